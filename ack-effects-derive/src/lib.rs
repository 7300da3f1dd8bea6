use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{Attribute, Data, DeriveInput, Error, Ident, Result, parse_macro_input};

/// Derives `ack_effects::Effectful`.
///
/// Structs take a single `#[effect(Observe | Mutate)]` on the type. Enums
/// take one per variant; a type-level attribute is the default for variants
/// without their own.
#[proc_macro_derive(Effectful, attributes(effect))]
pub fn derive_effectful(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand_effectful(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand_effectful(input: &DeriveInput) -> Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let type_default = find_effect_attr(&input.attrs).map(parse_effect_attr).transpose()?;

    let body = match &input.data {
        Data::Struct(_) => type_default.ok_or_else(|| {
            Error::new(Span::call_site(), "missing #[effect(...)] attribute")
        })?,
        Data::Enum(data) => {
            if data.variants.is_empty() {
                return Err(Error::new_spanned(name, "cannot derive Effectful for an empty enum"));
            }
            let mut arms = Vec::with_capacity(data.variants.len());
            for variant in &data.variants {
                let ident = &variant.ident;
                let effect = match find_effect_attr(&variant.attrs) {
                    Some(attr) => parse_effect_attr(attr)?,
                    None => type_default.clone().ok_or_else(|| {
                        Error::new_spanned(
                            ident,
                            "variant needs #[effect(...)] or the enum needs a default one",
                        )
                    })?,
                };
                arms.push(quote! { Self::#ident { .. } => #effect, });
            }
            quote! {
                match self {
                    #(#arms)*
                }
            }
        }
        Data::Union(_) => {
            return Err(Error::new_spanned(name, "Effectful cannot be derived for unions"));
        }
    };

    Ok(quote! {
        impl #impl_generics ack_effects::Effectful for #name #ty_generics #where_clause {
            fn effect(&self) -> ack_effects::Effect {
                #body
            }
        }
    })
}

fn find_effect_attr(attrs: &[Attribute]) -> Option<&Attribute> {
    attrs.iter().find(|attr| attr.path().is_ident("effect"))
}

fn parse_effect_attr(attr: &Attribute) -> Result<proc_macro2::TokenStream> {
    let spec = attr.parse_args::<EffectSpec>()?;

    Ok(match spec {
        EffectSpec::Observe => quote! { ack_effects::Effect::Observe },
        EffectSpec::Mutate => quote! { ack_effects::Effect::Mutate },
    })
}

enum EffectSpec {
    Observe,
    Mutate,
}

impl Parse for EffectSpec {
    fn parse(input: ParseStream<'_>) -> Result<Self> {
        let effect: Ident = input.parse()?;

        let parsed = match effect.to_string().as_str() {
            "Observe" => Self::Observe,
            "Mutate" => Self::Mutate,
            other => {
                return Err(Error::new_spanned(
                    effect,
                    format!("unsupported effect `{other}`; expected Observe or Mutate"),
                ))
            }
        };

        if input.is_empty() {
            Ok(parsed)
        } else {
            Err(input.error("unexpected tokens in #[effect(...)] attribute"))
        }
    }
}
