use ack_effects::{Effect, Effectful};
use ack_effects_derive::Effectful;

#[derive(Effectful)]
#[effect(Observe)]
struct QueryPrometheus;

#[derive(Effectful)]
#[effect(Mutate)]
struct ReassignIncident;

#[derive(Effectful)]
#[effect(Observe)]
#[allow(dead_code)]
enum Operation {
    ListPods { namespace: String },
    Nodes(Option<String>),
    #[effect(Mutate)]
    Acknowledge { incident_id: String },
    #[effect(Mutate)]
    Ping,
}

#[test]
fn derive_supports_structs() {
    assert_eq!(QueryPrometheus.effect(), Effect::Observe);
    assert_eq!(ReassignIncident.effect(), Effect::Mutate);
}

#[test]
fn derive_supports_enum_variants_with_default() {
    let list = Operation::ListPods {
        namespace: "payments".into(),
    };
    assert_eq!(list.effect(), Effect::Observe);
    assert_eq!(Operation::Nodes(None).effect(), Effect::Observe);
    assert_eq!(
        Operation::Acknowledge {
            incident_id: "PD-1".into()
        }
        .effect(),
        Effect::Mutate
    );
    assert_eq!(Operation::Ping.effect(), Effect::Mutate);
}
