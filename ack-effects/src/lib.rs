use serde::{Deserialize, Serialize};

/// Effect classification for tool operations.
/// Ordered by increasing severity of side effects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Effect {
    /// Reads external state. Safe to repeat.
    Observe,
    /// Changes external state (acknowledge, reassign). Idempotent by target.
    Mutate,
}

impl Effect {
    /// Derive recovery strategy from effect type.
    pub fn recovery(&self) -> Recovery {
        match self {
            Effect::Observe => Recovery::Retry,
            Effect::Mutate => Recovery::RetryIfRejected,
        }
    }

    /// Roles that only gather evidence may issue read-only operations.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Effect::Observe)
    }
}

/// Recovery strategy after a transient failure, derived from Effect type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recovery {
    /// Safe to re-execute after any transient failure.
    Retry,
    /// Re-execute only when the remote side refused the request before
    /// applying it (rate limiting). An unavailable upstream may have applied it.
    RetryIfRejected,
}

/// Any operation that has a classified effect.
pub trait Effectful {
    fn effect(&self) -> Effect;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_is_retryable_and_read_only() {
        assert_eq!(Effect::Observe.recovery(), Recovery::Retry);
        assert!(Effect::Observe.is_read_only());
    }

    #[test]
    fn mutate_retries_only_rejected_requests() {
        assert_eq!(Effect::Mutate.recovery(), Recovery::RetryIfRejected);
        assert!(!Effect::Mutate.is_read_only());
    }

    #[test]
    fn serializes_as_variant_name() {
        let json = serde_json::to_string(&Effect::Mutate).unwrap();
        assert_eq!(json, "\"Mutate\"");
    }
}
