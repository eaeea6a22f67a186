//! Send policy. Deciders inspect a stored CDA and say whether it is safe to
//! spend from (or send to) right now. They never touch the store.

pub mod time;

use serde::{Deserialize, Serialize};

use crate::deposit::CdaRecord;

pub use time::TimeDecider;

/// Outcome of a single oracle query. Never persisted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub ok: bool,
    pub reason: Option<String>,
}

impl Decision {
    pub fn approve() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

pub trait Decider: Send + Sync {
    fn name(&self) -> &'static str;

    fn decide(&self, record: &CdaRecord) -> Decision;
}

/// All configured deciders must approve. The first refusal wins.
pub struct Oracle {
    deciders: Vec<Box<dyn Decider>>,
}

impl Oracle {
    pub fn new(deciders: Vec<Box<dyn Decider>>) -> Self {
        Self { deciders }
    }

    pub fn len(&self) -> usize {
        self.deciders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deciders.is_empty()
    }

    pub fn decide(&self, record: &CdaRecord) -> Decision {
        if record.override_approved {
            return Decision::approve();
        }
        for decider in &self.deciders {
            let decision = decider.decide(record);
            if !decision.ok {
                tracing::debug!(
                    "decider '{}' refused CDA #{}: {:?}",
                    decider.name(),
                    record.index(),
                    decision.reason
                );
                return decision;
            }
        }
        Decision::approve()
    }
}
