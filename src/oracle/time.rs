use std::sync::Arc;
use std::time::Duration;

use super::{Decider, Decision};
use crate::clock::{duration_ms, Clock};
use crate::deposit::CdaRecord;

pub const REASON_NOT_TIMED_OUT: &str = "CDA has not yet timed out and is not fully funded";
pub const REASON_UNCHECKABLE: &str = "no checkable condition";

/// Approves a CDA once it is fully funded or within `threshold` of its
/// timeout, i.e. once no further deposit can legitimately be expected.
pub struct TimeDecider {
    clock: Arc<dyn Clock>,
    threshold: Duration,
}

impl TimeDecider {
    pub fn new(clock: Arc<dyn Clock>, threshold: Duration) -> Self {
        Self { clock, threshold }
    }
}

impl Decider for TimeDecider {
    fn name(&self) -> &'static str {
        "time"
    }

    fn decide(&self, record: &CdaRecord) -> Decision {
        let conditions = record.conditions();
        if !conditions.is_checkable() {
            return Decision::reject(REASON_UNCHECKABLE);
        }
        if record.is_fully_funded() {
            return Decision::approve();
        }
        let Some(timeout_at) = conditions.timeout_at else {
            return Decision::approve();
        };

        let horizon = self.clock.now().saturating_add(duration_ms(self.threshold));
        if horizon >= timeout_at {
            Decision::approve()
        } else {
            Decision::reject(REASON_NOT_TIMED_OUT)
        }
    }
}
