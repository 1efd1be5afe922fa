//! Escalation circuit breaker. Repeated escalations for the same witness
//! are capped: once the strike budget is exhausted the breaker trips,
//! further alerts are suppressed, and only a healthy cycle re-arms it.

use std::collections::HashMap;

/// Escalations allowed before the breaker trips.
const MAX_STRIKES: u32 = 5;

#[derive(Debug, Default)]
struct BreakerState {
    strikes: u32,
    tripped: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum EscalationDecision {
    /// Dispatch the alert.
    Send,
    /// Strike budget exhausted this cycle; announce the trip once.
    Tripped,
    /// Already tripped; stay silent.
    Suppressed,
}

/// Per-witness strike counters, keyed `<namespace>/<witness>`. Lives in
/// process memory behind the shared context; each witness key reconciles
/// single-threaded so no finer locking is needed.
#[derive(Debug, Default)]
pub struct EscalationBreaker {
    states: HashMap<String, BreakerState>,
}

impl EscalationBreaker {
    /// Called on every unhealthy cycle; decides whether this escalation
    /// may go out.
    pub fn on_unhealthy(&mut self, key: &str) -> EscalationDecision {
        let state = self.states.entry(key.to_owned()).or_default();
        if state.strikes < MAX_STRIKES {
            state.strikes += 1;
            return EscalationDecision::Send;
        }
        if !state.tripped {
            state.tripped = true;
            return EscalationDecision::Tripped;
        }
        EscalationDecision::Suppressed
    }

    /// A healthy cycle resets the witness completely.
    pub fn on_healthy(&mut self, key: &str) {
        self.states.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_five_then_trips_once() {
        let mut breaker = EscalationBreaker::default();
        for i in 0..5 {
            assert_eq!(
                breaker.on_unhealthy("ns/witness"),
                EscalationDecision::Send,
                "strike {i} should send"
            );
        }
        assert_eq!(breaker.on_unhealthy("ns/witness"), EscalationDecision::Tripped);
        assert_eq!(breaker.on_unhealthy("ns/witness"), EscalationDecision::Suppressed);
        assert_eq!(breaker.on_unhealthy("ns/witness"), EscalationDecision::Suppressed);
    }

    #[test]
    fn healthy_cycle_rearms() {
        let mut breaker = EscalationBreaker::default();
        for _ in 0..6 {
            breaker.on_unhealthy("ns/witness");
        }
        breaker.on_healthy("ns/witness");
        assert_eq!(breaker.on_unhealthy("ns/witness"), EscalationDecision::Send);
    }

    #[test]
    fn witnesses_are_independent() {
        let mut breaker = EscalationBreaker::default();
        for _ in 0..6 {
            breaker.on_unhealthy("ns/one");
        }
        assert_eq!(breaker.on_unhealthy("ns/two"), EscalationDecision::Send);
        assert_eq!(breaker.on_unhealthy("ns/one"), EscalationDecision::Suppressed);
    }
}
