use std::time::Duration;

use fabload_transport::{EndorsePolicy, LedgerOptions};

/// Canned behaviour of a simulated ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerScenario {
    pub name: &'static str,
    pub endorse_status: i32,
    pub transport_error_every: Option<u64>,
    pub nil_response_every: Option<u64>,
    pub endorse_latency_ms: u64,
    pub max_block_txs: usize,
    pub block_timeout_ms: u64,
}

pub const HEALTHY: LedgerScenario = LedgerScenario {
    name: "healthy",
    endorse_status: 200,
    transport_error_every: None,
    nil_response_every: None,
    endorse_latency_ms: 2,
    max_block_txs: 100,
    block_timeout_ms: 200,
};

pub const FLAKY_ENDORSERS: LedgerScenario = LedgerScenario {
    name: "flaky_endorsers",
    endorse_status: 200,
    transport_error_every: Some(25),
    nil_response_every: Some(40),
    endorse_latency_ms: 5,
    max_block_txs: 50,
    block_timeout_ms: 200,
};

pub const REJECTING: LedgerScenario = LedgerScenario {
    name: "rejecting",
    endorse_status: 500,
    transport_error_every: None,
    nil_response_every: None,
    endorse_latency_ms: 1,
    max_block_txs: 100,
    block_timeout_ms: 200,
};

pub const ALL: [LedgerScenario; 3] = [HEALTHY, FLAKY_ENDORSERS, REJECTING];

impl LedgerScenario {
    pub fn by_name(name: &str) -> Option<LedgerScenario> {
        ALL.into_iter().find(|scenario| scenario.name == name)
    }

    pub fn options(&self) -> LedgerOptions {
        let mut options = LedgerOptions::default().with_block_size(
            self.max_block_txs,
            Duration::from_millis(self.block_timeout_ms),
        );
        options.endorse = EndorsePolicy {
            status: self.endorse_status,
            message: if self.endorse_status >= 400 {
                "simulated rejection".to_string()
            } else {
                String::new()
            },
            transport_error_every: self.transport_error_every,
            nil_response_every: self.nil_response_every,
            latency: Duration::from_millis(self.endorse_latency_ms),
        };
        options
    }
}

impl Default for LedgerScenario {
    fn default() -> Self {
        HEALTHY
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{LedgerScenario, ALL, FLAKY_ENDORSERS, HEALTHY};

    #[test]
    fn scenarios_are_found_by_name() {
        for scenario in ALL {
            assert_eq!(LedgerScenario::by_name(scenario.name), Some(scenario));
        }
        assert_eq!(LedgerScenario::by_name("unknown"), None);
        assert_eq!(LedgerScenario::default(), HEALTHY);
    }

    #[test]
    fn options_carry_the_injection_policy() {
        let options = FLAKY_ENDORSERS.options();
        assert_eq!(options.max_block_txs, 50);
        assert_eq!(options.block_timeout, Duration::from_millis(200));
        assert_eq!(options.endorse.transport_error_every, Some(25));
        assert_eq!(options.endorse.nil_response_every, Some(40));
        assert_eq!(options.endorse.latency, Duration::from_millis(5));
    }
}
