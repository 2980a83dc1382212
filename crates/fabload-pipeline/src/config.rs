use std::time::Duration;

use fabload_core::{CoreError, Endpoint};
use thiserror::Error;

pub const DEFAULT_CHANNEL: &str = "mychannel";
pub const DEFAULT_CHAINCODE: &str = "fileasset";
pub const DEFAULT_FUNCTION: &str = "addFile";
/// Placeholder replaced by the unit's sequence number in argument templates.
pub const SEQ_PLACEHOLDER: &str = "{seq}";
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_SIGNER_TASKS: usize = 5;
pub const DEFAULT_ASSEMBLER_TASKS: usize = 5;
pub const DEFAULT_SPEED_SLICES: usize = 5;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);

pub fn default_args() -> Vec<String> {
    [SEQ_PLACEHOLDER, SEQ_PLACEHOLDER, "true", "-1", "-1"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Reasons a run configuration is rejected before any task starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("rate must be greater than zero")]
    ZeroRate,
    #[error("total must be greater than zero")]
    ZeroTotal,
    #[error("at least one endorsing endpoint is required")]
    NoEndorsers,
    #[error("{0} must be greater than zero")]
    ZeroField(&'static str),
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error(transparent)]
    Endpoint(#[from] CoreError),
}

/// Validated, immutable parameters of one benchmark run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Units to generate; `u64::MAX` runs until stopped.
    pub total: u64,
    /// Aggregate units per second.
    pub rate: u64,
    pub endorsers: Vec<Endpoint>,
    pub orderer: Endpoint,
    /// Commit feed endpoint; the first endorser when unset.
    pub observer: Option<Endpoint>,
    pub channel: String,
    pub chaincode: String,
    pub function: String,
    /// Argument template, see [`SEQ_PLACEHOLDER`].
    pub args: Vec<String>,
    /// Connections opened to every endorsing endpoint and to the orderer.
    pub connections: usize,
    /// Concurrent in-flight calls per endorsing connection.
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub signer_tasks: usize,
    pub assembler_tasks: usize,
    pub speed_slices: usize,
    pub tick_interval: Duration,
    pub report_interval: Duration,
}

impl RunConfig {
    pub fn new(total: u64, rate: u64, endorsers: Vec<Endpoint>, orderer: Endpoint) -> Self {
        Self {
            total,
            rate,
            endorsers,
            orderer,
            observer: None,
            channel: DEFAULT_CHANNEL.to_string(),
            chaincode: DEFAULT_CHAINCODE.to_string(),
            function: DEFAULT_FUNCTION.to_string(),
            args: default_args(),
            connections: 1,
            concurrency: 1,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            signer_tasks: DEFAULT_SIGNER_TASKS,
            assembler_tasks: DEFAULT_ASSEMBLER_TASKS,
            speed_slices: DEFAULT_SPEED_SLICES,
            tick_interval: DEFAULT_TICK_INTERVAL,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate == 0 {
            return Err(ConfigError::ZeroRate);
        }
        if self.total == 0 {
            return Err(ConfigError::ZeroTotal);
        }
        if self.endorsers.is_empty() {
            return Err(ConfigError::NoEndorsers);
        }
        for (field, value) in [
            ("connections", self.connections),
            ("concurrency", self.concurrency),
            ("queue_capacity", self.queue_capacity),
            ("signer_tasks", self.signer_tasks),
            ("assembler_tasks", self.assembler_tasks),
            ("speed_slices", self.speed_slices),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroField(field));
            }
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroField("tick_interval"));
        }
        if self.report_interval.is_zero() {
            return Err(ConfigError::ZeroField("report_interval"));
        }
        if self.channel.trim().is_empty() {
            return Err(ConfigError::EmptyField("channel"));
        }
        if self.chaincode.trim().is_empty() {
            return Err(ConfigError::EmptyField("chaincode"));
        }
        if self.function.trim().is_empty() {
            return Err(ConfigError::EmptyField("function"));
        }
        for endpoint in self.endorsers.iter().chain([&self.orderer]) {
            endpoint.validate()?;
        }
        if let Some(observer) = &self.observer {
            observer.validate()?;
        }
        Ok(())
    }

    pub fn observer_endpoint(&self) -> &Endpoint {
        self.observer
            .as_ref()
            .or_else(|| self.endorsers.first())
            .unwrap_or(&self.orderer)
    }

    /// Workers behind the endorsement dispatcher.
    pub fn endorsement_workers(&self) -> usize {
        self.connections * self.endorsers.len()
    }

    /// Contract arguments for unit `seq`.
    pub fn args_for(&self, seq: u64) -> Vec<Vec<u8>> {
        let seq = seq.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(SEQ_PLACEHOLDER, &seq).into_bytes())
            .collect()
    }

    /// Whether the run only ends when stopped.
    pub fn is_unbounded(&self) -> bool {
        self.total == u64::MAX
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fabload_core::Endpoint;

    use super::{ConfigError, RunConfig};

    fn config() -> RunConfig {
        RunConfig::new(
            100,
            10,
            vec![
                Endpoint::new("peer0:7051", "peer0.org1"),
                Endpoint::new("peer1:7051", "peer1.org1"),
            ],
            Endpoint::new("orderer0:7050", "orderer0"),
        )
    }

    #[test]
    fn defaults_validate() {
        let config = config();
        config.validate().expect("default config should validate");
        assert_eq!(config.observer_endpoint().addr, "peer0:7051");
        assert_eq!(config.endorsement_workers(), 2);
        assert!(!config.is_unbounded());
    }

    #[test]
    fn args_template_substitutes_sequence() {
        let config = config();
        let args = config.args_for(42);
        assert_eq!(
            args,
            vec![
                b"42".to_vec(),
                b"42".to_vec(),
                b"true".to_vec(),
                b"-1".to_vec(),
                b"-1".to_vec()
            ]
        );
    }

    #[test]
    fn rejects_zero_rate_total_and_pool_sizes() {
        let mut zero_rate = config();
        zero_rate.rate = 0;
        assert!(matches!(zero_rate.validate(), Err(ConfigError::ZeroRate)));

        let mut zero_total = config();
        zero_total.total = 0;
        assert!(matches!(zero_total.validate(), Err(ConfigError::ZeroTotal)));

        let mut no_peers = config();
        no_peers.endorsers.clear();
        assert!(matches!(no_peers.validate(), Err(ConfigError::NoEndorsers)));

        let mut zero_conn = config();
        zero_conn.connections = 0;
        assert!(matches!(zero_conn.validate(), Err(ConfigError::ZeroField("connections"))));

        let mut zero_tick = config();
        zero_tick.tick_interval = Duration::ZERO;
        assert!(matches!(zero_tick.validate(), Err(ConfigError::ZeroField("tick_interval"))));
    }

    #[test]
    fn rejects_malformed_endpoints() {
        let mut config = config();
        config.orderer = Endpoint::new("orderer0", "");
        let err = config.validate().expect_err("missing port must fail");
        assert_eq!(err.to_string(), "invalid endpoint `orderer0`: missing port");
    }
}
