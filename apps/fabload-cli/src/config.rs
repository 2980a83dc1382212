use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use fabload_core::Endpoint;
use fabload_crypto::{IdentityConfig, SigningAlgorithm};
use fabload_pipeline::config::{
    default_args, DEFAULT_ASSEMBLER_TASKS, DEFAULT_CHAINCODE, DEFAULT_CHANNEL, DEFAULT_FUNCTION, DEFAULT_QUEUE_CAPACITY, DEFAULT_SIGNER_TASKS,
    DEFAULT_SPEED_SLICES,
};
use fabload_pipeline::RunConfig;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("missing configuration field `{0}`")]
    Missing(&'static str),
}

/// A ledger node address as written in the config file: either
/// `"host:port"`, `"host:port=override"`, or a table with `addr` and
/// `override_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub addr: String,
    pub override_name: String,
}

impl EndpointConfig {
    fn parse(raw: &str) -> Self {
        match raw.split_once('=') {
            Some((addr, name)) => Self {
                addr: addr.trim().to_string(),
                override_name: name.trim().to_string(),
            },
            None => Self {
                addr: raw.trim().to_string(),
                override_name: String::new(),
            },
        }
    }

    pub fn to_endpoint(&self) -> Endpoint {
        Endpoint::new(self.addr.clone(), self.override_name.clone())
    }
}

impl<'de> Deserialize<'de> for EndpointConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EndpointVisitor;

        impl<'de> Visitor<'de> for EndpointVisitor {
            type Value = EndpointConfig;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an address string or a table with `addr`")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(EndpointConfig::parse(value))
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut addr = None;
                let mut override_name = String::new();
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "addr" => addr = Some(map.next_value::<String>()?),
                        "override_name" | "override" => override_name = map.next_value()?,
                        _ => {
                            map.next_value::<de::IgnoredAny>()?;
                        }
                    }
                }
                let addr = addr.ok_or_else(|| de::Error::missing_field("addr"))?;
                Ok(EndpointConfig { addr, override_name })
            }
        }

        deserializer.deserialize_any(EndpointVisitor)
    }
}

fn deserialize_endpoints<'de, D>(deserializer: D) -> Result<Vec<EndpointConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    struct EndpointListVisitor;

    impl<'de> Visitor<'de> for EndpointListVisitor {
        type Value = Vec<EndpointConfig>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a comma separated address list or a sequence of endpoints")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value
                .split(|c| c == ',' || c == ';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(EndpointConfig::parse)
                .collect())
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: SeqAccess<'de>,
        {
            let mut endpoints = Vec::new();
            while let Some(endpoint) = seq.next_element()? {
                endpoints.push(endpoint);
            }
            Ok(endpoints)
        }
    }

    deserializer.deserialize_any(EndpointListVisitor)
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value
                .split(|c| c == ',' || c == ';')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect())
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element::<String>()? {
                vec.push(element);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

fn is_env_file(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("env")
}

/// Result of exporting a `.env` config file into the process environment.
/// Returned rather than logged since it happens before logging is set up.
#[derive(Debug)]
pub enum EnvFileLoad {
    Loaded(PathBuf),
    Failed { path: PathBuf, reason: String },
}

impl EnvFileLoad {
    pub fn log(&self) {
        match self {
            EnvFileLoad::Loaded(path) => info!("loaded environment from {}", path.display()),
            EnvFileLoad::Failed { path, reason } => {
                warn!("failed to load .env from {}: {}", path.display(), reason)
            }
        }
    }
}

/// Exports a `.env` config file so `FABLOAD_` variables in it reach
/// [`FabloadConfig::new`]. Other config paths are left alone.
pub fn load_env_file(config_path: Option<&Path>) -> Option<EnvFileLoad> {
    let path = config_path.filter(|path| is_env_file(path))?;
    Some(match dotenvy::from_path(path) {
        Ok(()) => EnvFileLoad::Loaded(path.to_path_buf()),
        Err(err) => EnvFileLoad::Failed {
            path: path.to_path_buf(),
            reason: err.to_string(),
        },
    })
}

#[derive(Debug, Deserialize, Clone)]
pub struct FabloadConfig {
    #[serde(deserialize_with = "deserialize_endpoints")]
    pub peers: Vec<EndpointConfig>,
    pub orderer: Option<EndpointConfig>,
    pub observer: Option<EndpointConfig>,
    pub channel: String,
    pub chaincode: String,
    pub function: String,
    #[serde(deserialize_with = "deserialize_list")]
    pub args: Vec<String>,
    pub mspid: String,
    pub private_key: Option<PathBuf>,
    pub sign_cert: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_list")]
    pub tls_ca_certs: Vec<String>,
    pub signing_algorithm: SigningAlgorithm,
    pub num_of_conn: usize,
    pub client_per_conn: usize,
    pub queue_capacity: usize,
    pub signer_tasks: usize,
    pub assembler_tasks: usize,
    pub speed_slices: usize,
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub stats_log: PathBuf,
}

impl FabloadConfig {
    /// Layers defaults, the config file and `FABLOAD_` variables. A `.env`
    /// path contributes through the environment once [`load_env_file`] ran.
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("peers", Vec::<String>::new())?
            .set_default("channel", DEFAULT_CHANNEL)?
            .set_default("chaincode", DEFAULT_CHAINCODE)?
            .set_default("function", DEFAULT_FUNCTION)?
            .set_default("args", default_args())?
            .set_default("mspid", "Org1MSP")?
            .set_default("tls_ca_certs", Vec::<String>::new())?
            .set_default("signing_algorithm", "ecdsa")?
            .set_default("num_of_conn", 1)?
            .set_default("client_per_conn", 1)?
            .set_default("queue_capacity", DEFAULT_QUEUE_CAPACITY as u64)?
            .set_default("signer_tasks", DEFAULT_SIGNER_TASKS as u64)?
            .set_default("assembler_tasks", DEFAULT_ASSEMBLER_TASKS as u64)?
            .set_default("speed_slices", DEFAULT_SPEED_SLICES as u64)?
            .set_default("tick_interval", "200ms")?
            .set_default("report_interval", "1s")?
            .set_default("connect_timeout", "5s")?
            .set_default("request_timeout", "5s")?
            .set_default("stats_log", "static.log")?;

        if let Some(path) = config_path.filter(|path| !is_env_file(path)) {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(Environment::with_prefix("FABLOAD").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    /// Builds the run configuration. Without configured peers a simulated
    /// run falls back to the simulator's endpoints.
    pub fn run_config(&self, total: u64, rate: u64, simulate: bool) -> Result<RunConfig, SetupError> {
        let mut endorsers: Vec<Endpoint> = self.peers.iter().map(EndpointConfig::to_endpoint).collect();
        if endorsers.is_empty() {
            if !simulate {
                return Err(SetupError::Missing("peers"));
            }
            endorsers = fabload_sim::simulated_peers(2);
        }
        let orderer = match (&self.orderer, simulate) {
            (Some(orderer), _) => orderer.to_endpoint(),
            (None, true) => fabload_sim::simulated_orderer(),
            (None, false) => return Err(SetupError::Missing("orderer")),
        };

        let mut config = RunConfig::new(total, rate, endorsers, orderer);
        config.observer = self.observer.as_ref().map(EndpointConfig::to_endpoint);
        config.channel = self.channel.clone();
        config.chaincode = self.chaincode.clone();
        config.function = self.function.clone();
        config.args = self.args.clone();
        config.connections = self.num_of_conn;
        config.concurrency = self.client_per_conn;
        config.queue_capacity = self.queue_capacity;
        config.signer_tasks = self.signer_tasks;
        config.assembler_tasks = self.assembler_tasks;
        config.speed_slices = self.speed_slices;
        config.tick_interval = self.tick_interval;
        config.report_interval = self.report_interval;
        Ok(config)
    }

    pub fn identity_config(&self) -> Result<IdentityConfig, SetupError> {
        Ok(IdentityConfig {
            msp_id: self.mspid.clone(),
            private_key: self.private_key.clone().ok_or(SetupError::Missing("private_key"))?,
            sign_cert: self.sign_cert.clone().ok_or(SetupError::Missing("sign_cert"))?,
            tls_ca_certs: self.tls_ca_certs.iter().map(PathBuf::from).collect(),
            algorithm: self.signing_algorithm,
        })
    }
}
