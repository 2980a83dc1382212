//! Rate-controlled submission pipeline and commit observer.
//!
//! A [`runner::Benchmark`] wires the stages together:
//! generator → signer pool → endorsement dispatcher → proposer workers →
//! assembler pool → submission dispatcher → broadcaster workers, with an
//! independent [`observer::Observer`] counting committed transactions. Every
//! stage reports into one [`stats::StatsAggregator`] through a cloned handle.

pub mod assembler;
pub mod broadcaster;
pub mod config;
pub mod dispatcher;
pub mod element;
pub mod error;
pub mod observer;
pub mod proposer;
pub mod rate;
pub mod runner;
pub mod stats;

pub use config::{ConfigError, RunConfig};
pub use element::{UnitError, UnitStage, WorkUnit};
pub use error::{PipelineError, Stage};
pub use runner::{Benchmark, RunSummary, StopHandle};
pub use stats::{Counters, StatItem, StatsHandle, StatsReport, StatsSnapshot};
