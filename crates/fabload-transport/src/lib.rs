//! Remote contracts consumed by the fabload pipeline.
//!
//! The pipeline only depends on the endorser, broadcast and deliver traits
//! defined here. `memory` provides a simulated ledger implementing all three.

pub mod adapter;
pub mod error;
pub mod memory;

pub use adapter::{AckSource, BroadcastStream, Connector, DeliverStream, EndorserClient, EnvelopeSink};
pub use error::TransportError;
pub use memory::{EndorsePolicy, InMemoryLedger, LedgerOptions};
