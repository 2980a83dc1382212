use std::fmt;

use fabload_codec::CodecError;
use fabload_transport::TransportError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::element::UnitError;

/// Pipeline stage named in run-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Generator,
    Signer,
    Endorsement,
    Assembly,
    Submission,
    Observer,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Generator => "generator",
            Stage::Signer => "signer",
            Stage::Endorsement => "endorsement",
            Stage::Assembly => "assembly",
            Stage::Submission => "submission",
            Stage::Observer => "commit observer",
        };
        f.write_str(name)
    }
}

/// Failures that terminate a benchmark run.
///
/// Per-unit failures never appear here: they are logged and counted where
/// they happen.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to open {stage} connection to {endpoint}: {source}")]
    Connect {
        stage: Stage,
        endpoint: String,
        #[source]
        source: TransportError,
    },
    /// An acknowledgement or commit stream broke mid-run.
    #[error("{stage} stream failed: {reason}")]
    StreamFatal { stage: Stage, reason: String },
    /// The identity material cannot produce signatures.
    #[error("{stage} signing failed: {source}")]
    Signer {
        stage: Stage,
        #[source]
        source: CodecError,
    },
    /// A unit reached a stage it was not prepared for.
    #[error("{stage} received a unit out of order: {source}")]
    Unit {
        stage: Stage,
        #[source]
        source: UnitError,
    },
    #[error("{stage} queue closed while units were in flight")]
    QueueClosed { stage: Stage },
}

impl PipelineError {
    /// Stage responsible for the failure, when there is one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Config(_) => None,
            PipelineError::Connect { stage, .. }
            | PipelineError::StreamFatal { stage, .. }
            | PipelineError::Signer { stage, .. }
            | PipelineError::Unit { stage, .. }
            | PipelineError::QueueClosed { stage } => Some(*stage),
        }
    }
}
