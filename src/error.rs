use std::path::PathBuf;

use thiserror::Error;

/// Failures that are fatal to the candidate being applied.
///
/// Everything else travels as `anyhow::Error`; these variants exist so the
/// scheduler can tell a trust decision apart from an I/O hiccup when it logs
/// the outcome of a cycle.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("integrity check failed for {}: {reason}", artifact.display())]
    Integrity { artifact: PathBuf, reason: String },

    #[error("signature check failed for {}: {reason}", artifact.display())]
    Trust { artifact: PathBuf, reason: String },

    #[error("malformed artifact {}: {reason}", artifact.display())]
    MalformedArtifact { artifact: PathBuf, reason: String },

    #[error("archive entry '{entry}' escapes extraction root {}", root.display())]
    ZipSlip { entry: String, root: PathBuf },

    #[error("service did not report healthy after {attempts} probe attempts")]
    Unhealthy { attempts: u32 },
}

impl UpdateError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Integrity { .. } => "integrity",
            Self::Trust { .. } => "trust",
            Self::MalformedArtifact { .. } => "malformed_artifact",
            Self::ZipSlip { .. } => "zip_slip",
            Self::Unhealthy { .. } => "unhealthy",
        }
    }
}

/// Classifies an error chain for structured logging.
pub fn classify(err: &anyhow::Error) -> &'static str {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<UpdateError>())
        .map(UpdateError::kind)
        .unwrap_or("io")
}
