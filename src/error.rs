//! Typed errors for the document pipeline.
//!
//! Adapters around external tools use [`anyhow`] internally, just like the
//! rest of this program. At the pipeline boundary, those errors are folded
//! into a [`JobError`], which the job runner turns into a FAILURE record.

use thiserror::Error;

use crate::prelude::*;

/// Errors which can occur while extracting or editing a document.
#[derive(Debug, Error)]
pub enum JobError {
    /// The source document does not exist. Fatal for the job.
    #[error("File not found")]
    SourceNotFound {
        /// The path we were asked to read.
        path: PathBuf,
    },

    /// A page has a zero pixel dimension, so we can't map between pixel and
    /// vector space.
    #[error("invalid page geometry: {pixel_width}x{pixel_height} px")]
    InvalidPageGeometry { pixel_width: u32, pixel_height: u32 },

    /// OCR, rasterization or encoding failed. Fatal for the job.
    #[error("{capability} failed: {message}")]
    ExternalCapabilityFailure {
        /// Which collaborator failed.
        capability: Capability,
        /// The underlying error chain.
        message: String,
    },

    /// We could not determine the colors of a text block.
    #[error("color inspection failed: {0}")]
    ColorInspectionFailure(String),

    /// Neither the requested font nor any fallback font could be loaded.
    #[error("no usable font: {0}")]
    FontResourceUnavailable(String),

    /// Anything else that goes wrong inside the pipeline, such as writing the
    /// output file.
    #[error("{0}")]
    Internal(String),
}

impl JobError {
    /// Wrap an error from an external collaborator, keeping the full context
    /// chain in the message.
    pub fn external(capability: Capability, err: anyhow::Error) -> Self {
        JobError::ExternalCapabilityFailure {
            capability,
            message: format!("{:#}", err),
        }
    }

    /// Wrap any other internal error.
    pub fn internal(err: anyhow::Error) -> Self {
        JobError::Internal(format!("{:#}", err))
    }

    /// Does this error abort the enclosing job?
    ///
    /// Non-fatal errors are absorbed close to where they happen and replaced
    /// with safe defaults.
    pub fn is_fatal(&self) -> bool {
        match self {
            JobError::SourceNotFound { .. }
            | JobError::ExternalCapabilityFailure { .. }
            | JobError::Internal(_) => true,
            JobError::InvalidPageGeometry { .. }
            | JobError::ColorInspectionFailure(_)
            | JobError::FontResourceUnavailable(_) => false,
        }
    }
}

/// External collaborators we depend on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    Ocr,
    Rasterizer,
    Encoder,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::Ocr => "OCR",
            Capability::Rasterizer => "rasterizer",
            Capability::Encoder => "encoder",
        };
        f.write_str(name)
    }
}

/// Result type for pipeline entry points.
pub type JobResult<T> = std::result::Result<T, JobError>;
