//! Error taxonomy shared by every stage of the pipeline.
//!
//! Every fatal error names the [`Stage`] that failed together with a message
//! describing the offending input (axis, shape, keyword, path, ...).
//! Fit non-convergence is deliberately *not* an error: it is reported as a
//! [`ConvergenceWarning`](crate::fit::ConvergenceWarning) inside the fit result.

use std::fmt;

/// Pipeline stage in which an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Opening a cube from a path or URL.
    SourceOpen,
    /// Downloading a remote resource into the local cache.
    Fetch,
    /// Parsing header cards or world coordinate metadata.
    Header,
    /// Converting a region into a boolean mask, or applying masks.
    MaskBuild,
    /// Sampling a path or extracting a PV diagram.
    Extraction,
    /// Collapsing the spectral axis.
    Moment,
    /// Least-squares model fitting.
    Fit,
    /// Resampling onto a new coordinate grid.
    Reproject,
    /// Writing a product to disk.
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::SourceOpen => "source open",
            Stage::Fetch => "fetch",
            Stage::Header => "header parse",
            Stage::MaskBuild => "mask build",
            Stage::Extraction => "extraction",
            Stage::Moment => "moment",
            Stage::Fit => "fit",
            Stage::Reproject => "reproject",
            Stage::Write => "write",
        };
        f.write_str(name)
    }
}

/// Errors produced by this crate.
#[derive(Debug, thiserror::Error)]
pub enum CubeError {
    /// Resource unreachable, unreadable, or fetch exhausted its fallbacks.
    #[error("[{stage}] I/O error: {message}")]
    Io {
        stage: Stage,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
    /// Missing or invalid FITS structure or coordinate metadata.
    #[error("[{stage}] format error: {message}")]
    Format { stage: Stage, message: String },
    /// Mask, cube or coordinate-system dimensions disagree.
    #[error("[{stage}] shape mismatch: {message}")]
    ShapeMismatch { stage: Stage, message: String },
    /// Non-positive spacing, degenerate geometry, empty region, ...
    #[error("[{stage}] invalid argument: {message}")]
    InvalidArgument { stage: Stage, message: String },
    /// A path needs at least two waypoints.
    #[error("[{stage}] empty path: got {waypoints} waypoint(s), need at least 2")]
    EmptyPath { stage: Stage, waypoints: usize },
    /// Fit inputs have different lengths.
    #[error("[{stage}] dimension mismatch: {message}")]
    DimensionMismatch { stage: Stage, message: String },
    /// Target coordinate system cannot be inverted or is not continuous.
    #[error("[{stage}] unsupported projection: {message}")]
    UnsupportedProjection { stage: Stage, message: String },
}

pub type Result<T> = std::result::Result<T, CubeError>;

impl CubeError {
    /// Stage that produced this error.
    pub fn stage(&self) -> Stage {
        match self {
            CubeError::Io { stage, .. }
            | CubeError::Format { stage, .. }
            | CubeError::ShapeMismatch { stage, .. }
            | CubeError::InvalidArgument { stage, .. }
            | CubeError::EmptyPath { stage, .. }
            | CubeError::DimensionMismatch { stage, .. }
            | CubeError::UnsupportedProjection { stage, .. } => *stage,
        }
    }

    pub(crate) fn io(stage: Stage, message: impl Into<String>, source: std::io::Error) -> Self {
        CubeError::Io {
            stage,
            message: message.into(),
            source: Some(source),
        }
    }

    pub(crate) fn io_msg(stage: Stage, message: impl Into<String>) -> Self {
        CubeError::Io {
            stage,
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn format(stage: Stage, message: impl Into<String>) -> Self {
        CubeError::Format {
            stage,
            message: message.into(),
        }
    }

    pub(crate) fn shape(stage: Stage, message: impl Into<String>) -> Self {
        CubeError::ShapeMismatch {
            stage,
            message: message.into(),
        }
    }

    pub(crate) fn invalid(stage: Stage, message: impl Into<String>) -> Self {
        CubeError::InvalidArgument {
            stage,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_stage() {
        let e = CubeError::invalid(Stage::Extraction, "spacing must be > 0, got -1");
        let msg = e.to_string();
        assert!(msg.contains("extraction"), "{msg}");
        assert!(msg.contains("spacing"), "{msg}");
        assert_eq!(e.stage(), Stage::Extraction);

        let e = CubeError::EmptyPath {
            stage: Stage::Extraction,
            waypoints: 1,
        };
        assert!(e.to_string().contains("1 waypoint"));
    }
}
