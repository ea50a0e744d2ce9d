//! Renderer error kinds
//!
//! Backend failures surface as [`BackendError`]; everything the renderer itself
//! can detect (asset decode, shader validation, attachment validation) is a
//! [`RenderError`]. Callers use [`RenderError::is_fatal`] to decide whether to
//! abort startup or continue with a degraded asset.

use std::path::PathBuf;
use thiserror::Error;

use crate::backend::BackendError;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("failed to import model {path:?}: {reason}")]
    ImporterFailure { path: PathBuf, reason: String },

    #[error("failed to decode texture {path:?}: {reason}")]
    TextureDecodeFailure { path: PathBuf, reason: String },

    #[error("shader '{name}' failed to compile: {reason}")]
    ShaderCompileFailure { name: String, reason: String },

    #[error("offscreen target incomplete: {0}")]
    FramebufferIncomplete(String),

    #[error("vertex layout does not match shader '{shader}': {reason}")]
    VertexLayoutMismatch { shader: String, reason: String },

    #[error("offscreen target is {state}, cannot {operation}")]
    InvalidTargetState {
        state: &'static str,
        operation: &'static str,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl RenderError {
    /// Importer and texture failures degrade the affected asset; everything
    /// else stops startup.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RenderError::ImporterFailure { .. } | RenderError::TextureDecodeFailure { .. }
        )
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_failures_are_recoverable() {
        let err = RenderError::TextureDecodeFailure {
            path: PathBuf::from("missing.png"),
            reason: "not found".into(),
        };
        assert!(!err.is_fatal());

        let err = RenderError::ImporterFailure {
            path: PathBuf::from("rock.obj"),
            reason: "unreadable".into(),
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn target_and_shader_failures_are_fatal() {
        assert!(RenderError::FramebufferIncomplete("zero size".into()).is_fatal());
        assert!(RenderError::ShaderCompileFailure {
            name: "planet".into(),
            reason: "syntax".into()
        }
        .is_fatal());
        assert!(RenderError::from(BackendError::DeviceLost).is_fatal());
    }
}
