use std::io;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::{json, Value};

pub type RenderResult<T> = Result<T, RenderError>;

#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("media not found: '{reference}'")]
    MediaNotFound { reference: String },

    #[error("unsupported media reference '{reference}': {reason}")]
    UnsupportedReference { reference: String, reason: String },

    #[error("render failed ({status}): {diagnostics}")]
    RenderFailed { status: String, diagnostics: String },

    #[error("invalid scene: {0}")]
    InvalidScene(String),

    #[error("transcoding engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("i/o error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RenderError {
    pub fn media_not_found(reference: impl Into<String>) -> Self {
        Self::MediaNotFound {
            reference: reference.into(),
        }
    }

    pub fn unsupported(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_scene(msg: impl Into<String>) -> Self {
        Self::InvalidScene(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable machine-readable code, used by the CLI `--json` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MediaNotFound { .. } => "MEDIA_NOT_FOUND",
            Self::UnsupportedReference { .. } => "UNSUPPORTED_REFERENCE",
            Self::RenderFailed { .. } => "RENDER_FAILED",
            Self::InvalidScene(_) => "INVALID_SCENE",
            Self::EngineUnavailable(_) => "ENGINE_UNAVAILABLE",
            Self::Io { .. } => "IO_ERROR",
            Self::Other(_) => "INTERNAL",
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::MediaNotFound { reference } => Some(json!({ "reference": reference })),
            Self::UnsupportedReference { reference, reason } => {
                Some(json!({ "reference": reference, "reason": reason }))
            }
            Self::RenderFailed {
                status,
                diagnostics,
            } => Some(json!({ "status": status, "diagnostics": diagnostics })),
            Self::Io { path, .. } => Some(json!({ "path": path.display().to_string() })),
            Self::InvalidScene(_) | Self::EngineUnavailable(_) | Self::Other(_) => None,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            ok: false,
            error: ErrorEnvelopeBody {
                code: self.code().to_owned(),
                message: self.to_string(),
                details: self.details(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: ErrorEnvelopeBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelopeBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Builds an envelope for any error surfaced by the CLI. Typed render errors
/// keep their code; everything else is reported as `INTERNAL`.
pub fn envelope_for(error: &anyhow::Error) -> ErrorEnvelope {
    match find_render_error(error) {
        Some(render_error) => {
            let mut envelope = render_error.envelope();
            envelope.error.message = format!("{error:#}");
            envelope
        }
        None => ErrorEnvelope {
            ok: false,
            error: ErrorEnvelopeBody {
                code: "INTERNAL".to_owned(),
                message: format!("{error:#}"),
                details: None,
            },
        },
    }
}

pub fn find_render_error(error: &anyhow::Error) -> Option<&RenderError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<RenderError>())
}
