//! Error types for the shader variant cache
//!
//! Compile failures of a single stage are not errors here: they are cached on
//! the stage object. What reaches the caller is what the caller has to decide
//! about (a failed input offered for linking, a link failure, a stale handle).

use std::fmt;
use thiserror::Error;

use crate::program::ProgramKey;
use crate::shader::StageKind;
use crate::shader_id::ShaderId;

/// Result type alias for shader manager operations
pub type Result<T> = std::result::Result<T, ShaderError>;

/// Main error type for the shader manager
#[derive(Error, Debug)]
pub enum ShaderError {
    // === Stage errors ===
    #[error("{stage} shader {id} failed to compile and cannot be used as program input")]
    FailedStage { stage: StageKind, id: ShaderId },

    #[error("Stale {stage} shader handle (the cache was cleared since it was issued)")]
    StaleHandle { stage: StageKind },

    // === Program errors ===
    #[error("Program link failed for {key}: {log}")]
    ProgramLink { key: ProgramKey, log: String },

    // === Debug surface errors ===
    #[error("Invalid shader id '{text}': {reason}")]
    InvalidShaderId { text: String, reason: String },

    #[error("{stage} shader {id} not found in cache")]
    NotFound { stage: StageKind, id: ShaderId },

    // === IO errors ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// Helper constructors for common error patterns
impl ShaderError {
    /// Create a link error carrying the backend's diagnostic log
    pub fn program_link(key: ProgramKey, log: impl fmt::Display) -> Self {
        Self::ProgramLink {
            key,
            log: log.to_string(),
        }
    }

    /// Create an invalid shader id error
    pub fn invalid_shader_id(text: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::InvalidShaderId {
            text: text.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying later with different generator input could succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::FailedStage { .. } | Self::ProgramLink { .. })
    }
}
