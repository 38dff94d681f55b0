//! Shader variant cache for fixed-function pipeline emulation
//!
//! Every distinct combination of emulated render state maps to a `ShaderId`.
//! The `ShaderManager` compiles one stage object per key and stage, links one
//! program per stage combination, and keeps uniform uploads down to the groups
//! that changed since each program last saw them.
//!
//! The graphics API sits behind `GraphicsBackend` and source synthesis behind
//! `ShaderSourceGenerator`. With the `naga` feature, `NagaBackend` provides a
//! validating in-memory backend for tools and tests.

mod backend;
mod config;
mod error;
mod generator;
mod manager;
mod program;
mod shader;
mod shader_id;
mod stage_cache;
mod state;
mod uniforms;

#[cfg(feature = "naga")]
mod naga_backend;

#[cfg(test)]
mod test_support;

use log::LevelFilter;

pub use backend::{GraphicsBackend, ProgramHandle, ShaderHandle, UniformLocation, UniformValue};
pub use config::{BoneUniforms, ClipDepth, ShaderManagerConfig, BONE_ARRAY_MIN_UNIFORM_VECTORS};
pub use error::{Result, ShaderError};
pub use generator::{ShaderSourceGenerator, SourceTable};
pub use manager::{ShaderManager, ShaderStats};
pub use program::{LinkedProgram, ProgramBinding, ProgramCache, ProgramKey, StageInput};
pub use shader::{DebugShaderStringType, Shader, StageKind};
pub use shader_id::ShaderId;
pub use stage_cache::{StageCache, StageObjectHandle, StageStats};
pub use state::{
    color3, color4, color4_255, DepthRange, DisplayRotation, DrawState, FogState, LightKind,
    LightState, MaterialState, Primitive, ShaderBlendState, TextureState, UvGenMode, UvState,
    Viewport,
};
pub use uniforms::{Attribute, AttributeMask, UniformGroups, MAX_BONES, MAX_LIGHTS};

#[cfg(feature = "naga")]
pub use naga_backend::{glsl_to_module, NagaBackend};

/// Install an env_logger backend once. Set `FFP_SHADERS_DEBUG` for debug
/// output (cache hits and misses).
pub fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let log_level = if std::env::var("FFP_SHADERS_DEBUG").is_ok() {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        };

        // Another logger may already be installed by the host application.
        let _ = env_logger::Builder::new().filter_level(log_level).try_init();
    });
}
