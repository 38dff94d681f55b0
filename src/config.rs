//! Shader manager configuration

use glam::Mat4;

/// Smallest vertex uniform budget (in vec4 slots) at which bone matrices are
/// declared as one array. Eight mat4 bones take 32 slots; the rest of the
/// transform and lighting uniforms take roughly as many again.
pub const BONE_ARRAY_MIN_UNIFORM_VECTORS: u32 = 128;

/// How bone matrices are declared in skinned vertex shaders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoneUniforms {
    /// One `u_bone[N]` array with contiguous locations
    Array,
    /// Eight separate `u_bone0` .. `u_bone7` uniforms
    Discrete,
}

/// Clip-space depth convention of the render target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClipDepth {
    /// GL convention, z in [-w, w]
    #[default]
    NegativeOneToOne,
    /// Vulkan/D3D/WebGPU convention, z in [0, w]
    ZeroToOne,
}

impl ClipDepth {
    /// Matrix applied after the projection to land in this convention.
    pub fn remap(self) -> Mat4 {
        match self {
            ClipDepth::NegativeOneToOne => Mat4::IDENTITY,
            ClipDepth::ZeroToOne => Mat4::from_cols_array(&[
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 0.5, 0.0, //
                0.0, 0.0, 0.5, 1.0,
            ]),
        }
    }
}

/// Configuration for the shader manager
#[derive(Debug, Clone)]
pub struct ShaderManagerConfig {
    /// Vertex uniform vec4 slots the target guarantees; selects the bone
    /// declaration strategy.
    pub max_vertex_uniform_vectors: u32,

    /// Depth convention the projection uploads are remapped to.
    pub clip_depth: ClipDepth,

    /// Retry a failed hardware-transform vertex shader with the generator's
    /// software-transform key.
    pub software_transform_fallback: bool,

    /// Dump the full source of shaders that fail to compile.
    pub log_failed_source: bool,
}

impl Default for ShaderManagerConfig {
    fn default() -> Self {
        Self {
            max_vertex_uniform_vectors: 256,
            clip_depth: ClipDepth::default(),
            software_transform_fallback: true,
            log_failed_source: cfg!(debug_assertions),
        }
    }
}

impl ShaderManagerConfig {
    /// Bone declaration strategy for programs linked under this config
    pub fn bone_uniforms(&self) -> BoneUniforms {
        if self.max_vertex_uniform_vectors >= BONE_ARRAY_MIN_UNIFORM_VECTORS {
            BoneUniforms::Array
        } else {
            BoneUniforms::Discrete
        }
    }
}
