//! Shader source generation seam
//!
//! Source synthesis lives outside this crate. The caches only need a pure
//! function from (key, stage) to source, plus a few questions about what a key
//! means that only the key's encoder can answer.

use std::collections::HashMap;

use crate::shader::StageKind;
use crate::shader_id::ShaderId;
use crate::state::Primitive;

/// Produces shader source for a configuration key
pub trait ShaderSourceGenerator {
    /// Deterministic, side-effect free.
    fn generate(&self, id: &ShaderId, stage: StageKind) -> String;

    /// Whether the vertex variant for `id` runs the transform on the GPU.
    fn uses_hw_transform(&self, _id: &ShaderId) -> bool {
        true
    }

    /// Whether draws of `prim` with vertex key `id` need a geometry stage.
    fn uses_geometry_stage(&self, _prim: Primitive, _id: &ShaderId) -> bool {
        false
    }

    /// Key of the software-transform variant to use when the hardware
    /// transform vertex shader for `id` fails to compile.
    fn software_transform_fallback(&self, _id: &ShaderId) -> Option<ShaderId> {
        None
    }

    /// Short human readable description for debug listings.
    fn describe(&self, id: &ShaderId, stage: StageKind) -> String {
        format!("{} {}", stage, id)
    }
}

/// Generator backed by prebuilt sources, for tools and tests
#[derive(Debug, Clone, Default)]
pub struct SourceTable {
    sources: HashMap<(StageKind, ShaderId), String>,
    software_fallbacks: HashMap<ShaderId, ShaderId>,
}

impl SourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stage: StageKind, id: ShaderId, source: impl Into<String>) {
        self.sources.insert((stage, id), source.into());
    }

    pub fn with_source(mut self, stage: StageKind, id: ShaderId, source: impl Into<String>) -> Self {
        self.insert(stage, id, source);
        self
    }

    /// Use `fallback` when the vertex source for `id` does not compile.
    pub fn with_software_fallback(mut self, id: ShaderId, fallback: ShaderId) -> Self {
        self.software_fallbacks.insert(id, fallback);
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl ShaderSourceGenerator for SourceTable {
    /// Unknown keys produce empty source, which no backend compiles.
    fn generate(&self, id: &ShaderId, stage: StageKind) -> String {
        self.sources.get(&(stage, *id)).cloned().unwrap_or_default()
    }

    fn uses_hw_transform(&self, id: &ShaderId) -> bool {
        !self.software_fallbacks.values().any(|fallback| fallback == id)
    }

    fn uses_geometry_stage(&self, _prim: Primitive, id: &ShaderId) -> bool {
        self.sources.contains_key(&(StageKind::Geometry, *id))
    }

    fn software_transform_fallback(&self, id: &ShaderId) -> Option<ShaderId> {
        self.software_fallbacks.get(id).copied()
    }
}
