//! Graphics-API binding used by the caches
//!
//! The manager never talks to a GPU API directly. Everything it needs from one
//! (compiling, linking, name lookup, uniform uploads, binding) goes through
//! `GraphicsBackend`, with GL-style semantics: programs expose uniforms and
//! attributes by name, and attribute arrays are toggled per slot.

use glam::{Mat4, Vec2, Vec3, Vec4};
use smallvec::SmallVec;

use crate::shader::StageKind;
use crate::uniforms::MAX_BONES;

/// Compiled stage object owned by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderHandle(pub u64);

/// Linked program owned by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u64);

/// Location of a uniform inside a linked program. Array elements occupy
/// consecutive locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniformLocation(pub i32);

impl UniformLocation {
    /// Location of array element `index` when `self` is element 0
    pub fn offset(self, index: usize) -> Self {
        Self(self.0 + index as i32)
    }
}

/// A value uploaded to one uniform location
#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    Int(i32),
    Float(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
    /// Consecutive elements starting at the given location
    Mat4Array(SmallVec<[Mat4; MAX_BONES]>),
}

/// Operations the shader caches need from the graphics API
pub trait GraphicsBackend {
    /// Compile one stage. The error carries the compiler's diagnostic log.
    fn compile(&mut self, stage: StageKind, source: &str) -> Result<ShaderHandle, String>;

    /// Link stage objects into a program. The error carries the link log.
    fn link(
        &mut self,
        vs: ShaderHandle,
        gs: Option<ShaderHandle>,
        fs: ShaderHandle,
    ) -> Result<ProgramHandle, String>;

    /// `None` when the program has no active uniform with this name.
    fn uniform_location(&self, program: ProgramHandle, name: &str) -> Option<UniformLocation>;

    /// Declared element count of the uniform at `location` (1 for non-arrays).
    fn uniform_array_len(&self, _program: ProgramHandle, _location: UniformLocation) -> usize {
        1
    }

    /// `None` when the program has no active attribute with this name.
    fn attribute_location(&self, program: ProgramHandle, name: &str) -> Option<u32>;

    fn upload(&mut self, program: ProgramHandle, location: UniformLocation, value: UniformValue);

    fn bind(&mut self, program: ProgramHandle);

    fn unbind(&mut self);

    /// Enable or disable the vertex attribute array at `slot`.
    fn set_attribute_enabled(&mut self, slot: u32, enabled: bool);

    fn destroy_shader(&mut self, shader: ShaderHandle);

    fn destroy_program(&mut self, program: ProgramHandle);
}
