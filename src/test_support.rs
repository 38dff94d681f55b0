//! In-memory backend and key-driven generator shared by the unit tests

use std::collections::{BTreeSet, HashMap};

use crate::backend::{GraphicsBackend, ProgramHandle, ShaderHandle, UniformLocation, UniformValue};
use crate::generator::ShaderSourceGenerator;
use crate::shader::StageKind;
use crate::shader_id::ShaderId;
use crate::state::Primitive;
use crate::uniforms::MAX_LIGHTS;

// Vertex key bits (word 0)
pub const VS_TEXCOORD: u32 = 1 << 0;
pub const VS_LIGHTING: u32 = 1 << 1;
pub const VS_THROUGH: u32 = 1 << 2;
pub const VS_SOFTWARE: u32 = 1 << 3;
/// Hardware variant does not compile; falls back to `VS_SOFTWARE`.
pub const VS_FAIL: u32 = 1 << 4;
pub const VS_STEREO: u32 = 1 << 5;
const VS_BONE_SHIFT: u32 = 8;

/// Vertex key bits for `count` bone matrices
pub fn skinned(count: u32) -> u32 {
    count << VS_BONE_SHIFT
}

// Fragment key bits (word 0)
pub const FS_TEXTURE: u32 = 1 << 0;
pub const FS_FOG: u32 = 1 << 1;
pub const FS_ALPHA_TEST: u32 = 1 << 2;
pub const FS_STENCIL: u32 = 1 << 3;
pub const FS_SHADER_BLEND: u32 = 1 << 4;
pub const FS_FAIL: u32 = 1 << 5;
/// Compiles, but refuses to link.
pub const FS_LINK_ERROR: u32 = 1 << 6;

// Geometry key bits (word 0)
pub const GS_EXPAND: u32 = 1 << 0;

pub fn vs_id(bits: u32) -> ShaderId {
    ShaderId::from_words([bits, 0, 0, 0])
}

pub fn fs_id(bits: u32) -> ShaderId {
    ShaderId::from_words([bits, 0, 0, 0])
}

/// Writes GL-style declarations for whatever the key bits ask for
#[derive(Debug, Clone)]
pub struct FeatureGenerator {
    /// Declare bones as `u_bone[N]` rather than `u_bone0..`
    pub bone_array: bool,
}

impl Default for FeatureGenerator {
    fn default() -> Self {
        Self { bone_array: true }
    }
}

impl FeatureGenerator {
    fn vertex(&self, bits: u32) -> String {
        let mut src = String::from("// vertex\n");
        if bits & VS_FAIL != 0 {
            src.push_str("#error hardware transform not supported\n");
            return src;
        }

        let software = bits & VS_SOFTWARE != 0;
        src.push_str("attribute vec3 position;\n");
        if bits & VS_THROUGH != 0 {
            src.push_str("uniform mat4 u_proj_through;\n");
        } else {
            src.push_str("uniform mat4 u_proj;\n");
            if bits & VS_STEREO != 0 {
                src.push_str("uniform vec4 u_StereoParams;\n");
            }
            if !software {
                src.push_str("uniform mat4 u_world;\nuniform mat4 u_view;\n");
            }
        }
        if bits & VS_TEXCOORD != 0 {
            src.push_str("attribute vec2 texcoord;\nuniform vec4 u_uvscaleoffset;\n");
        }
        if bits & VS_LIGHTING != 0 && !software {
            src.push_str("attribute vec3 normal;\n");
            src.push_str("uniform vec4 u_ambient;\nuniform vec4 u_matambientalpha;\n");
            src.push_str("uniform vec3 u_matdiffuse;\nuniform vec4 u_matspecular;\n");
            src.push_str("uniform vec3 u_matemissive;\n");
            for i in 0..MAX_LIGHTS {
                for (ty, field) in [
                    ("vec3", "pos"),
                    ("vec3", "dir"),
                    ("vec3", "att"),
                    ("vec3", "diffuse"),
                    ("vec3", "specular"),
                    ("vec3", "ambient"),
                ] {
                    src.push_str(&format!("uniform {} u_light{}{};\n", ty, field, i));
                }
            }
        }

        let bones = (bits >> VS_BONE_SHIFT) & 0xF;
        if bones > 0 && !software {
            src.push_str("attribute vec4 w1;\n");
            if bones > 4 {
                src.push_str("attribute vec4 w2;\n");
            }
            if self.bone_array {
                src.push_str(&format!("uniform mat4 u_bone[{}];\n", bones));
            } else {
                for i in 0..bones {
                    src.push_str(&format!("uniform mat4 u_bone{};\n", i));
                }
            }
        }
        src.push_str("void main() {}\n");
        src
    }

    fn fragment(&self, bits: u32) -> String {
        let mut src = String::from("// fragment\n");
        if bits & FS_FAIL != 0 {
            src.push_str("#error unsupported blend mode\n");
            return src;
        }
        if bits & FS_LINK_ERROR != 0 {
            src.push_str("#link_error\n");
        }
        if bits & FS_TEXTURE != 0 {
            src.push_str("uniform sampler2D u_tex;\nuniform vec3 u_texenv;\n");
        }
        if bits & FS_FOG != 0 {
            src.push_str("uniform vec3 u_fogcolor;\nuniform vec2 u_fogcoef;\n");
        }
        if bits & FS_ALPHA_TEST != 0 {
            src.push_str("uniform vec4 u_alphacolorref;\nuniform vec4 u_alphacolormask;\n");
        }
        if bits & FS_STENCIL != 0 {
            src.push_str("uniform float u_stencilReplaceValue;\n");
        }
        if bits & FS_SHADER_BLEND != 0 {
            src.push_str("uniform sampler2D u_fbotex;\n");
            src.push_str("uniform vec3 u_blendFixA;\nuniform vec3 u_blendFixB;\n");
            src.push_str("uniform vec2 u_fbotexSize;\n");
        }
        src.push_str("void main() {}\n");
        src
    }
}

impl ShaderSourceGenerator for FeatureGenerator {
    fn generate(&self, id: &ShaderId, stage: StageKind) -> String {
        let bits = id.words()[0];
        match stage {
            StageKind::Vertex => self.vertex(bits),
            StageKind::Geometry => String::from("// geometry\nvoid main() {}\n"),
            StageKind::Fragment => self.fragment(bits),
        }
    }

    fn uses_hw_transform(&self, id: &ShaderId) -> bool {
        id.words()[0] & VS_SOFTWARE == 0
    }

    fn uses_geometry_stage(&self, prim: Primitive, id: &ShaderId) -> bool {
        id.words()[0] & GS_EXPAND != 0 && prim != Primitive::Points
    }

    fn software_transform_fallback(&self, id: &ShaderId) -> Option<ShaderId> {
        let bits = id.words()[0];
        (bits & VS_FAIL != 0).then(|| vs_id((bits & !VS_FAIL) | VS_SOFTWARE))
    }

    fn describe(&self, id: &ShaderId, stage: StageKind) -> String {
        let bits = id.words()[0];
        let names: &[(u32, &str)] = match stage {
            StageKind::Vertex => &[
                (VS_TEXCOORD, "texcoord"),
                (VS_LIGHTING, "lighting"),
                (VS_THROUGH, "through"),
                (VS_SOFTWARE, "software"),
                (VS_STEREO, "stereo"),
            ],
            StageKind::Geometry => &[(GS_EXPAND, "expand")],
            StageKind::Fragment => &[
                (FS_TEXTURE, "texture"),
                (FS_FOG, "fog"),
                (FS_ALPHA_TEST, "alpha test"),
                (FS_STENCIL, "stencil"),
                (FS_SHADER_BLEND, "shader blend"),
            ],
        };
        let features: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| bits & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        format!("{}: {}", stage, features.join(", "))
    }
}

#[derive(Debug, Clone)]
struct UniformDecl {
    name: String,
    base: i32,
    len: usize,
}

#[derive(Debug, Default)]
struct ProgramInfo {
    uniforms: Vec<UniformDecl>,
    attributes: Vec<String>,
}

/// Backend that parses `uniform`/`attribute` declarations and records calls
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub compiles: usize,
    pub links: usize,
    pub binds: usize,
    pub destroyed_shaders: usize,
    pub destroyed_programs: usize,
    /// Every upload as (program, uniform name, value). Array elements are
    /// named `name[i]`; whole-array uploads are recorded at element 0.
    pub uploads: Vec<(ProgramHandle, String, UniformValue)>,
    pub bound: Option<ProgramHandle>,
    enabled: BTreeSet<u32>,
    next_handle: u64,
    shaders: HashMap<u64, String>,
    programs: HashMap<u64, ProgramInfo>,
}

impl RecordingBackend {
    pub fn uploaded_names(&self) -> Vec<String> {
        self.uploads.iter().map(|(_, name, _)| name.clone()).collect()
    }

    /// Most recent value uploaded to `name` in `program`
    pub fn uploaded_value(&self, program: ProgramHandle, name: &str) -> Option<&UniformValue> {
        self.uploads
            .iter()
            .rev()
            .find(|(handle, uploaded, _)| *handle == program && uploaded == name)
            .map(|(_, _, value)| value)
    }

    pub fn enabled_slots(&self) -> Vec<u32> {
        self.enabled.iter().copied().collect()
    }

    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn parse_into(source: &str, info: &mut ProgramInfo, next_location: &mut i32) {
        for line in source.lines() {
            let line = line.trim().trim_end_matches(';');
            let mut tokens = line.split_whitespace();
            let (Some(kind), Some(_ty), Some(name)) = (tokens.next(), tokens.next(), tokens.next())
            else {
                continue;
            };
            match kind {
                "uniform" => {
                    let (name, len) = match name.split_once('[') {
                        Some((base, rest)) => {
                            (base, rest.trim_end_matches(']').parse().unwrap_or(1))
                        }
                        None => (name, 1),
                    };
                    if info.uniforms.iter().any(|decl| decl.name == name) {
                        continue;
                    }
                    info.uniforms.push(UniformDecl {
                        name: name.to_string(),
                        base: *next_location,
                        len,
                    });
                    *next_location += len as i32;
                }
                "attribute" => {
                    if !info.attributes.iter().any(|attr| attr == name) {
                        info.attributes.push(name.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    fn uniform_name(&self, program: ProgramHandle, location: UniformLocation) -> String {
        let decl = self.programs.get(&program.0).and_then(|info| {
            info.uniforms
                .iter()
                .find(|decl| location.0 >= decl.base && location.0 < decl.base + decl.len as i32)
        });
        match decl {
            Some(decl) if decl.len > 1 => format!("{}[{}]", decl.name, location.0 - decl.base),
            Some(decl) => decl.name.clone(),
            None => format!("<location {}>", location.0),
        }
    }
}

impl GraphicsBackend for RecordingBackend {
    fn compile(&mut self, _stage: StageKind, source: &str) -> Result<ShaderHandle, String> {
        self.compiles += 1;
        if source.trim().is_empty() {
            return Err("empty shader source".to_string());
        }
        if let Some(line) = source.lines().find(|line| line.starts_with("#error")) {
            return Err(format!("0:1: error: {}", line.trim_start_matches("#error").trim()));
        }
        let handle = self.allocate();
        self.shaders.insert(handle, source.to_string());
        Ok(ShaderHandle(handle))
    }

    fn link(
        &mut self,
        vs: ShaderHandle,
        gs: Option<ShaderHandle>,
        fs: ShaderHandle,
    ) -> Result<ProgramHandle, String> {
        self.links += 1;
        let mut info = ProgramInfo::default();
        let mut next_location = 0;
        for shader in [Some(vs), gs, Some(fs)].into_iter().flatten() {
            let source = self
                .shaders
                .get(&shader.0)
                .ok_or_else(|| format!("unknown shader {}", shader.0))?;
            if source.contains("#link_error") {
                return Err("link error: varying mismatch".to_string());
            }
            Self::parse_into(source, &mut info, &mut next_location);
        }
        let handle = self.allocate();
        self.programs.insert(handle, info);
        Ok(ProgramHandle(handle))
    }

    fn uniform_location(&self, program: ProgramHandle, name: &str) -> Option<UniformLocation> {
        let info = self.programs.get(&program.0)?;
        info.uniforms
            .iter()
            .find(|decl| decl.name == name)
            .map(|decl| UniformLocation(decl.base))
    }

    fn uniform_array_len(&self, program: ProgramHandle, location: UniformLocation) -> usize {
        self.programs
            .get(&program.0)
            .and_then(|info| info.uniforms.iter().find(|decl| decl.base == location.0))
            .map_or(1, |decl| decl.len)
    }

    fn attribute_location(&self, program: ProgramHandle, name: &str) -> Option<u32> {
        let info = self.programs.get(&program.0)?;
        if !info.attributes.iter().any(|attr| attr == name) {
            return None;
        }
        crate::uniforms::Attribute::from_name(name).map(|attr| attr.slot())
    }

    fn upload(&mut self, program: ProgramHandle, location: UniformLocation, value: UniformValue) {
        let name = self.uniform_name(program, location);
        self.uploads.push((program, name, value));
    }

    fn bind(&mut self, program: ProgramHandle) {
        self.binds += 1;
        self.bound = Some(program);
    }

    fn unbind(&mut self) {
        self.bound = None;
    }

    fn set_attribute_enabled(&mut self, slot: u32, enabled: bool) {
        if enabled {
            self.enabled.insert(slot);
        } else {
            self.enabled.remove(&slot);
        }
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        self.destroyed_shaders += 1;
        self.shaders.remove(&shader.0);
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        self.destroyed_programs += 1;
        self.programs.remove(&program.0);
    }
}
