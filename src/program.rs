//! Linked programs and the program cache
//!
//! A `LinkedProgram` resolves every uniform and attribute it could need once,
//! at link time. Names the variant does not declare resolve to `None` and the
//! matching uniform groups are left out of `available_uniforms()`, so they are
//! never uploaded to this program.
//!
//! Each program keeps its own stale set. Groups dirtied while another program
//! is active are parked in the cache's pending set and handed to every other
//! program when the active program changes.

use std::fmt;

use hashbrown::hash_map::{Entry, HashMap};

use crate::backend::{GraphicsBackend, ProgramHandle, UniformLocation, UniformValue};
use crate::config::{BoneUniforms, ClipDepth, ShaderManagerConfig};
use crate::error::{Result, ShaderError};
use crate::shader::Shader;
use crate::shader_id::ShaderId;
use crate::stage_cache::StageObjectHandle;
use crate::state::{color3, color4, color4_255, DrawState};
use crate::uniforms::{Attribute, AttributeMask, UniformGroups, MAX_BONES, MAX_LIGHTS};

/// Identity of a linked program: the keys of its stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    pub vs: ShaderId,
    pub gs: Option<ShaderId>,
    pub fs: ShaderId,
}

impl fmt::Display for ProgramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.gs {
            Some(gs) => write!(f, "vs {} / gs {} / fs {}", self.vs, gs, self.fs),
            None => write!(f, "vs {} / fs {}", self.vs, self.fs),
        }
    }
}

/// A cached stage object offered as link input
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    pub handle: StageObjectHandle,
    pub shader: &'a Shader,
}

/// What a program needs to know about the program bound before it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramBinding {
    pub handle: ProgramHandle,
    pub attributes: AttributeMask,
}

#[derive(Debug, Default, Clone, Copy)]
struct LightLocations {
    position: Option<UniformLocation>,
    direction: Option<UniformLocation>,
    attenuation: Option<UniformLocation>,
    angle: Option<UniformLocation>,
    spot_coef: Option<UniformLocation>,
    ambient: Option<UniformLocation>,
    diffuse: Option<UniformLocation>,
    specular: Option<UniformLocation>,
}

impl LightLocations {
    fn resolve<B: GraphicsBackend + ?Sized>(backend: &B, program: ProgramHandle, index: usize) -> Self {
        let find = |field: &str| backend.uniform_location(program, &format!("u_light{}{}", field, index));
        Self {
            position: find("pos"),
            direction: find("dir"),
            attenuation: find("att"),
            angle: find("angle"),
            spot_coef: find("spotCoef"),
            ambient: find("ambient"),
            diffuse: find("diffuse"),
            specular: find("specular"),
        }
    }

    fn any(&self) -> bool {
        [
            self.position,
            self.direction,
            self.attenuation,
            self.angle,
            self.spot_coef,
            self.ambient,
            self.diffuse,
            self.specular,
        ]
        .iter()
        .any(Option::is_some)
    }
}

/// Bone matrix locations, fixed at link time
#[derive(Debug, Clone, Copy, PartialEq)]
enum BoneLocations {
    Absent,
    Array { base: UniformLocation, count: usize },
    Discrete([Option<UniformLocation>; MAX_BONES]),
}

impl BoneLocations {
    fn resolve<B: GraphicsBackend + ?Sized>(
        backend: &B,
        program: ProgramHandle,
        strategy: BoneUniforms,
        use_hw_transform: bool,
    ) -> Self {
        // Software transform skins on the CPU.
        if !use_hw_transform {
            return BoneLocations::Absent;
        }

        match strategy {
            BoneUniforms::Array => match backend.uniform_location(program, "u_bone") {
                Some(base) => BoneLocations::Array {
                    base,
                    count: backend.uniform_array_len(program, base).clamp(1, MAX_BONES),
                },
                None => BoneLocations::Absent,
            },
            BoneUniforms::Discrete => {
                let mut locations = [None; MAX_BONES];
                for (i, location) in locations.iter_mut().enumerate() {
                    *location = backend.uniform_location(program, &format!("u_bone{}", i));
                }
                if locations.iter().all(Option::is_none) {
                    BoneLocations::Absent
                } else {
                    BoneLocations::Discrete(locations)
                }
            }
        }
    }

    fn groups(&self) -> UniformGroups {
        match self {
            BoneLocations::Absent => UniformGroups::empty(),
            BoneLocations::Array { count, .. } => UniformGroups::bones(*count),
            BoneLocations::Discrete(locations) => locations
                .iter()
                .enumerate()
                .filter(|(_, location)| location.is_some())
                .fold(UniformGroups::empty(), |acc, (i, _)| acc | UniformGroups::bone(i)),
        }
    }

    fn strategy(&self) -> Option<BoneUniforms> {
        match self {
            BoneLocations::Absent => None,
            BoneLocations::Array { .. } => Some(BoneUniforms::Array),
            BoneLocations::Discrete(_) => Some(BoneUniforms::Discrete),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct UniformLocations {
    proj: Option<UniformLocation>,
    proj_through: Option<UniformLocation>,
    stereo_params: Option<UniformLocation>,
    tex_env: Option<UniformLocation>,
    view: Option<UniformLocation>,
    world: Option<UniformLocation>,
    tex_matrix: Option<UniformLocation>,
    depth_range: Option<UniformLocation>,
    stencil_replace_value: Option<UniformLocation>,

    // Shader blending
    blend_fix_a: Option<UniformLocation>,
    blend_fix_b: Option<UniformLocation>,
    fbotex_size: Option<UniformLocation>,

    // Fragment tests and fog
    alpha_color_ref: Option<UniformLocation>,
    alpha_color_mask: Option<UniformLocation>,
    fog_color: Option<UniformLocation>,
    fog_coef: Option<UniformLocation>,

    // Texturing
    uv_scale_offset: Option<UniformLocation>,
    tex_clamp: Option<UniformLocation>,
    tex_clamp_off: Option<UniformLocation>,

    // Lighting
    ambient: Option<UniformLocation>,
    mat_ambient_alpha: Option<UniformLocation>,
    mat_diffuse: Option<UniformLocation>,
    mat_specular: Option<UniformLocation>,
    mat_emissive: Option<UniformLocation>,
    lights: [LightLocations; MAX_LIGHTS],
}

impl UniformLocations {
    fn resolve<B: GraphicsBackend + ?Sized>(backend: &B, program: ProgramHandle) -> Self {
        let find = |name: &str| backend.uniform_location(program, name);
        let mut lights = [LightLocations::default(); MAX_LIGHTS];
        for (i, light) in lights.iter_mut().enumerate() {
            *light = LightLocations::resolve(backend, program, i);
        }

        Self {
            proj: find("u_proj"),
            proj_through: find("u_proj_through"),
            stereo_params: find("u_StereoParams"),
            tex_env: find("u_texenv"),
            view: find("u_view"),
            world: find("u_world"),
            tex_matrix: find("u_texmtx"),
            depth_range: find("u_depthRange"),
            stencil_replace_value: find("u_stencilReplaceValue"),
            blend_fix_a: find("u_blendFixA"),
            blend_fix_b: find("u_blendFixB"),
            fbotex_size: find("u_fbotexSize"),
            alpha_color_ref: find("u_alphacolorref"),
            alpha_color_mask: find("u_alphacolormask"),
            fog_color: find("u_fogcolor"),
            fog_coef: find("u_fogcoef"),
            uv_scale_offset: find("u_uvscaleoffset"),
            tex_clamp: find("u_texclamp"),
            tex_clamp_off: find("u_texclampoff"),
            ambient: find("u_ambient"),
            mat_ambient_alpha: find("u_matambientalpha"),
            mat_diffuse: find("u_matdiffuse"),
            mat_specular: find("u_matspecular"),
            mat_emissive: find("u_matemissive"),
            lights,
        }
    }

    fn groups(&self) -> UniformGroups {
        let mut groups = UniformGroups::empty();
        let singles = [
            (self.proj, UniformGroups::PROJ_MATRIX),
            (self.proj_through, UniformGroups::PROJ_THROUGH_MATRIX),
            (self.stereo_params, UniformGroups::PROJ_MATRIX),
            (self.tex_env, UniformGroups::TEX_ENV),
            (self.alpha_color_ref, UniformGroups::ALPHA_COLOR_REF),
            (self.alpha_color_mask, UniformGroups::ALPHA_COLOR_MASK),
            (self.fog_color, UniformGroups::FOG_COLOR),
            (self.fog_coef, UniformGroups::FOG_COEF),
            (self.tex_matrix, UniformGroups::TEX_MATRIX),
            (self.stencil_replace_value, UniformGroups::STENCIL_REPLACE_VALUE),
            (self.blend_fix_a, UniformGroups::SHADER_BLEND),
            (self.blend_fix_b, UniformGroups::SHADER_BLEND),
            (self.fbotex_size, UniformGroups::SHADER_BLEND),
            (self.depth_range, UniformGroups::DEPTH_RANGE),
            (self.ambient, UniformGroups::AMBIENT),
            (self.mat_ambient_alpha, UniformGroups::MAT_AMBIENT_ALPHA),
            (self.mat_diffuse, UniformGroups::MAT_DIFFUSE),
            (self.mat_specular, UniformGroups::MAT_SPECULAR),
            (self.mat_emissive, UniformGroups::MAT_EMISSIVE),
            (self.world, UniformGroups::WORLD_MATRIX),
            (self.view, UniformGroups::VIEW_MATRIX),
            (self.uv_scale_offset, UniformGroups::UV_SCALE_OFFSET),
            (self.tex_clamp, UniformGroups::TEX_CLAMP),
            (self.tex_clamp_off, UniformGroups::TEX_CLAMP),
        ];
        for (location, group) in singles {
            if location.is_some() {
                groups |= group;
            }
        }
        for (i, light) in self.lights.iter().enumerate() {
            if light.any() {
                groups |= UniformGroups::light(i);
            }
        }
        groups
    }
}

fn set<B: GraphicsBackend + ?Sized>(
    backend: &mut B,
    program: ProgramHandle,
    location: Option<UniformLocation>,
    value: UniformValue,
) {
    if let Some(location) = location {
        backend.upload(program, location, value);
    }
}

/// One linked vertex/geometry/fragment combination
#[derive(Debug)]
pub struct LinkedProgram {
    key: ProgramKey,
    handle: ProgramHandle,
    vs: StageObjectHandle,
    gs: Option<StageObjectHandle>,
    fs: StageObjectHandle,
    use_hw_transform: bool,
    clip_depth: ClipDepth,
    attributes: AttributeMask,
    locations: UniformLocations,
    bones: BoneLocations,
    available: UniformGroups,
    stale: UniformGroups,
}

impl LinkedProgram {
    /// Link the inputs and resolve everything the program could upload.
    /// The new program starts with every group stale.
    pub fn link<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        key: ProgramKey,
        vs: StageInput<'_>,
        gs: Option<StageInput<'_>>,
        fs: StageInput<'_>,
        config: &ShaderManagerConfig,
    ) -> Result<Self> {
        let compiled = |input: StageInput<'_>| {
            input.shader.handle().ok_or(ShaderError::FailedStage {
                stage: input.shader.stage(),
                id: *input.shader.id(),
            })
        };
        let vs_handle = compiled(vs)?;
        let gs_handle = gs.map(compiled).transpose()?;
        let fs_handle = compiled(fs)?;

        let handle = backend.link(vs_handle, gs_handle, fs_handle).map_err(|log| {
            log::error!("Could not link program {}: {}", key, log);
            ShaderError::program_link(key, log)
        })?;

        // Sampler units never change; set them once.
        backend.bind(handle);
        for (name, unit) in [("u_tex", 0), ("u_fbotex", 1), ("u_testtex", 2)] {
            if let Some(location) = backend.uniform_location(handle, name) {
                backend.upload(handle, location, UniformValue::Int(unit));
            }
        }

        let mut attributes = AttributeMask::empty();
        for attr in Attribute::ALL {
            if let Some(slot) = backend.attribute_location(handle, attr.name()) {
                if slot != attr.slot() {
                    log::warn!(
                        "Program {}: attribute '{}' at slot {}, expected {}",
                        key,
                        attr.name(),
                        slot,
                        attr.slot()
                    );
                }
                attributes |= attr.mask();
            }
        }

        let use_hw_transform = vs.shader.use_hw_transform();
        let locations = UniformLocations::resolve(&*backend, handle);
        let bones = BoneLocations::resolve(&*backend, handle, config.bone_uniforms(), use_hw_transform);
        let available = locations.groups() | bones.groups();

        if available.contains(UniformGroups::PROJ_MATRIX | UniformGroups::PROJ_THROUGH_MATRIX) {
            log::warn!("Program {} declares both projection matrices", key);
        }

        log::info!(
            "Linked program {} (hw transform: {}, attributes: {:?}, uniform groups: {:#010x})",
            key,
            use_hw_transform,
            attributes,
            available.bits()
        );

        Ok(Self {
            key,
            handle,
            vs: vs.handle,
            gs: gs.map(|input| input.handle),
            fs: fs.handle,
            use_hw_transform,
            clip_depth: config.clip_depth,
            attributes,
            locations,
            bones,
            available,
            stale: UniformGroups::all(),
        })
    }

    /// Make this the bound program and push its stale uniforms. Binding and
    /// attribute toggling are skipped when `previous` is this program.
    /// Returns the groups this program contains.
    pub fn activate<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        state: &DrawState,
        previous: Option<ProgramBinding>,
        is_clear: bool,
    ) -> UniformGroups {
        let switched = previous.map_or(true, |prev| prev.handle != self.handle);
        if switched {
            backend.bind(self.handle);

            // Unknown previous state: disable everything this program does not use.
            let (enable, disable) = match previous {
                Some(prev) => (
                    self.attributes - prev.attributes,
                    prev.attributes - self.attributes,
                ),
                None => (self.attributes, AttributeMask::all() - self.attributes),
            };
            for attr in disable.attributes() {
                backend.set_attribute_enabled(attr.slot(), false);
            }
            for attr in enable.attributes() {
                backend.set_attribute_enabled(attr.slot(), true);
            }
        }

        self.update_uniforms(backend, state, is_clear);
        self.available
    }

    /// Upload every stale group this program contains. A clear pass only
    /// uploads `UniformGroups::CLEAR_PASS`; the rest stays stale.
    /// Returns the uploaded groups.
    pub fn update_uniforms<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        state: &DrawState,
        is_clear: bool,
    ) -> UniformGroups {
        let mut dirty = self.stale & self.available;
        if is_clear {
            dirty &= UniformGroups::CLEAR_PASS;
        }
        if dirty.is_empty() {
            return dirty;
        }
        self.stale.remove(dirty);

        let program = self.handle;
        let l = &self.locations;

        if dirty.contains(UniformGroups::PROJ_MATRIX) {
            let proj = state.projection_matrix(self.clip_depth);
            set(backend, program, l.proj, UniformValue::Mat4(proj));
            // Stereo eye parameters travel with the projection.
            set(backend, program, l.stereo_params, UniformValue::Vec4(state.stereo));
        }
        if dirty.contains(UniformGroups::PROJ_THROUGH_MATRIX) {
            let proj = state.through_projection_matrix(self.clip_depth);
            set(backend, program, l.proj_through, UniformValue::Mat4(proj));
        }
        if dirty.contains(UniformGroups::TEX_ENV) {
            set(backend, program, l.tex_env, UniformValue::Vec3(color3(state.tex_env_color)));
        }
        if dirty.contains(UniformGroups::ALPHA_COLOR_REF) {
            let reference = color4_255(state.color_test_ref, state.alpha_test_ref);
            set(backend, program, l.alpha_color_ref, UniformValue::Vec4(reference));
        }
        if dirty.contains(UniformGroups::ALPHA_COLOR_MASK) {
            let mask = color4_255(state.color_test_mask, state.alpha_test_mask);
            set(backend, program, l.alpha_color_mask, UniformValue::Vec4(mask));
        }
        if dirty.contains(UniformGroups::STENCIL_REPLACE_VALUE) {
            let value = UniformValue::Float(state.stencil_replace_value());
            set(backend, program, l.stencil_replace_value, value);
        }
        if dirty.contains(UniformGroups::FOG_COLOR) {
            set(backend, program, l.fog_color, UniformValue::Vec3(color3(state.fog.color)));
        }
        if dirty.contains(UniformGroups::FOG_COEF) {
            set(backend, program, l.fog_coef, UniformValue::Vec2(state.fog_coef()));
        }
        if dirty.contains(UniformGroups::SHADER_BLEND) {
            set(backend, program, l.blend_fix_a, UniformValue::Vec3(color3(state.blend.fix_a)));
            set(backend, program, l.blend_fix_b, UniformValue::Vec3(color3(state.blend.fix_b)));
            let texel = UniformValue::Vec2(state.framebuffer_texel_size());
            set(backend, program, l.fbotex_size, texel);
        }
        if dirty.contains(UniformGroups::DEPTH_RANGE) {
            let range = UniformValue::Vec4(state.depth_range_vector());
            set(backend, program, l.depth_range, range);
        }
        if dirty.contains(UniformGroups::UV_SCALE_OFFSET) {
            let uv = UniformValue::Vec4(state.uv_scale_offset());
            set(backend, program, l.uv_scale_offset, uv);
        }
        if dirty.contains(UniformGroups::TEX_CLAMP) {
            set(backend, program, l.tex_clamp, UniformValue::Vec4(state.tex_clamp()));
            let offset = UniformValue::Vec2(state.tex_clamp_offset());
            set(backend, program, l.tex_clamp_off, offset);
        }

        // Transform matrices
        if dirty.contains(UniformGroups::WORLD_MATRIX) {
            set(backend, program, l.world, UniformValue::Mat4(state.world));
        }
        if dirty.contains(UniformGroups::VIEW_MATRIX) {
            set(backend, program, l.view, UniformValue::Mat4(state.view));
        }
        if dirty.contains(UniformGroups::TEX_MATRIX) {
            set(backend, program, l.tex_matrix, UniformValue::Mat4(state.tex_matrix));
        }
        self.upload_bones(backend, state, dirty);

        // Lighting
        if dirty.contains(UniformGroups::AMBIENT) {
            let ambient = color4(state.ambient_color, state.ambient_alpha);
            set(backend, program, l.ambient, UniformValue::Vec4(ambient));
        }
        if dirty.contains(UniformGroups::MAT_AMBIENT_ALPHA) {
            let ambient = color4(state.material.ambient, state.material.ambient_alpha);
            set(backend, program, l.mat_ambient_alpha, UniformValue::Vec4(ambient));
        }
        if dirty.contains(UniformGroups::MAT_DIFFUSE) {
            let diffuse = UniformValue::Vec3(color3(state.material.diffuse));
            set(backend, program, l.mat_diffuse, diffuse);
        }
        if dirty.contains(UniformGroups::MAT_EMISSIVE) {
            let emissive = UniformValue::Vec3(color3(state.material.emissive));
            set(backend, program, l.mat_emissive, emissive);
        }
        if dirty.contains(UniformGroups::MAT_SPECULAR) {
            let specular = color3(state.material.specular).extend(state.material.specular_coef);
            set(backend, program, l.mat_specular, UniformValue::Vec4(specular));
        }
        for i in 0..MAX_LIGHTS {
            if dirty.contains(UniformGroups::light(i)) {
                Self::upload_light(backend, program, &l.lights[i], state, i);
            }
        }

        dirty
    }

    fn upload_light<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        program: ProgramHandle,
        locations: &LightLocations,
        state: &DrawState,
        index: usize,
    ) {
        let light = &state.lights[index];
        set(backend, program, locations.position, UniformValue::Vec3(state.light_position(index)));
        set(backend, program, locations.direction, UniformValue::Vec3(light.direction));
        set(backend, program, locations.attenuation, UniformValue::Vec3(light.attenuation));
        set(backend, program, locations.angle, UniformValue::Float(light.cone_cos));
        set(backend, program, locations.spot_coef, UniformValue::Float(light.spot_exponent));
        set(backend, program, locations.ambient, UniformValue::Vec3(color3(light.ambient)));
        set(backend, program, locations.diffuse, UniformValue::Vec3(color3(light.diffuse)));
        set(backend, program, locations.specular, UniformValue::Vec3(color3(light.specular)));
    }

    fn upload_bones<B: GraphicsBackend + ?Sized>(
        &self,
        backend: &mut B,
        state: &DrawState,
        dirty: UniformGroups,
    ) {
        match self.bones {
            BoneLocations::Absent => {}
            BoneLocations::Array { base, count } => {
                let all = UniformGroups::bones(count);
                let dirty_bones = dirty & all;
                if dirty_bones == all {
                    let matrices = state.bones[..count].iter().copied().collect();
                    backend.upload(self.handle, base, UniformValue::Mat4Array(matrices));
                } else {
                    for i in 0..count {
                        if dirty_bones.contains(UniformGroups::bone(i)) {
                            let value = UniformValue::Mat4(state.bones[i]);
                            backend.upload(self.handle, base.offset(i), value);
                        }
                    }
                }
            }
            BoneLocations::Discrete(locations) => {
                for (i, location) in locations.iter().enumerate() {
                    if dirty.contains(UniformGroups::bone(i)) {
                        set(backend, self.handle, *location, UniformValue::Mat4(state.bones[i]));
                    }
                }
            }
        }
    }

    /// Disable the attribute arrays this program enabled and unbind it.
    pub fn deactivate<B: GraphicsBackend + ?Sized>(&self, backend: &mut B) {
        for attr in self.attributes.attributes() {
            backend.set_attribute_enabled(attr.slot(), false);
        }
        backend.unbind();
    }

    pub(crate) fn mark_stale(&mut self, groups: UniformGroups) {
        self.stale |= groups;
    }

    pub(crate) fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        backend.destroy_program(self.handle);
    }

    pub fn key(&self) -> &ProgramKey {
        &self.key
    }

    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }

    pub fn binding(&self) -> ProgramBinding {
        ProgramBinding {
            handle: self.handle,
            attributes: self.attributes,
        }
    }

    pub fn vertex_shader(&self) -> StageObjectHandle {
        self.vs
    }

    pub fn geometry_shader(&self) -> Option<StageObjectHandle> {
        self.gs
    }

    pub fn fragment_shader(&self) -> StageObjectHandle {
        self.fs
    }

    pub fn use_hw_transform(&self) -> bool {
        self.use_hw_transform
    }

    /// Vertex attributes the program reads
    pub fn attributes(&self) -> AttributeMask {
        self.attributes
    }

    /// Uniform groups present in this program
    pub fn available_uniforms(&self) -> UniformGroups {
        self.available
    }

    /// Groups this program holds outdated values for (including absent ones)
    pub fn stale_uniforms(&self) -> UniformGroups {
        self.stale
    }

    /// How bone matrices were resolved, `None` for unskinned programs
    pub fn bone_uniforms(&self) -> Option<BoneUniforms> {
        self.bones.strategy()
    }
}

/// Content-addressed store of linked programs
#[derive(Debug, Default)]
pub struct ProgramCache {
    programs: HashMap<ProgramKey, LinkedProgram>,
    pending: UniformGroups,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ProgramKey) -> Option<&LinkedProgram> {
        self.programs.get(key)
    }

    pub fn get_mut(&mut self, key: &ProgramKey) -> Option<&mut LinkedProgram> {
        self.programs.get_mut(key)
    }

    /// Store a freshly linked program. Keys are unique; a program for `key`
    /// must not already be cached.
    pub fn insert(&mut self, program: LinkedProgram) -> &mut LinkedProgram {
        match self.programs.entry(program.key) {
            Entry::Vacant(entry) => entry.insert(program),
            Entry::Occupied(entry) => {
                debug_assert!(false, "program {} linked twice", program.key);
                log::error!("Program {} linked twice, keeping the first", program.key);
                entry.into_mut()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ProgramKey> {
        self.programs.keys()
    }

    /// Park groups dirtied while a single program was active.
    pub fn mark_pending(&mut self, groups: UniformGroups) {
        self.pending |= groups;
    }

    pub fn pending(&self) -> UniformGroups {
        self.pending
    }

    /// Hand pending groups to every program except `outgoing`, which received
    /// them directly while it was active.
    pub fn settle(&mut self, outgoing: Option<ProgramKey>) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        for (key, program) in self.programs.iter_mut() {
            if Some(*key) != outgoing {
                program.mark_stale(pending);
            }
        }
    }

    /// Drop every program, releasing backend handles when `destroy` is set.
    pub fn clear<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B, destroy: bool) {
        let count = self.programs.len();
        for (_, program) in self.programs.drain() {
            if destroy {
                program.destroy(backend);
            }
        }
        self.pending = UniformGroups::empty();
        if count > 0 {
            log::info!("Cleared program cache: {} programs removed", count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::StageKind;
    use crate::stage_cache::StageCache;
    use crate::test_support::*;
    use glam::{Mat4, Vec4};

    struct Fixture {
        backend: RecordingBackend,
        generator: FeatureGenerator,
        vs_cache: StageCache,
        fs_cache: StageCache,
        config: ShaderManagerConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                backend: RecordingBackend::default(),
                generator: FeatureGenerator::default(),
                vs_cache: StageCache::new(StageKind::Vertex),
                fs_cache: StageCache::new(StageKind::Fragment),
                config: ShaderManagerConfig::default(),
            }
        }

        fn link(&mut self, vs_bits: u32, fs_bits: u32) -> Result<LinkedProgram> {
            let vs_id = ShaderId::from_words([vs_bits, 0, 0, 0]);
            let fs_id = ShaderId::from_words([fs_bits, 0, 0, 0]);
            let vs = self.vs_cache.get_or_create(&vs_id, &self.generator, &mut self.backend, false);
            let fs = self.fs_cache.get_or_create(&fs_id, &self.generator, &mut self.backend, false);
            let key = ProgramKey { vs: vs_id, gs: None, fs: fs_id };
            LinkedProgram::link(
                &mut self.backend,
                key,
                StageInput { handle: vs, shader: self.vs_cache.get(vs).unwrap() },
                None,
                StageInput { handle: fs, shader: self.fs_cache.get(fs).unwrap() },
                &self.config,
            )
        }
    }

    #[test]
    fn test_link_resolves_present_groups() {
        let mut fx = Fixture::new();
        let program = fx.link(VS_TEXCOORD, FS_TEXTURE | FS_FOG).unwrap();

        let available = program.available_uniforms();
        assert!(available.contains(UniformGroups::PROJ_MATRIX));
        assert!(available.contains(UniformGroups::UV_SCALE_OFFSET));
        assert!(available.contains(UniformGroups::TEX_ENV));
        assert!(available.contains(UniformGroups::FOG_COLOR | UniformGroups::FOG_COEF));
        assert!(!available.intersects(UniformGroups::LIGHTS));
        assert!(!available.contains(UniformGroups::PROJ_THROUGH_MATRIX));

        assert_eq!(program.attributes(), AttributeMask::POSITION | AttributeMask::TEXCOORD);
        assert_eq!(program.stale_uniforms(), UniformGroups::all());
        assert_eq!(program.bone_uniforms(), None);
    }

    #[test]
    fn test_link_sets_sampler_units() {
        let mut fx = Fixture::new();
        let program = fx.link(VS_TEXCOORD, FS_TEXTURE).unwrap();
        assert_eq!(
            fx.backend.uploaded_value(program.handle(), "u_tex"),
            Some(&UniformValue::Int(0))
        );
    }

    #[test]
    fn test_shader_blend_group() {
        let mut fx = Fixture::new();
        let mut program = fx.link(0, FS_SHADER_BLEND).unwrap();
        assert!(program.available_uniforms().contains(UniformGroups::SHADER_BLEND));
        assert_eq!(
            fx.backend.uploaded_value(program.handle(), "u_fbotex"),
            Some(&UniformValue::Int(1))
        );

        let state = DrawState::default();
        fx.backend.uploads.clear();
        program.mark_stale(UniformGroups::all());
        program.update_uniforms(&mut fx.backend, &state, false);
        let names = fx.backend.uploaded_names();
        for name in ["u_blendFixA", "u_blendFixB", "u_fbotexSize"] {
            assert!(names.contains(&name.to_string()), "{names:?}");
        }
    }

    #[test]
    fn test_stereo_params_follow_projection() {
        let mut fx = Fixture::new();
        let mut program = fx.link(VS_STEREO, 0).unwrap();
        assert!(program.available_uniforms().contains(UniformGroups::PROJ_MATRIX));

        let mut state = DrawState::default();
        state.stereo = Vec4::new(0.5, -0.5, 1.0, 0.0);
        program.update_uniforms(&mut fx.backend, &state, false);
        assert_eq!(
            fx.backend.uploaded_value(program.handle(), "u_StereoParams"),
            Some(&UniformValue::Vec4(Vec4::new(0.5, -0.5, 1.0, 0.0)))
        );

        fx.backend.uploads.clear();
        program.mark_stale(UniformGroups::PROJ_MATRIX);
        program.update_uniforms(&mut fx.backend, &state, false);
        let mut names = fx.backend.uploaded_names();
        names.sort();
        assert_eq!(names, vec!["u_StereoParams".to_string(), "u_proj".to_string()]);
    }

    #[test]
    fn test_link_failure_carries_log() {
        let mut fx = Fixture::new();
        let err = fx.link(0, FS_LINK_ERROR).unwrap_err();
        match err {
            ShaderError::ProgramLink { log, .. } => assert!(log.contains("link error")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_failed_input_is_rejected() {
        let mut fx = Fixture::new();
        let err = fx.link(0, FS_FAIL).unwrap_err();
        assert!(matches!(err, ShaderError::FailedStage { stage: StageKind::Fragment, .. }));
        assert_eq!(fx.backend.links, 0);
    }

    #[test]
    fn test_activate_uploads_only_stale_groups() {
        let mut fx = Fixture::new();
        let mut program = fx.link(VS_TEXCOORD, FS_TEXTURE | FS_FOG).unwrap();
        let state = DrawState::default();

        let present = program.activate(&mut fx.backend, &state, None, false);
        assert_eq!(present, program.available_uniforms());
        assert!(fx.backend.uploaded_names().contains(&"u_fogcolor".to_string()));
        assert!(program.stale_uniforms().intersection(present).is_empty());

        fx.backend.uploads.clear();
        program.mark_stale(UniformGroups::FOG_COLOR | UniformGroups::LIGHT0);
        let uploaded = program.update_uniforms(&mut fx.backend, &state, false);
        assert_eq!(uploaded, UniformGroups::FOG_COLOR);
        assert_eq!(fx.backend.uploaded_names(), vec!["u_fogcolor".to_string()]);

        // Absent groups stay recorded as stale without ever being uploaded.
        assert!(program.stale_uniforms().contains(UniformGroups::LIGHT0));
    }

    #[test]
    fn test_clear_pass_uploads_reduced_set() {
        let mut fx = Fixture::new();
        let mut program = fx.link(VS_THROUGH, FS_FOG | FS_STENCIL).unwrap();
        let state = DrawState::default();

        let uploaded = program.update_uniforms(&mut fx.backend, &state, true);
        assert_eq!(
            uploaded,
            UniformGroups::PROJ_THROUGH_MATRIX | UniformGroups::STENCIL_REPLACE_VALUE
        );
        assert!(program.stale_uniforms().contains(UniformGroups::FOG_COLOR));

        let uploaded = program.update_uniforms(&mut fx.backend, &state, false);
        assert_eq!(uploaded, UniformGroups::FOG_COLOR | UniformGroups::FOG_COEF);
    }

    #[test]
    fn test_attribute_arrays_follow_previous_program() {
        let mut fx = Fixture::new();
        let mut textured = fx.link(VS_TEXCOORD, FS_TEXTURE).unwrap();
        let mut lit = fx.link(VS_LIGHTING, 0).unwrap();
        let state = DrawState::default();

        textured.activate(&mut fx.backend, &state, None, false);
        assert_eq!(fx.backend.enabled_slots(), vec![0, 1]);

        lit.activate(&mut fx.backend, &state, Some(textured.binding()), false);
        assert_eq!(fx.backend.enabled_slots(), vec![0, 2]);

        lit.deactivate(&mut fx.backend);
        assert!(fx.backend.enabled_slots().is_empty());
        assert_eq!(fx.backend.bound, None);
    }

    #[test]
    fn test_same_program_skips_bind() {
        let mut fx = Fixture::new();
        let mut program = fx.link(0, 0).unwrap();
        let state = DrawState::default();

        program.activate(&mut fx.backend, &state, None, false);
        let binds = fx.backend.binds;
        program.activate(&mut fx.backend, &state, Some(program.binding()), false);
        assert_eq!(fx.backend.binds, binds);
    }

    #[test]
    fn test_light_groups_are_per_slot() {
        let mut fx = Fixture::new();
        let mut program = fx.link(VS_LIGHTING, 0).unwrap();
        let state = DrawState::default();
        program.activate(&mut fx.backend, &state, None, false);
        fx.backend.uploads.clear();

        program.mark_stale(UniformGroups::light(2));
        let uploaded = program.update_uniforms(&mut fx.backend, &state, false);
        assert_eq!(uploaded, UniformGroups::LIGHT2);
        let names = fx.backend.uploaded_names();
        assert!(names.iter().all(|name| name.ends_with('2')), "{names:?}");
        assert!(names.contains(&"u_lightpos2".to_string()));
    }

    #[test]
    fn test_bone_array_uploads() {
        let mut fx = Fixture::new();
        let mut program = fx.link(skinned(4), 0).unwrap();
        assert_eq!(program.bone_uniforms(), Some(BoneUniforms::Array));
        assert_eq!(
            program.available_uniforms() & UniformGroups::BONE_MATRICES,
            UniformGroups::bones(4)
        );

        let mut state = DrawState::default();
        state.bones[2] = Mat4::from_translation(glam::Vec3::X);
        program.update_uniforms(&mut fx.backend, &state, false);
        let whole = fx.backend.uploaded_value(program.handle(), "u_bone[0]");
        assert!(matches!(whole, Some(UniformValue::Mat4Array(m)) if m.len() == 4));

        fx.backend.uploads.clear();
        program.mark_stale(UniformGroups::BONE_MATRIX2);
        program.update_uniforms(&mut fx.backend, &state, false);
        assert_eq!(fx.backend.uploaded_names(), vec!["u_bone[2]".to_string()]);
        assert_eq!(
            fx.backend.uploaded_value(program.handle(), "u_bone[2]"),
            Some(&UniformValue::Mat4(state.bones[2]))
        );
    }

    #[test]
    fn test_discrete_bones_with_small_uniform_budget() {
        let mut fx = Fixture::new();
        fx.config.max_vertex_uniform_vectors = 64;
        fx.generator.bone_array = false;
        let mut program = fx.link(skinned(3), 0).unwrap();
        assert_eq!(program.bone_uniforms(), Some(BoneUniforms::Discrete));

        let state = DrawState::default();
        program.update_uniforms(&mut fx.backend, &state, false);
        let names = fx.backend.uploaded_names();
        for bone in ["u_bone0", "u_bone1", "u_bone2"] {
            assert!(names.contains(&bone.to_string()));
        }
        assert!(!names.contains(&"u_bone3".to_string()));
    }

    #[test]
    fn test_software_transform_skips_bones() {
        let mut fx = Fixture::new();
        let program = fx.link(skinned(2) | VS_SOFTWARE, 0).unwrap();
        assert!(!program.use_hw_transform());
        assert_eq!(program.bone_uniforms(), None);
        assert!(!program.available_uniforms().intersects(UniformGroups::BONE_MATRICES));
    }

    #[test]
    fn test_alpha_and_stencil_conversions() {
        let mut fx = Fixture::new();
        let mut program = fx.link(0, FS_ALPHA_TEST | FS_STENCIL).unwrap();
        let mut state = DrawState::default();
        state.color_test_ref = 0x102030;
        state.alpha_test_ref = 0x40;
        state.stencil_ref = 255;
        program.update_uniforms(&mut fx.backend, &state, false);

        let handle = program.handle();
        assert_eq!(
            fx.backend.uploaded_value(handle, "u_alphacolorref"),
            Some(&UniformValue::Vec4(Vec4::new(48.0, 32.0, 16.0, 64.0)))
        );
        assert_eq!(
            fx.backend.uploaded_value(handle, "u_stencilReplaceValue"),
            Some(&UniformValue::Float(1.0))
        );
    }

    #[test]
    fn test_program_cache_settle_skips_outgoing() {
        let mut fx = Fixture::new();
        let mut cache = ProgramCache::new();
        let mut a = fx.link(0, 0).unwrap();
        let mut b = fx.link(VS_TEXCOORD, FS_TEXTURE).unwrap();
        let state = DrawState::default();
        a.update_uniforms(&mut fx.backend, &state, false);
        b.update_uniforms(&mut fx.backend, &state, false);
        let (key_a, key_b) = (*a.key(), *b.key());
        cache.insert(a);
        cache.insert(b);

        cache.mark_pending(UniformGroups::WORLD_MATRIX);
        cache.settle(Some(key_a));

        assert!(cache.pending().is_empty());
        assert!(!cache.get(&key_a).unwrap().stale_uniforms().contains(UniformGroups::WORLD_MATRIX));
        assert!(cache.get(&key_b).unwrap().stale_uniforms().contains(UniformGroups::WORLD_MATRIX));
    }

    #[test]
    fn test_program_cache_clear_destroys() {
        let mut fx = Fixture::new();
        let mut cache = ProgramCache::new();
        cache.insert(fx.link(0, 0).unwrap());
        cache.mark_pending(UniformGroups::FOG_COLOR);

        cache.clear(&mut fx.backend, true);
        assert!(cache.is_empty());
        assert!(cache.pending().is_empty());
        assert_eq!(fx.backend.destroyed_programs, 1);
    }
}
