//! Shader manager: the per-draw entry point
//!
//! Per draw the caller resolves the vertex stage, optionally the geometry
//! stage, then the fragment stage, which yields the linked program for the
//! draw with its stale uniforms already uploaded.
//!
//! Uniform invalidation runs in two steps. `dirty_uniform` only records bits.
//! The next `apply_vertex_shader` hands them to the active program and parks
//! them as pending; pending bits reach every other program when the active
//! program changes. A program therefore only re-uploads a group if the group
//! changed since that program last uploaded it.

use crate::backend::GraphicsBackend;
use crate::config::ShaderManagerConfig;
use crate::error::{Result, ShaderError};
use crate::generator::ShaderSourceGenerator;
use crate::program::{LinkedProgram, ProgramCache, ProgramKey, StageInput};
use crate::shader::{DebugShaderStringType, Shader, StageKind};
use crate::shader_id::ShaderId;
use crate::stage_cache::{StageCache, StageObjectHandle, StageStats};
use crate::state::{DrawState, Primitive};
use crate::uniforms::UniformGroups;

/// Cache statistics across every stage and the program cache
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShaderStats {
    pub vertex: StageStats,
    pub geometry: StageStats,
    pub fragment: StageStats,
    /// Vertex lookups answered by the most recent key
    pub vertex_fast_path_hits: usize,
    /// Fragment lookups that resolved to the already active program
    pub program_fast_path_hits: usize,
    pub program_hits: usize,
    pub program_misses: usize,
    pub link_failures: usize,
    /// Draws refused because an input stage had failed to compile
    pub rejected_inputs: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct ProgramStats {
    vertex_fast_path_hits: usize,
    program_fast_path_hits: usize,
    program_hits: usize,
    program_misses: usize,
    link_failures: usize,
    rejected_inputs: usize,
}

/// One-entry cache in front of a stage cache
#[derive(Debug, Default, Clone, Copy)]
struct RecentStage {
    entry: Option<(ShaderId, StageObjectHandle)>,
}

impl RecentStage {
    fn lookup(&self, id: &ShaderId) -> Option<StageObjectHandle> {
        self.entry
            .filter(|(recent, _)| recent == id)
            .map(|(_, handle)| handle)
    }

    fn remember(&mut self, id: ShaderId, handle: StageObjectHandle) {
        self.entry = Some((id, handle));
    }

    fn forget(&mut self) {
        self.entry = None;
    }
}

/// Owns the stage caches, the program cache and the uniform dirty state
pub struct ShaderManager<B: GraphicsBackend, G: ShaderSourceGenerator> {
    config: ShaderManagerConfig,
    backend: B,
    generator: G,
    vertex: StageCache,
    geometry: StageCache,
    fragment: StageCache,
    programs: ProgramCache,
    recent_vertex: RecentStage,
    recent_geometry: RecentStage,
    last_program: Option<ProgramKey>,
    /// Groups dirtied since the last `apply_vertex_shader`
    global_dirty: UniformGroups,
    stats: ProgramStats,
}

impl<B: GraphicsBackend, G: ShaderSourceGenerator> ShaderManager<B, G> {
    pub fn new(backend: B, generator: G) -> Self {
        Self::with_config(backend, generator, ShaderManagerConfig::default())
    }

    pub fn with_config(backend: B, generator: G, config: ShaderManagerConfig) -> Self {
        log::info!(
            "Shader manager created (bone uniforms: {:?}, clip depth: {:?})",
            config.bone_uniforms(),
            config.clip_depth
        );
        Self {
            config,
            backend,
            generator,
            vertex: StageCache::new(StageKind::Vertex),
            geometry: StageCache::new(StageKind::Geometry),
            fragment: StageCache::new(StageKind::Fragment),
            programs: ProgramCache::new(),
            recent_vertex: RecentStage::default(),
            recent_geometry: RecentStage::default(),
            last_program: None,
            global_dirty: UniformGroups::all(),
            stats: ProgramStats::default(),
        }
    }

    /// Resolve the vertex stage for this draw, compiling on a miss. If the
    /// hardware-transform variant fails to compile and the generator names a
    /// software-transform key, that variant is returned instead.
    pub fn apply_vertex_shader(&mut self, prim: Primitive, id: &ShaderId) -> StageObjectHandle {
        self.flush_dirty_uniforms();

        if let Some(handle) = self.recent_vertex.lookup(id) {
            self.stats.vertex_fast_path_hits += 1;
            return handle;
        }

        let log_failed_source = self.config.log_failed_source;
        let mut handle = self
            .vertex
            .get_or_create(id, &self.generator, &mut self.backend, log_failed_source);

        let failed = self.vertex.get(handle).map_or(false, Shader::failed);
        if failed && self.config.software_transform_fallback {
            if let Some(fallback) = self.generator.software_transform_fallback(id) {
                log::warn!(
                    "Vertex shader {} failed to compile, using software transform variant {} for {:?}",
                    id,
                    fallback,
                    prim
                );
                handle = self
                    .vertex
                    .get_or_create(&fallback, &self.generator, &mut self.backend, log_failed_source);
            }
        }

        self.recent_vertex.remember(*id, handle);
        handle
    }

    /// Resolve the geometry stage, or `None` when this draw does not need one.
    pub fn apply_geometry_shader(
        &mut self,
        prim: Primitive,
        id: &ShaderId,
    ) -> Option<StageObjectHandle> {
        if !self.generator.uses_geometry_stage(prim, id) {
            return None;
        }
        if let Some(handle) = self.recent_geometry.lookup(id) {
            return Some(handle);
        }

        let handle = self.geometry.get_or_create(
            id,
            &self.generator,
            &mut self.backend,
            self.config.log_failed_source,
        );
        self.recent_geometry.remember(*id, handle);
        Some(handle)
    }

    /// Resolve the fragment stage and the program linking it with `vs` (and
    /// `gs`), make that program current and upload its stale uniforms.
    ///
    /// Fails without touching the current program when an input stage failed
    /// to compile or the link fails; the caller skips the draw.
    pub fn apply_fragment_shader(
        &mut self,
        vs: StageObjectHandle,
        gs: Option<StageObjectHandle>,
        prim: Primitive,
        id: &ShaderId,
        is_clear: bool,
        state: &DrawState,
    ) -> Result<&LinkedProgram> {
        let key = self.resolve_program(vs, gs, prim, id, is_clear, state)?;
        // A resolved key is always cached and current; the lookup cannot miss.
        self.programs.get(&key).ok_or(ShaderError::NotFound {
            stage: StageKind::Fragment,
            id: key.fs,
        })
    }

    fn resolve_program(
        &mut self,
        vs: StageObjectHandle,
        gs: Option<StageObjectHandle>,
        prim: Primitive,
        id: &ShaderId,
        is_clear: bool,
        state: &DrawState,
    ) -> Result<ProgramKey> {
        self.flush_dirty_uniforms();

        let vs_shader = self
            .vertex
            .get(vs)
            .ok_or(ShaderError::StaleHandle { stage: StageKind::Vertex })?;
        let gs_shader = match gs {
            Some(handle) => Some(
                self.geometry
                    .get(handle)
                    .ok_or(ShaderError::StaleHandle { stage: StageKind::Geometry })?,
            ),
            None => None,
        };
        let key = ProgramKey {
            vs: *vs_shader.id(),
            gs: gs_shader.map(|shader| *shader.id()),
            fs: *id,
        };

        // Same program as the previous draw: only push what went stale.
        if self.last_program == Some(key) {
            if let Some(program) = self.programs.get_mut(&key) {
                self.stats.program_fast_path_hits += 1;
                program.update_uniforms(&mut self.backend, state, is_clear);
                return Ok(key);
            }
        }

        let fs = self.fragment.get_or_create(
            id,
            &self.generator,
            &mut self.backend,
            self.config.log_failed_source,
        );
        let vs_shader = self
            .vertex
            .get(vs)
            .ok_or(ShaderError::StaleHandle { stage: StageKind::Vertex })?;
        let gs_shader = match gs {
            Some(handle) => self.geometry.get(handle),
            None => None,
        };
        let fs_shader = self
            .fragment
            .get(fs)
            .ok_or(ShaderError::StaleHandle { stage: StageKind::Fragment })?;

        let inputs = [Some(vs_shader), gs_shader, Some(fs_shader)];
        if let Some(failed) = inputs.into_iter().flatten().find(|shader| shader.failed()) {
            self.stats.rejected_inputs += 1;
            log::warn!(
                "Skipping {:?} draw: {} shader {} failed to compile",
                prim,
                failed.stage(),
                failed.id()
            );
            return Err(ShaderError::FailedStage {
                stage: failed.stage(),
                id: *failed.id(),
            });
        }

        self.programs.settle(self.last_program);
        let previous = self
            .last_program
            .and_then(|last| self.programs.get(&last))
            .map(LinkedProgram::binding);

        if let Some(program) = self.programs.get_mut(&key) {
            self.stats.program_hits += 1;
            log::debug!("Program cache HIT: {}", key);
            program.activate(&mut self.backend, state, previous, is_clear);
        } else {
            self.stats.program_misses += 1;
            log::debug!("Program cache MISS: {}", key);
            let linked = LinkedProgram::link(
                &mut self.backend,
                key,
                StageInput { handle: vs, shader: vs_shader },
                gs.zip(gs_shader).map(|(handle, shader)| StageInput { handle, shader }),
                StageInput { handle: fs, shader: fs_shader },
                &self.config,
            );
            let linked = match linked {
                Ok(linked) => linked,
                Err(err) => {
                    self.stats.link_failures += 1;
                    return Err(err);
                }
            };
            let program = self.programs.insert(linked);
            program.activate(&mut self.backend, state, previous, is_clear);
        }

        self.last_program = Some(key);
        Ok(key)
    }

    /// Record that the uniform groups in `groups` changed.
    pub fn dirty_uniform(&mut self, groups: UniformGroups) {
        self.global_dirty |= groups;
    }

    /// Forget the recent-stage shortcuts and the current program, and mark
    /// every uniform group dirty. Use after external state the caches cannot
    /// see has changed.
    pub fn dirty_shader(&mut self) {
        self.recent_vertex.forget();
        self.recent_geometry.forget();
        self.dirty_last_shader();
        self.global_dirty = UniformGroups::all();
    }

    /// Unbind the current program, so the next draw rebinds from scratch.
    pub fn dirty_last_shader(&mut self) {
        if let Some(key) = self.last_program.take() {
            if let Some(program) = self.programs.get(&key) {
                program.deactivate(&mut self.backend);
            }
            // The outgoing program already holds everything pending.
            self.programs.settle(Some(key));
        }
    }

    /// Drop every cached program and stage object. Backend handles are
    /// released when `destroy` is set; pass false when the context that owned
    /// them is already gone.
    pub fn clear_cache(&mut self, destroy: bool) {
        if destroy {
            self.dirty_last_shader();
        } else {
            self.last_program = None;
        }

        // Programs reference stage objects, so they go first.
        self.programs.clear(&mut self.backend, destroy);
        self.vertex.clear(&mut self.backend, destroy);
        self.geometry.clear(&mut self.backend, destroy);
        self.fragment.clear(&mut self.backend, destroy);

        self.recent_vertex.forget();
        self.recent_geometry.forget();
        self.global_dirty = UniformGroups::all();
    }

    fn flush_dirty_uniforms(&mut self) {
        if self.global_dirty.is_empty() {
            return;
        }
        let dirty = std::mem::take(&mut self.global_dirty);
        if let Some(key) = self.last_program {
            if let Some(program) = self.programs.get_mut(&key) {
                program.mark_stale(dirty);
            }
        }
        self.programs.mark_pending(dirty);
    }

    pub fn num_vertex_shaders(&self) -> usize {
        self.vertex.len()
    }

    pub fn num_geometry_shaders(&self) -> usize {
        self.geometry.len()
    }

    pub fn num_fragment_shaders(&self) -> usize {
        self.fragment.len()
    }

    pub fn num_programs(&self) -> usize {
        self.programs.len()
    }

    /// Text ids of the cached objects of `stage`, in key order
    pub fn debug_shader_ids(&self, stage: StageKind) -> Vec<String> {
        self.stage_cache(stage).ids().map(ShaderId::to_string).collect()
    }

    /// Description or source of a cached object, looked up by text id
    pub fn debug_shader_string(
        &self,
        id: &str,
        stage: StageKind,
        kind: DebugShaderStringType,
    ) -> Result<String> {
        let id: ShaderId = id.parse()?;
        let cache = self.stage_cache(stage);
        let shader = cache
            .find(&id)
            .and_then(|handle| cache.get(handle))
            .ok_or(ShaderError::NotFound { stage, id })?;

        Ok(match kind {
            DebugShaderStringType::ShortDesc => self.generator.describe(&id, stage),
            DebugShaderStringType::SourceCode => shader.source().to_string(),
        })
    }

    pub fn stats(&self) -> ShaderStats {
        ShaderStats {
            vertex: self.vertex.stats(),
            geometry: self.geometry.stats(),
            fragment: self.fragment.stats(),
            vertex_fast_path_hits: self.stats.vertex_fast_path_hits,
            program_fast_path_hits: self.stats.program_fast_path_hits,
            program_hits: self.stats.program_hits,
            program_misses: self.stats.program_misses,
            link_failures: self.stats.link_failures,
            rejected_inputs: self.stats.rejected_inputs,
        }
    }

    /// Resolve a stage handle from any of the three caches
    pub fn shader(&self, handle: StageObjectHandle) -> Option<&Shader> {
        self.stage_cache(handle.stage()).get(handle)
    }

    pub fn program(&self, key: &ProgramKey) -> Option<&LinkedProgram> {
        self.programs.get(key)
    }

    /// Program bound by the last successful `apply_fragment_shader`
    pub fn active_program(&self) -> Option<&LinkedProgram> {
        self.last_program.and_then(|key| self.programs.get(&key))
    }

    /// Groups dirtied but not yet handed to any program
    pub fn pending_uniforms(&self) -> UniformGroups {
        self.global_dirty | self.programs.pending()
    }

    pub fn config(&self) -> &ShaderManagerConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    fn stage_cache(&self, stage: StageKind) -> &StageCache {
        match stage {
            StageKind::Vertex => &self.vertex,
            StageKind::Geometry => &self.geometry,
            StageKind::Fragment => &self.fragment,
        }
    }
}

impl<B: GraphicsBackend, G: ShaderSourceGenerator> Drop for ShaderManager<B, G> {
    fn drop(&mut self) {
        self.clear_cache(true);
    }
}
