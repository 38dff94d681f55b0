//! Per-stage shader object cache
//!
//! Maps a configuration key to the one `Shader` compiled for it. The cache owns
//! its objects; everything else refers to them through `StageObjectHandle`,
//! which stops resolving once the cache is cleared.

use std::collections::BTreeMap;

use crate::backend::GraphicsBackend;
use crate::generator::ShaderSourceGenerator;
use crate::shader::{Shader, StageKind};
use crate::shader_id::ShaderId;

/// Non-owning reference to a cached shader object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageObjectHandle {
    stage: StageKind,
    index: u32,
    generation: u32,
}

impl StageObjectHandle {
    pub fn stage(&self) -> StageKind {
        self.stage
    }
}

/// Cache statistics for one stage
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StageStats {
    pub hits: usize,
    pub misses: usize,
    /// Misses whose compile failed
    pub failures: usize,
}

/// Content-addressed store of compiled objects for one stage
#[derive(Debug)]
pub struct StageCache {
    stage: StageKind,
    shaders: Vec<Shader>,
    index: BTreeMap<ShaderId, u32>,
    generation: u32,
    stats: StageStats,
}

impl StageCache {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            shaders: Vec::new(),
            index: BTreeMap::new(),
            generation: 0,
            stats: StageStats::default(),
        }
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    /// Return the object for `id`, generating and compiling it on a miss.
    /// A failed compile is cached like any other result.
    pub fn get_or_create<B, G>(
        &mut self,
        id: &ShaderId,
        generator: &G,
        backend: &mut B,
        log_failed_source: bool,
    ) -> StageObjectHandle
    where
        B: GraphicsBackend + ?Sized,
        G: ShaderSourceGenerator + ?Sized,
    {
        if let Some(&index) = self.index.get(id) {
            self.stats.hits += 1;
            return self.handle(index);
        }

        self.stats.misses += 1;
        let source = generator.generate(id, self.stage);
        let use_hw_transform = self.stage == StageKind::Vertex && generator.uses_hw_transform(id);
        let shader = Shader::compile(
            backend,
            *id,
            self.stage,
            source,
            use_hw_transform,
            log_failed_source,
        );
        if shader.failed() {
            self.stats.failures += 1;
        }

        let index = self.shaders.len() as u32;
        self.shaders.push(shader);
        self.index.insert(*id, index);
        log::debug!("{} shader cache MISS: {} (now {} cached)", self.stage, id, self.shaders.len());
        self.handle(index)
    }

    /// Resolve a handle. `None` for handles issued before the last clear or by
    /// another stage's cache.
    pub fn get(&self, handle: StageObjectHandle) -> Option<&Shader> {
        if handle.stage != self.stage || handle.generation != self.generation {
            return None;
        }
        self.shaders.get(handle.index as usize)
    }

    pub fn find(&self, id: &ShaderId) -> Option<StageObjectHandle> {
        self.index.get(id).map(|&index| self.handle(index))
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    /// Cached keys in key order
    pub fn ids(&self) -> impl Iterator<Item = &ShaderId> {
        self.index.keys()
    }

    /// Every cached object with its handle, in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (StageObjectHandle, &Shader)> {
        self.shaders
            .iter()
            .enumerate()
            .map(|(index, shader)| (self.handle(index as u32), shader))
    }

    pub fn stats(&self) -> StageStats {
        self.stats
    }

    /// Drop every object, releasing backend handles when `destroy` is set
    /// (skip it when the context that owned them is already gone).
    pub fn clear<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B, destroy: bool) {
        let count = self.shaders.len();
        for shader in self.shaders.drain(..) {
            if destroy {
                shader.destroy(backend);
            }
        }
        self.index.clear();
        self.generation = self.generation.wrapping_add(1);
        if count > 0 {
            log::info!("Cleared {} shader cache: {} entries removed", self.stage, count);
        }
    }

    fn handle(&self, index: u32) -> StageObjectHandle {
        StageObjectHandle {
            stage: self.stage,
            index,
            generation: self.generation,
        }
    }
}
