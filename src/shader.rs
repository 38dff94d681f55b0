//! Compiled shader stage objects

use std::fmt;

use crate::backend::{GraphicsBackend, ShaderHandle};
use crate::shader_id::ShaderId;

/// Pipeline stage a shader object belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageKind {
    Vertex,
    Geometry,
    Fragment,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Vertex => "vertex",
            StageKind::Geometry => "geometry",
            StageKind::Fragment => "fragment",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `ShaderManager::debug_shader_string` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugShaderStringType {
    ShortDesc,
    SourceCode,
}

/// One compiled stage program. A failed compile still produces a `Shader`:
/// it stays in the cache so the variant is not recompiled every draw, but it
/// is never linked.
#[derive(Debug)]
pub struct Shader {
    id: ShaderId,
    stage: StageKind,
    source: String,
    handle: Option<ShaderHandle>,
    compile_log: Option<String>,
    use_hw_transform: bool,
}

impl Shader {
    /// Compile `source` through the backend, recording failure instead of
    /// returning it.
    pub fn compile<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        id: ShaderId,
        stage: StageKind,
        source: String,
        use_hw_transform: bool,
        log_failed_source: bool,
    ) -> Self {
        let (handle, compile_log) = match backend.compile(stage, &source) {
            Ok(handle) => (Some(handle), None),
            Err(log) => {
                log::error!("Error in {} shader {} compilation: {}", stage, id, log);
                if log_failed_source {
                    log::error!("Failed {} shader source:\n{}", stage, source);
                }
                (None, Some(log))
            }
        };

        Self {
            id,
            stage,
            source,
            handle,
            compile_log,
            use_hw_transform: use_hw_transform && stage == StageKind::Vertex,
        }
    }

    pub fn id(&self) -> &ShaderId {
        &self.id
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// `None` when compilation failed.
    pub fn handle(&self) -> Option<ShaderHandle> {
        self.handle
    }

    pub fn failed(&self) -> bool {
        self.handle.is_none()
    }

    pub fn compile_log(&self) -> Option<&str> {
        self.compile_log.as_deref()
    }

    /// Always false for non-vertex stages.
    pub fn use_hw_transform(&self) -> bool {
        self.use_hw_transform
    }

    /// Release the compiled handle.
    pub(crate) fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        if let Some(handle) = self.handle {
            backend.destroy_shader(handle);
        }
    }
}
