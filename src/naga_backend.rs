//! Reference backend built on naga
//!
//! Compiles GLSL stages with naga's frontend and validator, reflects the
//! uniforms and vertex inputs each stage declares, and checks the stage
//! interface at link time. Uploads are stored per program so tools and tests
//! can read back what the manager pushed.
//!
//! Uniforms are taken from uniform blocks (member names) and opaque handles
//! (variable names). Locations are assigned in declaration order, vertex stage
//! first, with arrays taking one location per element.

use std::collections::{BTreeSet, HashMap};

use naga::{front, valid, AddressSpace, ArraySize, Binding, Module, ShaderStage, TypeInner};

use crate::backend::{GraphicsBackend, ProgramHandle, ShaderHandle, UniformLocation, UniformValue};
use crate::shader::StageKind;

/// Parse and validate one GLSL stage
pub fn glsl_to_module(source: &str, stage: ShaderStage) -> Result<Module, String> {
    let mut frontend = front::glsl::Frontend::default();
    let options = front::glsl::Options {
        stage,
        defines: Default::default(),
    };

    let module = frontend
        .parse(&options, source)
        .map_err(|e| format!("GLSL parse error: {:?}", e))?;

    let mut validator = valid::Validator::new(valid::ValidationFlags::all(), valid::Capabilities::all());
    validator
        .validate(&module)
        .map_err(|e| format!("Validation error: {:?}", e))?;

    Ok(module)
}

/// What a compiled stage exposes to the stages around it
#[derive(Debug, Default, Clone)]
struct StageInterface {
    stage: Option<StageKind>,
    /// (name, element count)
    uniforms: Vec<(String, usize)>,
    /// (name, location) of entry point inputs
    inputs: Vec<(Option<String>, u32)>,
    outputs: BTreeSet<u32>,
}

fn array_len(inner: &TypeInner) -> usize {
    match inner {
        TypeInner::Array {
            size: ArraySize::Constant(count),
            ..
        } => count.get() as usize,
        _ => 1,
    }
}

fn binding_location(binding: Option<&Binding>) -> Option<u32> {
    match binding {
        Some(Binding::Location { location, .. }) => Some(*location),
        _ => None,
    }
}

impl StageInterface {
    fn reflect(stage: StageKind, module: &Module) -> Self {
        let mut interface = Self {
            stage: Some(stage),
            ..Default::default()
        };

        for (_, var) in module.global_variables.iter() {
            match var.space {
                AddressSpace::Uniform => match &module.types[var.ty].inner {
                    TypeInner::Struct { members, .. } => {
                        for member in members {
                            if let Some(name) = &member.name {
                                let len = array_len(&module.types[member.ty].inner);
                                interface.uniforms.push((name.clone(), len));
                            }
                        }
                    }
                    inner => {
                        if let Some(name) = &var.name {
                            interface.uniforms.push((name.clone(), array_len(inner)));
                        }
                    }
                },
                AddressSpace::Handle => {
                    if let Some(name) = &var.name {
                        interface.uniforms.push((name.clone(), 1));
                    }
                }
                _ => {}
            }
        }

        if let Some(entry) = module.entry_points.first() {
            for arg in &entry.function.arguments {
                if let Some(location) = binding_location(arg.binding.as_ref()) {
                    interface.inputs.push((arg.name.clone(), location));
                }
            }

            if let Some(result) = &entry.function.result {
                match (&result.binding, &module.types[result.ty].inner) {
                    (Some(binding), _) => {
                        interface.outputs.extend(binding_location(Some(binding)));
                    }
                    (None, TypeInner::Struct { members, .. }) => {
                        interface
                            .outputs
                            .extend(members.iter().filter_map(|member| binding_location(member.binding.as_ref())));
                    }
                    _ => {}
                }
            }
        }

        interface
    }
}

#[derive(Debug, Clone)]
struct UniformSlot {
    name: String,
    base: i32,
    len: usize,
}

#[derive(Debug, Default)]
struct LinkedInterface {
    uniforms: Vec<UniformSlot>,
    attributes: Vec<(String, u32)>,
    values: HashMap<i32, UniformValue>,
}

impl LinkedInterface {
    fn slot(&self, name: &str) -> Option<&UniformSlot> {
        self.uniforms.iter().find(|slot| slot.name == name)
    }

    fn contains_location(&self, location: UniformLocation) -> bool {
        self.uniforms
            .iter()
            .any(|slot| location.0 >= slot.base && location.0 < slot.base + slot.len as i32)
    }
}

/// Backend that validates sources with naga and records uploads in memory
#[derive(Debug, Default)]
pub struct NagaBackend {
    next_handle: u64,
    shaders: HashMap<u64, StageInterface>,
    programs: HashMap<u64, LinkedInterface>,
    bound: Option<ProgramHandle>,
    enabled_attributes: u32,
}

impl NagaBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value uploaded to `name` (element 0 for arrays)
    pub fn uniform_value(&self, program: ProgramHandle, name: &str) -> Option<&UniformValue> {
        let linked = self.programs.get(&program.0)?;
        let slot = linked.slot(name)?;
        linked.values.get(&slot.base)
    }

    pub fn bound_program(&self) -> Option<ProgramHandle> {
        self.bound
    }

    pub fn attribute_enabled(&self, slot: u32) -> bool {
        self.enabled_attributes & (1 << slot) != 0
    }

    pub fn shader_count(&self) -> usize {
        self.shaders.len()
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

impl GraphicsBackend for NagaBackend {
    fn compile(&mut self, stage: StageKind, source: &str) -> Result<ShaderHandle, String> {
        let naga_stage = match stage {
            StageKind::Vertex => ShaderStage::Vertex,
            StageKind::Fragment => ShaderStage::Fragment,
            StageKind::Geometry => {
                return Err("geometry stages are not supported by the naga GLSL frontend".to_string())
            }
        };

        let module = glsl_to_module(source, naga_stage)?;
        let interface = StageInterface::reflect(stage, &module);
        log::trace!(
            "Compiled {} stage: {} uniforms, {} inputs, {} outputs",
            stage,
            interface.uniforms.len(),
            interface.inputs.len(),
            interface.outputs.len()
        );

        let handle = self.allocate();
        self.shaders.insert(handle, interface);
        Ok(ShaderHandle(handle))
    }

    fn link(
        &mut self,
        vs: ShaderHandle,
        gs: Option<ShaderHandle>,
        fs: ShaderHandle,
    ) -> Result<ProgramHandle, String> {
        if gs.is_some() {
            return Err("geometry stages are not supported".to_string());
        }
        let vertex = self
            .shaders
            .get(&vs.0)
            .ok_or_else(|| format!("unknown vertex shader {}", vs.0))?;
        let fragment = self
            .shaders
            .get(&fs.0)
            .ok_or_else(|| format!("unknown fragment shader {}", fs.0))?;
        if vertex.stage != Some(StageKind::Vertex) || fragment.stage != Some(StageKind::Fragment) {
            return Err("stage mismatch: expected a vertex and a fragment shader".to_string());
        }

        for (name, location) in &fragment.inputs {
            if !vertex.outputs.contains(location) {
                return Err(format!(
                    "fragment input '{}' at location {} is not written by the vertex stage",
                    name.as_deref().unwrap_or("<unnamed>"),
                    location
                ));
            }
        }

        let mut linked = LinkedInterface::default();
        let mut next_location = 0;
        for (name, len) in vertex.uniforms.iter().chain(&fragment.uniforms) {
            if linked.slot(name).is_some() {
                continue;
            }
            linked.uniforms.push(UniformSlot {
                name: name.clone(),
                base: next_location,
                len: *len,
            });
            next_location += *len as i32;
        }
        linked.attributes = vertex
            .inputs
            .iter()
            .filter_map(|(name, location)| name.clone().map(|name| (name, *location)))
            .collect();

        let handle = self.allocate();
        self.programs.insert(handle, linked);
        Ok(ProgramHandle(handle))
    }

    fn uniform_location(&self, program: ProgramHandle, name: &str) -> Option<UniformLocation> {
        let linked = self.programs.get(&program.0)?;
        linked.slot(name).map(|slot| UniformLocation(slot.base))
    }

    fn uniform_array_len(&self, program: ProgramHandle, location: UniformLocation) -> usize {
        self.programs
            .get(&program.0)
            .and_then(|linked| linked.uniforms.iter().find(|slot| slot.base == location.0))
            .map_or(1, |slot| slot.len)
    }

    fn attribute_location(&self, program: ProgramHandle, name: &str) -> Option<u32> {
        let linked = self.programs.get(&program.0)?;
        linked
            .attributes
            .iter()
            .find(|(attribute, _)| attribute == name)
            .map(|(_, location)| *location)
    }

    fn upload(&mut self, program: ProgramHandle, location: UniformLocation, value: UniformValue) {
        match self.programs.get_mut(&program.0) {
            Some(linked) if linked.contains_location(location) => {
                linked.values.insert(location.0, value);
            }
            Some(_) => log::warn!("Upload to unknown location {} in program {}", location.0, program.0),
            None => log::warn!("Upload to unknown program {}", program.0),
        }
    }

    fn bind(&mut self, program: ProgramHandle) {
        self.bound = Some(program);
    }

    fn unbind(&mut self) {
        self.bound = None;
    }

    fn set_attribute_enabled(&mut self, slot: u32, enabled: bool) {
        if enabled {
            self.enabled_attributes |= 1 << slot;
        } else {
            self.enabled_attributes &= !(1 << slot);
        }
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        self.shaders.remove(&shader.0);
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        if self.bound == Some(program) {
            self.bound = None;
        }
        self.programs.remove(&program.0);
    }
}
