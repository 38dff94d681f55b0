//! Logical pipeline state read by uniform uploads
//!
//! The renderer owns a `DrawState`, mutates it as the emulated pipeline
//! changes, and calls `ShaderManager::dirty_uniform` with the groups it
//! touched. Uploads read from here and apply the per-group conversions.

use std::f32::consts::{FRAC_PI_2, PI};

use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::config::ClipDepth;
use crate::uniforms::{MAX_BONES, MAX_LIGHTS};

/// Primitive kind of the draw being prepared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Points,
    Lines,
    LineStrip,
    Triangles,
    TriangleStrip,
    TriangleFan,
    /// Axis-aligned sprites given as two corners.
    Rectangles,
}

/// Rotation of the output surface relative to the emulated display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayRotation {
    #[default]
    Rotate0,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl DisplayRotation {
    pub fn matrix(self) -> Mat4 {
        match self {
            DisplayRotation::Rotate0 => Mat4::IDENTITY,
            DisplayRotation::Rotate90 => Mat4::from_rotation_z(FRAC_PI_2),
            DisplayRotation::Rotate180 => Mat4::from_rotation_z(PI),
            DisplayRotation::Rotate270 => Mat4::from_rotation_z(-FRAC_PI_2),
        }
    }
}

/// Colors are packed little-endian as 0x00BBGGRR.
pub fn color3(rgb: u32) -> Vec3 {
    Vec3::new(
        (rgb & 0xFF) as f32,
        ((rgb >> 8) & 0xFF) as f32,
        ((rgb >> 16) & 0xFF) as f32,
    ) / 255.0
}

pub fn color4(rgb: u32, alpha: u8) -> Vec4 {
    color3(rgb).extend(alpha as f32 / 255.0)
}

/// Channels kept in 0..=255 for exact integer comparisons in the shader.
pub fn color4_255(rgb: u32, alpha: u8) -> Vec4 {
    Vec4::new(
        (rgb & 0xFF) as f32,
        ((rgb >> 8) & 0xFF) as f32,
        ((rgb >> 16) & 0xFF) as f32,
        alpha as f32,
    )
}

/// Viewport scale. Negative extents mean the axis is mirrored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FogState {
    pub color: u32,
    /// Distance at which fog ends
    pub end: f32,
    /// Reciprocal of the fog range
    pub slope: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LightKind {
    #[default]
    Directional,
    Point,
    Spot,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightState {
    pub kind: LightKind,
    pub position: Vec3,
    pub direction: Vec3,
    /// Constant, linear and quadratic attenuation
    pub attenuation: Vec3,
    /// Cosine of the spot cone cutoff
    pub cone_cos: f32,
    pub spot_exponent: f32,
    pub ambient: u32,
    pub diffuse: u32,
    pub specular: u32,
}

impl Default for LightState {
    fn default() -> Self {
        Self {
            kind: LightKind::Directional,
            position: Vec3::Z,
            direction: Vec3::NEG_Z,
            attenuation: Vec3::X,
            cone_cos: 0.0,
            spot_exponent: 0.0,
            ambient: 0,
            diffuse: 0xFFFFFF,
            specular: 0xFFFFFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialState {
    pub ambient: u32,
    pub ambient_alpha: u8,
    pub diffuse: u32,
    pub specular: u32,
    pub specular_coef: f32,
    pub emissive: u32,
}

impl Default for MaterialState {
    fn default() -> Self {
        Self {
            ambient: 0xFFFFFF,
            ambient_alpha: 0xFF,
            diffuse: 0xFFFFFF,
            specular: 0xFFFFFF,
            specular_coef: 1.0,
            emissive: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UvGenMode {
    #[default]
    TextureCoords,
    TextureMatrix,
    EnvironmentMap,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UvState {
    pub mode: UvGenMode,
    pub scale: Vec2,
    pub offset: Vec2,
}

impl Default for UvState {
    fn default() -> Self {
        Self {
            mode: UvGenMode::TextureCoords,
            scale: Vec2::ONE,
            offset: Vec2::ZERO,
        }
    }
}

/// Size of the bound texture: the logical size the pipeline addresses and the
/// size of the buffer actually backing it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureState {
    pub width: u32,
    pub height: u32,
    pub buffer_width: u32,
    pub buffer_height: u32,
    pub x_offset: f32,
    pub y_offset: f32,
}

impl Default for TextureState {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            buffer_width: 1,
            buffer_height: 1,
            x_offset: 0.0,
            y_offset: 0.0,
        }
    }
}

impl TextureState {
    fn inv_buffer_size(&self) -> Vec2 {
        Vec2::new(
            1.0 / self.buffer_width.max(1) as f32,
            1.0 / self.buffer_height.max(1) as f32,
        )
    }

    /// Logical size over buffer size
    pub fn size_factor(&self) -> Vec2 {
        Vec2::new(self.width as f32, self.height as f32) * self.inv_buffer_size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthRange {
    pub z_scale: f32,
    pub z_center: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShaderBlendState {
    pub fix_a: u32,
    pub fix_b: u32,
    /// Size of the framebuffer copy sampled by the blend shader
    pub framebuffer_width: u32,
    pub framebuffer_height: u32,
}

/// Everything uniform uploads read
#[derive(Debug, Clone, PartialEq)]
pub struct DrawState {
    pub projection: Mat4,
    pub viewport: Viewport,
    /// Render target size, the through-mode ortho extent
    pub render_target: Vec2,
    pub rotation: DisplayRotation,
    /// Per-eye stereo parameters, uploaded with the projection
    pub stereo: Vec4,

    pub world: Mat4,
    pub view: Mat4,
    pub tex_matrix: Mat4,
    pub bones: [Mat4; MAX_BONES],

    pub fog: FogState,
    pub tex_env_color: u32,

    pub color_test_ref: u32,
    pub alpha_test_ref: u8,
    pub color_test_mask: u32,
    pub alpha_test_mask: u8,
    pub stencil_ref: u8,

    pub ambient_color: u32,
    pub ambient_alpha: u8,
    pub material: MaterialState,
    pub lights: [LightState; MAX_LIGHTS],

    pub uv: UvState,
    pub texture: TextureState,
    pub depth_range: DepthRange,
    pub blend: ShaderBlendState,
}

impl Default for DrawState {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            viewport: Viewport {
                width: 480.0,
                height: 272.0,
            },
            render_target: Vec2::new(480.0, 272.0),
            rotation: DisplayRotation::default(),
            stereo: Vec4::ZERO,
            world: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            tex_matrix: Mat4::IDENTITY,
            bones: [Mat4::IDENTITY; MAX_BONES],
            fog: FogState {
                color: 0,
                end: 0.0,
                slope: 0.0,
            },
            tex_env_color: 0,
            color_test_ref: 0,
            alpha_test_ref: 0,
            color_test_mask: 0xFFFFFF,
            alpha_test_mask: 0xFF,
            stencil_ref: 0,
            ambient_color: 0,
            ambient_alpha: 0,
            material: MaterialState::default(),
            lights: [LightState::default(); MAX_LIGHTS],
            uv: UvState::default(),
            texture: TextureState::default(),
            depth_range: DepthRange {
                z_scale: 32767.5,
                z_center: 32767.5,
            },
            blend: ShaderBlendState {
                fix_a: 0xFFFFFF,
                fix_b: 0,
                framebuffer_width: 480,
                framebuffer_height: 272,
            },
        }
    }
}

impl DrawState {
    /// Projection for transformed draws, corrected for target orientation.
    pub fn projection_matrix(&self, clip_depth: ClipDepth) -> Mat4 {
        let mut m = self.projection;
        // The emulated pipeline has Y pointing down.
        if self.viewport.height >= 0.0 {
            m.y_axis.y = -m.y_axis.y;
            m.w_axis.y = -m.w_axis.y;
        }
        if self.viewport.width < 0.0 {
            m.x_axis.x = -m.x_axis.x;
            m.w_axis.x = -m.w_axis.x;
        }
        clip_depth.remap() * self.rotation.matrix() * m
    }

    /// Projection for through-mode (pre-transformed) draws.
    pub fn through_projection_matrix(&self, clip_depth: ClipDepth) -> Mat4 {
        let ortho = Mat4::orthographic_rh_gl(
            0.0,
            self.render_target.x,
            self.render_target.y,
            0.0,
            0.0,
            1.0,
        );
        clip_depth.remap() * self.rotation.matrix() * ortho
    }

    /// Fog end and slope with non-finite slopes made safe for shaders.
    pub fn fog_coef(&self) -> Vec2 {
        let (end, slope) = (self.fog.end, self.fog.slope);
        if slope.is_infinite() {
            Vec2::new(end, if slope < 0.0 { -10000.0 } else { 10000.0 })
        } else if slope.is_nan() {
            // Put the fog far away at a large finite distance.
            Vec2::new(100000.0, 1.0)
        } else {
            Vec2::new(end, slope)
        }
    }

    /// Light position; directional lights carry a normalized direction.
    pub fn light_position(&self, index: usize) -> Vec3 {
        let light = &self.lights[index];
        match light.kind {
            LightKind::Directional => light.position.try_normalize().unwrap_or(light.position),
            LightKind::Point | LightKind::Spot => light.position,
        }
    }

    pub fn uv_scale_offset(&self) -> Vec4 {
        let factor = self.texture.size_factor();
        match self.uv.mode {
            UvGenMode::TextureCoords => Vec4::new(
                self.uv.scale.x * factor.x,
                self.uv.scale.y * factor.y,
                self.uv.offset.x * factor.x,
                self.uv.offset.y * factor.y,
            ),
            // The matrix runs first, so only the size factor can be baked in.
            UvGenMode::TextureMatrix | UvGenMode::EnvironmentMap => {
                Vec4::new(factor.x, factor.y, 0.0, 0.0)
            }
        }
    }

    /// Wrap size, then half a texel for clamping.
    pub fn tex_clamp(&self) -> Vec4 {
        let factor = self.texture.size_factor();
        let half_texel = self.texture.inv_buffer_size() * 0.5;
        Vec4::new(factor.x, factor.y, half_texel.x, half_texel.y)
    }

    pub fn tex_clamp_offset(&self) -> Vec2 {
        Vec2::new(self.texture.x_offset, self.texture.y_offset) * self.texture.inv_buffer_size()
    }

    pub fn depth_range_vector(&self) -> Vec4 {
        let DepthRange { z_scale, z_center } = self.depth_range;
        let inv_scale = if z_scale != 0.0 { 1.0 / z_scale } else { 0.0 };
        Vec4::new(z_scale, z_center, z_center, inv_scale)
    }

    pub fn stencil_replace_value(&self) -> f32 {
        self.stencil_ref as f32 / 255.0
    }

    pub fn framebuffer_texel_size(&self) -> Vec2 {
        Vec2::new(
            1.0 / self.blend.framebuffer_width.max(1) as f32,
            1.0 / self.blend.framebuffer_height.max(1) as f32,
        )
    }
}
