//! Uniform groups and vertex attribute slots
//!
//! Uniforms are invalidated and uploaded in named groups. Each group owns one
//! bit; lights and bones are bounded sets indexed through `light()`/`bone()`.

use bitflags::bitflags;

/// Number of hardware light slots
pub const MAX_LIGHTS: usize = 4;

/// Number of bone matrices a skinned vertex shader can reference
pub const MAX_BONES: usize = 8;

bitflags! {
    /// Set of uniform groups, used both as the dirty set and as the
    /// "present in this program" set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UniformGroups: u32 {
        const PROJ_MATRIX           = 1 << 0;
        const PROJ_THROUGH_MATRIX   = 1 << 1;
        const FOG_COLOR             = 1 << 2;
        const FOG_COEF              = 1 << 3;
        const TEX_ENV               = 1 << 4;
        const ALPHA_COLOR_REF       = 1 << 5;
        const STENCIL_REPLACE_VALUE = 1 << 6;
        const ALPHA_COLOR_MASK      = 1 << 7;
        const LIGHT0                = 1 << 8;
        const LIGHT1                = 1 << 9;
        const LIGHT2                = 1 << 10;
        const LIGHT3                = 1 << 11;
        const MAT_DIFFUSE           = 1 << 12;
        const MAT_SPECULAR          = 1 << 13;
        const MAT_EMISSIVE          = 1 << 14;
        const AMBIENT               = 1 << 15;
        const MAT_AMBIENT_ALPHA     = 1 << 16;
        /// In-shader blending only.
        const SHADER_BLEND          = 1 << 17;
        const UV_SCALE_OFFSET       = 1 << 18;
        const TEX_CLAMP             = 1 << 19;
        const DEPTH_RANGE           = 1 << 20;
        const WORLD_MATRIX          = 1 << 21;
        const VIEW_MATRIX           = 1 << 22;
        const TEX_MATRIX            = 1 << 23;
        const BONE_MATRIX0          = 1 << 24;
        const BONE_MATRIX1          = 1 << 25;
        const BONE_MATRIX2          = 1 << 26;
        const BONE_MATRIX3          = 1 << 27;
        const BONE_MATRIX4          = 1 << 28;
        const BONE_MATRIX5          = 1 << 29;
        const BONE_MATRIX6          = 1 << 30;
        const BONE_MATRIX7          = 1 << 31;
    }
}

impl UniformGroups {
    /// Every light group.
    pub const LIGHTS: Self = Self::from_bits_retain(0xF << 8);

    /// Every bone matrix group.
    pub const BONE_MATRICES: Self = Self::from_bits_retain(0xFF << 24);

    /// Groups a clear pass reads. Everything else stays stale until a
    /// regular draw uploads it.
    pub const CLEAR_PASS: Self = Self::from_bits_retain(
        Self::PROJ_MATRIX.bits()
            | Self::PROJ_THROUGH_MATRIX.bits()
            | Self::STENCIL_REPLACE_VALUE.bits()
            | Self::DEPTH_RANGE.bits(),
    );

    /// Group of light slot `index` (0..4).
    pub fn light(index: usize) -> Self {
        assert!(index < MAX_LIGHTS, "light index {} out of range", index);
        Self::from_bits_retain(Self::LIGHT0.bits() << index)
    }

    /// Group of bone matrix `index` (0..8).
    pub fn bone(index: usize) -> Self {
        assert!(index < MAX_BONES, "bone index {} out of range", index);
        Self::from_bits_retain(Self::BONE_MATRIX0.bits() << index)
    }

    /// The first `count` bone groups.
    pub fn bones(count: usize) -> Self {
        (0..count.min(MAX_BONES)).fold(Self::empty(), |acc, i| acc | Self::bone(i))
    }
}

/// Vertex attribute slots. Slot numbers are fixed across every program so
/// attribute arrays can be toggled by diffing masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Attribute {
    Position = 0,
    TexCoord = 1,
    Normal = 2,
    Weight1 = 3,
    Weight2 = 4,
    Color0 = 5,
    Color1 = 6,
}

impl Attribute {
    pub const ALL: [Attribute; 7] = [
        Attribute::Position,
        Attribute::TexCoord,
        Attribute::Normal,
        Attribute::Weight1,
        Attribute::Weight2,
        Attribute::Color0,
        Attribute::Color1,
    ];

    /// Name the generated shaders declare this attribute under
    pub fn name(self) -> &'static str {
        match self {
            Attribute::Position => "position",
            Attribute::TexCoord => "texcoord",
            Attribute::Normal => "normal",
            Attribute::Weight1 => "w1",
            Attribute::Weight2 => "w2",
            Attribute::Color0 => "color0",
            Attribute::Color1 => "color1",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|attr| attr.name() == name)
    }

    pub fn slot(self) -> u32 {
        self as u32
    }

    pub fn mask(self) -> AttributeMask {
        AttributeMask::from_bits_retain(1 << self.slot())
    }
}

bitflags! {
    /// Attributes present in a program, one bit per `Attribute` slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttributeMask: u8 {
        const POSITION = 1 << 0;
        const TEXCOORD = 1 << 1;
        const NORMAL   = 1 << 2;
        const WEIGHT1  = 1 << 3;
        const WEIGHT2  = 1 << 4;
        const COLOR0   = 1 << 5;
        const COLOR1   = 1 << 6;
    }
}

impl AttributeMask {
    /// Attributes in slot order.
    pub fn attributes(self) -> impl Iterator<Item = Attribute> {
        Attribute::ALL
            .into_iter()
            .filter(move |attr| self.contains(attr.mask()))
    }
}
