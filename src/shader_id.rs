//! Configuration keys for shader variants
//!
//! A `ShaderId` packs every pipeline-state bit that affects the generated source
//! of one stage. The encoding belongs to the caller; this crate only compares,
//! orders, hashes and prints keys.

use std::fmt;
use std::str::FromStr;

use crate::error::ShaderError;

const WORDS: usize = 4;

/// Opaque, totally ordered configuration key for one shader stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShaderId {
    words: [u32; WORDS],
}

impl ShaderId {
    /// Number of usable bits
    pub const BITS: usize = WORDS * 32;

    /// An all-zero key
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    pub const fn from_words(words: [u32; WORDS]) -> Self {
        Self { words }
    }

    pub fn words(&self) -> &[u32; WORDS] {
        &self.words
    }

    pub fn bit(&self, bit: usize) -> bool {
        debug_assert!(bit < Self::BITS);
        (self.words[bit / 32] >> (bit % 32)) & 1 != 0
    }

    /// Read a `count`-bit field starting at `bit`. Fields never straddle a word.
    pub fn bits(&self, bit: usize, count: usize) -> u32 {
        debug_assert!(count > 0 && count <= 32);
        debug_assert_eq!(bit / 32, (bit + count - 1) / 32, "field straddles a word");
        let word = self.words[bit / 32] >> (bit % 32);
        if count == 32 {
            word
        } else {
            word & ((1u32 << count) - 1)
        }
    }

    pub fn set_bit(&mut self, bit: usize, value: bool) {
        debug_assert!(bit < Self::BITS);
        let mask = 1u32 << (bit % 32);
        if value {
            self.words[bit / 32] |= mask;
        } else {
            self.words[bit / 32] &= !mask;
        }
    }

    /// Write a `count`-bit field starting at `bit`; excess value bits are dropped.
    pub fn set_bits(&mut self, bit: usize, count: usize, value: u32) {
        debug_assert!(count > 0 && count <= 32);
        debug_assert_eq!(bit / 32, (bit + count - 1) / 32, "field straddles a word");
        let field = if count == 32 { u32::MAX } else { (1u32 << count) - 1 };
        let shift = bit % 32;
        let word = &mut self.words[bit / 32];
        *word = (*word & !(field << shift)) | ((value & field) << shift);
    }
}

impl fmt::Display for ShaderId {
    /// Words in comparison order, so the text sorts like the key.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for word in self.words.iter() {
            write!(f, "{:08x}", word)?;
        }
        Ok(())
    }
}

impl FromStr for ShaderId {
    type Err = ShaderError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        if text.len() != WORDS * 8 {
            return Err(ShaderError::invalid_shader_id(
                text,
                format!("expected {} hex digits, got {}", WORDS * 8, text.len()),
            ));
        }
        if !text.is_ascii() {
            return Err(ShaderError::invalid_shader_id(text, "not a hex string"));
        }

        let mut words = [0u32; WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            let chunk = &text[i * 8..(i + 1) * 8];
            *word = u32::from_str_radix(chunk, 16)
                .map_err(|e| ShaderError::invalid_shader_id(text, e))?;
        }
        Ok(Self { words })
    }
}
