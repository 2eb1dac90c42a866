//! Built-in shader programs and the user-callback escape hatch.
//!
//! Draw calls bind a [`VertexProgram`] and a [`PixelProgram`]. The
//! built-in variants cover the common paths (MVP transform, flat fill,
//! mipmapped texturing) without any dynamic dispatch in the pixel loop;
//! `Custom` carries a trait object for everything else.

mod flat;
mod textured;

pub use flat::FlatShader;
pub use textured::TexturedShader;

use crate::{PixelShade, VertexIn, VertexOut, VertexShade};

#[derive(Clone, Copy)]
pub enum VertexProgram<'a> {
    /// Clip position = MVP x (position, 1); attributes pass through as
    /// varyings unchanged.
    Transform,
    Custom(&'a dyn VertexShade),
}

impl VertexProgram<'_> {
    pub(crate) fn shade(&self, input: &VertexIn<'_>, out: &mut VertexOut, num_varyings: usize) {
        match self {
            VertexProgram::Transform => {
                out.clip = *input.mvp * input.position.extend(1.0);
                out.varyings[..num_varyings].copy_from_slice(&input.attributes[..num_varyings]);
            }
            VertexProgram::Custom(shader) => shader.shade(input, out),
        }
    }
}

#[derive(Clone, Copy)]
pub enum PixelProgram<'a> {
    /// Every covered pixel gets this BGRA8 color.
    Flat(u32),
    Textured(TexturedShader<'a>),
    Custom(&'a dyn PixelShade),
}
