//! Tile-based multithreaded software rasterizer.
//!
//! Indexed triangle draw calls with programmable vertex and pixel stages
//! render into a tiled BGRA8 color + f32 depth framebuffer. A frame runs
//! in two phases over a fixed worker pool: the front-end transforms,
//! clips and bins triangles into per-(thread, tile) chunks, then one task
//! per covered tile rasterizes its bin list with 8x8 block edge tests,
//! 2x2 quad shading, perspective-correct interpolation and mipmapped
//! texture sampling.

pub mod binning;
pub mod config;
pub mod context;
pub mod framebuffer;
pub mod math;
pub(crate) mod raster;
pub mod shaders;
pub mod task;
pub mod texture;

pub use glam;

pub use config::{RenderSettings, MAX_VARYINGS};
pub use context::{DrawCall, Frame, IndexSlice, RenderContext, RenderContextParams, Stream};
pub use framebuffer::FrameBuffer;
pub use shaders::{FlatShader, PixelProgram, TexturedShader, VertexProgram};
pub use texture::{AddressMode, TextureData};

use glam::{Mat4, Vec3, Vec4};

/// Inputs handed to the vertex stage for one vertex.
pub struct VertexIn<'a> {
    pub mvp: &'a Mat4,
    pub position: Vec3,
    /// This vertex's attribute record; empty when no buffer is bound.
    pub attributes: &'a [f32],
}

/// Vertex stage output: a clip-space position and up to
/// [`MAX_VARYINGS`] scalar varyings.
pub struct VertexOut {
    pub clip: Vec4,
    pub varyings: [f32; MAX_VARYINGS],
}

/// User vertex stage. Must be pure in its inputs: the front-end caches
/// shaded vertices by index and may skip repeated invocations.
pub trait VertexShade: Sync {
    fn shade(&self, input: &VertexIn<'_>, out: &mut VertexOut);
}

/// Screen-space (u, v) derivatives across a quad, used for mip selection.
#[derive(Clone, Copy, Debug, Default)]
pub struct UvDerivatives {
    pub du_dx: f32,
    pub du_dy: f32,
    pub dv_dx: f32,
    pub dv_dy: f32,
}

/// One 2x2 quad of perspective-corrected varyings handed to the pixel
/// stage. Lanes order as (x, y), (x+1, y), (x, y+1), (x+1, y+1); only
/// lanes set in `coverage` are written back, the rest exist for
/// derivative support.
pub struct QuadIn<'a> {
    pub varyings: &'a [[f32; MAX_VARYINGS]; 4],
    pub num_varyings: usize,
    /// Lane offset of the (u, v) pair within the varyings.
    pub uv_varying: usize,
    pub derivs: UvDerivatives,
    pub coverage: u8,
}

impl QuadIn<'_> {
    pub fn uv(&self, lane: usize) -> (f32, f32) {
        let v = &self.varyings[lane];
        (v[self.uv_varying], v[self.uv_varying + 1])
    }
}

/// User pixel stage: four BGRA8 colors per quad.
pub trait PixelShade: Sync {
    fn shade(&self, quad: &QuadIn<'_>) -> [u32; 4];
}
