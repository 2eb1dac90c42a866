//! Draw submission and the frame lifecycle.
//!
//! A [`RenderContext`] owns the task system and the bin grid for its whole
//! life. Rendering happens through a frame-scoped handle:
//! [`RenderContext::begin_frame`] binds a framebuffer and resets the
//! per-frame state, [`Frame::draw_indexed`] records draw calls borrowing
//! the caller's buffers, and [`Frame::end`] runs the front-end binning
//! tasks to quiescence, then the per-tile raster tasks.

use glam::Mat4;

use crate::binning::{self, BinContext};
use crate::config::{FRONT_END_GRANULARITY, MAX_VARYINGS};
use crate::framebuffer::FrameBuffer;
use crate::math::Size;
use crate::raster;
use crate::shaders::{PixelProgram, TexturedShader, VertexProgram};
use crate::task::TaskSystem;
use crate::texture::{AddressMode, TextureData};
use crate::{PixelShade, VertexShade};

/// Index buffer view; the two widths the pipeline accepts.
#[derive(Clone, Copy)]
pub enum IndexSlice<'a> {
    U16(&'a [u16]),
    U32(&'a [u32]),
}

impl IndexSlice<'_> {
    pub fn len(&self) -> usize {
        match self {
            IndexSlice::U16(s) => s.len(),
            IndexSlice::U32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn get(&self, i: usize) -> u32 {
        match self {
            IndexSlice::U16(s) => s[i] as u32,
            IndexSlice::U32(s) => s[i],
        }
    }
}

impl<'a> From<&'a [u16]> for IndexSlice<'a> {
    fn from(s: &'a [u16]) -> Self {
        IndexSlice::U16(s)
    }
}

impl<'a> From<&'a [u32]> for IndexSlice<'a> {
    fn from(s: &'a [u32]) -> Self {
        IndexSlice::U32(s)
    }
}

/// Strided view over vertex data; `stride` counts f32 lanes per vertex.
#[derive(Clone, Copy)]
pub struct Stream<'a> {
    data: &'a [f32],
    stride: usize,
}

impl<'a> Stream<'a> {
    pub fn new(data: &'a [f32], stride: usize) -> Self {
        assert!(stride > 0, "vertex stream stride must be non-zero");
        assert!(
            data.len() % stride == 0,
            "vertex stream length {} is not a multiple of stride {stride}",
            data.len()
        );
        Stream { data, stride }
    }

    fn empty() -> Self {
        Stream { data: &[], stride: 0 }
    }

    pub fn len(&self) -> usize {
        if self.stride == 0 {
            0
        } else {
            self.data.len() / self.stride
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub(crate) fn record(&self, i: usize) -> &'a [f32] {
        if self.stride == 0 {
            &[]
        } else {
            &self.data[i * self.stride..(i + 1) * self.stride]
        }
    }

    pub(crate) fn position(&self, i: usize) -> glam::Vec3 {
        let r = self.record(i);
        glam::Vec3::new(r[0], r[1], r[2])
    }
}

/// One indexed triangle-list draw. Built with chainable `with_*` methods;
/// everything is borrowed for the frame that consumes it.
#[derive(Clone, Copy)]
pub struct DrawCall<'a> {
    pub(crate) vertex: VertexProgram<'a>,
    pub(crate) pixel: PixelProgram<'a>,
    pub(crate) indices: IndexSlice<'a>,
    pub(crate) positions: Stream<'a>,
    pub(crate) attributes: Stream<'a>,
    pub(crate) num_varyings: usize,
    pub(crate) uv_varying: usize,
    pub(crate) mvp: Mat4,
    pub(crate) color_write: bool,
    pub(crate) depth_write: bool,
    pub(crate) depth_read: bool,
    pub(crate) draw_call_idx: u32,
}

impl<'a> DrawCall<'a> {
    pub fn new() -> Self {
        DrawCall {
            vertex: VertexProgram::Transform,
            pixel: PixelProgram::Flat(0xff_ff_ff_ff),
            indices: IndexSlice::U32(&[]),
            positions: Stream::empty(),
            attributes: Stream::empty(),
            num_varyings: 0,
            uv_varying: 0,
            mvp: Mat4::IDENTITY,
            color_write: true,
            depth_write: true,
            depth_read: true,
            draw_call_idx: 0,
        }
    }

    /// Bind a custom vertex stage emitting `num_varyings` scalar varyings.
    pub fn with_vertex_shader(mut self, shader: &'a dyn VertexShade, num_varyings: usize) -> Self {
        assert!(
            num_varyings <= MAX_VARYINGS,
            "vertex shader emits {num_varyings} varyings, cap is {MAX_VARYINGS}"
        );
        self.vertex = VertexProgram::Custom(shader);
        self.num_varyings = num_varyings;
        self
    }

    pub fn with_flat_color(mut self, bgra: u32) -> Self {
        self.pixel = PixelProgram::Flat(bgra);
        self
    }

    pub fn with_texture(mut self, texture: &'a TextureData, address: AddressMode) -> Self {
        self.pixel = PixelProgram::Textured(TexturedShader { texture, address });
        self
    }

    pub fn with_pixel_shader(mut self, shader: &'a dyn PixelShade) -> Self {
        self.pixel = PixelProgram::Custom(shader);
        self
    }

    pub fn with_index_buffer(mut self, indices: impl Into<IndexSlice<'a>>) -> Self {
        self.indices = indices.into();
        self
    }

    /// Positions as `stride` f32 lanes per vertex, x/y/z in the first three.
    pub fn with_position_buffer(mut self, data: &'a [f32], stride: usize) -> Self {
        assert!(stride >= 3, "position stride must cover x, y, z");
        self.positions = Stream::new(data, stride);
        self
    }

    /// Per-vertex attributes, `stride` f32 lanes each; `uv_varying` is the
    /// lane offset of the (u, v) pair used for texture derivatives.
    pub fn with_attribute_buffer(mut self, data: &'a [f32], stride: usize, uv_varying: usize) -> Self {
        self.attributes = Stream::new(data, stride);
        self.uv_varying = uv_varying;
        self
    }

    pub fn with_mvp(mut self, mvp: Mat4) -> Self {
        self.mvp = mvp;
        self
    }

    pub fn with_color_write(mut self, enable: bool) -> Self {
        self.color_write = enable;
        self
    }

    pub fn with_depth_write(mut self, enable: bool) -> Self {
        self.depth_write = enable;
        self
    }

    pub fn with_depth_read(mut self, enable: bool) -> Self {
        self.depth_read = enable;
        self
    }
}

impl Default for DrawCall<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RenderContextParams {
    /// Worker threads besides the submitter; `None` leaves one logical
    /// core for the submitter and spawns workers on the rest.
    pub num_workers: Option<usize>,
    pub scratch_bytes_per_thread: usize,
}

impl Default for RenderContextParams {
    fn default() -> Self {
        RenderContextParams {
            num_workers: None,
            scratch_bytes_per_thread: 32 << 20,
        }
    }
}

pub struct RenderContext {
    tasks: TaskSystem,
    bins: BinContext,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::with_params(RenderContextParams::default())
    }

    pub fn with_params(params: RenderContextParams) -> Self {
        let workers = params.num_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(0)
        });
        let tasks = TaskSystem::new(workers, params.scratch_bytes_per_thread);
        let bins = BinContext::new(tasks.total_threads() as u32, 0, 0);
        RenderContext { tasks, bins }
    }

    /// Threads participating in rendering, including the submitter.
    pub fn num_threads(&self) -> usize {
        self.tasks.total_threads()
    }

    /// Start a frame targeting `fb`: clears the draw list, rewinds every
    /// scratch arena and shapes the bin grid to the framebuffer.
    pub fn begin_frame<'f>(&'f mut self, fb: &'f mut FrameBuffer) -> Frame<'f> {
        self.tasks.reset_allocators();
        self.bins
            .resize(self.tasks.total_threads() as u32, fb.tiles_x(), fb.tiles_y());
        self.bins.reset();
        Frame {
            ctx: self,
            fb,
            draws: Vec::new(),
        }
    }

    /// Join the worker pool. Dropping the context does the same.
    pub fn shutdown(self) {}
}

impl Default for RenderContext {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-progress frame; ends (and renders) with [`Frame::end`].
pub struct Frame<'f> {
    ctx: &'f mut RenderContext,
    fb: &'f mut FrameBuffer,
    draws: Vec<DrawCall<'f>>,
}

impl<'f> Frame<'f> {
    /// Record a draw call. Precondition violations are programmer errors
    /// and fail hard here, before any task runs.
    pub fn draw_indexed(&mut self, mut draw: DrawCall<'f>) {
        assert!(!draw.positions.is_empty(), "no position buffer bound");
        assert!(
            draw.indices.len() % 3 == 0,
            "index count {} is not a multiple of 3",
            draw.indices.len()
        );
        if let VertexProgram::Transform = draw.vertex {
            // The pass-through stage forwards whole attribute records.
            draw.num_varyings = draw.attributes.stride();
        }
        assert!(
            draw.num_varyings <= MAX_VARYINGS,
            "{} varyings exceed the cap of {MAX_VARYINGS}",
            draw.num_varyings
        );
        if let PixelProgram::Textured(_) = draw.pixel {
            assert!(
                draw.uv_varying + 2 <= draw.num_varyings,
                "textured draw needs (u, v) varyings at lane {}",
                draw.uv_varying
            );
        }

        draw.draw_call_idx = self.draws.len() as u32;
        self.draws.push(draw);
    }

    /// Run the pipeline: front-end binning tasks for every draw call, the
    /// global barrier, then one raster task per covered tile. A panic in
    /// any task resurfaces here on the submitting thread.
    pub fn end(self) {
        let Frame { ctx, fb, draws } = self;
        let tasks = &ctx.tasks;
        let bins = &ctx.bins;
        let viewport = Size::new(fb.width(), fb.height());
        let tiles_x = fb.tiles_x();
        let tiles_y = fb.tiles_y();

        tasks.scope(|scope| {
            for draw in &draws {
                let num_tris = (draw.indices.len() / 3) as u32;
                scope.run(num_tris, FRONT_END_GRANULARITY, move |thread_idx, start, end| {
                    binning::bin_triangles(
                        bins,
                        tasks.arena(thread_idx),
                        thread_idx,
                        start..end,
                        draw,
                        viewport,
                    );
                });
            }
        });

        let slots = fb.tile_slots();
        let mut tiles_rastered = 0usize;
        tasks.scope(|scope| {
            for tile_y in 0..tiles_y {
                for tile_x in 0..tiles_x {
                    if !bins.tile_has_tris(tile_x, tile_y) {
                        continue;
                    }
                    tiles_rastered += 1;
                    let slot = slots[(tile_y * tiles_x + tile_x) as usize];
                    let draws = &draws;
                    scope.run(1, 1, move |_, _, _| {
                        raster::raster_tile(bins, draws, tile_x, tile_y, slot);
                    });
                }
            }
        });

        log::debug!(
            "frame complete: {} draw calls, {}/{} tiles rastered",
            draws.len(),
            tiles_rastered,
            tiles_x * tiles_y,
        );
    }
}
