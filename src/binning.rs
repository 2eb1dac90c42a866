//! Bin storage and the front-end: vertex shading, near clipping, edge and
//! plane setup, and per-tile binning.
//!
//! Every triangle that survives clipping and culling is appended to the
//! executing thread's bin for each tile its bounding box covers. A bin is
//! an ordered list of fixed-capacity chunks allocated from that thread's
//! scratch arena; the back-end replays them after the frame barrier in
//! `(draw call, thread, chunk, triangle)` order.

use std::cell::UnsafeCell;
use std::ops::Range;
use std::ptr::NonNull;

use glam::Vec4;

use crate::config::{
    BIN_HEIGHT_LOG2, BIN_WIDTH_LOG2, BLOCK_DIM, MAX_THREAD_BIN_CHUNKS, MAX_VARYINGS, NEAR_W,
    SUBPIXEL_BITS, SUBPIXEL_HALF, SUBPIXEL_ONE, TRIS_PER_BIN_CHUNK,
};
use crate::context::DrawCall;
use crate::math::{ndc_to_viewport, IRect, Size};
use crate::task::ScratchArena;
use crate::{VertexIn, VertexOut};

/// Three edge functions in 28.4 fixed point. `c` carries the pixel-center
/// offset and the top-left fill-rule bias; `dx`/`dy` step one pixel.
/// `block_*` bound the triangle inside its tile in 8-pixel blocks.
#[derive(Clone, Copy)]
pub struct EdgeEq {
    pub c: [i32; 3],
    pub dx: [i32; 3],
    pub dy: [i32; 3],
    pub block_min_x: u8,
    pub block_max_x: u8,
    pub block_min_y: u8,
    pub block_max_y: u8,
}

/// Screen-linear interpolant: `c0 + x*dx + y*dy` at integer pixel (x, y),
/// with the half-pixel center folded into `c0`.
#[derive(Clone, Copy, Default)]
pub struct PlaneEq {
    pub c0: f32,
    pub dx: f32,
    pub dy: f32,
}

impl PlaneEq {
    #[inline(always)]
    pub fn eval(&self, x: f32, y: f32) -> f32 {
        self.c0 + x * self.dx + y * self.dy
    }
}

/// Per-(thread, tile) triangle batch. Attribute planes are premultiplied
/// by 1/w so the back-end recovers perspective-correct varyings with one
/// multiply per pixel.
pub struct BinChunk {
    pub edges: [EdgeEq; TRIS_PER_BIN_CHUNK],
    pub recip_w: [PlaneEq; TRIS_PER_BIN_CHUNK],
    pub z_over_w: [PlaneEq; TRIS_PER_BIN_CHUNK],
    pub attribs: [PlaneEq; TRIS_PER_BIN_CHUNK * MAX_VARYINGS],
    pub attrib_stride: u32,
    pub num_tris: u32,
}

pub struct ThreadBin {
    pub draw_call_indices: [u32; MAX_THREAD_BIN_CHUNKS],
    pub chunks: [Option<NonNull<BinChunk>>; MAX_THREAD_BIN_CHUNKS],
    pub num_chunks: u32,
}

impl ThreadBin {
    fn new() -> Self {
        ThreadBin {
            draw_call_indices: [0; MAX_THREAD_BIN_CHUNKS],
            chunks: [None; MAX_THREAD_BIN_CHUNKS],
            num_chunks: 0,
        }
    }
}

/// `threads x tiles_y x tiles_x` thread bins. Writers are partitioned by
/// thread during the front-end; the back-end reads only after the frame
/// barrier, so no bin is ever locked.
pub struct BinContext {
    bins: Vec<UnsafeCell<ThreadBin>>,
    num_threads: u32,
    bins_x: u32,
    bins_y: u32,
}

// SAFETY: interior mutability is constrained by the pipeline phases: each
// thread writes only its own bins before the barrier, and all access after
// the barrier is read-only.
unsafe impl Sync for BinContext {}

impl BinContext {
    pub fn new(num_threads: u32, bins_x: u32, bins_y: u32) -> Self {
        let count = (num_threads * bins_x * bins_y) as usize;
        BinContext {
            bins: (0..count).map(|_| UnsafeCell::new(ThreadBin::new())).collect(),
            num_threads,
            bins_x,
            bins_y,
        }
    }

    /// Re-shape the bin grid for a framebuffer; keeps the allocation when
    /// the shape already matches.
    pub fn resize(&mut self, num_threads: u32, bins_x: u32, bins_y: u32) {
        if self.num_threads != num_threads || self.bins_x != bins_x || self.bins_y != bins_y {
            *self = BinContext::new(num_threads, bins_x, bins_y);
        }
    }

    /// Forget all chunks. Chunk memory itself is reclaimed by the arena
    /// reset that accompanies this at the start of a frame.
    pub fn reset(&mut self) {
        for bin in &mut self.bins {
            bin.get_mut().num_chunks = 0;
        }
    }

    pub fn num_threads(&self) -> u32 {
        self.num_threads
    }

    pub fn bins_x(&self) -> u32 {
        self.bins_x
    }

    pub fn bins_y(&self) -> u32 {
        self.bins_y
    }

    /// # Safety
    ///
    /// Before the frame barrier the returned bin may only be touched by
    /// `thread_idx` itself; after the barrier it may only be read.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn thread_bin(&self, thread_idx: u32, tile_x: u32, tile_y: u32) -> &mut ThreadBin {
        debug_assert!(thread_idx < self.num_threads && tile_x < self.bins_x && tile_y < self.bins_y);
        let idx = ((thread_idx * self.bins_y + tile_y) * self.bins_x + tile_x) as usize;
        unsafe { &mut *self.bins[idx].get() }
    }

    /// Whether any thread binned a triangle to this tile. Only meaningful
    /// after the front-end has quiesced.
    pub fn tile_has_tris(&self, tile_x: u32, tile_y: u32) -> bool {
        (0..self.num_threads).any(|t| {
            // SAFETY: read-only, past the front-end barrier.
            unsafe { self.thread_bin(t, tile_x, tile_y).num_chunks > 0 }
        })
    }
}

/// A vertex after the vertex stage, before the perspective divide.
#[derive(Clone, Copy)]
pub(crate) struct ShadedVertex {
    pub clip: Vec4,
    pub varyings: [f32; MAX_VARYINGS],
}

const VERTEX_CACHE_SIZE: usize = 32;

/// Direct-mapped vertex cache over the task's working set. Sound because
/// vertex shading is required to be pure in its inputs.
struct VertexCache {
    tags: [u32; VERTEX_CACHE_SIZE],
    entries: [ShadedVertex; VERTEX_CACHE_SIZE],
}

impl VertexCache {
    fn new() -> Self {
        VertexCache {
            tags: [u32::MAX; VERTEX_CACHE_SIZE],
            entries: [ShadedVertex { clip: Vec4::ZERO, varyings: [0.0; MAX_VARYINGS] };
                VERTEX_CACHE_SIZE],
        }
    }

    fn shade(&mut self, draw: &DrawCall, index: u32) -> ShadedVertex {
        let slot = index as usize & (VERTEX_CACHE_SIZE - 1);
        if self.tags[slot] == index {
            return self.entries[slot];
        }

        let position = draw.positions.position(index as usize);
        let input = VertexIn {
            mvp: &draw.mvp,
            position,
            attributes: draw.attributes.record(index as usize),
        };
        let mut out = VertexOut {
            clip: Vec4::ZERO,
            varyings: [0.0; MAX_VARYINGS],
        };
        draw.vertex.shade(&input, &mut out, draw.num_varyings);

        let shaded = ShadedVertex {
            clip: out.clip,
            varyings: out.varyings,
        };
        self.tags[slot] = index;
        self.entries[slot] = shaded;
        shaded
    }
}

/// Front-end entry: transform, clip, set up and bin triangles
/// `[tris.start, tris.end)` of `draw` into `thread_idx`'s bins.
pub(crate) fn bin_triangles(
    bins: &BinContext,
    arena: &ScratchArena,
    thread_idx: u32,
    tris: Range<u32>,
    draw: &DrawCall,
    viewport: Size<u32>,
) {
    let mut cache = VertexCache::new();
    let mut clipped = [ShadedVertex {
        clip: Vec4::ZERO,
        varyings: [0.0; MAX_VARYINGS],
    }; 4];

    for tri in tris {
        let i0 = draw.indices.get(3 * tri as usize);
        let i1 = draw.indices.get(3 * tri as usize + 1);
        let i2 = draw.indices.get(3 * tri as usize + 2);

        let v0 = cache.shade(draw, i0);
        let v1 = cache.shade(draw, i1);
        let v2 = cache.shade(draw, i2);

        if v0.clip.w < NEAR_W && v1.clip.w < NEAR_W && v2.clip.w < NEAR_W {
            continue;
        }

        let count = clip_near(&[v0, v1, v2], draw.num_varyings, &mut clipped);
        if count < 3 {
            continue;
        }

        let first = [clipped[0], clipped[1], clipped[2]];
        setup_and_bin(bins, arena, thread_idx, draw, &first, viewport);
        if count == 4 {
            let second = [clipped[0], clipped[2], clipped[3]];
            setup_and_bin(bins, arena, thread_idx, draw, &second, viewport);
        }
    }
}

/// Sutherland-Hodgman against the plane `w = NEAR_W`. One clipping plane,
/// so a triangle yields at most four vertices. Returns the vertex count.
pub(crate) fn clip_near(
    tri: &[ShadedVertex; 3],
    num_varyings: usize,
    out: &mut [ShadedVertex; 4],
) -> usize {
    let mut count = 0;
    for i in 0..3 {
        let cur = &tri[i];
        let next = &tri[(i + 1) % 3];
        let cur_in = cur.clip.w >= NEAR_W;
        let next_in = next.clip.w >= NEAR_W;

        if cur_in {
            out[count] = *cur;
            count += 1;
        }
        if cur_in != next_in {
            let t = (NEAR_W - cur.clip.w) / (next.clip.w - cur.clip.w);
            let mut mid = ShadedVertex {
                clip: cur.clip.lerp(next.clip, t),
                varyings: [0.0; MAX_VARYINGS],
            };
            for a in 0..num_varyings {
                mid.varyings[a] = cur.varyings[a] + (next.varyings[a] - cur.varyings[a]) * t;
            }
            out[count] = mid;
            count += 1;
        }
    }
    count
}

/// Top-left fill rule on an edge stored as `dx = yi - yj`, `dy = xj - xi`
/// (screen y down, interior on the non-negative side). The edge vector is
/// `(dy, -dx)`: a top edge is exactly horizontal going right, a left edge
/// goes up. Pixels exactly on any other edge are excluded by biasing `c`.
fn is_top_left(dx: i32, dy: i32) -> bool {
    let top = dx == 0 && dy > 0;
    let left = dx > 0;
    top || left
}

/// Vertex coordinates are clamped into this fixed-point guard box so edge
/// setup stays inside i32; geometry overhanging the viewport by more than
/// `MAX_FRAME_DIM` pixels distorts rather than overflows.
const COORD_GUARD: i32 = 1 << 15;

fn setup_and_bin(
    bins: &BinContext,
    arena: &ScratchArena,
    thread_idx: u32,
    draw: &DrawCall,
    tri: &[ShadedVertex; 3],
    viewport: Size<u32>,
) {
    let mut xi = [0i32; 3];
    let mut yi = [0i32; 3];
    let mut inv_w = [0f32; 3];
    let mut zw = [0f32; 3];

    for k in 0..3 {
        let clip = tri[k].clip;
        let iw = 1.0 / clip.w;
        inv_w[k] = iw;
        zw[k] = clip.z * iw;
        let (px, py) = ndc_to_viewport(
            clip.x * iw,
            clip.y * iw,
            viewport.width as f32,
            viewport.height as f32,
        );
        xi[k] = ((px * SUBPIXEL_ONE as f32).round() as i32).clamp(-COORD_GUARD, COORD_GUARD);
        yi[k] = ((py * SUBPIXEL_ONE as f32).round() as i32).clamp(-COORD_GUARD, COORD_GUARD);
    }

    let area2 = (xi[1] - xi[0]) as i64 * (yi[2] - yi[0]) as i64
        - (yi[1] - yi[0]) as i64 * (xi[2] - xi[0]) as i64;
    // Counter-clockwise in NDC is front; after the viewport y flip that is
    // a negative screen-space cross. Zero area and back-faces drop here.
    if area2 >= 0 {
        return;
    }
    // Relabel v1/v2 so every edge function is non-negative on the interior.
    xi.swap(1, 2);
    yi.swap(1, 2);
    inv_w.swap(1, 2);
    zw.swap(1, 2);
    let tri = [&tri[0], &tri[2], &tri[1]];

    // Pixel-center coverage range of the bounding box, clamped to the
    // framebuffer. Empty means no pixel center can be covered.
    let min_xf = xi[0].min(xi[1]).min(xi[2]);
    let max_xf = xi[0].max(xi[1]).max(xi[2]);
    let min_yf = yi[0].min(yi[1]).min(yi[2]);
    let max_yf = yi[0].max(yi[1]).max(yi[2]);
    let bounds = IRect {
        x0: (min_xf + SUBPIXEL_HALF - 1) >> SUBPIXEL_BITS,
        y0: (min_yf + SUBPIXEL_HALF - 1) >> SUBPIXEL_BITS,
        x1: (max_xf - SUBPIXEL_HALF) >> SUBPIXEL_BITS,
        y1: (max_yf - SUBPIXEL_HALF) >> SUBPIXEL_BITS,
    }
    .intersect(IRect {
        x0: 0,
        y0: 0,
        x1: viewport.width as i32 - 1,
        y1: viewport.height as i32 - 1,
    });
    if bounds.is_empty() {
        return;
    }

    let mut edge_c = [0i32; 3];
    let mut edge_dx = [0i32; 3];
    let mut edge_dy = [0i32; 3];
    for k in 0..3 {
        let j = (k + 1) % 3;
        let dx = yi[k] - yi[j];
        let dy = xi[j] - xi[k];
        let mut c = xi[k] as i64 * yi[j] as i64 - yi[k] as i64 * xi[j] as i64;
        // Sample at pixel centers, bias exclusive edges per the fill rule.
        c += SUBPIXEL_HALF as i64 * (dx + dy) as i64;
        if !is_top_left(dx, dy) {
            c -= 1;
        }
        edge_c[k] = c.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        edge_dx[k] = dx << SUBPIXEL_BITS;
        edge_dy[k] = dy << SUBPIXEL_BITS;
    }

    // Interpolant planes through the snapped screen positions. 1/w, z/w
    // and attr/w are all affine in screen space; attributes carry the 1/w
    // factor so the back-end restores perspective with one multiply.
    let sx = xi.map(|v| v as f32 / SUBPIXEL_ONE as f32);
    let sy = yi.map(|v| v as f32 / SUBPIXEL_ONE as f32);
    let det = (sx[1] - sx[0]) * (sy[2] - sy[0]) - (sx[2] - sx[0]) * (sy[1] - sy[0]);
    let inv_det = 1.0 / det;
    let plane = |v0: f32, v1: f32, v2: f32| -> PlaneEq {
        let dx = ((v1 - v0) * (sy[2] - sy[0]) - (v2 - v0) * (sy[1] - sy[0])) * inv_det;
        let dy = ((v2 - v0) * (sx[1] - sx[0]) - (v1 - v0) * (sx[2] - sx[0])) * inv_det;
        PlaneEq {
            c0: v0 - dx * sx[0] - dy * sy[0] + 0.5 * (dx + dy),
            dx,
            dy,
        }
    };

    let recip_w_plane = plane(inv_w[0], inv_w[1], inv_w[2]);
    let z_over_w_plane = plane(zw[0], zw[1], zw[2]);
    let mut attr_planes = [PlaneEq::default(); MAX_VARYINGS];
    for a in 0..draw.num_varyings {
        attr_planes[a] = plane(
            tri[0].varyings[a] * inv_w[0],
            tri[1].varyings[a] * inv_w[1],
            tri[2].varyings[a] * inv_w[2],
        );
    }

    let tile0_x = bounds.x0 >> BIN_WIDTH_LOG2;
    let tile1_x = bounds.x1 >> BIN_WIDTH_LOG2;
    let tile0_y = bounds.y0 >> BIN_HEIGHT_LOG2;
    let tile1_y = bounds.y1 >> BIN_HEIGHT_LOG2;

    for tile_y in tile0_y..=tile1_y {
        for tile_x in tile0_x..=tile1_x {
            // SAFETY: front-end phase; this thread owns these bins.
            let bin = unsafe { bins.thread_bin(thread_idx, tile_x as u32, tile_y as u32) };
            let chunk = ensure_chunk(bin, arena, draw);
            let t = chunk.num_tris as usize;

            let origin_x = tile_x << BIN_WIDTH_LOG2;
            let origin_y = tile_y << BIN_HEIGHT_LOG2;
            let tile = bounds.intersect(IRect {
                x0: origin_x,
                y0: origin_y,
                x1: origin_x + (1 << BIN_WIDTH_LOG2) - 1,
                y1: origin_y + (1 << BIN_HEIGHT_LOG2) - 1,
            });
            chunk.edges[t] = EdgeEq {
                c: edge_c,
                dx: edge_dx,
                dy: edge_dy,
                block_min_x: ((tile.x0 - origin_x) / BLOCK_DIM) as u8,
                block_max_x: ((tile.x1 - origin_x) / BLOCK_DIM) as u8,
                block_min_y: ((tile.y0 - origin_y) / BLOCK_DIM) as u8,
                block_max_y: ((tile.y1 - origin_y) / BLOCK_DIM) as u8,
            };
            chunk.recip_w[t] = recip_w_plane;
            chunk.z_over_w[t] = z_over_w_plane;
            let base = t * MAX_VARYINGS;
            chunk.attribs[base..base + draw.num_varyings]
                .copy_from_slice(&attr_planes[..draw.num_varyings]);
            chunk.num_tris += 1;
        }
    }
}

/// The bin's current chunk, if it belongs to `draw` and has room;
/// otherwise a fresh chunk from the thread's arena.
fn ensure_chunk<'a>(bin: &'a mut ThreadBin, arena: &ScratchArena, draw: &DrawCall) -> &'a mut BinChunk {
    let n = bin.num_chunks as usize;
    if n > 0 && bin.draw_call_indices[n - 1] == draw.draw_call_idx {
        // SAFETY: chunk pointers in 0..num_chunks are live arena
        // allocations owned by this thread for the rest of the frame.
        let chunk = unsafe { &mut *bin.chunks[n - 1].unwrap().as_ptr() };
        if (chunk.num_tris as usize) < TRIS_PER_BIN_CHUNK {
            return chunk;
        }
    }

    assert!(
        n < MAX_THREAD_BIN_CHUNKS,
        "thread bin overflow: more than {MAX_THREAD_BIN_CHUNKS} chunks for one tile"
    );
    let ptr = arena.alloc::<BinChunk>();
    // SAFETY: freshly allocated, suitably aligned, defined bytes; only the
    // header fields need a value before triangles are appended.
    let chunk = unsafe {
        let p = ptr.as_ptr();
        (*p).num_tris = 0;
        (*p).attrib_stride = draw.num_varyings as u32;
        &mut *p
    };
    bin.chunks[n] = Some(ptr);
    bin.draw_call_indices[n] = draw.draw_call_idx;
    bin.num_chunks += 1;
    chunk
}
