//! Back-end: rasterize and shade every triangle binned to one tile.
//!
//! Triangles are visited in `(draw call, thread, chunk, triangle)` order,
//! which is the observed rendering order and independent of how the
//! front-end packets were scheduled across threads. Within a triangle the
//! tile is walked in 8x8 blocks (trivial accept/reject on the corner edge
//! values) and shaded in 2x2 quads, the granularity of the derivative
//! computation.

use crate::binning::{BinChunk, BinContext, EdgeEq};
use crate::config::{BIN_WIDTH, BIN_WIDTH_LOG2, BIN_HEIGHT_LOG2, BLOCK_DIM, MAX_VARYINGS};
use crate::context::DrawCall;
use crate::framebuffer::{ColorTile, DepthTile, TileSlot};
use crate::shaders::{FlatShader, PixelProgram};
use crate::{PixelShade, QuadIn, UvDerivatives};

/// Quad lane offsets: 0=(0,0) 1=(1,0) 2=(0,1) 3=(1,1).
const LANE_X: [i32; 4] = [0, 1, 0, 1];
const LANE_Y: [i32; 4] = [0, 0, 1, 1];

pub(crate) fn raster_tile(
    bins: &BinContext,
    draws: &[DrawCall],
    tile_x: u32,
    tile_y: u32,
    slot: TileSlot,
) {
    // SAFETY: exactly one task rasterizes each tile and the frame waits
    // for all of them before the framebuffer borrow ends.
    let mut color = unsafe { slot.color_mut() };
    let mut depth = unsafe { slot.depth_mut() };

    for draw in draws {
        // Resolve the pixel program once per draw call; the tile loop is
        // monomorphized over the shader so built-ins inline into the quad
        // loop and only user callbacks pay an indirect call.
        match &draw.pixel {
            PixelProgram::Flat(color_value) => raster_draw(
                bins,
                draw,
                &FlatShader(*color_value),
                tile_x,
                tile_y,
                color.as_deref_mut(),
                depth.as_deref_mut(),
            ),
            PixelProgram::Textured(shader) => raster_draw(
                bins,
                draw,
                shader,
                tile_x,
                tile_y,
                color.as_deref_mut(),
                depth.as_deref_mut(),
            ),
            PixelProgram::Custom(shader) => raster_draw::<dyn PixelShade>(
                bins,
                draw,
                *shader,
                tile_x,
                tile_y,
                color.as_deref_mut(),
                depth.as_deref_mut(),
            ),
        }
    }
}

fn raster_draw<S: PixelShade + ?Sized>(
    bins: &BinContext,
    draw: &DrawCall,
    shader: &S,
    tile_x: u32,
    tile_y: u32,
    mut color: Option<&mut ColorTile>,
    mut depth: Option<&mut DepthTile>,
) {
    let origin_x = (tile_x << BIN_WIDTH_LOG2) as i32;
    let origin_y = (tile_y << BIN_HEIGHT_LOG2) as i32;

    for thread_idx in 0..bins.num_threads() {
        // SAFETY: past the frame barrier, bins are read-only.
        let bin = unsafe { &*bins.thread_bin(thread_idx, tile_x, tile_y) };
        for chunk_idx in 0..bin.num_chunks as usize {
            if bin.draw_call_indices[chunk_idx] != draw.draw_call_idx {
                continue;
            }
            // SAFETY: chunk pointers below num_chunks are live for the frame.
            let chunk = unsafe { bin.chunks[chunk_idx].unwrap().as_ref() };
            raster_chunk(
                chunk,
                draw,
                shader,
                origin_x,
                origin_y,
                color.as_deref_mut(),
                depth.as_deref_mut(),
            );
        }
    }
}

fn raster_chunk<S: PixelShade + ?Sized>(
    chunk: &BinChunk,
    draw: &DrawCall,
    shader: &S,
    origin_x: i32,
    origin_y: i32,
    mut color: Option<&mut ColorTile>,
    mut depth: Option<&mut DepthTile>,
) {
    let stride = chunk.attrib_stride as usize;
    let has_uv = stride >= draw.uv_varying + 2;

    for t in 0..chunk.num_tris as usize {
        let edges = &chunk.edges[t];
        let recip_w = &chunk.recip_w[t];
        let z_over_w = &chunk.z_over_w[t];
        let attribs = &chunk.attribs[t * MAX_VARYINGS..t * MAX_VARYINGS + stride];

        for block_y in edges.block_min_y..=edges.block_max_y {
            for block_x in edges.block_min_x..=edges.block_max_x {
                let base_x = origin_x + block_x as i32 * BLOCK_DIM;
                let base_y = origin_y + block_y as i32 * BLOCK_DIM;

                // Evaluate each edge at the four corner pixel centers. The
                // centers of all block pixels lie in their convex hull, so
                // all-negative on one edge rejects the block outright and
                // all-non-negative on all three covers it fully.
                let mut full = true;
                let mut out = false;
                for k in 0..3 {
                    let dx = edges.dx[k] as i64;
                    let dy = edges.dy[k] as i64;
                    let e00 = edges.c[k] as i64 + dx * base_x as i64 + dy * base_y as i64;
                    let e10 = e00 + dx * (BLOCK_DIM - 1) as i64;
                    let e01 = e00 + dy * (BLOCK_DIM - 1) as i64;
                    let e11 = e10 + dy * (BLOCK_DIM - 1) as i64;
                    if e00 < 0 && e10 < 0 && e01 < 0 && e11 < 0 {
                        out = true;
                        break;
                    }
                    if e00 < 0 || e10 < 0 || e01 < 0 || e11 < 0 {
                        full = false;
                    }
                }
                if out {
                    continue;
                }

                for quad_y in (0..BLOCK_DIM).step_by(2) {
                    for quad_x in (0..BLOCK_DIM).step_by(2) {
                        let px = base_x + quad_x;
                        let py = base_y + quad_y;
                        let mask = if full { 0xf } else { coverage_mask(edges, px, py) };
                        if mask == 0 {
                            continue;
                        }
                        shade_quad(
                            draw,
                            shader,
                            recip_w,
                            z_over_w,
                            attribs,
                            has_uv,
                            px,
                            py,
                            px - origin_x,
                            py - origin_y,
                            mask,
                            color.as_deref_mut(),
                            depth.as_deref_mut(),
                        );
                    }
                }
            }
        }
    }
}

/// 4-bit coverage of a 2x2 quad: a lane is covered when all three edge
/// functions are non-negative at its pixel center.
fn coverage_mask(edges: &EdgeEq, px: i32, py: i32) -> u8 {
    let mut mask = 0xfu8;
    for k in 0..3 {
        let dx = edges.dx[k] as i64;
        let dy = edges.dy[k] as i64;
        let e00 = edges.c[k] as i64 + dx * px as i64 + dy * py as i64;
        let e10 = e00 + dx;
        let e01 = e00 + dy;
        let e11 = e10 + dy;
        let mut edge_mask = 0u8;
        if e00 >= 0 {
            edge_mask |= 1;
        }
        if e10 >= 0 {
            edge_mask |= 2;
        }
        if e01 >= 0 {
            edge_mask |= 4;
        }
        if e11 >= 0 {
            edge_mask |= 8;
        }
        mask &= edge_mask;
        if mask == 0 {
            break;
        }
    }
    mask
}

#[allow(clippy::too_many_arguments)]
fn shade_quad<S: PixelShade + ?Sized>(
    draw: &DrawCall,
    shader: &S,
    recip_w: &crate::binning::PlaneEq,
    z_over_w: &crate::binning::PlaneEq,
    attribs: &[crate::binning::PlaneEq],
    has_uv: bool,
    px: i32,
    py: i32,
    local_x: i32,
    local_y: i32,
    mut mask: u8,
    color: Option<&mut ColorTile>,
    depth: Option<&mut DepthTile>,
) {
    let mut z = [0f32; 4];
    for lane in 0..4 {
        z[lane] = z_over_w.eval((px + LANE_X[lane]) as f32, (py + LANE_Y[lane]) as f32);
    }

    let lane_index = |lane: usize| -> usize {
        (local_y + LANE_Y[lane]) as usize * BIN_WIDTH + (local_x + LANE_X[lane]) as usize
    };

    if draw.depth_read {
        if let Some(depth) = depth.as_deref() {
            for lane in 0..4 {
                if mask & (1 << lane) != 0 && !(z[lane] < depth.depth[lane_index(lane)]) {
                    mask &= !(1 << lane);
                }
            }
            if mask == 0 {
                return;
            }
        }
    }

    // Perspective-correct varyings: the planes interpolate attr/w, so one
    // reciprocal and multiply per lane undoes the perspective.
    let mut w = [0f32; 4];
    for lane in 0..4 {
        let rw = recip_w.eval((px + LANE_X[lane]) as f32, (py + LANE_Y[lane]) as f32);
        w[lane] = 1.0 / rw;
    }
    let mut varyings = [[0f32; MAX_VARYINGS]; 4];
    for (a, plane) in attribs.iter().enumerate() {
        for lane in 0..4 {
            let v = plane.eval((px + LANE_X[lane]) as f32, (py + LANE_Y[lane]) as f32);
            varyings[lane][a] = v * w[lane];
        }
    }

    let derivs = if has_uv {
        let u = draw.uv_varying;
        UvDerivatives {
            du_dx: varyings[1][u] - varyings[0][u],
            du_dy: varyings[2][u] - varyings[0][u],
            dv_dx: varyings[1][u + 1] - varyings[0][u + 1],
            dv_dy: varyings[2][u + 1] - varyings[0][u + 1],
        }
    } else {
        UvDerivatives::default()
    };

    let quad = QuadIn {
        varyings: &varyings,
        num_varyings: attribs.len(),
        uv_varying: draw.uv_varying,
        derivs,
        coverage: mask,
    };
    let colors = shader.shade(&quad);

    let mut color = color.filter(|_| draw.color_write);
    let mut depth = depth.filter(|_| draw.depth_write);
    for lane in 0..4 {
        if mask & (1 << lane) == 0 {
            continue;
        }
        let idx = lane_index(lane);
        if let Some(color) = color.as_deref_mut() {
            color.pixels[idx] = colors[lane];
        }
        if let Some(depth) = depth.as_deref_mut() {
            depth.depth[idx] = z[lane];
        }
    }
}
