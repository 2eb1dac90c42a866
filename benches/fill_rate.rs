use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tilerast::{
    AddressMode, DrawCall, FrameBuffer, RenderContext, RenderContextParams, TextureData,
};

const WIDTH: u32 = 512;
const HEIGHT: u32 = 512;

/// A grid of quads covering the whole viewport, stride-3 NDC positions
/// plus per-vertex uv.
fn grid_scene(grid: u32) -> (Vec<f32>, Vec<f32>, Vec<u32>) {
    let mut positions = Vec::new();
    let mut uvs = Vec::new();
    let mut indices = Vec::new();
    for gy in 0..grid {
        for gx in 0..grid {
            let x0 = gx as f32 / grid as f32 * 2.0 - 1.0;
            let y0 = gy as f32 / grid as f32 * 2.0 - 1.0;
            let s = 2.0 / grid as f32;
            let z = 0.25 + 0.5 * ((gx + gy) % 7) as f32 / 7.0;
            let base = (positions.len() / 3) as u32;
            positions.extend_from_slice(&[
                x0, y0 + s, z, //
                x0, y0, z, //
                x0 + s, y0, z, //
                x0 + s, y0 + s, z,
            ]);
            uvs.extend_from_slice(&[0.0, 0.0, 0.0, 4.0, 4.0, 4.0, 4.0, 0.0]);
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
    }
    (positions, uvs, indices)
}

fn checker_texture(dim: u32) -> TextureData {
    let mut data = Vec::with_capacity((dim * dim * 4) as usize);
    for y in 0..dim {
        for x in 0..dim {
            let v = if (x / 8 + y / 8) % 2 == 0 { 32 } else { 224 };
            data.extend_from_slice(&[v, v, v, 255]);
        }
    }
    TextureData::from_bgra8(dim, dim, &data).unwrap()
}

fn fill_rate(c: &mut Criterion) {
    let _ = env_logger::try_init();

    let mut group = c.benchmark_group("fill rate");

    let (positions, uvs, indices) = grid_scene(24);
    let texture = checker_texture(256);
    let mut ctx = RenderContext::with_params(RenderContextParams::default());
    let mut fb = FrameBuffer::new(WIDTH, HEIGHT);

    group.bench_function("flat 512x512", |b| {
        b.iter(|| {
            fb.clear(0xff_00_00_00, true, true);
            let mut frame = ctx.begin_frame(&mut fb);
            frame.draw_indexed(
                DrawCall::new()
                    .with_position_buffer(&positions, 3)
                    .with_index_buffer(&indices[..])
                    .with_flat_color(0xff_40_c0_40),
            );
            frame.end();
            black_box(fb.color_at(0, 0));
        })
    });

    group.bench_function("textured 512x512", |b| {
        b.iter(|| {
            fb.clear(0xff_00_00_00, true, true);
            let mut frame = ctx.begin_frame(&mut fb);
            frame.draw_indexed(
                DrawCall::new()
                    .with_position_buffer(&positions, 3)
                    .with_attribute_buffer(&uvs, 2, 0)
                    .with_index_buffer(&indices[..])
                    .with_texture(&texture, AddressMode::Wrap),
            );
            frame.end();
            black_box(fb.color_at(0, 0));
        })
    });

    group.finish();
}

criterion_group!(benches, fill_rate);
criterion_main!(benches);
