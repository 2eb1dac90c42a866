//! Mipmapped BGRA8 textures and the nearest-filter sampler.
//!
//! Dimensions are powers of two and tracked by their log2. Mip `k` has
//! dimensions `max(1, w >> k) x max(1, h >> k)` with mip 0 the full image;
//! all levels live contiguously behind per-level byte offsets.

use std::path::Path;

use anyhow::Context;
use thiserror::Error;

use crate::config::MAX_TEX_DIM_LOG2;
use crate::UvDerivatives;

pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Error)]
pub enum TextureError {
    #[error("texture dimensions must be powers of two, got {0}x{1}")]
    NotPowerOfTwo(u32, u32),
    #[error("texture dimensions {0}x{1} exceed the limit of {MAX_TEX_DIM_LOG2} mip levels")]
    TooLarge(u32, u32),
    #[error("texel data holds {got} bytes, expected {expected}")]
    SizeMismatch { expected: usize, got: usize },
    #[error("mip chain holds {got} levels, expected {expected}")]
    MipCountMismatch { expected: u32, got: usize },
}

/// How out-of-range texture coordinates resolve.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AddressMode {
    #[default]
    Wrap,
    Clamp,
}

pub struct TextureData {
    width_log2: u32,
    height_log2: u32,
    num_mips: u32,
    mip_offsets: [u32; MAX_TEX_DIM_LOG2],
    texels: Vec<u8>,
}

impl TextureData {
    /// Build a texture from one BGRA8 image, generating the full mip chain
    /// with a 2x2 box filter.
    pub fn from_bgra8(width: u32, height: u32, data: &[u8]) -> Result<Self, TextureError> {
        let (width_log2, height_log2) = validate_dims(width, height)?;
        let expected = (width * height) as usize * BYTES_PER_PIXEL;
        if data.len() != expected {
            return Err(TextureError::SizeMismatch {
                expected,
                got: data.len(),
            });
        }

        let num_mips = width_log2.max(height_log2) + 1;
        let mut tex = TextureData {
            width_log2,
            height_log2,
            num_mips,
            mip_offsets: [0; MAX_TEX_DIM_LOG2],
            texels: Vec::new(),
        };
        tex.texels.reserve(chain_bytes(width, height, num_mips));
        tex.texels.extend_from_slice(data);

        for level in 1..num_mips {
            let (src_w, src_h) = tex.mip_dims(level - 1);
            let (dst_w, dst_h) = tex.mip_dims(level);
            let src_at = tex.mip_offsets[level as usize - 1] as usize;
            tex.mip_offsets[level as usize] = tex.texels.len() as u32;
            for y in 0..dst_h {
                for x in 0..dst_w {
                    // Clamp the second tap when the source axis is already 1.
                    let x0 = (2 * x).min(src_w - 1);
                    let x1 = (2 * x + 1).min(src_w - 1);
                    let y0 = (2 * y).min(src_h - 1);
                    let y1 = (2 * y + 1).min(src_h - 1);
                    for ch in 0..BYTES_PER_PIXEL {
                        let tap = |tx: u32, ty: u32| {
                            tex.texels[src_at + ((ty * src_w + tx) as usize) * BYTES_PER_PIXEL + ch]
                                as u32
                        };
                        let sum = tap(x0, y0) + tap(x1, y0) + tap(x0, y1) + tap(x1, y1);
                        tex.texels.push(((sum + 2) / 4) as u8);
                    }
                }
            }
        }
        Ok(tex)
    }

    /// Build a texture from a caller-provided mip chain (pre-filtered
    /// assets). `levels` must hold exactly `num_mips` images, finest first.
    pub fn from_mips(width: u32, height: u32, levels: &[&[u8]]) -> Result<Self, TextureError> {
        let (width_log2, height_log2) = validate_dims(width, height)?;
        let num_mips = width_log2.max(height_log2) + 1;
        if levels.len() != num_mips as usize {
            return Err(TextureError::MipCountMismatch {
                expected: num_mips,
                got: levels.len(),
            });
        }

        let mut tex = TextureData {
            width_log2,
            height_log2,
            num_mips,
            mip_offsets: [0; MAX_TEX_DIM_LOG2],
            texels: Vec::with_capacity(chain_bytes(width, height, num_mips)),
        };
        for (level, data) in levels.iter().enumerate() {
            let (w, h) = tex.mip_dims(level as u32);
            let expected = (w * h) as usize * BYTES_PER_PIXEL;
            if data.len() != expected {
                return Err(TextureError::SizeMismatch {
                    expected,
                    got: data.len(),
                });
            }
            tex.mip_offsets[level] = tex.texels.len() as u32;
            tex.texels.extend_from_slice(data);
        }
        Ok(tex)
    }

    /// Decode an image file (via the `image` crate) into a mipped texture.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let img = image::open(path)
            .with_context(|| format!("failed to load texture {path:?}"))?
            .to_rgba8();
        let (width, height) = img.dimensions();
        let mut bgra = img.into_raw();
        for px in bgra.chunks_exact_mut(BYTES_PER_PIXEL) {
            px.swap(0, 2);
        }
        Ok(Self::from_bgra8(width, height, &bgra)?)
    }

    pub fn width(&self) -> u32 {
        1 << self.width_log2
    }

    pub fn height(&self) -> u32 {
        1 << self.height_log2
    }

    pub fn num_mips(&self) -> u32 {
        self.num_mips
    }

    pub fn mip_dims(&self, level: u32) -> (u32, u32) {
        (
            1.max(self.width() >> level),
            1.max(self.height() >> level),
        )
    }

    /// Mip level for a quad's texture-space footprint:
    /// `clamp(floor(log2 rho), 0, num_mips - 1)` with
    /// `rho^2 = max(|Du|^2, |Dv|^2)` of the dimension-scaled derivatives.
    /// The floor of the log comes straight from the exponent bits of
    /// `rho^2`; zero and subnormal footprints clamp to level 0.
    pub fn mip_level(&self, derivs: &UvDerivatives) -> u32 {
        let w = self.width() as f32;
        let h = self.height() as f32;
        let du = (derivs.du_dx * w, derivs.du_dy * h);
        let dv = (derivs.dv_dx * w, derivs.dv_dy * h);
        let rho2 = (du.0 * du.0 + du.1 * du.1).max(dv.0 * dv.0 + dv.1 * dv.1);
        let exponent = ((rho2.to_bits() >> 23) as i32) - 127;
        (exponent >> 1).clamp(0, self.num_mips as i32 - 1) as u32
    }

    /// Nearest-filter sample with mip selection. Returns the texel channels
    /// in storage (BGRA) order scaled to [0, 1].
    pub fn sample(&self, u: f32, v: f32, derivs: &UvDerivatives, mode: AddressMode) -> [f32; 4] {
        let level = self.mip_level(derivs);
        let (w, h) = self.mip_dims(level);
        let (u, v) = match mode {
            AddressMode::Clamp => (u, v),
            AddressMode::Wrap => (wrap(u), wrap(v)),
        };
        let x = ((u * w as f32).floor() as i32).clamp(0, w as i32 - 1) as u32;
        let y = ((v * h as f32).floor() as i32).clamp(0, h as i32 - 1) as u32;
        let px = self.fetch(level, x, y);
        const RECIP_255: f32 = 1.0 / 255.0;
        [
            px[0] as f32 * RECIP_255,
            px[1] as f32 * RECIP_255,
            px[2] as f32 * RECIP_255,
            px[3] as f32 * RECIP_255,
        ]
    }

    pub fn fetch(&self, level: u32, x: u32, y: u32) -> [u8; 4] {
        let (w, h) = self.mip_dims(level);
        debug_assert!(x < w && y < h);
        let at = self.mip_offsets[level as usize] as usize
            + ((y * w + x) as usize) * BYTES_PER_PIXEL;
        [
            self.texels[at],
            self.texels[at + 1],
            self.texels[at + 2],
            self.texels[at + 3],
        ]
    }
}

/// Periodic repeat: the absolute fractional part for positive inputs,
/// mirrored back from 1 for negative ones.
fn wrap(x: f32) -> f32 {
    if x >= 0.0 {
        x.fract()
    } else {
        1.0 - (-x).fract()
    }
}

fn validate_dims(width: u32, height: u32) -> Result<(u32, u32), TextureError> {
    if width == 0 || height == 0 || !width.is_power_of_two() || !height.is_power_of_two() {
        return Err(TextureError::NotPowerOfTwo(width, height));
    }
    let width_log2 = width.trailing_zeros();
    let height_log2 = height.trailing_zeros();
    if width_log2.max(height_log2) + 1 > MAX_TEX_DIM_LOG2 as u32 {
        return Err(TextureError::TooLarge(width, height));
    }
    Ok((width_log2, height_log2))
}

fn chain_bytes(width: u32, height: u32, num_mips: u32) -> usize {
    (0..num_mips)
        .map(|l| (1.max(width >> l) * 1.max(height >> l)) as usize * BYTES_PER_PIXEL)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(color: [u8; 4], w: u32, h: u32) -> Vec<u8> {
        color.repeat((w * h) as usize)
    }

    fn derivs(du_dx: f32, dv_dy: f32) -> UvDerivatives {
        UvDerivatives {
            du_dx,
            dv_dy,
            ..Default::default()
        }
    }

    #[test]
    fn mip_chain_shape() {
        let tex = TextureData::from_bgra8(256, 256, &solid([1, 2, 3, 4], 256, 256)).unwrap();
        assert_eq!(tex.num_mips(), 9);
        assert_eq!(tex.mip_dims(0), (256, 256));
        assert_eq!(tex.mip_dims(8), (1, 1));

        let wide = TextureData::from_bgra8(64, 4, &solid([0, 0, 0, 0], 64, 4)).unwrap();
        assert_eq!(wide.num_mips(), 7);
        assert_eq!(wide.mip_dims(2), (16, 1));
        assert_eq!(wide.mip_dims(6), (1, 1));
    }

    #[test]
    fn rejects_bad_dimensions() {
        assert!(matches!(
            TextureData::from_bgra8(100, 64, &[]),
            Err(TextureError::NotPowerOfTwo(100, 64))
        ));
        assert!(matches!(
            TextureData::from_bgra8(16384, 16384, &[]),
            Err(TextureError::TooLarge(..))
        ));
        assert!(matches!(
            TextureData::from_bgra8(4, 4, &[0; 3]),
            Err(TextureError::SizeMismatch { expected: 64, got: 3 })
        ));
    }

    #[test]
    fn mip_selection_from_derivatives() {
        let tex = TextureData::from_bgra8(256, 256, &solid([0, 0, 0, 0], 256, 256)).unwrap();
        assert_eq!(tex.mip_level(&derivs(1.0 / 256.0, 1.0 / 256.0)), 0);
        assert_eq!(tex.mip_level(&derivs(1.0 / 64.0, 1.0 / 64.0)), 2);
        assert_eq!(tex.mip_level(&derivs(8.0 / 256.0, 8.0 / 256.0)), 3);
        // Non-power-of-two footprints floor.
        assert_eq!(tex.mip_level(&derivs(3.0 / 256.0, 0.0)), 1);
        // Degenerate and huge footprints clamp to the chain.
        assert_eq!(tex.mip_level(&derivs(0.0, 0.0)), 0);
        assert_eq!(tex.mip_level(&derivs(1e20, 1e20)), tex.num_mips() - 1);
    }

    #[test]
    fn sample_reads_selected_mip() {
        // Distinct constant color per level.
        let l0 = solid([10, 10, 10, 255], 4, 4);
        let l1 = solid([20, 20, 20, 255], 2, 2);
        let l2 = solid([30, 30, 30, 255], 1, 1);
        let tex = TextureData::from_mips(4, 4, &[&l0, &l1, &l2]).unwrap();

        let flat = tex.sample(0.5, 0.5, &derivs(0.0, 0.0), AddressMode::Clamp);
        assert!((flat[0] - 10.0 / 255.0).abs() < 1e-6);
        let mid = tex.sample(0.5, 0.5, &derivs(2.0 / 4.0, 0.0), AddressMode::Clamp);
        assert!((mid[0] - 20.0 / 255.0).abs() < 1e-6);
        let coarse = tex.sample(0.5, 0.5, &derivs(100.0, 0.0), AddressMode::Clamp);
        assert!((coarse[0] - 30.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn wrap_mirrors_negative_uvs() {
        // 4x4 texture, distinct color per texel.
        let mut data = Vec::new();
        for i in 0..16u8 {
            data.extend_from_slice(&[i, 2 * i, 3 * i, 255]);
        }
        let tex = TextureData::from_bgra8(4, 4, &data).unwrap();

        let d = UvDerivatives::default();
        let neg = tex.sample(-0.125, -0.375, &d, AddressMode::Wrap);
        let pos = tex.sample(0.875, 0.625, &d, AddressMode::Wrap);
        assert_eq!(neg, pos);
    }

    #[test]
    fn wrap_is_periodic() {
        let mut data = Vec::new();
        for i in 0..64u8 {
            data.extend_from_slice(&[i, i ^ 0x5a, 255 - i, 255]);
        }
        let tex = TextureData::from_bgra8(8, 8, &data).unwrap();
        let d = UvDerivatives::default();
        for (u, v) in [(0.3, 0.7), (0.61, 0.11), (0.99, 0.5)] {
            let base = tex.sample(u, v, &d, AddressMode::Wrap);
            assert_eq!(base, tex.sample(u + 1.0, v, &d, AddressMode::Wrap));
            assert_eq!(base, tex.sample(u - 1.0, v, &d, AddressMode::Wrap));
            assert_eq!(base, tex.sample(u, v + 1.0, &d, AddressMode::Wrap));
        }
    }

    #[test]
    fn clamp_pins_out_of_range() {
        let mut data = Vec::new();
        for i in 0..4u8 {
            data.extend_from_slice(&[i, 0, 0, 255]);
        }
        let tex = TextureData::from_bgra8(2, 2, &data).unwrap();
        let d = UvDerivatives::default();
        assert_eq!(
            tex.sample(-2.0, 0.0, &d, AddressMode::Clamp),
            tex.sample(0.0, 0.0, &d, AddressMode::Clamp)
        );
        assert_eq!(
            tex.sample(9.0, 0.9, &d, AddressMode::Clamp),
            tex.sample(0.9, 0.9, &d, AddressMode::Clamp)
        );
    }

    #[test]
    fn box_filter_averages() {
        let mut data = Vec::new();
        for i in 0..4 {
            let v = if i % 2 == 0 { 0 } else { 255 };
            data.extend_from_slice(&[v, v, v, 255]);
        }
        let tex = TextureData::from_bgra8(2, 2, &data).unwrap();
        let px = tex.fetch(1, 0, 0);
        assert_eq!(px[0], 128); // (0 + 255 + 0 + 255 + 2) / 4
        assert_eq!(px[3], 255);
    }
}
