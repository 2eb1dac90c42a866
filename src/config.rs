use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::context::RenderContextParams;

/// Tile (bin) dimensions. Tiles own a color and depth sub-buffer and a
/// per-thread triangle list; both axes must be powers of two so screen
/// coordinates map to tiles by shifting.
pub const BIN_WIDTH_LOG2: u32 = 6;
pub const BIN_HEIGHT_LOG2: u32 = 6;
pub const BIN_WIDTH: usize = 1 << BIN_WIDTH_LOG2;
pub const BIN_HEIGHT: usize = 1 << BIN_HEIGHT_LOG2;

/// Edge tests run on 8x8 pixel blocks, shading on 2x2 quads.
pub const BLOCK_DIM: i32 = 8;

/// Scalar f32 varyings a vertex shader may emit per vertex.
pub const MAX_VARYINGS: usize = 16;

/// Depth buffer clear value; the depth test passes on `z/w < stored`.
pub const DEPTH_MAX: f32 = 1.0;

/// Upper bound on `num_mips`, i.e. textures up to 8192x8192.
pub const MAX_TEX_DIM_LOG2: usize = 14;

/// Triangles per bin chunk and chunks per thread bin.
pub const TRIS_PER_BIN_CHUNK: usize = 512;
pub const MAX_THREAD_BIN_CHUNKS: usize = 512;

/// Subpixel precision of the fixed-point edge functions (28.4).
pub const SUBPIXEL_BITS: i32 = 4;
pub const SUBPIXEL_ONE: i32 = 1 << SUBPIXEL_BITS;
pub const SUBPIXEL_HALF: i32 = SUBPIXEL_ONE / 2;

/// Largest framebuffer axis. Keeps 28.4 edge equations inside i32.
pub const MAX_FRAME_DIM: u32 = 2048;

/// Triangles with every clip-space w below this plane are dropped; the
/// rest clip against it before the perspective divide.
pub const NEAR_W: f32 = 1.0 / 4096.0;

/// Triangles handed to one front-end task packet.
pub const FRONT_END_GRANULARITY: u32 = 512;

const _: () = {
    assert!(BIN_WIDTH.is_power_of_two() && BIN_HEIGHT.is_power_of_two());
    // Block-level triangle bounds are stored per tile in u8.
    assert!(BIN_WIDTH / BLOCK_DIM as usize <= u8::MAX as usize);
    assert!(BIN_HEIGHT / BLOCK_DIM as usize <= u8::MAX as usize);
    assert!(BIN_WIDTH % BLOCK_DIM as usize == 0 && BIN_HEIGHT % BLOCK_DIM as usize == 0);
    assert!((MAX_FRAME_DIM as usize) << SUBPIXEL_BITS <= 1 << 15);
};

/// Renderer settings as loaded from a TOML file.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct RenderSettings {
    pub width: u32,
    pub height: u32,
    /// Worker threads in addition to the submitting thread. Defaults to
    /// one per remaining logical core.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "RenderSettings::default_scratch_mb", rename = "scratch-mb")]
    pub scratch_mb: usize,
    #[serde(
        default = "RenderSettings::default_clear_color",
        rename = "clear-color",
        deserialize_with = "RenderSettings::deserialize_clear_color"
    )]
    pub clear_color: u32,
}

impl RenderSettings {
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {path:?}"))?;
        let settings = toml::from_str(&contents)?;
        Ok(settings)
    }

    pub fn context_params(&self) -> RenderContextParams {
        RenderContextParams {
            num_workers: self.workers,
            scratch_bytes_per_thread: self.scratch_mb << 20,
        }
    }

    fn default_scratch_mb() -> usize {
        32
    }

    fn default_clear_color() -> u32 {
        0xff_00_00_00
    }

    fn deserialize_clear_color<'de, D: serde::Deserializer<'de>>(deser: D) -> Result<u32, D::Error> {
        use serde::de::Error;

        let hex_color: String = Deserialize::deserialize(deser)?;
        let rgb = u32::from_str_radix(hex_color.strip_prefix('#').unwrap_or(""), 16)
            .map_err(Error::custom)?;
        Ok(0xff_00_00_00 | rgb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_from_toml() {
        let settings: RenderSettings = toml::from_str(
            r##"
            width = 1280
            height = 720
            workers = 3
            clear-color = "#336699"
            "##,
        )
        .unwrap();
        assert_eq!(settings.width, 1280);
        assert_eq!(settings.height, 720);
        assert_eq!(settings.workers, Some(3));
        assert_eq!(settings.scratch_mb, 32);
        assert_eq!(settings.clear_color, 0xff_33_66_99);
    }

    #[test]
    fn settings_defaults() {
        let settings: RenderSettings = toml::from_str("width = 64\nheight = 64").unwrap();
        assert_eq!(settings.workers, None);
        assert_eq!(settings.clear_color, 0xff_00_00_00);
    }
}
