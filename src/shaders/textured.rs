use crate::texture::{AddressMode, TextureData};
use crate::{PixelShade, QuadIn};

/// Nearest-filtered, mipmapped texture fetch through the draw call's
/// (u, v) varyings.
#[derive(Clone, Copy)]
pub struct TexturedShader<'a> {
    pub texture: &'a TextureData,
    pub address: AddressMode,
}

impl<'a> TexturedShader<'a> {
    pub fn new(texture: &'a TextureData) -> Self {
        TexturedShader {
            texture,
            address: AddressMode::default(),
        }
    }
}

impl PixelShade for TexturedShader<'_> {
    fn shade(&self, quad: &QuadIn<'_>) -> [u32; 4] {
        let mut out = [0u32; 4];
        for lane in 0..4 {
            if quad.coverage & (1 << lane) == 0 {
                continue;
            }
            let (u, v) = quad.uv(lane);
            let c = self.texture.sample(u, v, &quad.derivs, self.address);
            out[lane] = u32::from_le_bytes([
                (c[0] * 255.0 + 0.5) as u8,
                (c[1] * 255.0 + 0.5) as u8,
                (c[2] * 255.0 + 0.5) as u8,
                (c[3] * 255.0 + 0.5) as u8,
            ]);
        }
        out
    }
}
