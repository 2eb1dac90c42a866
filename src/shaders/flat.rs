use crate::{PixelShade, QuadIn};

/// Unconditional fill with one BGRA8 color.
pub struct FlatShader(pub u32);

impl PixelShade for FlatShader {
    fn shade(&self, _quad: &QuadIn<'_>) -> [u32; 4] {
        [self.0; 4]
    }
}
