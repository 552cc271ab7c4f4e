use crate::error::LightingError;

/// Opaque handle used to reference textures owned by a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u32);

impl TextureHandle {
    /// Get the underlying integer ID (useful for debugging).
    pub fn to_u32(self) -> u32 {
        self.0
    }
}

/// How texel data is interpreted when a texture is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureKind {
    /// sRGB-encoded color data, decoded to linear on sampling.
    Color,
    /// Linear tangent-space normals, `rgb = n * 0.5 + 0.5`.
    Normal,
}

/// RGBA8 texel of the 1x1 fallback used when a color texture is absent.
pub const DEFAULT_COLOR_TEXEL: [u8; 4] = [255, 255, 255, 255];
/// RGBA8 texel of the 1x1 fallback used when a normal texture is absent (+z).
pub const DEFAULT_NORMAL_TEXEL: [u8; 4] = [128, 128, 255, 255];

/// Byte length of a `width`x`height` RGBA8 image, checked against `len`.
pub(crate) fn checked_rgba_len(
    width: u32,
    height: u32,
    len: usize,
) -> Result<usize, LightingError> {
    let invalid = LightingError::InvalidTextureData { width, height, len };
    if width == 0 || height == 0 {
        return Err(invalid);
    }
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|texels| texels.checked_mul(4))
        .ok_or_else(|| invalid.clone())?;
    if expected != len {
        return Err(invalid);
    }
    Ok(expected)
}
