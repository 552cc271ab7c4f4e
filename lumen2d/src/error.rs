//! Structural errors raised by the lighting pipeline.
//!
//! Public entry points return `anyhow::Result`; these values travel inside the
//! `anyhow::Error` and can be recovered with `downcast_ref::<LightingError>()`.

use thiserror::Error;

use crate::render::{FrameState, LightingTarget};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LightingError {
    /// A pass was entered out of sequence, e.g. occlusion while no frame is active.
    #[error("invalid pass order: cannot enter {to:?} from {from:?}")]
    InvalidPassOrder { from: FrameState, to: FrameState },

    /// A backend pass was issued outside `begin_frame`/`end_frame`.
    #[error("no frame in progress for the {pass} pass")]
    NoActiveFrame { pass: &'static str },

    /// A framebuffer attachment is absent after the resize step.
    #[error("framebuffer {target:?} is missing")]
    MissingFramebuffer { target: LightingTarget },

    /// A framebuffer attachment exists but was not resized as requested.
    #[error("framebuffer {target:?} is {actual:?}, expected {expected:?}")]
    FramebufferSizeMismatch {
        target: LightingTarget,
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("invalid lighting configuration: {0}")]
    InvalidConfig(String),

    /// A pass exceeded its per-frame uniform capacity.
    #[error("too many draws in the {pass} pass (max: {max})")]
    TooManyDraws { pass: &'static str, max: usize },

    /// Pixel data does not describe a non-empty `width`x`height` RGBA8 image.
    #[error("invalid texture data: {width}x{height} RGBA8 from {len} bytes")]
    InvalidTextureData { width: u32, height: u32, len: usize },

    #[error("unknown texture handle {0}")]
    UnknownTexture(u32),

    #[error("unknown render target {0}")]
    UnknownRenderTarget(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LightingError::InvalidPassOrder {
            from: FrameState::Idle,
            to: FrameState::Occlusion { light: 0 },
        };
        assert_eq!(
            err.to_string(),
            "invalid pass order: cannot enter Occlusion { light: 0 } from Idle"
        );

        let err = LightingError::TooManyDraws {
            pass: "occlusion",
            max: 8,
        };
        assert_eq!(err.to_string(), "too many draws in the occlusion pass (max: 8)");
    }

    #[test]
    fn test_error_survives_anyhow_round_trip() {
        let err: anyhow::Error = LightingError::MissingFramebuffer {
            target: LightingTarget::LightMap,
        }
        .into();
        assert_eq!(
            err.downcast_ref::<LightingError>(),
            Some(&LightingError::MissingFramebuffer {
                target: LightingTarget::LightMap
            })
        );
    }
}
