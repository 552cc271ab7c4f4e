use crate::error::LightingError;

/// Position of the renderer within a frame.
///
/// `light` counts shadow-casting lights in submission order. Light `i`
/// finishes its screen-shadow pass before light `i + 1` enters occlusion,
/// because the occlusion and polar buffers are shared between lights.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    FramebufferCheck,
    Occlusion { light: usize },
    PolarDistance { light: usize },
    ScreenShadow { light: usize },
    LightAccumulation,
    Composite,
}

impl FrameState {
    pub fn can_enter(self, next: FrameState) -> bool {
        use FrameState::*;

        match (self, next) {
            (Idle, FramebufferCheck) => true,
            (FramebufferCheck, Occlusion { light }) => light == 0,
            (ScreenShadow { light: done }, Occlusion { light }) => light == done + 1,
            (Occlusion { light: a }, PolarDistance { light: b }) => a == b,
            (PolarDistance { light: a }, ScreenShadow { light: b }) => a == b,
            (FramebufferCheck | ScreenShadow { .. }, LightAccumulation) => true,
            (LightAccumulation, Composite) => true,
            (Composite, Idle) => true,
            _ => false,
        }
    }

    /// Move to `next`, or report the illegal transition and stay put.
    pub fn advance(&mut self, next: FrameState) -> Result<(), LightingError> {
        if !self.can_enter(next) {
            return Err(LightingError::InvalidPassOrder {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    pub fn is_idle(self) -> bool {
        self == FrameState::Idle
    }
}

impl Default for FrameState {
    fn default() -> Self {
        FrameState::Idle
    }
}
