//! Sizes of the four intermediate targets and when to reallocate them.

use anyhow::Result;
use log::debug;

use crate::config::{validate_positive, validate_shadow_size, LightingConfig};
use crate::error::LightingError;
use crate::render::backend::{LightingBackend, LightingTarget};

/// Tracks the governing resolutions of the intermediate targets.
///
/// Setters only record the new value and raise a dirty flag; the backend is
/// touched once per flag in [`FramebufferSet::apply_pending_resizes`], so any
/// number of changes between two frames costs at most one reallocation.
#[derive(Debug, Clone)]
pub struct FramebufferSet {
    shadow_map_size: u32,
    shadow_upscale: f32,
    light_map_scale: f32,
    shadow_map_scale: f32,
    viewport: (u32, u32),
    should_resize_shadow_framebuffers: bool,
    should_resize_screenspace_framebuffers: bool,
    shadow_resizes: usize,
    screen_resizes: usize,
}

impl FramebufferSet {
    /// Validate `config` and create all four targets on `backend`.
    ///
    /// Creation does not count as a resize.
    pub fn new<B: LightingBackend>(
        backend: &mut B,
        config: &LightingConfig,
        viewport: (u32, u32),
    ) -> Result<Self> {
        config.validate()?;
        let set = Self {
            shadow_map_size: config.shadow_map_size,
            shadow_upscale: config.shadow_upscale,
            light_map_scale: config.light_map_scale,
            shadow_map_scale: config.shadow_map_scale,
            viewport: clamp_viewport(viewport),
            should_resize_shadow_framebuffers: false,
            should_resize_screenspace_framebuffers: false,
            shadow_resizes: 0,
            screen_resizes: 0,
        };
        backend.resize_shadow_targets(set.shadow_map_size)?;
        backend.resize_screen_targets(set.light_map_size(), set.shadow_buffer_size())?;
        set.verify(backend)?;
        Ok(set)
    }

    pub fn shadow_map_size(&self) -> u32 {
        self.shadow_map_size
    }

    pub fn shadow_upscale(&self) -> f32 {
        self.shadow_upscale
    }

    pub fn light_map_scale(&self) -> f32 {
        self.light_map_scale
    }

    pub fn shadow_map_scale(&self) -> f32 {
        self.shadow_map_scale
    }

    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    /// World-space side of the square each light sees.
    pub fn light_view_extent(&self) -> f32 {
        self.shadow_map_size as f32 * self.shadow_upscale
    }

    pub fn light_map_size(&self) -> (u32, u32) {
        scaled(self.viewport, self.light_map_scale)
    }

    pub fn shadow_buffer_size(&self) -> (u32, u32) {
        scaled(self.viewport, self.shadow_map_scale)
    }

    /// Size a target must have once pending resizes are applied.
    pub fn expected_size(&self, target: LightingTarget) -> (u32, u32) {
        match target {
            LightingTarget::Occlusion => (self.shadow_map_size, self.shadow_map_size),
            LightingTarget::PolarDistance => (self.shadow_map_size, 1),
            LightingTarget::LightMap => self.light_map_size(),
            LightingTarget::ShadowMap => self.shadow_buffer_size(),
        }
    }

    pub fn set_shadow_map_size(&mut self, size: u32) -> Result<(), LightingError> {
        validate_shadow_size(size)?;
        if size != self.shadow_map_size {
            self.shadow_map_size = size;
            self.should_resize_shadow_framebuffers = true;
        }
        Ok(())
    }

    /// Changes the light view's world extent only; buffer sizes are unaffected.
    pub fn set_shadow_upscale(&mut self, upscale: f32) -> Result<(), LightingError> {
        validate_positive("shadow_upscale", upscale)?;
        self.shadow_upscale = upscale;
        Ok(())
    }

    pub fn set_light_map_scale(&mut self, scale: f32) -> Result<(), LightingError> {
        validate_positive("light_map_scale", scale)?;
        if scale != self.light_map_scale {
            self.light_map_scale = scale;
            self.should_resize_screenspace_framebuffers = true;
        }
        Ok(())
    }

    pub fn set_shadow_map_scale(&mut self, scale: f32) -> Result<(), LightingError> {
        validate_positive("shadow_map_scale", scale)?;
        if scale != self.shadow_map_scale {
            self.shadow_map_scale = scale;
            self.should_resize_screenspace_framebuffers = true;
        }
        Ok(())
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        let viewport = clamp_viewport((width, height));
        if viewport != self.viewport {
            self.viewport = viewport;
            self.should_resize_screenspace_framebuffers = true;
        }
    }

    pub fn is_shadow_dirty(&self) -> bool {
        self.should_resize_shadow_framebuffers
    }

    pub fn is_screen_dirty(&self) -> bool {
        self.should_resize_screenspace_framebuffers
    }

    /// Number of shadow-target reallocations since creation.
    pub fn shadow_resizes(&self) -> usize {
        self.shadow_resizes
    }

    /// Number of screen-target reallocations since creation.
    pub fn screen_resizes(&self) -> usize {
        self.screen_resizes
    }

    /// Reallocate the targets behind each raised flag, then check that every
    /// target exists at its expected size.
    pub fn apply_pending_resizes<B: LightingBackend>(&mut self, backend: &mut B) -> Result<()> {
        if self.should_resize_shadow_framebuffers {
            debug!("Resizing shadow framebuffers to {}", self.shadow_map_size);
            backend.resize_shadow_targets(self.shadow_map_size)?;
            self.should_resize_shadow_framebuffers = false;
            self.shadow_resizes += 1;
        }

        if self.should_resize_screenspace_framebuffers {
            let light_map = self.light_map_size();
            let shadow_map = self.shadow_buffer_size();
            debug!(
                "Resizing screen framebuffers: light map {:?}, shadow map {:?}",
                light_map, shadow_map
            );
            backend.resize_screen_targets(light_map, shadow_map)?;
            self.should_resize_screenspace_framebuffers = false;
            self.screen_resizes += 1;
        }

        if let Err(err) = self.verify(backend) {
            // Keep the failing group flagged so the next frame reallocates it.
            if let LightingError::MissingFramebuffer { target }
            | LightingError::FramebufferSizeMismatch { target, .. } = &err
            {
                match target {
                    LightingTarget::Occlusion | LightingTarget::PolarDistance => {
                        self.should_resize_shadow_framebuffers = true;
                    }
                    LightingTarget::LightMap | LightingTarget::ShadowMap => {
                        self.should_resize_screenspace_framebuffers = true;
                    }
                }
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn verify<B: LightingBackend>(&self, backend: &B) -> Result<(), LightingError> {
        for target in LightingTarget::ALL {
            let expected = self.expected_size(target);
            match backend.target_size(target) {
                None => return Err(LightingError::MissingFramebuffer { target }),
                Some(actual) if actual != expected => {
                    return Err(LightingError::FramebufferSizeMismatch {
                        target,
                        expected,
                        actual,
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn clamp_viewport(viewport: (u32, u32)) -> (u32, u32) {
    (viewport.0.max(1), viewport.1.max(1))
}

fn scaled(size: (u32, u32), scale: f32) -> (u32, u32) {
    let dim = |v: u32| ((v as f32 * scale).round() as u32).max(1);
    (dim(size.0), dim(size.1))
}
