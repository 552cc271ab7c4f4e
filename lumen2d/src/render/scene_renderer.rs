//! Per-frame orchestration of the lighting pipeline.
//!
//! Callers submit lights and objects, then call [`SceneRenderer::render`],
//! which runs
//!
//! ```text
//! FramebufferCheck -> [Occlusion(i) -> PolarDistance(i) -> ScreenShadow(i)]*
//!                  -> LightAccumulation -> Composite
//! ```
//!
//! and returns every submitted record to its pool, whether the frame
//! succeeded or not.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, warn};

use crate::assets::TextureProvider;
use crate::config::{validate_color, validate_non_negative, LightingConfig};
use crate::error::LightingError;
use crate::math::{Camera2D, Transform2D, Vec2};
use crate::render::backend::{
    CompositeParams, LightDraw, LightView, LightingBackend, LightingTarget, ScreenView, ShadowDraw,
};
use crate::render::batch::{composite_batches, occlusion_batches, CompositeBatches, TextureResolver};
use crate::render::frame::FrameState;
use crate::render::framebuffers::FramebufferSet;
use crate::render::light::PointLight;
use crate::render::material::{Geometry, Material};
use crate::render::renderable::{
    LightRenderable, ObjectRenderable, PoolStats, RenderablePool,
};
use crate::render::sprite::TextureKind;

/// What the last successful frame did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameStats {
    /// Lights that reached the pipeline.
    pub lights: usize,
    pub shadow_lights: usize,
    /// Lights rejected at submission as malformed.
    pub rejected_lights: usize,
    /// Occlusion draw calls summed over all shadow-casting lights.
    pub occlusion_batches: usize,
    pub composite_batches: usize,
    /// Layer of each composite draw call, in draw order.
    pub composite_layers: Vec<i32>,
    pub culled_objects: usize,
}

/// Lighting pipeline driving a [`LightingBackend`].
pub struct SceneRenderer<B: LightingBackend> {
    backend: B,
    framebuffers: FramebufferSet,
    soft_shadows: bool,
    ambient_color: [f32; 3],
    ambient_intensity: f32,
    direction_sample_distance: f32,
    clear_color: [f32; 4],
    light_pool: RenderablePool<LightRenderable>,
    object_pool: RenderablePool<ObjectRenderable>,
    lights: Vec<LightRenderable>,
    objects: Vec<ObjectRenderable>,
    rejected_lights: usize,
    state: FrameState,
    warned_textures: HashSet<String>,
    last_frame_stats: FrameStats,
}

impl<B: LightingBackend> SceneRenderer<B> {
    /// Create the pipeline and its four intermediate targets.
    pub fn new(mut backend: B, config: &LightingConfig, viewport: (u32, u32)) -> Result<Self> {
        let framebuffers = FramebufferSet::new(&mut backend, config, viewport)?;
        debug!(
            "Lighting pipeline ready: shadow map {}, viewport {:?}",
            config.shadow_map_size, viewport
        );
        Ok(Self {
            backend,
            framebuffers,
            soft_shadows: config.soft_shadows,
            ambient_color: config.ambient_color,
            ambient_intensity: config.ambient_intensity,
            direction_sample_distance: config.direction_sample_distance,
            clear_color: config.clear_color,
            light_pool: RenderablePool::new(),
            object_pool: RenderablePool::new(),
            lights: Vec::new(),
            objects: Vec::new(),
            rejected_lights: 0,
            state: FrameState::Idle,
            warned_textures: HashSet::new(),
            last_frame_stats: FrameStats::default(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn framebuffers(&self) -> &FramebufferSet {
        &self.framebuffers
    }

    /// Read-only view of an intermediate buffer, as left by the last frame.
    pub fn framebuffer(&self, target: LightingTarget) -> Option<&B::Surface> {
        self.backend.intermediate(target)
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn last_frame_stats(&self) -> &FrameStats {
        &self.last_frame_stats
    }

    pub fn light_pool_stats(&self) -> PoolStats {
        self.light_pool.stats()
    }

    pub fn object_pool_stats(&self) -> PoolStats {
        self.object_pool.stats()
    }

    /// Forget which missing texture paths were already reported, so the next
    /// lookup of each warns again.
    pub fn clear_texture_warnings(&mut self) {
        self.warned_textures.clear();
    }

    /// Records waiting for the next `render()`: (lights, objects).
    pub fn pending(&self) -> (usize, usize) {
        (self.lights.len(), self.objects.len())
    }

    // Configuration

    /// Snapshot of the current settings.
    pub fn config(&self) -> LightingConfig {
        LightingConfig {
            shadow_map_size: self.framebuffers.shadow_map_size(),
            shadow_upscale: self.framebuffers.shadow_upscale(),
            soft_shadows: self.soft_shadows,
            ambient_color: self.ambient_color,
            ambient_intensity: self.ambient_intensity,
            light_map_scale: self.framebuffers.light_map_scale(),
            shadow_map_scale: self.framebuffers.shadow_map_scale(),
            direction_sample_distance: self.direction_sample_distance,
            clear_color: self.clear_color,
        }
    }

    /// Apply every field of `config`. Nothing changes if any field is invalid.
    pub fn apply_config(&mut self, config: &LightingConfig) -> Result<(), LightingError> {
        config.validate()?;
        self.framebuffers.set_shadow_map_size(config.shadow_map_size)?;
        self.framebuffers.set_shadow_upscale(config.shadow_upscale)?;
        self.framebuffers.set_light_map_scale(config.light_map_scale)?;
        self.framebuffers.set_shadow_map_scale(config.shadow_map_scale)?;
        self.soft_shadows = config.soft_shadows;
        self.ambient_color = config.ambient_color;
        self.ambient_intensity = config.ambient_intensity;
        self.direction_sample_distance = config.direction_sample_distance;
        self.clear_color = config.clear_color;
        Ok(())
    }

    /// Takes effect at the start of the next frame.
    pub fn set_shadow_map_size(&mut self, size: u32) -> Result<(), LightingError> {
        self.framebuffers.set_shadow_map_size(size)
    }

    pub fn set_shadow_upscale(&mut self, upscale: f32) -> Result<(), LightingError> {
        self.framebuffers.set_shadow_upscale(upscale)
    }

    pub fn set_soft_shadows(&mut self, enabled: bool) {
        self.soft_shadows = enabled;
    }

    pub fn set_ambient_color(&mut self, color: [f32; 3]) -> Result<(), LightingError> {
        validate_color("ambient_color", &color)?;
        self.ambient_color = color;
        Ok(())
    }

    pub fn set_ambient_intensity(&mut self, intensity: f32) -> Result<(), LightingError> {
        validate_non_negative("ambient_intensity", intensity)?;
        self.ambient_intensity = intensity;
        Ok(())
    }

    /// Takes effect at the start of the next frame.
    pub fn set_light_map_scale(&mut self, scale: f32) -> Result<(), LightingError> {
        self.framebuffers.set_light_map_scale(scale)
    }

    /// Takes effect at the start of the next frame.
    pub fn set_shadow_map_scale(&mut self, scale: f32) -> Result<(), LightingError> {
        self.framebuffers.set_shadow_map_scale(scale)
    }

    pub fn set_direction_sample_distance(&mut self, texels: f32) -> Result<(), LightingError> {
        validate_non_negative("direction_sample_distance", texels)?;
        self.direction_sample_distance = texels;
        Ok(())
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) -> Result<(), LightingError> {
        validate_color("clear_color", &color)?;
        self.clear_color = color;
        Ok(())
    }

    /// Viewport resize notification. Screen buffers follow on the next frame.
    pub fn on_viewport_resized(&mut self, width: u32, height: u32) {
        self.framebuffers.set_viewport(width, height);
        self.backend.resize_output(width, height);
    }

    // Submission

    /// Queue a light for the next frame. The position is read from
    /// `transform` now; malformed lights are dropped with a warning.
    pub fn submit_light(&mut self, transform: &Transform2D, light: &PointLight) {
        if !light.is_well_formed() || !transform.position.is_finite() {
            warn!(
                "Skipping malformed light at {:?} (range {}, intensity {})",
                transform.position, light.range, light.intensity
            );
            self.rejected_lights += 1;
            return;
        }
        let mut record = self.light_pool.acquire();
        record.fill(transform, light);
        self.lights.push(record);
    }

    /// Queue an object for the next frame. Geometry and material are shared,
    /// not copied; bounds are computed now.
    pub fn submit_object(
        &mut self,
        geometry: &Arc<Geometry>,
        material: &Arc<Material>,
        flip_x: bool,
        flip_y: bool,
        layer: i32,
    ) {
        let mut record = self.object_pool.acquire();
        record.fill(geometry, material, flip_x, flip_y, layer);
        self.objects.push(record);
    }

    // Frame

    /// Run every pass for the submitted scene and draw into `target`, or the
    /// backend's default output when `None`.
    ///
    /// Submissions are consumed even when the frame fails; on failure the
    /// backend discards the partial frame and the renderer returns to idle.
    pub fn render(
        &mut self,
        camera: &Camera2D,
        textures: &dyn TextureProvider,
        target: Option<&B::Target>,
    ) -> Result<()> {
        let result = self.run_frame(camera, textures, target);
        if let Err(err) = &result {
            warn!("Frame aborted: {err}");
            self.backend.abort_frame();
            self.state = FrameState::Idle;
        }
        self.light_pool.release_all(&mut self.lights);
        self.object_pool.release_all(&mut self.objects);
        self.rejected_lights = 0;
        result
    }

    fn run_frame(
        &mut self,
        camera: &Camera2D,
        textures: &dyn TextureProvider,
        target: Option<&B::Target>,
    ) -> Result<()> {
        self.framebuffer_check()?;
        self.backend.begin_frame(target)?;

        let screen = ScreenView {
            camera: *camera,
            viewport: self.framebuffers.viewport(),
        };
        let mut stats = FrameStats {
            lights: self.lights.len(),
            rejected_lights: self.rejected_lights,
            ..FrameStats::default()
        };

        let shadow_lights: Vec<(Vec2, f32)> = self
            .lights
            .iter()
            .filter(|light| light.casts_shadows)
            .map(|light| (light.position, light.range))
            .collect();
        for (index, &(center, range)) in shadow_lights.iter().enumerate() {
            stats.occlusion_batches += self.occlusion_pass(index, center, textures)?;
            self.polar_distance_pass(index)?;
            self.screen_shadow_pass(index, center, range, &screen)?;
        }
        stats.shadow_lights = shadow_lights.len();

        self.light_accumulation_pass(&screen)?;

        let composite = self.composite_pass(&screen, textures, target)?;
        stats.composite_batches = composite.batches.len();
        stats.composite_layers = composite.batches.iter().map(|batch| batch.layer).collect();
        stats.culled_objects = composite.culled;

        self.backend.end_frame(target)?;
        self.state.advance(FrameState::Idle)?;

        debug!(
            "Frame: {} lights ({} casting shadows), {} occlusion batches, {} composite batches, {} culled",
            stats.lights,
            stats.shadow_lights,
            stats.occlusion_batches,
            stats.composite_batches,
            stats.culled_objects
        );
        self.last_frame_stats = stats;
        Ok(())
    }

    pub(crate) fn framebuffer_check(&mut self) -> Result<()> {
        self.state.advance(FrameState::FramebufferCheck)?;
        self.framebuffers.apply_pending_resizes(&mut self.backend)
    }

    /// Returns the number of occlusion draw calls.
    pub(crate) fn occlusion_pass(
        &mut self,
        light: usize,
        center: Vec2,
        textures: &dyn TextureProvider,
    ) -> Result<usize> {
        self.state.advance(FrameState::Occlusion { light })?;
        let view = LightView {
            center,
            extent: self.framebuffers.light_view_extent(),
        };
        let mut resolver = TextureResolver::new(
            textures,
            self.backend.default_texture(TextureKind::Color),
            self.backend.default_texture(TextureKind::Normal),
            &mut self.warned_textures,
        );
        let batches = occlusion_batches(&self.objects, &view.rect(), &mut resolver);
        self.backend.render_occlusion(&view, &batches)?;
        Ok(batches.len())
    }

    pub(crate) fn polar_distance_pass(&mut self, light: usize) -> Result<()> {
        self.state.advance(FrameState::PolarDistance { light })?;
        self.backend.render_polar_distances()
    }

    pub(crate) fn screen_shadow_pass(
        &mut self,
        light: usize,
        center: Vec2,
        range: f32,
        screen: &ScreenView,
    ) -> Result<()> {
        self.state.advance(FrameState::ScreenShadow { light })?;
        let shadow = ShadowDraw {
            center,
            extent: self.framebuffers.light_view_extent(),
            range,
            softness: if self.soft_shadows { 1.0 } else { 0.0 },
            resolution: self.framebuffers.shadow_map_size(),
        };
        self.backend.render_shadow(screen, &shadow)
    }

    pub(crate) fn light_accumulation_pass(&mut self, screen: &ScreenView) -> Result<()> {
        self.state.advance(FrameState::LightAccumulation)?;
        let draws: Vec<LightDraw> = self
            .lights
            .iter()
            .map(|light| LightDraw {
                center: light.position,
                range: light.range,
                color: light.color,
                intensity: light.intensity,
            })
            .collect();
        self.backend.render_light_map(screen, &draws)
    }

    pub(crate) fn composite_pass(
        &mut self,
        screen: &ScreenView,
        textures: &dyn TextureProvider,
        target: Option<&B::Target>,
    ) -> Result<CompositeBatches> {
        self.state.advance(FrameState::Composite)?;
        let mut resolver = TextureResolver::new(
            textures,
            self.backend.default_texture(TextureKind::Color),
            self.backend.default_texture(TextureKind::Normal),
            &mut self.warned_textures,
        );
        let visible = screen.camera.visible_rect(screen.viewport.0, screen.viewport.1);
        let composite = composite_batches(&self.objects, &visible, &mut resolver);
        let params = CompositeParams {
            ambient: self.ambient_color.map(|c| c * self.ambient_intensity),
            direction_sample_distance: self.direction_sample_distance,
            clear_color: self.clear_color,
        };
        self.backend
            .render_objects(screen, &params, &composite.batches, target)?;
        Ok(composite)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::render::sprite::TextureHandle;
    use crate::render::SoftwareBackend;

    fn renderer() -> SceneRenderer<SoftwareBackend> {
        let config = LightingConfig {
            shadow_map_size: 16,
            ..LightingConfig::default()
        };
        SceneRenderer::new(SoftwareBackend::new(32, 32), &config, (32, 32)).unwrap()
    }

    fn no_textures() -> HashMap<String, TextureHandle> {
        HashMap::new()
    }

    fn camera() -> Camera2D {
        Camera2D::centered_on(Vec2::ZERO, 32, 32)
    }

    #[test]
    fn test_occlusion_while_idle_fails_fast() {
        let mut renderer = renderer();
        let err = renderer
            .occlusion_pass(0, Vec2::ZERO, &no_textures())
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<LightingError>(),
            Some(&LightingError::InvalidPassOrder {
                from: FrameState::Idle,
                to: FrameState::Occlusion { light: 0 },
            })
        );
    }

    #[test]
    fn test_composite_before_light_accumulation_fails() {
        let mut renderer = renderer();
        renderer.framebuffer_check().unwrap();
        let screen = ScreenView {
            camera: camera(),
            viewport: (32, 32),
        };
        let err = renderer
            .composite_pass(&screen, &no_textures(), None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LightingError>(),
            Some(LightingError::InvalidPassOrder { .. })
        ));
        assert_eq!(renderer.state(), FrameState::FramebufferCheck);
    }

    #[test]
    fn test_lists_are_drained_by_render() {
        let mut renderer = renderer();
        let geometry = Arc::new(Geometry::quad(Vec2::ZERO, Vec2::new(4.0, 4.0)));
        let material = Arc::new(Material::default());
        renderer.submit_light(&Transform2D::identity(), &PointLight::default());
        renderer.submit_object(&geometry, &material, false, false, 0);
        assert_eq!(renderer.pending(), (1, 1));

        renderer.render(&camera(), &no_textures(), None).unwrap();
        assert_eq!(renderer.pending(), (0, 0));
        assert!(renderer.state().is_idle());
        assert_eq!(Arc::strong_count(&geometry), 1);
    }

    #[test]
    fn test_malformed_light_is_rejected() {
        let mut renderer = renderer();
        renderer.submit_light(&Transform2D::identity(), &PointLight::new([1.0; 3], 1.0, -5.0));
        renderer.submit_light(
            &Transform2D::from_position(Vec2::new(f32::NAN, 0.0)),
            &PointLight::default(),
        );
        assert_eq!(renderer.pending(), (0, 0));

        renderer.render(&camera(), &no_textures(), None).unwrap();
        assert_eq!(renderer.last_frame_stats().rejected_lights, 2);
        assert_eq!(renderer.last_frame_stats().lights, 0);
    }

    #[test]
    fn test_pools_are_reused_across_frames() {
        let mut renderer = renderer();
        let geometry = Arc::new(Geometry::quad(Vec2::ZERO, Vec2::new(4.0, 4.0)));
        let material = Arc::new(Material::default());
        for _ in 0..3 {
            for _ in 0..5 {
                renderer.submit_object(&geometry, &material, false, false, 0);
            }
            renderer.submit_light(&Transform2D::identity(), &PointLight::default());
            renderer.render(&camera(), &no_textures(), None).unwrap();
        }
        assert_eq!(
            renderer.object_pool_stats(),
            PoolStats {
                allocated: 5,
                available: 5
            }
        );
        assert_eq!(renderer.light_pool_stats().allocated, 1);
    }

    #[test]
    fn test_apply_config_is_all_or_nothing() {
        let mut renderer = renderer();
        let before = renderer.config();
        let invalid = LightingConfig {
            ambient_intensity: 0.9,
            light_map_scale: -1.0,
            ..before.clone()
        };
        assert!(renderer.apply_config(&invalid).is_err());
        assert_eq!(renderer.config(), before);

        let valid = LightingConfig {
            shadow_map_size: 32,
            soft_shadows: false,
            ..before
        };
        renderer.apply_config(&valid).unwrap();
        assert_eq!(renderer.config(), valid);
        assert!(renderer.framebuffers().is_shadow_dirty());
    }

    #[test]
    fn test_non_finite_colors_are_rejected_and_kept() {
        let mut renderer = renderer();
        let before = renderer.config();
        assert!(matches!(
            renderer.set_ambient_color([f32::NAN, 1.0, 1.0]),
            Err(LightingError::InvalidConfig(_))
        ));
        assert!(renderer.set_clear_color([0.0, f32::NEG_INFINITY, 0.0, 1.0]).is_err());
        assert_eq!(renderer.config(), before);

        renderer.set_ambient_color([0.1, 0.2, 0.3]).unwrap();
        assert_eq!(renderer.config().ambient_color, [0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_shadow_lights_are_counted() {
        let mut renderer = renderer();
        renderer.submit_light(&Transform2D::identity(), &PointLight::default().with_shadows(true));
        renderer.submit_light(&Transform2D::identity(), &PointLight::default());
        renderer.submit_light(&Transform2D::identity(), &PointLight::default().with_shadows(true));
        renderer.render(&camera(), &no_textures(), None).unwrap();
        let stats = renderer.last_frame_stats();
        assert_eq!(stats.lights, 3);
        assert_eq!(stats.shadow_lights, 2);
    }
}
