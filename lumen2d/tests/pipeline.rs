use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use approx::assert_relative_eq;
use lumen2d::render::{
    CompositeParams, GeometryBatch, Image, LightDraw, LightView, ScreenView, ShadowDraw,
};
use lumen2d::{
    Camera2D, FrameState, Geometry, LightingBackend, LightingConfig, LightingError,
    LightingTarget, Material, PointLight, SceneRenderer, SoftwareBackend, TextureHandle,
    TextureKind, Transform2D, Vec2,
};

const VIEWPORT: (u32, u32) = (64, 64);

/// Shows world [-64, 64] on both axes.
fn camera() -> Camera2D {
    Camera2D {
        position: Vec2::new(-64.0, -64.0),
        zoom: 0.5,
    }
}

fn screen() -> ScreenView {
    ScreenView {
        camera: camera(),
        viewport: VIEWPORT,
    }
}

fn config() -> LightingConfig {
    LightingConfig {
        shadow_map_size: 32,
        shadow_upscale: 4.0,
        soft_shadows: false,
        ambient_color: [1.0, 1.0, 1.0],
        ambient_intensity: 0.2,
        ..LightingConfig::default()
    }
}

fn renderer_with(config: &LightingConfig) -> SceneRenderer<SoftwareBackend> {
    SceneRenderer::new(SoftwareBackend::new(VIEWPORT.0, VIEWPORT.1), config, VIEWPORT).unwrap()
}

fn no_textures() -> HashMap<String, TextureHandle> {
    HashMap::new()
}

fn floor() -> Arc<Geometry> {
    Arc::new(Geometry::quad(Vec2::ZERO, Vec2::new(128.0, 128.0)))
}

fn backbuffer_at(renderer: &SceneRenderer<SoftwareBackend>, world: Vec2) -> [f32; 4] {
    renderer
        .backend()
        .backbuffer()
        .pixel_at(&screen(), world)
        .unwrap()
}

fn shadow_buffer(renderer: &SceneRenderer<SoftwareBackend>) -> &Image {
    renderer.framebuffer(LightingTarget::ShadowMap).unwrap()
}

#[test]
fn test_zero_intensity_light_leaves_ambient_only() {
    let mut renderer = renderer_with(&LightingConfig {
        ambient_intensity: 0.5,
        ..config()
    });
    let material = Arc::new(Material::default().with_tint([0.8, 0.4, 0.2, 1.0]));

    renderer.submit_object(&floor(), &material, false, false, 0);
    renderer.submit_light(
        &Transform2D::from_position(Vec2::ZERO),
        &PointLight::new([1.0, 1.0, 1.0], 0.0, 100.0),
    );
    renderer.render(&camera(), &no_textures(), None).unwrap();

    for world in [Vec2::ZERO, Vec2::new(-40.0, 20.0), Vec2::new(60.0, -60.0)] {
        let pixel = backbuffer_at(&renderer, world);
        assert_relative_eq!(pixel[0], 0.4, epsilon = 1e-5);
        assert_relative_eq!(pixel[1], 0.2, epsilon = 1e-5);
        assert_relative_eq!(pixel[2], 0.1, epsilon = 1e-5);
        assert_relative_eq!(pixel[3], 1.0, epsilon = 1e-5);
    }
}

/// Light at the origin with range 40; a caster spanning x 8..20, y -12..12;
/// a receiving floor under everything.
fn render_shadowed_scene(renderer: &mut SceneRenderer<SoftwareBackend>) {
    let receiver = Arc::new(Material::default().casting_shadows(false));
    let caster = Arc::new(Material::default().casting_shadows(true));
    let caster_geometry = Arc::new(Geometry::quad(Vec2::new(14.0, 0.0), Vec2::new(12.0, 24.0)));

    renderer.submit_object(&floor(), &receiver, false, false, 0);
    renderer.submit_object(&caster_geometry, &caster, false, false, 1);
    renderer.submit_light(
        &Transform2D::from_position(Vec2::ZERO),
        &PointLight::new([1.0, 1.0, 1.0], 1.0, 40.0).with_shadows(true),
    );
    renderer.render(&camera(), &no_textures(), None).unwrap();
}

#[test]
fn test_caster_shadows_the_receiver_behind_it() {
    let mut renderer = renderer_with(&config());
    render_shadowed_scene(&mut renderer);

    let behind = Vec2::new(30.0, 0.0);
    let opposite = Vec2::new(-30.0, 0.0);
    let shadow = shadow_buffer(&renderer);
    let behind_visibility = shadow.pixel_at(&screen(), behind).unwrap()[0];
    let opposite_visibility = shadow.pixel_at(&screen(), opposite).unwrap()[0];
    assert!(behind_visibility < 0.05, "behind caster: {behind_visibility}");
    assert!(opposite_visibility > 0.1, "unoccluded: {opposite_visibility}");

    // Receiver behind the caster gets ambient only.
    let pixel = backbuffer_at(&renderer, behind);
    for c in 0..3 {
        assert_relative_eq!(pixel[c], 0.2, epsilon = 1e-4);
    }
    assert!(backbuffer_at(&renderer, opposite)[0] > pixel[0]);
    assert_eq!(renderer.last_frame_stats().shadow_lights, 1);
}

#[test]
fn test_shadow_buffer_is_zero_beyond_light_range() {
    let mut renderer = renderer_with(&config());
    render_shadowed_scene(&mut renderer);

    let shadow = shadow_buffer(&renderer);
    let mut checked = 0;
    for y in 0..shadow.height() {
        for x in 0..shadow.width() {
            let world = Vec2::new(-64.0 + (x as f32 + 0.5) * 2.0, -64.0 + (y as f32 + 0.5) * 2.0);
            if world.length() >= 40.5 {
                assert_eq!(shadow.pixel(x, y)[0], 0.0, "pixel ({x}, {y})");
                checked += 1;
            }
        }
    }
    assert!(checked > 0);
}

#[test]
fn test_lights_without_shadows_leave_shadow_buffer_empty() {
    let mut renderer = renderer_with(&config());
    let caster = Arc::new(Material::default().casting_shadows(true));
    renderer.submit_object(&floor(), &caster, false, false, 0);
    renderer.submit_light(
        &Transform2D::from_position(Vec2::ZERO),
        &PointLight::new([1.0, 1.0, 1.0], 1.0, 50.0),
    );
    renderer.render(&camera(), &no_textures(), None).unwrap();

    assert!(shadow_buffer(&renderer)
        .pixels()
        .iter()
        .all(|pixel| pixel[0] == 0.0));
    let stats = renderer.last_frame_stats();
    assert_eq!(stats.shadow_lights, 0);
    assert_eq!(stats.occlusion_batches, 0);

    // The light map still sees the light.
    let light_map = renderer.framebuffer(LightingTarget::LightMap).unwrap();
    assert!(light_map.pixel_at(&screen(), Vec2::ZERO).unwrap()[3] > 0.9);
}

#[test]
fn test_receivers_take_direct_light_only_from_shadow_casting_lights() {
    let no_ambient = LightingConfig {
        ambient_intensity: 0.0,
        ..config()
    };
    let receiver = Arc::new(Material::default());
    let non_receiver = Arc::new(Material::default().receiving_shadows(false));
    let render_lit = |material: &Arc<Material>, light: PointLight| {
        let mut renderer = renderer_with(&no_ambient);
        renderer.submit_object(&floor(), material, false, false, 0);
        renderer.submit_light(&Transform2D::from_position(Vec2::ZERO), &light);
        renderer.render(&camera(), &no_textures(), None).unwrap();
        backbuffer_at(&renderer, Vec2::new(1.0, 1.0))
    };
    let plain = PointLight::new([1.0, 1.0, 1.0], 1.0, 50.0);

    assert_eq!(render_lit(&receiver, plain), [0.0, 0.0, 0.0, 1.0]);
    assert!(render_lit(&non_receiver, plain)[0] > 0.5);
    assert!(render_lit(&receiver, plain.with_shadows(true))[0] > 0.5);
}

/// Red channel near the center of a small white quad whose 1x1 normal map
/// encodes `normal`, lit by one light at `light` with no ambient term.
fn shade_with_normal(light: Vec2, normal: [f32; 3], flip_x: bool, flip_y: bool) -> f32 {
    let mut renderer = renderer_with(&LightingConfig {
        ambient_intensity: 0.0,
        ..config()
    });
    let encode = |v: f32| ((v * 0.5 + 0.5) * 255.0).round() as u8;
    let texel = [encode(normal[0]), encode(normal[1]), encode(normal[2]), 255];
    let handle = renderer
        .backend_mut()
        .create_texture(&texel, 1, 1, TextureKind::Normal)
        .unwrap();
    let textures = HashMap::from([("tilted".to_string(), handle)]);
    let material = Arc::new(
        Material::default()
            .with_normal_texture("tilted")
            .receiving_shadows(false),
    );
    let quad = Arc::new(Geometry::quad(Vec2::ZERO, Vec2::new(8.0, 8.0)));

    renderer.submit_object(&quad, &material, flip_x, flip_y, 0);
    renderer.submit_light(
        &Transform2D::from_position(light),
        &PointLight::new([1.0, 1.0, 1.0], 1.0, 100.0),
    );
    renderer.render(&camera(), &textures, None).unwrap();
    backbuffer_at(&renderer, Vec2::new(1.0, 1.0))[0]
}

#[test]
fn test_normals_tilted_toward_the_light_are_brighter() {
    for (light, toward) in [
        (Vec2::new(30.0, 0.0), [0.6, 0.0, 0.8]),
        (Vec2::new(-30.0, 0.0), [-0.6, 0.0, 0.8]),
        (Vec2::new(0.0, 30.0), [0.0, 0.6, 0.8]),
        (Vec2::new(0.0, -30.0), [0.0, -0.6, 0.8]),
    ] {
        let away = [-toward[0], -toward[1], toward[2]];
        let facing = shade_with_normal(light, toward, false, false);
        let facing_away = shade_with_normal(light, away, false, false);
        assert!(
            facing > facing_away,
            "light at {light:?}: {facing} facing vs {facing_away} facing away"
        );
    }
}

#[test]
fn test_flipped_sprites_mirror_their_normals() {
    let right = Vec2::new(30.0, 0.0);
    let facing = shade_with_normal(right, [0.6, 0.0, 0.8], false, false);
    let mirrored = shade_with_normal(right, [-0.6, 0.0, 0.8], true, false);
    assert_relative_eq!(mirrored, facing, epsilon = 1e-5);
    assert!(shade_with_normal(right, [-0.6, 0.0, 0.8], false, false) < facing);

    let above = Vec2::new(0.0, -30.0);
    let facing = shade_with_normal(above, [0.0, -0.6, 0.8], false, false);
    let mirrored = shade_with_normal(above, [0.0, 0.6, 0.8], false, true);
    assert_relative_eq!(mirrored, facing, epsilon = 1e-5);
    assert!(shade_with_normal(above, [0.0, 0.6, 0.8], false, false) < facing);
}

#[test]
fn test_unlit_objects_ignore_lights() {
    let tint = [0.3, 0.6, 0.9, 1.0];
    let material = Arc::new(Material::default().lit(false).with_tint(tint));
    let point = Vec2::new(5.0, 5.0);

    let mut renderer = renderer_with(&config());
    renderer.submit_object(&floor(), &material, false, false, 0);
    renderer.render(&camera(), &no_textures(), None).unwrap();
    let dark = backbuffer_at(&renderer, point);

    renderer.submit_object(&floor(), &material, false, false, 0);
    renderer.submit_light(
        &Transform2D::from_position(Vec2::ZERO),
        &PointLight::new([1.0, 0.5, 0.0], 3.0, 80.0).with_shadows(true),
    );
    renderer.render(&camera(), &no_textures(), None).unwrap();
    let lit = backbuffer_at(&renderer, point);

    assert_eq!(dark, lit);
    for c in 0..4 {
        assert_relative_eq!(lit[c], tint[c], epsilon = 1e-5);
    }
}

#[test]
fn test_identical_frames_render_identically() {
    let mut renderer = renderer_with(&LightingConfig {
        soft_shadows: true,
        ..config()
    });
    render_shadowed_scene(&mut renderer);
    let first = renderer.backend().backbuffer().clone();
    let first_shadow = shadow_buffer(&renderer).clone();

    render_shadowed_scene(&mut renderer);
    assert_eq!(renderer.backend().backbuffer(), &first);
    assert_eq!(shadow_buffer(&renderer), &first_shadow);
}

#[test]
fn test_higher_layers_draw_on_top() {
    let mut renderer = renderer_with(&config());
    let red = Arc::new(Material::default().lit(false).with_tint([1.0, 0.0, 0.0, 1.0]));
    let blue = Arc::new(Material::default().lit(false).with_tint([0.0, 0.0, 1.0, 1.0]));
    let green = Arc::new(Material::default().lit(false).with_tint([0.0, 1.0, 0.0, 1.0]));
    let square = Arc::new(Geometry::quad(Vec2::ZERO, Vec2::new(32.0, 32.0)));
    let wide = Arc::new(Geometry::quad(Vec2::ZERO, Vec2::new(96.0, 32.0)));

    renderer.submit_object(&square, &red, false, false, 2);
    renderer.submit_object(&wide, &green, false, false, 0);
    renderer.submit_object(&square, &blue, false, false, 1);
    renderer.render(&camera(), &no_textures(), None).unwrap();

    assert_eq!(backbuffer_at(&renderer, Vec2::ZERO), [1.0, 0.0, 0.0, 1.0]);
    assert_eq!(backbuffer_at(&renderer, Vec2::new(40.0, 0.0)), [0.0, 1.0, 0.0, 1.0]);
    assert_eq!(renderer.last_frame_stats().composite_layers, vec![0, 1, 2]);
}

#[test]
fn test_same_layer_keeps_submission_order() {
    let mut renderer = renderer_with(&config());
    let red = Arc::new(Material::default().lit(false).with_tint([1.0, 0.0, 0.0, 1.0]));
    let blue = Arc::new(Material::default().lit(false).with_tint([0.0, 0.0, 1.0, 1.0]));
    let square = Arc::new(Geometry::quad(Vec2::ZERO, Vec2::new(32.0, 32.0)));

    renderer.submit_object(&square, &red, false, false, 0);
    renderer.submit_object(&square, &blue, false, false, 0);
    renderer.render(&camera(), &no_textures(), None).unwrap();

    assert_eq!(backbuffer_at(&renderer, Vec2::ZERO), [0.0, 0.0, 1.0, 1.0]);
}

#[test]
fn test_offscreen_target_leaves_backbuffer_untouched() {
    let mut renderer = renderer_with(&LightingConfig {
        clear_color: [0.0, 0.0, 0.0, 0.0],
        ..config()
    });
    let target = renderer.backend_mut().create_render_target(VIEWPORT.0, VIEWPORT.1);
    let white = Arc::new(Material::default().lit(false));

    renderer.submit_object(&floor(), &white, false, false, 0);
    renderer.render(&camera(), &no_textures(), Some(&target)).unwrap();

    let output = renderer.backend().render_target(target).unwrap();
    assert_eq!(output.pixel_at(&screen(), Vec2::ZERO), Some([1.0; 4]));
    assert!(renderer
        .backend()
        .backbuffer()
        .pixels()
        .iter()
        .all(|pixel| *pixel == [0.0; 4]));
}

#[test]
fn test_resizes_are_coalesced_until_next_frame() {
    let mut renderer = renderer_with(&config());
    renderer.set_light_map_scale(0.5).unwrap();
    renderer.set_shadow_map_scale(0.25).unwrap();
    renderer.on_viewport_resized(100, 50);
    renderer.on_viewport_resized(120, 60);
    renderer.set_shadow_map_size(64).unwrap();
    renderer.set_shadow_map_size(16).unwrap();

    // Nothing is rebuilt before the frame.
    assert_eq!(renderer.framebuffers().screen_resizes(), 0);
    assert_eq!(
        renderer.backend().target_size(LightingTarget::LightMap),
        Some(VIEWPORT)
    );

    renderer.render(&camera(), &no_textures(), None).unwrap();
    let framebuffers = renderer.framebuffers();
    assert_eq!(framebuffers.screen_resizes(), 1);
    assert_eq!(framebuffers.shadow_resizes(), 1);

    let backend = renderer.backend();
    assert_eq!(backend.target_size(LightingTarget::LightMap), Some((60, 30)));
    assert_eq!(backend.target_size(LightingTarget::ShadowMap), Some((30, 15)));
    assert_eq!(backend.target_size(LightingTarget::Occlusion), Some((16, 16)));
    assert_eq!(backend.target_size(LightingTarget::PolarDistance), Some((16, 1)));

    renderer.render(&camera(), &no_textures(), None).unwrap();
    assert_eq!(renderer.framebuffers().screen_resizes(), 1);
}

/// Software backend that can be told to ignore screen-buffer resizes.
struct StaleBuffersBackend {
    inner: SoftwareBackend,
    ignore_screen_resizes: bool,
    aborted_frames: usize,
}

impl LightingBackend for StaleBuffersBackend {
    type Target = <SoftwareBackend as LightingBackend>::Target;
    type Surface = Image;

    fn create_texture(
        &mut self,
        rgba: &[u8],
        width: u32,
        height: u32,
        kind: TextureKind,
    ) -> Result<TextureHandle> {
        self.inner.create_texture(rgba, width, height, kind)
    }

    fn default_texture(&self, kind: TextureKind) -> TextureHandle {
        self.inner.default_texture(kind)
    }

    fn texture_size(&self, handle: TextureHandle) -> Option<(u32, u32)> {
        self.inner.texture_size(handle)
    }

    fn release_texture(&mut self, handle: TextureHandle) {
        self.inner.release_texture(handle);
    }

    fn resize_shadow_targets(&mut self, size: u32) -> Result<()> {
        self.inner.resize_shadow_targets(size)
    }

    fn resize_screen_targets(
        &mut self,
        light_map: (u32, u32),
        shadow_map: (u32, u32),
    ) -> Result<()> {
        if self.ignore_screen_resizes {
            return Ok(());
        }
        self.inner.resize_screen_targets(light_map, shadow_map)
    }

    fn target_size(&self, target: LightingTarget) -> Option<(u32, u32)> {
        self.inner.target_size(target)
    }

    fn intermediate(&self, target: LightingTarget) -> Option<&Image> {
        self.inner.intermediate(target)
    }

    fn resize_output(&mut self, width: u32, height: u32) {
        self.inner.resize_output(width, height);
    }

    fn begin_frame(&mut self, target: Option<&Self::Target>) -> Result<()> {
        self.inner.begin_frame(target)
    }

    fn render_occlusion(&mut self, view: &LightView, batches: &[GeometryBatch]) -> Result<()> {
        self.inner.render_occlusion(view, batches)
    }

    fn render_polar_distances(&mut self) -> Result<()> {
        self.inner.render_polar_distances()
    }

    fn render_shadow(&mut self, screen: &ScreenView, shadow: &ShadowDraw) -> Result<()> {
        self.inner.render_shadow(screen, shadow)
    }

    fn render_light_map(&mut self, screen: &ScreenView, lights: &[LightDraw]) -> Result<()> {
        self.inner.render_light_map(screen, lights)
    }

    fn render_objects(
        &mut self,
        screen: &ScreenView,
        params: &CompositeParams,
        batches: &[GeometryBatch],
        target: Option<&Self::Target>,
    ) -> Result<()> {
        self.inner.render_objects(screen, params, batches, target)
    }

    fn end_frame(&mut self, target: Option<&Self::Target>) -> Result<()> {
        self.inner.end_frame(target)
    }

    fn abort_frame(&mut self) {
        self.aborted_frames += 1;
        self.inner.abort_frame();
    }
}

#[test]
fn test_failed_resize_aborts_frame_and_recovers() {
    let backend = StaleBuffersBackend {
        inner: SoftwareBackend::new(VIEWPORT.0, VIEWPORT.1),
        ignore_screen_resizes: false,
        aborted_frames: 0,
    };
    let mut renderer = SceneRenderer::new(backend, &config(), VIEWPORT).unwrap();
    renderer.backend_mut().ignore_screen_resizes = true;
    renderer.on_viewport_resized(40, 40);

    let material = Arc::new(Material::default());
    renderer.submit_object(&floor(), &material, false, false, 0);
    renderer.submit_light(&Transform2D::identity(), &PointLight::default());
    let err = renderer
        .render(&camera(), &no_textures(), None)
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<LightingError>(),
        Some(LightingError::FramebufferSizeMismatch { .. })
    ));
    assert_eq!(renderer.state(), FrameState::Idle);
    assert_eq!(renderer.pending(), (0, 0));
    assert_eq!(renderer.backend().aborted_frames, 1);

    // Once the backend honours resizes again the next frame succeeds.
    renderer.backend_mut().ignore_screen_resizes = false;
    renderer.submit_object(&floor(), &material, false, false, 0);
    renderer.render(&camera(), &no_textures(), None).unwrap();
    assert_eq!(
        renderer.backend().target_size(LightingTarget::LightMap),
        Some((40, 40))
    );
}
