use std::time::{Duration, Instant};

use anyhow::Result;
use log::{error, info};
use winit::{
    dpi::{LogicalSize, PhysicalSize},
    event::{ElementState, Event, KeyEvent, WindowEvent},
    event_loop::EventLoop,
    keyboard::{KeyCode, PhysicalKey},
    window::Window,
};

use crate::{
    assets::AssetManager,
    config::LightingConfig,
    math::Camera2D,
    render::{Renderer, SceneRenderer, TextureHandle, TextureKind, WgpuBackend},
};

/// Configuration values for the engine window and runtime behavior.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub lighting: LightingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            title: "Lumen2D".into(),
            width: 1280,
            height: 720,
            vsync: true,
            lighting: LightingConfig::default(),
        }
    }
}

/// Runs a window whose frames are drawn by the lighting pipeline.
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    /// Create a new engine instance with default configuration.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// Override the window title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.config.title = title.into();
        self
    }

    /// Override the initial window size in logical pixels.
    #[must_use]
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.config.width = width;
        self.config.height = height;
        self
    }

    /// Enable or disable vertical sync.
    #[must_use]
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.config.vsync = vsync;
        self
    }

    /// Initial lighting parameters. They can be changed later through the renderer.
    #[must_use]
    pub fn with_lighting(mut self, lighting: LightingConfig) -> Self {
        self.config.lighting = lighting;
        self
    }

    /// Run the provided game until the window is closed or the game requests exit.
    pub fn run<G: Game + 'static>(self, mut game: G) -> Result<()> {
        let config = self.config;
        config.lighting.validate()?;

        let event_loop = EventLoop::new()?;
        let mut window_attributes = Window::default_attributes();
        window_attributes.title = config.title.clone();
        window_attributes.inner_size = Some(LogicalSize::new(config.width, config.height).into());
        let window = event_loop.create_window(window_attributes)?;

        // The surface borrows the window for the rest of the program.
        let window: &'static Window = Box::leak(Box::new(window));

        let mut ctx = EngineContext::new(window, &config)?;
        game.init(&mut ctx)?;

        let mut last_frame = Instant::now();
        event_loop.run(move |event, elwt| match event {
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => {
                    elwt.exit();
                }
                WindowEvent::KeyboardInput { event, .. } => {
                    if is_escape_pressed(&event) {
                        elwt.exit();
                    }
                }
                WindowEvent::Resized(new_size) => {
                    ctx.resize_renderer(new_size);
                }
                WindowEvent::RedrawRequested => {
                    if let Err(err) = game.draw(&mut ctx) {
                        error!("Encountered error during draw: {err:?}");
                        elwt.exit();
                        return;
                    }

                    if ctx.exit_requested {
                        elwt.exit();
                    }
                }
                _ => {}
            },
            Event::AboutToWait => {
                let now = Instant::now();
                ctx.update_time(now - last_frame);
                last_frame = now;

                if let Err(err) = game.update(&mut ctx) {
                    error!("Encountered error during update: {err:?}");
                    elwt.exit();
                    return;
                }

                if ctx.exit_requested {
                    elwt.exit();
                    return;
                }

                ctx.window.request_redraw();
            }
            _ => {}
        })?;

        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn is_escape_pressed(event: &KeyEvent) -> bool {
    event.state == ElementState::Pressed
        && matches!(event.physical_key, PhysicalKey::Code(KeyCode::Escape))
}

/// Shared context provided to game code each frame.
pub struct EngineContext<'window> {
    window: &'window Window,
    delta_time: Duration,
    elapsed_time: Duration,
    exit_requested: bool,
    renderer: Renderer<'window>,
    assets: AssetManager,
}

impl<'window> EngineContext<'window> {
    fn new(window: &'window Window, config: &EngineConfig) -> Result<Self> {
        let backend = WgpuBackend::new(window, config.vsync)?;
        let size = window.inner_size();
        let renderer = SceneRenderer::new(backend, &config.lighting, (size.width, size.height))?;
        info!(
            "Lighting pipeline ready at {}x{} (shadow map {})",
            size.width, size.height, config.lighting.shadow_map_size
        );

        Ok(Self {
            window,
            delta_time: Duration::ZERO,
            elapsed_time: Duration::ZERO,
            exit_requested: false,
            renderer,
            assets: AssetManager::new(),
        })
    }

    fn update_time(&mut self, delta: Duration) {
        self.delta_time = delta;
        self.elapsed_time += delta;
    }

    fn resize_renderer(&mut self, new_size: PhysicalSize<u32>) {
        self.renderer
            .on_viewport_resized(new_size.width, new_size.height);
    }

    /// Duration between the current and previous frames.
    pub fn delta_time(&self) -> Duration {
        self.delta_time
    }

    /// Total time elapsed since the engine started running.
    pub fn elapsed_time(&self) -> Duration {
        self.elapsed_time
    }

    /// Access the underlying winit window.
    pub fn window(&self) -> &Window {
        self.window
    }

    /// Window size in physical pixels.
    pub fn window_size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    /// Request that the engine exit after the current frame.
    pub fn request_exit(&mut self) {
        self.exit_requested = true;
    }

    /// Access the renderer to submit lights and objects or tune lighting.
    pub fn renderer(&mut self) -> &mut Renderer<'window> {
        &mut self.renderer
    }

    /// Access the asset manager for loading and caching textures.
    pub fn assets(&mut self) -> &mut AssetManager {
        &mut self.assets
    }

    /// Load a texture using the asset manager (convenience method).
    ///
    /// Avoids borrowing the renderer and the asset manager separately.
    pub fn load_texture(&mut self, path: &str, kind: TextureKind) -> Result<TextureHandle> {
        self.assets
            .load_texture(self.renderer.backend_mut(), path, kind)
    }

    /// Load a texture from encoded bytes using the asset manager (convenience method).
    pub fn load_texture_from_bytes(
        &mut self,
        key: &str,
        bytes: &[u8],
        kind: TextureKind,
    ) -> Result<TextureHandle> {
        self.assets
            .load_texture_from_bytes(self.renderer.backend_mut(), key, bytes, kind)
    }

    /// Upload raw RGBA8 texels under `key`.
    pub fn load_texture_from_rgba(
        &mut self,
        key: &str,
        rgba: &[u8],
        width: u32,
        height: u32,
        kind: TextureKind,
    ) -> Result<TextureHandle> {
        self.assets.load_texture_from_rgba(
            self.renderer.backend_mut(),
            key,
            rgba,
            width,
            height,
            kind,
        )
    }

    /// Unload a texture and free it on the GPU. Materials still naming `key`
    /// fall back to the default texture, with a fresh warning.
    pub fn unload_texture(&mut self, key: &str) {
        self.assets.unload_texture(self.renderer.backend_mut(), key);
        self.renderer.clear_texture_warnings();
    }

    /// Render everything submitted since the last frame to the window.
    pub fn render(&mut self, camera: &Camera2D) -> Result<()> {
        self.renderer.render(camera, &self.assets, None)
    }
}

/// Trait implemented by user code to hook into the engine lifecycle.
pub trait Game {
    /// Called once after the window is created but before the first frame.
    fn init(&mut self, _ctx: &mut EngineContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Update game state. Called once per frame before drawing.
    fn update(&mut self, ctx: &mut EngineContext<'_>) -> Result<()>;

    /// Submit lights and objects, then call [`EngineContext::render`].
    fn draw(&mut self, ctx: &mut EngineContext<'_>) -> Result<()>;
}
