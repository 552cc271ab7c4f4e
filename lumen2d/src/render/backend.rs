//! The graphics-device service the lighting pipeline is written against.
//!
//! A backend owns the four intermediate targets and the textures; the
//! [`SceneRenderer`](crate::render::SceneRenderer) decides what to draw and in
//! which order, and hands the backend one pass at a time.

use std::sync::Arc;

use anyhow::Result;
use glam::Mat4;

use crate::math::{Camera2D, Rect, Vec2};
use crate::render::material::{BatchVertex, Material};
use crate::render::sprite::{TextureHandle, TextureKind};

/// The four intermediate render targets of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LightingTarget {
    /// Light-local, `shadow_map_size` squared, single channel.
    Occlusion,
    /// `shadow_map_size` x 1, one texel per angular slice.
    PolarDistance,
    /// Screen-space additive light color (rgb) and brightness (a).
    LightMap,
    /// Screen-space shadow factor.
    ShadowMap,
}

impl LightingTarget {
    pub const ALL: [Self; 4] = [
        Self::Occlusion,
        Self::PolarDistance,
        Self::LightMap,
        Self::ShadowMap,
    ];
}

/// Square world-space window seen by a light during the occlusion pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LightView {
    pub center: Vec2,
    /// Side length in world units.
    pub extent: f32,
}

impl LightView {
    pub fn rect(&self) -> Rect {
        Rect::from_center_size(self.center, Vec2::new(self.extent, self.extent))
    }

    /// Maps the view rectangle onto the whole occlusion buffer, minimum
    /// corner at uv (0, 0).
    pub fn view_projection(&self) -> Mat4 {
        let rect = self.rect();
        Mat4::orthographic_rh_gl(rect.min.x, rect.max.x, rect.max.y, rect.min.y, -1.0, 1.0)
    }
}

/// Camera and viewport used by the screen-space passes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScreenView {
    pub camera: Camera2D,
    /// Viewport in pixels. Screen buffers may be smaller or larger; they
    /// cover the same world rectangle.
    pub viewport: (u32, u32),
}

impl ScreenView {
    pub fn view_projection(&self) -> Mat4 {
        self.camera.view_projection(self.viewport.0, self.viewport.1)
    }

    /// World position to pixel coordinates of a buffer covering the viewport.
    pub fn to_buffer_pixels(&self, world: Vec2, buffer: (u32, u32)) -> Vec2 {
        let screen = self.camera.world_to_screen(world);
        Vec2::new(
            screen.x * buffer.0 as f32 / self.viewport.0 as f32,
            screen.y * buffer.1 as f32 / self.viewport.1 as f32,
        )
    }
}

/// One light's screen-space shadow quad.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShadowDraw {
    pub center: Vec2,
    /// Side of the light view the polar buffer was built from.
    pub extent: f32,
    pub range: f32,
    /// 0.0 for hard shadows, 1.0 for the fully blurred kernel.
    pub softness: f32,
    /// Number of angular slices in the polar buffer.
    pub resolution: u32,
}

impl ShadowDraw {
    pub fn rect(&self) -> Rect {
        Rect::from_center_size(self.center, Vec2::new(self.extent, self.extent))
    }

    pub fn half_extent_over_range(&self) -> f32 {
        self.extent * 0.5 / self.range
    }
}

/// One light's additive quad in the light-accumulation pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LightDraw {
    pub center: Vec2,
    pub range: f32,
    pub color: [f32; 3],
    pub intensity: f32,
}

impl LightDraw {
    pub fn rect(&self) -> Rect {
        let side = self.range * 2.0;
        Rect::from_center_size(self.center, Vec2::new(side, side))
    }

    pub fn radiance(&self) -> [f32; 3] {
        self.color.map(|c| c * self.intensity)
    }
}

/// Frame-wide inputs of the compositing pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompositeParams {
    /// Ambient color already multiplied by its intensity.
    pub ambient: [f32; 3],
    /// Distance, in light-buffer texels, of the direction-estimation ring.
    pub direction_sample_distance: f32,
    pub clear_color: [f32; 4],
}

/// Consecutive objects merged into one vertex/index buffer and one draw call.
///
/// Indices are already offset into the merged vertex list.
#[derive(Clone, Debug)]
pub struct GeometryBatch {
    pub layer: i32,
    pub material: Arc<Material>,
    pub color_texture: TextureHandle,
    pub normal_texture: TextureHandle,
    pub flip_x: bool,
    pub flip_y: bool,
    pub vertices: Vec<BatchVertex>,
    pub indices: Vec<u32>,
}

impl GeometryBatch {
    /// Sample uv with the batch's flip state applied.
    pub fn flipped_uv(&self, uv: [f32; 2]) -> [f32; 2] {
        [
            if self.flip_x { 1.0 - uv[0] } else { uv[0] },
            if self.flip_y { 1.0 - uv[1] } else { uv[1] },
        ]
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Pass-granular rendering service.
///
/// The renderer calls these in frame order; a backend may assume that the
/// occlusion, polar-distance and shadow passes of one light run back to back.
/// A pass issued outside `begin_frame`/`end_frame` fails with
/// [`LightingError::NoActiveFrame`](crate::error::LightingError::NoActiveFrame).
pub trait LightingBackend {
    /// An output the composite pass can draw into instead of the default one.
    type Target;
    /// Read-only view of an intermediate buffer.
    type Surface;

    fn create_texture(
        &mut self,
        rgba: &[u8],
        width: u32,
        height: u32,
        kind: TextureKind,
    ) -> Result<TextureHandle>;

    /// 1x1 white for [`TextureKind::Color`], flat +z for [`TextureKind::Normal`].
    fn default_texture(&self, kind: TextureKind) -> TextureHandle;

    fn texture_size(&self, handle: TextureHandle) -> Option<(u32, u32)>;

    /// Free a texture. Default textures and unknown handles are ignored.
    fn release_texture(&mut self, handle: TextureHandle);

    /// (Re)create the occlusion and polar-distance buffers.
    fn resize_shadow_targets(&mut self, size: u32) -> Result<()>;

    /// (Re)create the light and shadow buffers.
    fn resize_screen_targets(&mut self, light_map: (u32, u32), shadow_map: (u32, u32))
        -> Result<()>;

    /// Current size of an intermediate target, `None` if it does not exist.
    fn target_size(&self, target: LightingTarget) -> Option<(u32, u32)>;

    fn intermediate(&self, target: LightingTarget) -> Option<&Self::Surface>;

    /// The default output changed size.
    fn resize_output(&mut self, _width: u32, _height: u32) {}

    /// Start a frame: acquire the output and clear the light and shadow buffers.
    fn begin_frame(&mut self, target: Option<&Self::Target>) -> Result<()>;

    /// Clear the occlusion buffer and draw every batch's coverage into it.
    fn render_occlusion(&mut self, view: &LightView, batches: &[GeometryBatch]) -> Result<()>;

    /// Rebuild the polar-distance buffer from the occlusion buffer.
    fn render_polar_distances(&mut self) -> Result<()>;

    /// Add one light's shadow factor into the shadow buffer.
    fn render_shadow(&mut self, screen: &ScreenView, shadow: &ShadowDraw) -> Result<()>;

    fn render_light_map(&mut self, screen: &ScreenView, lights: &[LightDraw]) -> Result<()>;

    /// Clear the output and composite every batch over it, in order.
    fn render_objects(
        &mut self,
        screen: &ScreenView,
        params: &CompositeParams,
        batches: &[GeometryBatch],
        target: Option<&Self::Target>,
    ) -> Result<()>;

    /// Submit recorded work and present the default output if it was used.
    fn end_frame(&mut self, target: Option<&Self::Target>) -> Result<()>;

    /// Drop whatever the current frame recorded without submitting it.
    fn abort_frame(&mut self);
}
