mod backend;
mod batch;
mod frame;
mod framebuffers;
mod light;
mod material;
mod renderable;
mod scene_renderer;
pub mod shading;
mod software;
mod sprite;
mod wgpu_backend;

pub use backend::{
    CompositeParams, GeometryBatch, LightDraw, LightView, LightingBackend, LightingTarget,
    ScreenView, ShadowDraw,
};
pub use frame::FrameState;
pub use framebuffers::FramebufferSet;
pub use light::PointLight;
pub use material::{BatchVertex, Geometry, Material};
pub use renderable::{
    LightRenderable, ObjectRenderable, PoolStats, Recyclable, RenderablePool,
};
pub use scene_renderer::{FrameStats, SceneRenderer};
pub use software::{AddressMode, Image, RenderTargetId, SoftwareBackend};
pub use sprite::{TextureHandle, TextureKind, DEFAULT_COLOR_TEXEL, DEFAULT_NORMAL_TEXEL};
pub use wgpu_backend::{OffscreenTarget, RenderTexture, WgpuBackend};

/// The lighting pipeline on the windowed wgpu backend.
pub type Renderer<'window> = SceneRenderer<WgpuBackend<'window>>;
