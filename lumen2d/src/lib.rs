//! Lumen2D - per-pixel 2D lighting with soft shadows.
//!
//! Submit point lights and textured geometry to a [`SceneRenderer`] each
//! frame; it renders per-light shadow maps, accumulates a light buffer and
//! composites normal-mapped objects on top. The pipeline runs on wgpu
//! ([`WgpuBackend`]) or on the CPU ([`SoftwareBackend`]) for headless use.

pub mod assets;
pub mod config;
pub mod engine;
pub mod error;
pub mod math;
pub mod render;

pub use crate::assets::{AssetManager, TextureProvider};
pub use crate::config::LightingConfig;
pub use crate::engine::{Engine, EngineConfig, EngineContext, Game};
pub use crate::error::LightingError;
pub use crate::math::{Camera2D, Rect, Transform2D, Vec2};
pub use crate::render::{
    FrameState, FrameStats, Geometry, LightingBackend, LightingTarget, Material, PointLight,
    Renderer, SceneRenderer, SoftwareBackend, TextureHandle, TextureKind, WgpuBackend,
};
