//! Per-frame light and object records and the free-list pool that recycles them.

use std::sync::Arc;

use crate::math::{Rect, Transform2D, Vec2};
use crate::render::light::PointLight;
use crate::render::material::{Geometry, Material};

/// Records that can be returned to a [`RenderablePool`].
pub trait Recyclable: Default {
    /// Drop every reference held by the record so pooled instances do not
    /// keep geometry or materials alive.
    fn reset(&mut self);
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LightRenderable {
    pub position: Vec2,
    pub color: [f32; 3],
    pub intensity: f32,
    pub range: f32,
    pub casts_shadows: bool,
}

impl LightRenderable {
    pub(crate) fn fill(&mut self, transform: &Transform2D, light: &PointLight) {
        self.position = transform.position;
        self.color = light.color;
        self.intensity = light.intensity;
        self.range = light.range;
        self.casts_shadows = light.casts_shadows;
    }
}

impl Recyclable for LightRenderable {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Clone, Debug)]
pub struct ObjectRenderable {
    pub geometry: Option<Arc<Geometry>>,
    pub material: Option<Arc<Material>>,
    pub flip_x: bool,
    pub flip_y: bool,
    pub layer: i32,
    pub bounds: Rect,
}

impl ObjectRenderable {
    pub(crate) fn fill(
        &mut self,
        geometry: &Arc<Geometry>,
        material: &Arc<Material>,
        flip_x: bool,
        flip_y: bool,
        layer: i32,
    ) {
        // Geometry may be animated, so bounds are rescanned every submission.
        self.bounds = geometry.bounds();
        self.geometry = Some(Arc::clone(geometry));
        self.material = Some(Arc::clone(material));
        self.flip_x = flip_x;
        self.flip_y = flip_y;
        self.layer = layer;
    }
}

impl Default for ObjectRenderable {
    fn default() -> Self {
        Self {
            geometry: None,
            material: None,
            flip_x: false,
            flip_y: false,
            layer: 0,
            bounds: Rect::EMPTY,
        }
    }
}

impl Recyclable for ObjectRenderable {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Allocation counters for a pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Records ever created by the pool.
    pub allocated: usize,
    /// Records currently waiting in the free list.
    pub available: usize,
}

/// Explicit free list of records. Not thread-safe; owned by the renderer.
#[derive(Debug)]
pub struct RenderablePool<T: Recyclable> {
    free: Vec<T>,
    allocated: usize,
}

impl<T: Recyclable> RenderablePool<T> {
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            allocated: 0,
        }
    }

    /// Take a recycled record, or create one when the free list is empty.
    pub fn acquire(&mut self) -> T {
        match self.free.pop() {
            Some(record) => record,
            None => {
                self.allocated += 1;
                T::default()
            }
        }
    }

    pub fn release(&mut self, mut record: T) {
        record.reset();
        self.free.push(record);
    }

    /// Return every record of a per-frame list, leaving it empty.
    pub fn release_all(&mut self, list: &mut Vec<T>) {
        for record in list.drain(..) {
            self.release(record);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated,
            available: self.free.len(),
        }
    }
}

impl<T: Recyclable> Default for RenderablePool<T> {
    fn default() -> Self {
        Self::new()
    }
}
