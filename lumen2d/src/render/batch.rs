//! Turns the per-frame object list into draw batches.
//!
//! Objects are merged while consecutive entries share a material (by
//! identity) and flip state; the composite pass also requires the same
//! layer. A key change starts a new batch.

use std::collections::HashSet;
use std::sync::Arc;

use log::warn;

use crate::assets::TextureProvider;
use crate::math::Rect;
use crate::render::backend::GeometryBatch;
use crate::render::material::{Geometry, Material};
use crate::render::renderable::ObjectRenderable;
use crate::render::sprite::{TextureHandle, TextureKind};

/// Upper bound on remembered missing paths; the set is reset when full.
pub(crate) const MAX_WARNED_TEXTURES: usize = 256;

/// Resolves material texture paths, substituting defaults for missing ones.
///
/// Each unresolved path is reported once while it stays in `warned`.
pub(crate) struct TextureResolver<'a> {
    provider: &'a dyn TextureProvider,
    default_color: TextureHandle,
    default_normal: TextureHandle,
    warned: &'a mut HashSet<String>,
}

impl<'a> TextureResolver<'a> {
    pub(crate) fn new(
        provider: &'a dyn TextureProvider,
        default_color: TextureHandle,
        default_normal: TextureHandle,
        warned: &'a mut HashSet<String>,
    ) -> Self {
        Self {
            provider,
            default_color,
            default_normal,
            warned,
        }
    }

    pub(crate) fn resolve(&mut self, path: Option<&str>, kind: TextureKind) -> TextureHandle {
        let fallback = match kind {
            TextureKind::Color => self.default_color,
            TextureKind::Normal => self.default_normal,
        };
        let Some(path) = path else {
            return fallback;
        };
        match self.provider.resolve(path) {
            Some(handle) => handle,
            None => {
                if self.warned.len() >= MAX_WARNED_TEXTURES && !self.warned.contains(path) {
                    self.warned.clear();
                }
                if self.warned.insert(path.to_string()) {
                    warn!("Texture '{}' not found, using default {:?} texture", path, kind);
                }
                fallback
            }
        }
    }
}

/// Batches for the composite pass plus the number of objects left out.
#[derive(Debug, Default)]
pub(crate) struct CompositeBatches {
    pub batches: Vec<GeometryBatch>,
    pub culled: usize,
}

/// Shadow casters overlapping `view`, in submission order.
pub(crate) fn occlusion_batches(
    objects: &[ObjectRenderable],
    view: &Rect,
    textures: &mut TextureResolver<'_>,
) -> Vec<GeometryBatch> {
    let mut batches = Vec::new();
    for object in objects {
        let Some((geometry, material)) = drawable(object) else {
            continue;
        };
        if !material.casts_shadows || !object.bounds.intersects(view) {
            continue;
        }
        append(&mut batches, object, geometry, material, textures, false);
    }
    batches
}

/// Visible objects grouped by ascending layer; submission order is kept
/// within a layer.
pub(crate) fn composite_batches(
    objects: &[ObjectRenderable],
    visible: &Rect,
    textures: &mut TextureResolver<'_>,
) -> CompositeBatches {
    let mut culled = 0;
    let mut ordered: Vec<&ObjectRenderable> = Vec::with_capacity(objects.len());
    for object in objects {
        if drawable(object).is_some() && object.bounds.intersects(visible) {
            ordered.push(object);
        } else {
            culled += 1;
        }
    }
    // Stable sort.
    ordered.sort_by_key(|object| object.layer);

    let mut batches = Vec::new();
    for object in ordered {
        if let Some((geometry, material)) = drawable(object) {
            append(&mut batches, object, geometry, material, textures, true);
        }
    }
    CompositeBatches { batches, culled }
}

fn drawable(object: &ObjectRenderable) -> Option<(&Geometry, &Arc<Material>)> {
    let geometry = object.geometry.as_deref()?;
    let material = object.material.as_ref()?;
    let vertex_count = geometry.vertices.len();
    let well_formed = !geometry.is_empty()
        && geometry.indices.len() % 3 == 0
        && geometry.indices.iter().all(|&i| (i as usize) < vertex_count);
    well_formed.then_some((geometry, material))
}

fn append(
    batches: &mut Vec<GeometryBatch>,
    object: &ObjectRenderable,
    geometry: &Geometry,
    material: &Arc<Material>,
    textures: &mut TextureResolver<'_>,
    match_layer: bool,
) {
    let continues = batches.last().is_some_and(|batch| {
        Arc::ptr_eq(&batch.material, material)
            && batch.flip_x == object.flip_x
            && batch.flip_y == object.flip_y
            && (!match_layer || batch.layer == object.layer)
    });

    if !continues {
        batches.push(GeometryBatch {
            layer: object.layer,
            material: Arc::clone(material),
            color_texture: textures.resolve(material.color_texture.as_deref(), TextureKind::Color),
            normal_texture: textures
                .resolve(material.normal_texture.as_deref(), TextureKind::Normal),
            flip_x: object.flip_x,
            flip_y: object.flip_y,
            vertices: Vec::new(),
            indices: Vec::new(),
        });
    }

    if let Some(batch) = batches.last_mut() {
        let base = batch.vertices.len() as u32;
        batch.vertices.extend_from_slice(&geometry.vertices);
        batch
            .indices
            .extend(geometry.indices.iter().map(|index| index + base));
    }
}
