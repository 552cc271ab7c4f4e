use bytemuck::{Pod, Zeroable};

use crate::math::{Rect, Transform2D, Vec2};

/// Surface description shared by every object drawn with it.
///
/// Texture fields are paths resolved through a
/// [`TextureProvider`](crate::assets::TextureProvider) at render time; an
/// absent or unresolved path falls back to a 1x1 default texture.
#[derive(Clone, Debug, PartialEq)]
pub struct Material {
    pub color_texture: Option<String>,
    pub normal_texture: Option<String>,
    /// Multiplicative tint applied to the sampled texture color.
    pub tint: [f32; 4],
    /// Lit objects sample the light and shadow buffers; unlit ones draw texture x tint.
    pub is_lit: bool,
    pub casts_shadows: bool,
    pub receives_shadows: bool,
}

impl Material {
    pub fn new(color_texture: impl Into<String>) -> Self {
        Self {
            color_texture: Some(color_texture.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_normal_texture(mut self, path: impl Into<String>) -> Self {
        self.normal_texture = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_tint(mut self, tint: [f32; 4]) -> Self {
        self.tint = tint;
        self
    }

    #[must_use]
    pub fn lit(mut self, is_lit: bool) -> Self {
        self.is_lit = is_lit;
        self
    }

    #[must_use]
    pub fn casting_shadows(mut self, casts: bool) -> Self {
        self.casts_shadows = casts;
        self
    }

    #[must_use]
    pub fn receiving_shadows(mut self, receives: bool) -> Self {
        self.receives_shadows = receives;
        self
    }
}

impl Default for Material {
    fn default() -> Self {
        Self {
            color_texture: None,
            normal_texture: None,
            tint: [1.0, 1.0, 1.0, 1.0],
            is_lit: true,
            casts_shadows: false,
            receives_shadows: true,
        }
    }
}

/// World-space vertex shared by the occlusion and composite passes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct BatchVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
}

/// Indexed triangle list in world space.
///
/// Geometry is owned by the submitting component and shared with the
/// pipeline through an `Arc`, so it is never copied on submission.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Geometry {
    pub vertices: Vec<BatchVertex>,
    pub indices: Vec<u32>,
}

impl Geometry {
    pub fn new(vertices: Vec<BatchVertex>, indices: Vec<u32>) -> Self {
        Self { vertices, indices }
    }

    /// Axis-aligned quad with uv (0,0) at the top-left (minimum) corner.
    pub fn quad(center: Vec2, size: Vec2) -> Self {
        let rect = Rect::from_center_size(center, size);
        let corners = [
            ([rect.min.x, rect.min.y], [0.0, 0.0]),
            ([rect.max.x, rect.min.y], [1.0, 0.0]),
            ([rect.max.x, rect.max.y], [1.0, 1.0]),
            ([rect.min.x, rect.max.y], [0.0, 1.0]),
        ];
        Self::from_corners(corners)
    }

    /// Quad of `base_size` placed by a transform (rotation and scale included).
    pub fn from_transform(transform: &Transform2D, base_size: Vec2) -> Self {
        let matrix = transform.to_matrix(base_size);
        let corner = |x: f32, y: f32| {
            let p = matrix.transform_point3(glam::Vec3::new(x, y, 0.0));
            [p.x, p.y]
        };
        Self::from_corners([
            (corner(-0.5, -0.5), [0.0, 0.0]),
            (corner(0.5, -0.5), [1.0, 0.0]),
            (corner(0.5, 0.5), [1.0, 1.0]),
            (corner(-0.5, 0.5), [0.0, 1.0]),
        ])
    }

    fn from_corners(corners: [([f32; 2], [f32; 2]); 4]) -> Self {
        Self {
            vertices: corners
                .iter()
                .map(|&(position, uv)| BatchVertex { position, uv })
                .collect(),
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    /// Bounds of every vertex. Empty geometry yields [`Rect::EMPTY`].
    pub fn bounds(&self) -> Rect {
        Rect::from_points(self.vertices.iter().map(|v| Vec2::from(v.position)))
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.len() < 3
    }
}
