use glam::{Mat4, Vec3};

/// 2D vector type used throughout Lumen2D.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };
    pub const ONE: Self = Self { x: 1.0, y: 1.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Returns the squared length of the vector (faster than `length()`).
    pub fn length_squared(&self) -> f32 {
        self.x * self.x + self.y * self.y
    }

    pub fn normalized(&self) -> Self {
        let len = self.length();
        if len == 0.0 {
            Self::ZERO
        } else {
            Self::new(self.x / len, self.y / len)
        }
    }

    /// Computes the dot product of two vectors.
    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y
    }

    /// Computes the distance between two points.
    pub fn distance(self, rhs: Self) -> f32 {
        (self - rhs).length()
    }

    /// Returns a vector with component-wise minimum values.
    pub fn min(self, rhs: Self) -> Self {
        Self::new(self.x.min(rhs.x), self.y.min(rhs.y))
    }

    /// Returns a vector with component-wise maximum values.
    pub fn max(self, rhs: Self) -> Self {
        Self::new(self.x.max(rhs.x), self.y.max(rhs.y))
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(f32, f32)> for Vec2 {
    fn from(value: (f32, f32)) -> Self {
        Self {
            x: value.0,
            y: value.1,
        }
    }
}

impl From<[f32; 2]> for Vec2 {
    fn from(value: [f32; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

impl std::ops::Add for Vec2 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::AddAssign for Vec2 {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl std::ops::Mul<f32> for Vec2 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self::Output {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

impl std::ops::Div<f32> for Vec2 {
    type Output = Self;

    fn div(self, rhs: f32) -> Self::Output {
        Self::new(self.x / rhs, self.y / rhs)
    }
}

impl std::ops::Neg for Vec2 {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self::new(-self.x, -self.y)
    }
}

/// Axis-aligned rectangle in world space.
///
/// A rectangle whose `max` is not strictly greater than `min` on both axes has
/// no area and never intersects anything; [`Rect::EMPTY`] is the canonical
/// such value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rect {
    pub min: Vec2,
    pub max: Vec2,
}

impl Rect {
    pub const EMPTY: Self = Self {
        min: Vec2 {
            x: f32::INFINITY,
            y: f32::INFINITY,
        },
        max: Vec2 {
            x: f32::NEG_INFINITY,
            y: f32::NEG_INFINITY,
        },
    };

    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    /// Square or rectangle of the given size centered on `center`.
    pub fn from_center_size(center: Vec2, size: Vec2) -> Self {
        let half = size * 0.5;
        Self::new(center - half, center + half)
    }

    /// Smallest rectangle enclosing every point. Empty input yields [`Rect::EMPTY`].
    pub fn from_points<I>(points: I) -> Self
    where
        I: IntoIterator<Item = Vec2>,
    {
        points.into_iter().fold(Self::EMPTY, |rect, p| Self {
            min: rect.min.min(p),
            max: rect.max.max(p),
        })
    }

    pub fn width(&self) -> f32 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f32 {
        self.max.y - self.min.y
    }

    pub fn center(&self) -> Vec2 {
        (self.min + self.max) * 0.5
    }

    pub fn has_area(&self) -> bool {
        self.width() > 0.0 && self.height() > 0.0
    }

    pub fn contains(&self, point: Vec2) -> bool {
        point.x >= self.min.x && point.x <= self.max.x && point.y >= self.min.y && point.y <= self.max.y
    }

    /// Overlap test used for culling. Degenerate rectangles never intersect.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.has_area()
            && other.has_area()
            && self.min.x < other.max.x
            && other.min.x < self.max.x
            && self.min.y < other.max.y
            && other.min.y < self.max.y
    }
}

/// Transform describing 2D position, scale, and rotation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform2D {
    pub position: Vec2,
    pub scale: Vec2,
    /// Rotation in radians around the Z axis.
    pub rotation: f32,
}

impl Transform2D {
    pub fn new(position: Vec2, scale: Vec2, rotation: f32) -> Self {
        Self {
            position,
            scale,
            rotation,
        }
    }

    pub fn from_position(position: Vec2) -> Self {
        Self {
            position,
            ..Self::identity()
        }
    }

    pub fn identity() -> Self {
        Self {
            position: Vec2::ZERO,
            scale: Vec2::ONE,
            rotation: 0.0,
        }
    }

    pub fn to_matrix(&self, base_size: Vec2) -> Mat4 {
        let translation = Mat4::from_translation(Vec3::new(self.position.x, self.position.y, 0.0));
        let rotation = Mat4::from_rotation_z(self.rotation);
        let scale = Mat4::from_scale(Vec3::new(
            self.scale.x * base_size.x,
            self.scale.y * base_size.y,
            1.0,
        ));

        translation * rotation * scale
    }
}

impl Default for Transform2D {
    fn default() -> Self {
        Self::identity()
    }
}

/// Camera representing a simple 2D view.
///
/// `position` is the world coordinate shown at the top-left corner of the
/// viewport; world +y points down the screen.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera2D {
    pub position: Vec2,
    pub zoom: f32,
}

impl Camera2D {
    pub fn new(position: Vec2) -> Self {
        Self {
            position,
            zoom: 1.0,
        }
    }

    /// Camera whose viewport of `width`x`height` pixels is centered on `center`.
    pub fn centered_on(center: Vec2, width: u32, height: u32) -> Self {
        Self::new(center - Vec2::new(width as f32, height as f32) * 0.5)
    }

    pub fn view_projection(&self, width: u32, height: u32) -> Mat4 {
        let projection = Mat4::orthographic_rh_gl(0.0, width as f32, height as f32, 0.0, -1.0, 1.0);

        let zoom = Mat4::from_scale(Vec3::new(self.zoom, self.zoom, 1.0));
        let translation =
            Mat4::from_translation(Vec3::new(-self.position.x, -self.position.y, 0.0));

        projection * zoom * translation
    }

    /// World-space rectangle covered by a viewport of the given size.
    pub fn visible_rect(&self, width: u32, height: u32) -> Rect {
        let size = Vec2::new(width as f32, height as f32) / self.zoom;
        Rect::new(self.position, self.position + size)
    }

    /// Converts screen coordinates to world coordinates using this camera.
    pub fn screen_to_world(&self, screen_pos: Vec2) -> Vec2 {
        screen_pos / self.zoom + self.position
    }

    /// Converts world coordinates to screen coordinates using this camera.
    pub fn world_to_screen(&self, world_pos: Vec2) -> Vec2 {
        (world_pos - self.position) * self.zoom
    }
}

impl Default for Camera2D {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            zoom: 1.0,
        }
    }
}
