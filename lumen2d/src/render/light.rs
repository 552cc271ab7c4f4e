/// A point light that emits light in all directions.
///
/// The light's position comes from the transform it is submitted with, so the
/// same component can be shared by several entities.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointLight {
    /// Color of the light (RGB, values typically 0.0-1.0, can exceed 1.0 for HDR)
    pub color: [f32; 3],
    /// Intensity/brightness of the light (0.0 = off, 1.0 = normal, >1.0 = brighter)
    pub intensity: f32,
    /// World-space radius beyond which the light contributes nothing
    pub range: f32,
    /// Whether objects can block this light. Materials that receive shadows
    /// take direct light only where a shadow-casting light reaches them, so a
    /// light without shadows only lights materials with `receives_shadows` off.
    pub casts_shadows: bool,
}

impl PointLight {
    /// Create a new point light. Shadows are off by default.
    pub fn new(color: [f32; 3], intensity: f32, range: f32) -> Self {
        Self {
            color,
            intensity,
            range,
            casts_shadows: false,
        }
    }

    /// Enable or disable shadow casting.
    ///
    /// A light without shadows adds nothing to shadow-receiving materials;
    /// see [`PointLight::casts_shadows`].
    #[must_use]
    pub fn with_shadows(mut self, casts_shadows: bool) -> Self {
        self.casts_shadows = casts_shadows;
        self
    }

    /// Range must be positive and intensity non-negative.
    pub fn is_well_formed(&self) -> bool {
        self.range.is_finite()
            && self.range > 0.0
            && self.intensity.is_finite()
            && self.intensity >= 0.0
            && self.color.iter().all(|c| c.is_finite())
    }
}

impl Default for PointLight {
    fn default() -> Self {
        Self {
            color: [1.0, 1.0, 1.0],
            intensity: 1.0,
            range: 100.0,
            casts_shadows: false,
        }
    }
}
