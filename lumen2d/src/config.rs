use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::LightingError;

/// Runtime-tunable lighting parameters.
///
/// Every field can also be changed individually through the
/// [`SceneRenderer`](crate::render::SceneRenderer) setters; size and scale
/// changes take effect lazily at the start of the next frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightingConfig {
    /// Texel resolution of the light-local occlusion buffer (square) and the
    /// number of angular slices in the polar distance buffer.
    pub shadow_map_size: u32,
    /// World units covered per shadow texel. The light-local view spans
    /// `shadow_map_size * shadow_upscale` world units.
    pub shadow_upscale: f32,
    pub soft_shadows: bool,
    pub ambient_color: [f32; 3],
    pub ambient_intensity: f32,
    /// Light buffer resolution relative to the viewport.
    pub light_map_scale: f32,
    /// Shadow buffer resolution relative to the viewport.
    pub shadow_map_scale: f32,
    /// Distance, in light-buffer texels, of the ring used to estimate light direction.
    pub direction_sample_distance: f32,
    /// Color the output target is cleared to before objects are composited.
    pub clear_color: [f32; 4],
}

impl Default for LightingConfig {
    fn default() -> Self {
        Self {
            shadow_map_size: 512,
            shadow_upscale: 1.0,
            soft_shadows: true,
            ambient_color: [1.0, 1.0, 1.0],
            ambient_intensity: 0.25,
            light_map_scale: 1.0,
            shadow_map_scale: 1.0,
            direction_sample_distance: 24.0,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl LightingConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Ambient term as it enters the shading equation.
    pub fn ambient(&self) -> [f32; 3] {
        self.ambient_color.map(|c| c * self.ambient_intensity)
    }

    pub fn validate(&self) -> Result<(), LightingError> {
        validate_shadow_size(self.shadow_map_size)?;
        validate_positive("shadow_upscale", self.shadow_upscale)?;
        validate_positive("light_map_scale", self.light_map_scale)?;
        validate_positive("shadow_map_scale", self.shadow_map_scale)?;
        validate_non_negative("ambient_intensity", self.ambient_intensity)?;
        validate_non_negative("direction_sample_distance", self.direction_sample_distance)?;
        validate_color("ambient_color", &self.ambient_color)?;
        validate_color("clear_color", &self.clear_color)?;
        Ok(())
    }
}

pub(crate) fn validate_shadow_size(size: u32) -> Result<(), LightingError> {
    if size == 0 {
        return Err(LightingError::InvalidConfig(
            "shadow_map_size must be at least 1".into(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_positive(name: &str, value: f32) -> Result<(), LightingError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(LightingError::InvalidConfig(format!(
            "{name} must be positive and finite, got {value}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_non_negative(name: &str, value: f32) -> Result<(), LightingError> {
    if !value.is_finite() || value < 0.0 {
        return Err(LightingError::InvalidConfig(format!(
            "{name} must be non-negative and finite, got {value}"
        )));
    }
    Ok(())
}

/// Every channel must be finite; values above 1.0 are allowed (HDR).
pub(crate) fn validate_color(name: &str, color: &[f32]) -> Result<(), LightingError> {
    if color.iter().any(|c| !c.is_finite()) {
        return Err(LightingError::InvalidConfig(format!(
            "{name} must be finite, got {color:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LightingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.direction_sample_distance, 24.0);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config =
            LightingConfig::from_json_str(r#"{ "shadow_map_size": 256, "soft_shadows": false }"#)
                .unwrap();
        assert_eq!(config.shadow_map_size, 256);
        assert!(!config.soft_shadows);
        assert_eq!(config.light_map_scale, 1.0);
    }

    #[test]
    fn test_json_rejects_invalid_values() {
        let err = LightingConfig::from_json_str(r#"{ "light_map_scale": 0.0 }"#).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LightingError>(),
            Some(LightingError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_non_finite_colors_are_rejected() {
        let config = LightingConfig {
            ambient_color: [0.2, f32::NAN, 0.4],
            ..LightingConfig::default()
        };
        assert!(config.validate().is_err());

        let config = LightingConfig {
            clear_color: [0.0, 0.0, f32::INFINITY, 1.0],
            ..LightingConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LightingError::InvalidConfig(msg)) if msg.contains("clear_color")
        ));
    }

    #[test]
    fn test_json_survives_save_and_load() {
        let config = LightingConfig {
            ambient_color: [0.2, 0.3, 0.4],
            shadow_upscale: 2.0,
            ..LightingConfig::default()
        };
        let json = config.to_json_string().unwrap();
        assert_eq!(LightingConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_ambient_is_scaled_by_intensity() {
        let config = LightingConfig {
            ambient_color: [1.0, 0.5, 0.0],
            ambient_intensity: 0.5,
            ..LightingConfig::default()
        };
        assert_eq!(config.ambient(), [0.5, 0.25, 0.0]);
    }
}
