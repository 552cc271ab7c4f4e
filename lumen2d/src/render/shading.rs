//! Numeric core of every lighting pass.
//!
//! The software backend evaluates these functions directly and the WGSL
//! programs in `shaders/` mirror them statement for statement, so the two
//! backends agree on constants, coordinate conventions and blend math.
//!
//! Conventions:
//! * Light-local uv has its origin at the light view's minimum corner, with
//!   `v` increasing along world +y.
//! * Polar texel coordinate `s` in `[0, 1)` covers angle `s * TAU - PI`, so
//!   `s = 0.5` looks along world +x and `s = 0.75` along world +y.
//! * Radii are normalized to the light view's half extent.

use std::f32::consts::{PI, TAU};

use crate::math::Vec2;

/// Occlusion above this value counts as a shadow caster.
pub const OCCLUSION_THRESHOLD: f32 = 0.75;

/// 9-tap kernel applied along the polar axis, centered on index 4.
pub const BLUR_WEIGHTS: [f32; 9] = [0.05, 0.09, 0.12, 0.15, 0.16, 0.15, 0.12, 0.09, 0.05];

/// Offsets sampled around a pixel to estimate where the light comes from,
/// scaled by `direction_sample_distance` texels.
///
/// Four points on the unit circle in two opposite pairs, rotated off the
/// axes. Opposite pairs make each pair a central difference, so the estimate
/// points toward a single light even when the taps reach past it.
pub const POISSON_RING: [[f32; 2]; 4] = [
    [0.942_016_24, 0.335_567],
    [-0.335_567, 0.942_016_24],
    [-0.942_016_24, -0.335_567],
    [0.335_567, -0.942_016_24],
];

/// Height of the light above the sprite plane when forming the light vector.
pub const LIGHT_HEIGHT: f32 = 1.0;

/// Fragments with less alpha than this are discarded.
pub const MIN_ALPHA: f32 = 1.0 / 255.0;

pub fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// WGSL `step`: 1.0 when `x >= edge`.
pub fn step(edge: f32, x: f32) -> f32 {
    if x >= edge {
        1.0
    } else {
        0.0
    }
}

pub fn mix(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// `max(1 - d²/range², 0)²`. Strictly decreasing on `[0, range)`, zero beyond.
pub fn attenuation(distance: f32, range: f32) -> f32 {
    let falloff = (1.0 - (distance * distance) / (range * range)).max(0.0);
    falloff * falloff
}

/// Angle covered by polar texel coordinate `s`.
pub fn polar_angle(s: f32) -> f32 {
    s * TAU - PI
}

/// Inverse of [`polar_angle`] for `theta` in `[-PI, PI]`.
pub fn polar_coordinate(theta: f32) -> f32 {
    (theta + PI) / TAU
}

/// Light-local uv of the point at `theta` and normalized radius `r`.
pub fn polar_sample_uv(theta: f32, r: f32) -> [f32; 2] {
    [0.5 + 0.5 * r * theta.cos(), 0.5 + 0.5 * r * theta.sin()]
}

/// Normalized distance to the first caster along the slice at `s`, or 1.0.
///
/// `occlusion` samples the occlusion buffer at a light-local uv.
pub fn polar_distance(occlusion: impl Fn([f32; 2]) -> f32, s: f32, resolution: u32) -> f32 {
    let theta = polar_angle(s);
    let steps = resolution as f32;
    let mut best = 1.0_f32;
    for y in 0..resolution {
        let r = y as f32 / steps;
        let caster = occlusion(polar_sample_uv(theta, r));
        if caster > OCCLUSION_THRESHOLD && r < best {
            best = r;
        }
    }
    best
}

/// Shadow factor for a pixel at `norm` relative to the light.
///
/// `polar` samples the distance buffer at a (wrapping) texel coordinate.
/// `softness` blends between the hard center tap (0.0) and the blurred sum
/// (1.0). `half_extent_over_range` converts normalized radius into a fraction
/// of the light's range so the factor is zero outside it.
pub fn shadow_visibility(
    polar: impl Fn(f32) -> f32,
    norm: Vec2,
    resolution: u32,
    softness: f32,
    half_extent_over_range: f32,
) -> f32 {
    let r = norm.length();
    let theta = norm.y.atan2(norm.x);
    let s = polar_coordinate(theta);
    let tap = |coord: f32| step(r, polar(coord));

    let center = tap(s);
    let blur = (1.0 / resolution as f32) * smoothstep(0.0, 1.0, r);
    let sum: f32 = BLUR_WEIGHTS
        .iter()
        .enumerate()
        .map(|(i, weight)| tap(s + (i as f32 - 4.0) * blur) * weight)
        .sum();

    let lit = mix(center, sum, softness);
    let edge = r.max(r * half_extent_over_range);
    lit * (1.0 - smoothstep(0.0, 1.0, edge))
}

/// Brightness-weighted gradient of the light buffer around `uv`.
///
/// Points toward brighter texels; zero in a uniformly lit area.
pub fn estimate_light_direction(
    brightness: impl Fn([f32; 2]) -> f32,
    uv: [f32; 2],
    texel: [f32; 2],
    distance: f32,
) -> Vec2 {
    let center = brightness(uv);
    POISSON_RING.iter().fold(Vec2::ZERO, |dir, offset| {
        let sample = brightness([
            uv[0] + offset[0] * distance * texel[0],
            uv[1] + offset[1] * distance * texel[1],
        ]);
        dir + Vec2::from(*offset) * (sample - center)
    })
}

/// Unpack a normal-map texel, mirroring it with the sprite's flip state.
pub fn decode_normal(rgb: [f32; 3], flip_x: bool, flip_y: bool) -> [f32; 3] {
    let mut n = rgb.map(|c| c * 2.0 - 1.0);
    if flip_x {
        n[0] = -n[0];
    }
    if flip_y {
        n[1] = -n[1];
    }
    n
}

/// Final color of a lit fragment.
///
/// `diffuse` is the texture sample already multiplied by the tint; `light` is
/// the light-buffer sample; `visibility` is the shadow factor (1.0 for
/// materials that do not receive shadows).
pub fn shade_lit(
    diffuse: [f32; 4],
    normal: [f32; 3],
    light: [f32; 4],
    visibility: f32,
    ambient: [f32; 3],
    direction: Vec2,
) -> [f32; 4] {
    let l = [direction.x, direction.y, LIGHT_HEIGHT];
    let len = (l[0] * l[0] + l[1] * l[1] + l[2] * l[2]).sqrt();
    let lambert = ((normal[0] * l[0] + normal[1] * l[1] + normal[2] * l[2]) / len).max(0.0);
    let mut out = diffuse;
    for c in 0..3 {
        out[c] = diffuse[c] * (ambient[c] + light[c] * lambert * visibility);
    }
    out
}

pub fn srgb_to_linear(value: u8) -> f32 {
    let c = value as f32 / 255.0;
    if c <= 0.040_45 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}
