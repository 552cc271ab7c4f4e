//! Deterministic CPU implementation of [`LightingBackend`].
//!
//! Every pass runs the functions in [`shading`](crate::render::shading) over
//! f32 images with a top-left-rule triangle rasterizer and bilinear
//! sampling, so it produces the same buffers on every machine. It backs
//! headless rendering and the test suite.

use anyhow::Result;
use glam::{Mat4, Vec3};

use crate::error::LightingError;
use crate::math::Vec2;
use crate::render::backend::{
    CompositeParams, GeometryBatch, LightDraw, LightView, LightingBackend, LightingTarget,
    ScreenView, ShadowDraw,
};
use crate::render::material::BatchVertex;
use crate::render::shading::{
    attenuation, decode_normal, estimate_light_direction, polar_distance, shade_lit,
    shadow_visibility, srgb_to_linear, MIN_ALPHA,
};
use crate::render::sprite::{
    checked_rgba_len, TextureHandle, TextureKind, DEFAULT_COLOR_TEXEL, DEFAULT_NORMAL_TEXEL,
};

/// How sampling treats coordinates outside `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressMode {
    ClampToEdge,
    /// Wrap horizontally, clamp vertically.
    RepeatU,
}

/// Linear RGBA f32 image, row-major with the first row at the top.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    width: u32,
    height: u32,
    pixels: Vec<[f32; 4]>,
}

impl Image {
    pub fn new(width: u32, height: u32) -> Self {
        Self::filled(width, height, [0.0; 4])
    }

    pub fn filled(width: u32, height: u32, color: [f32; 4]) -> Self {
        Self {
            width,
            height,
            pixels: vec![color; width as usize * height as usize],
        }
    }

    /// Decode RGBA8 texels. Color textures are sRGB encoded, normal maps linear.
    pub fn from_rgba8(rgba: &[u8], width: u32, height: u32, kind: TextureKind) -> Result<Self> {
        checked_rgba_len(width, height, rgba.len())?;
        let pixels = rgba
            .chunks_exact(4)
            .map(|texel| {
                let rgb = |c: u8| match kind {
                    TextureKind::Color => srgb_to_linear(c),
                    TextureKind::Normal => c as f32 / 255.0,
                };
                [rgb(texel[0]), rgb(texel[1]), rgb(texel[2]), texel[3] as f32 / 255.0]
            })
            .collect();
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixels(&self) -> &[[f32; 4]] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        self.pixels[self.index(x, y)]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: [f32; 4]) {
        let index = self.index(x, y);
        self.pixels[index] = color;
    }

    pub fn clear(&mut self, color: [f32; 4]) {
        self.pixels.fill(color);
    }

    /// Pixel containing the world point under `view`, if it lies inside the
    /// image. Handy for probing screen buffers.
    pub fn pixel_at(&self, view: &ScreenView, world: Vec2) -> Option<[f32; 4]> {
        let p = view.to_buffer_pixels(world, self.size());
        if p.x < 0.0 || p.y < 0.0 {
            return None;
        }
        let (x, y) = (p.x as u32, p.y as u32);
        (x < self.width && y < self.height).then(|| self.pixel(x, y))
    }

    /// Bilinear sample at normalized coordinates, texel centers at `(i + 0.5) / size`.
    pub fn sample(&self, uv: [f32; 2], address: AddressMode) -> [f32; 4] {
        let x = uv[0] * self.width as f32 - 0.5;
        let y = uv[1] * self.height as f32 - 0.5;
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;

        let column = |i: i64| match address {
            AddressMode::ClampToEdge => i.clamp(0, self.width as i64 - 1) as u32,
            AddressMode::RepeatU => i.rem_euclid(self.width as i64) as u32,
        };
        let row = |j: i64| j.clamp(0, self.height as i64 - 1) as u32;

        let (cx0, cx1) = (column(x0 as i64), column(x0 as i64 + 1));
        let (ry0, ry1) = (row(y0 as i64), row(y0 as i64 + 1));
        let a = self.pixel(cx0, ry0);
        let b = self.pixel(cx1, ry0);
        let c = self.pixel(cx0, ry1);
        let d = self.pixel(cx1, ry1);

        let mut out = [0.0; 4];
        for i in 0..4 {
            let top = a[i] + (b[i] - a[i]) * fx;
            let bottom = c[i] + (d[i] - c[i]) * fx;
            out[i] = top + (bottom - top) * fy;
        }
        out
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

/// Offscreen output of the software backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderTargetId(u32);

/// Headless renderer writing into in-memory images.
pub struct SoftwareBackend {
    textures: Vec<Option<Image>>,
    free_textures: Vec<u32>,
    default_color: TextureHandle,
    default_normal: TextureHandle,
    occlusion: Option<Image>,
    polar: Option<Image>,
    light_map: Option<Image>,
    shadow_map: Option<Image>,
    backbuffer: Image,
    render_targets: Vec<Image>,
    in_frame: bool,
}

impl SoftwareBackend {
    /// Backend whose default output is a `width`x`height` backbuffer.
    pub fn new(width: u32, height: u32) -> Self {
        let mut backend = Self {
            textures: Vec::new(),
            free_textures: Vec::new(),
            default_color: TextureHandle(0),
            default_normal: TextureHandle(0),
            occlusion: None,
            polar: None,
            light_map: None,
            shadow_map: None,
            backbuffer: Image::new(width.max(1), height.max(1)),
            render_targets: Vec::new(),
            in_frame: false,
        };
        backend.default_color = backend.push_texture(texel_image(DEFAULT_COLOR_TEXEL, TextureKind::Color));
        backend.default_normal =
            backend.push_texture(texel_image(DEFAULT_NORMAL_TEXEL, TextureKind::Normal));
        backend
    }

    pub fn backbuffer(&self) -> &Image {
        &self.backbuffer
    }

    pub fn create_render_target(&mut self, width: u32, height: u32) -> RenderTargetId {
        let id = RenderTargetId(self.render_targets.len() as u32);
        self.render_targets.push(Image::new(width.max(1), height.max(1)));
        id
    }

    pub fn render_target(&self, id: RenderTargetId) -> Option<&Image> {
        self.render_targets.get(id.0 as usize)
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&Image> {
        self.textures.get(handle.0 as usize)?.as_ref()
    }

    /// Number of live textures, defaults included.
    pub fn texture_count(&self) -> usize {
        self.textures.iter().filter(|slot| slot.is_some()).count()
    }

    fn push_texture(&mut self, image: Image) -> TextureHandle {
        if let Some(index) = self.free_textures.pop() {
            self.textures[index as usize] = Some(image);
            return TextureHandle(index);
        }
        let handle = TextureHandle(self.textures.len() as u32);
        self.textures.push(Some(image));
        handle
    }

    fn expect_frame(&self, pass: &'static str) -> Result<(), LightingError> {
        if self.in_frame {
            Ok(())
        } else {
            Err(LightingError::NoActiveFrame { pass })
        }
    }

    fn texture_or_err(&self, handle: TextureHandle) -> Result<&Image, LightingError> {
        self.texture(handle)
            .ok_or(LightingError::UnknownTexture(handle.0))
    }

    fn output_mut(&mut self, target: Option<&RenderTargetId>) -> Result<&mut Image> {
        match target {
            None => Ok(&mut self.backbuffer),
            Some(id) => self
                .render_targets
                .get_mut(id.0 as usize)
                .ok_or_else(|| LightingError::UnknownRenderTarget(id.0).into()),
        }
    }
}

fn texel_image(texel: [u8; 4], kind: TextureKind) -> Image {
    // A single texel always has the right length.
    Image::from_rgba8(&texel, 1, 1, kind).unwrap_or_else(|_| Image::new(1, 1))
}

fn required(image: &Option<Image>, target: LightingTarget) -> Result<&Image, LightingError> {
    image
        .as_ref()
        .ok_or(LightingError::MissingFramebuffer { target })
}

fn required_mut(
    image: &mut Option<Image>,
    target: LightingTarget,
) -> Result<&mut Image, LightingError> {
    image
        .as_mut()
        .ok_or(LightingError::MissingFramebuffer { target })
}

impl LightingBackend for SoftwareBackend {
    type Target = RenderTargetId;
    type Surface = Image;

    fn create_texture(
        &mut self,
        rgba: &[u8],
        width: u32,
        height: u32,
        kind: TextureKind,
    ) -> Result<TextureHandle> {
        let image = Image::from_rgba8(rgba, width, height, kind)?;
        Ok(self.push_texture(image))
    }

    fn default_texture(&self, kind: TextureKind) -> TextureHandle {
        match kind {
            TextureKind::Color => self.default_color,
            TextureKind::Normal => self.default_normal,
        }
    }

    fn texture_size(&self, handle: TextureHandle) -> Option<(u32, u32)> {
        self.texture(handle).map(Image::size)
    }

    fn release_texture(&mut self, handle: TextureHandle) {
        if handle == self.default_color || handle == self.default_normal {
            return;
        }
        if let Some(slot) = self.textures.get_mut(handle.0 as usize) {
            if slot.take().is_some() {
                self.free_textures.push(handle.0);
            }
        }
    }

    fn resize_shadow_targets(&mut self, size: u32) -> Result<()> {
        self.occlusion = Some(Image::new(size, size));
        self.polar = Some(Image::filled(size, 1, [1.0; 4]));
        Ok(())
    }

    fn resize_screen_targets(
        &mut self,
        light_map: (u32, u32),
        shadow_map: (u32, u32),
    ) -> Result<()> {
        self.light_map = Some(Image::new(light_map.0, light_map.1));
        self.shadow_map = Some(Image::new(shadow_map.0, shadow_map.1));
        Ok(())
    }

    fn target_size(&self, target: LightingTarget) -> Option<(u32, u32)> {
        self.intermediate(target).map(Image::size)
    }

    fn intermediate(&self, target: LightingTarget) -> Option<&Image> {
        match target {
            LightingTarget::Occlusion => self.occlusion.as_ref(),
            LightingTarget::PolarDistance => self.polar.as_ref(),
            LightingTarget::LightMap => self.light_map.as_ref(),
            LightingTarget::ShadowMap => self.shadow_map.as_ref(),
        }
    }

    fn resize_output(&mut self, width: u32, height: u32) {
        self.backbuffer = Image::new(width.max(1), height.max(1));
    }

    fn begin_frame(&mut self, target: Option<&RenderTargetId>) -> Result<()> {
        self.output_mut(target)?;
        required_mut(&mut self.light_map, LightingTarget::LightMap)?.clear([0.0; 4]);
        required_mut(&mut self.shadow_map, LightingTarget::ShadowMap)?.clear([0.0; 4]);
        self.in_frame = true;
        Ok(())
    }

    fn render_occlusion(&mut self, view: &LightView, batches: &[GeometryBatch]) -> Result<()> {
        self.expect_frame("occlusion")?;
        let mut occlusion = self
            .occlusion
            .take()
            .ok_or(LightingError::MissingFramebuffer {
                target: LightingTarget::Occlusion,
            })?;
        occlusion.clear([0.0; 4]);

        let result = (|| -> Result<()> {
            let view_projection = view.view_projection();
            for batch in batches {
                let texture = self.texture_or_err(batch.color_texture)?;
                let tint_alpha = batch.material.tint[3];
                for_each_triangle(batch, |triangle| {
                    rasterize(&mut occlusion, view_projection, triangle, |image, x, y, frag| {
                        let uv = batch.flipped_uv(frag.uv);
                        let value = texture.sample(uv, AddressMode::ClampToEdge)[3] * tint_alpha;
                        let current = image.pixel(x, y)[0];
                        let blended = current.max(value);
                        image.set_pixel(x, y, [blended, blended, blended, blended]);
                    });
                });
            }
            Ok(())
        })();

        self.occlusion = Some(occlusion);
        result
    }

    fn render_polar_distances(&mut self) -> Result<()> {
        self.expect_frame("polar distance")?;
        let occlusion = required(&self.occlusion, LightingTarget::Occlusion)?;
        let polar = self
            .polar
            .as_mut()
            .ok_or(LightingError::MissingFramebuffer {
                target: LightingTarget::PolarDistance,
            })?;

        let resolution = polar.width();
        for x in 0..resolution {
            let s = (x as f32 + 0.5) / resolution as f32;
            let distance = polar_distance(
                |uv| occlusion.sample(uv, AddressMode::ClampToEdge)[0],
                s,
                resolution,
            );
            polar.set_pixel(x, 0, [distance; 4]);
        }
        Ok(())
    }

    fn render_shadow(&mut self, screen: &ScreenView, shadow: &ShadowDraw) -> Result<()> {
        self.expect_frame("shadow")?;
        let polar = required(&self.polar, LightingTarget::PolarDistance)?;
        let shadow_map = self
            .shadow_map
            .as_mut()
            .ok_or(LightingError::MissingFramebuffer {
                target: LightingTarget::ShadowMap,
            })?;

        let half_extent = shadow.extent * 0.5;
        let ratio = shadow.half_extent_over_range();
        rasterize_rect(shadow_map, screen.view_projection(), shadow.rect(), |image, x, y, frag| {
            let norm = (Vec2::from(frag.world) - shadow.center) / half_extent;
            let value = shadow_visibility(
                |s| polar.sample([s, 0.5], AddressMode::RepeatU)[0],
                norm,
                shadow.resolution,
                shadow.softness,
                ratio,
            );
            let current = image.pixel(x, y);
            image.set_pixel(x, y, current.map(|c| c + value));
        });
        Ok(())
    }

    fn render_light_map(&mut self, screen: &ScreenView, lights: &[LightDraw]) -> Result<()> {
        self.expect_frame("light map")?;
        let light_map = required_mut(&mut self.light_map, LightingTarget::LightMap)?;
        let view_projection = screen.view_projection();
        for light in lights {
            let radiance = light.radiance();
            rasterize_rect(light_map, view_projection, light.rect(), |image, x, y, frag| {
                let distance = Vec2::from(frag.world).distance(light.center);
                let att = attenuation(distance, light.range);
                let current = image.pixel(x, y);
                image.set_pixel(
                    x,
                    y,
                    [
                        current[0] + radiance[0] * att,
                        current[1] + radiance[1] * att,
                        current[2] + radiance[2] * att,
                        current[3] + att,
                    ],
                );
            });
        }
        Ok(())
    }

    fn render_objects(
        &mut self,
        screen: &ScreenView,
        params: &CompositeParams,
        batches: &[GeometryBatch],
        target: Option<&RenderTargetId>,
    ) -> Result<()> {
        self.expect_frame("object")?;
        // Split borrows: the output is written while textures and the screen
        // buffers are read.
        let mut output = std::mem::replace(self.output_mut(target)?, Image::new(1, 1));
        output.clear(params.clear_color);

        let result = (|| -> Result<()> {
            let light_map = required(&self.light_map, LightingTarget::LightMap)?;
            let shadow_map = required(&self.shadow_map, LightingTarget::ShadowMap)?;
            let texel = [
                1.0 / light_map.width() as f32,
                1.0 / light_map.height() as f32,
            ];
            let output_size = Vec2::new(output.width() as f32, output.height() as f32);
            let view_projection = screen.view_projection();

            for batch in batches {
                let color = self.texture_or_err(batch.color_texture)?;
                let normals = self.texture_or_err(batch.normal_texture)?;
                let material = &batch.material;

                for_each_triangle(batch, |triangle| {
                    rasterize(&mut output, view_projection, triangle, |image, x, y, frag| {
                        let uv = batch.flipped_uv(frag.uv);
                        let texel_color = color.sample(uv, AddressMode::ClampToEdge);
                        let mut diffuse = [0.0; 4];
                        for c in 0..4 {
                            diffuse[c] = texel_color[c] * material.tint[c];
                        }
                        if diffuse[3] < MIN_ALPHA {
                            return;
                        }

                        let shaded = if material.is_lit {
                            let screen_uv = [
                                (x as f32 + 0.5) / output_size.x,
                                (y as f32 + 0.5) / output_size.y,
                            ];
                            let light = light_map.sample(screen_uv, AddressMode::ClampToEdge);
                            let visibility = if material.receives_shadows {
                                shadow_map.sample(screen_uv, AddressMode::ClampToEdge)[0]
                                    .clamp(0.0, 1.0)
                            } else {
                                1.0
                            };
                            let direction = estimate_light_direction(
                                |p| light_map.sample(p, AddressMode::ClampToEdge)[3],
                                screen_uv,
                                texel,
                                params.direction_sample_distance,
                            );
                            let n = normals.sample(uv, AddressMode::ClampToEdge);
                            let normal = decode_normal([n[0], n[1], n[2]], batch.flip_x, batch.flip_y);
                            shade_lit(diffuse, normal, light, visibility, params.ambient, direction)
                        } else {
                            diffuse
                        };

                        let dst = image.pixel(x, y);
                        image.set_pixel(x, y, blend_over(shaded, dst));
                    });
                });
            }
            Ok(())
        })();

        *self.output_mut(target)? = output;
        result
    }

    fn end_frame(&mut self, _target: Option<&RenderTargetId>) -> Result<()> {
        self.expect_frame("end of frame")?;
        self.in_frame = false;
        Ok(())
    }

    fn abort_frame(&mut self) {
        self.in_frame = false;
    }
}

/// `src.rgb * src.a + dst.rgb * (1 - src.a)`, alpha `src.a + dst.a * (1 - src.a)`.
fn blend_over(src: [f32; 4], dst: [f32; 4]) -> [f32; 4] {
    let a = src[3];
    [
        src[0] * a + dst[0] * (1.0 - a),
        src[1] * a + dst[1] * (1.0 - a),
        src[2] * a + dst[2] * (1.0 - a),
        a + dst[3] * (1.0 - a),
    ]
}

/// Interpolated per-fragment inputs.
#[derive(Clone, Copy, Debug)]
struct Fragment {
    uv: [f32; 2],
    world: [f32; 2],
}

fn for_each_triangle(batch: &GeometryBatch, mut f: impl FnMut([BatchVertex; 3])) {
    for tri in batch.indices.chunks_exact(3) {
        f([
            batch.vertices[tri[0] as usize],
            batch.vertices[tri[1] as usize],
            batch.vertices[tri[2] as usize],
        ]);
    }
}

/// Axis-aligned world rectangle drawn as two triangles, uv spanning it.
fn rasterize_rect(
    image: &mut Image,
    view_projection: Mat4,
    rect: crate::math::Rect,
    mut shade: impl FnMut(&mut Image, u32, u32, Fragment),
) {
    let corners = [
        BatchVertex {
            position: [rect.min.x, rect.min.y],
            uv: [0.0, 0.0],
        },
        BatchVertex {
            position: [rect.max.x, rect.min.y],
            uv: [1.0, 0.0],
        },
        BatchVertex {
            position: [rect.max.x, rect.max.y],
            uv: [1.0, 1.0],
        },
        BatchVertex {
            position: [rect.min.x, rect.max.y],
            uv: [0.0, 1.0],
        },
    ];
    rasterize(image, view_projection, [corners[0], corners[1], corners[2]], &mut shade);
    rasterize(image, view_projection, [corners[0], corners[2], corners[3]], &mut shade);
}

/// Fill one triangle, calling `shade` for every covered pixel center.
///
/// Edges follow the top-left rule, so triangles sharing an edge never both
/// cover a pixel; additive passes depend on that.
fn rasterize(
    image: &mut Image,
    view_projection: Mat4,
    triangle: [BatchVertex; 3],
    mut shade: impl FnMut(&mut Image, u32, u32, Fragment),
) {
    let (width, height) = (image.width() as f32, image.height() as f32);
    let to_pixels = |v: &BatchVertex| {
        let ndc = view_projection.project_point3(Vec3::new(v.position[0], v.position[1], 0.0));
        Vec2::new((ndc.x + 1.0) * 0.5 * width, (1.0 - ndc.y) * 0.5 * height)
    };

    let mut verts = triangle;
    let mut p = [to_pixels(&verts[0]), to_pixels(&verts[1]), to_pixels(&verts[2])];
    let mut area = edge(p[0], p[1], p[2]);
    if area == 0.0 || !area.is_finite() {
        return;
    }
    if area < 0.0 {
        verts.swap(1, 2);
        p.swap(1, 2);
        area = -area;
    }

    let min_x = p.iter().map(|v| v.x).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
    let min_y = p.iter().map(|v| v.y).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
    let max_x = p.iter().map(|v| v.x).fold(f32::NEG_INFINITY, f32::max).ceil().min(width) as u32;
    let max_y = p.iter().map(|v| v.y).fold(f32::NEG_INFINITY, f32::max).ceil().min(height) as u32;

    let edges = [(1, 2), (2, 0), (0, 1)];
    let top_left = edges.map(|(a, b)| is_top_left(p[a], p[b]));

    for y in min_y..max_y {
        for x in min_x..max_x {
            let center = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
            let mut weights = [0.0; 3];
            let mut inside = true;
            for (i, &(a, b)) in edges.iter().enumerate() {
                let w = edge(p[a], p[b], center);
                if w < 0.0 || (w == 0.0 && !top_left[i]) {
                    inside = false;
                    break;
                }
                weights[i] = w / area;
            }
            if !inside {
                continue;
            }

            let lerp = |get: fn(&BatchVertex) -> [f32; 2]| {
                let (a, b, c) = (get(&verts[0]), get(&verts[1]), get(&verts[2]));
                [
                    a[0] * weights[0] + b[0] * weights[1] + c[0] * weights[2],
                    a[1] * weights[0] + b[1] * weights[1] + c[1] * weights[2],
                ]
            };
            let fragment = Fragment {
                uv: lerp(|v: &BatchVertex| v.uv),
                world: lerp(|v: &BatchVertex| v.position),
            };
            shade(image, x, y, fragment);
        }
    }
}

fn edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

/// Top edges run rightwards, left edges run upwards (y down, positive area).
fn is_top_left(a: Vec2, b: Vec2) -> bool {
    (a.y == b.y && b.x > a.x) || b.y < a.y
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::math::{Camera2D, Rect};
    use crate::render::material::{Geometry, Material};

    fn screen(width: u32, height: u32) -> ScreenView {
        ScreenView {
            camera: Camera2D::new(Vec2::ZERO),
            viewport: (width, height),
        }
    }

    /// Backend with every target allocated and a frame in progress.
    fn framed_backend(shadow_size: u32, screen: u32) -> SoftwareBackend {
        let mut backend = SoftwareBackend::new(screen, screen);
        backend.resize_shadow_targets(shadow_size).unwrap();
        backend.resize_screen_targets((screen, screen), (screen, screen)).unwrap();
        backend.begin_frame(None).unwrap();
        backend
    }

    fn batch_for(backend: &SoftwareBackend, geometry: Geometry, material: Material) -> GeometryBatch {
        GeometryBatch {
            layer: 0,
            material: Arc::new(material),
            color_texture: backend.default_texture(TextureKind::Color),
            normal_texture: backend.default_texture(TextureKind::Normal),
            flip_x: false,
            flip_y: false,
            vertices: geometry.vertices,
            indices: geometry.indices,
        }
    }

    #[test]
    fn test_bilinear_sampling() {
        let mut image = Image::new(2, 1);
        image.set_pixel(0, 0, [0.0; 4]);
        image.set_pixel(1, 0, [1.0; 4]);
        assert_eq!(image.sample([0.25, 0.5], AddressMode::ClampToEdge)[0], 0.0);
        assert_eq!(image.sample([0.5, 0.5], AddressMode::ClampToEdge)[0], 0.5);
        assert_eq!(image.sample([1.0, 0.5], AddressMode::ClampToEdge)[0], 1.0);
        // Wrapping blends the last texel with the first.
        assert_eq!(image.sample([1.0, 0.5], AddressMode::RepeatU)[0], 0.5);
    }

    #[test]
    fn test_color_textures_are_srgb_decoded() {
        let color = Image::from_rgba8(&[128, 0, 255, 255], 1, 1, TextureKind::Color).unwrap();
        let normal = Image::from_rgba8(&[128, 0, 255, 255], 1, 1, TextureKind::Normal).unwrap();
        assert!(color.pixel(0, 0)[0] < 0.25);
        approx::assert_relative_eq!(normal.pixel(0, 0)[0], 128.0 / 255.0);
        assert_eq!(color.pixel(0, 0)[3], 1.0);
        assert!(Image::from_rgba8(&[0, 0, 0], 1, 1, TextureKind::Color).is_err());
    }

    #[test]
    fn test_adjacent_triangles_cover_each_pixel_once() {
        let mut image = Image::new(8, 8);
        let rect = Rect::new(Vec2::ZERO, Vec2::new(8.0, 8.0));
        let vp = screen(8, 8).view_projection();
        rasterize_rect(&mut image, vp, rect, |img, x, y, _| {
            let current = img.pixel(x, y);
            img.set_pixel(x, y, current.map(|c| c + 1.0));
        });
        assert!(image.pixels().iter().all(|p| p[0] == 1.0));
    }

    #[test]
    fn test_partial_rect_covers_only_its_pixels() {
        let mut image = Image::new(8, 8);
        let rect = Rect::new(Vec2::new(2.0, 2.0), Vec2::new(4.0, 6.0));
        rasterize_rect(&mut image, screen(8, 8).view_projection(), rect, |img, x, y, _| {
            img.set_pixel(x, y, [1.0; 4]);
        });
        let covered = image.pixels().iter().filter(|p| p[0] == 1.0).count();
        assert_eq!(covered, 8);
        assert_eq!(image.pixel(2, 2)[0], 1.0);
        assert_eq!(image.pixel(4, 2)[0], 0.0);
    }

    #[test]
    fn test_occlusion_writes_alpha_times_tint() {
        let mut backend = framed_backend(8, 8);
        let view = LightView {
            center: Vec2::ZERO,
            extent: 8.0,
        };
        let geometry = Geometry::quad(Vec2::new(2.0, 0.0), Vec2::new(2.0, 8.0));
        let material = Material::default().with_tint([1.0, 1.0, 1.0, 0.5]);
        let batch = batch_for(&backend, geometry, material);
        backend.render_occlusion(&view, &[batch]).unwrap();

        let occlusion = backend.intermediate(LightingTarget::Occlusion).unwrap();
        // World x in [1, 3] maps to columns 5 and 6.
        assert_eq!(occlusion.pixel(5, 4)[0], 0.5);
        assert_eq!(occlusion.pixel(6, 0)[0], 0.5);
        assert_eq!(occlusion.pixel(4, 4)[0], 0.0);
    }

    #[test]
    fn test_polar_distance_finds_caster_to_the_right() {
        let mut backend = framed_backend(16, 8);
        let view = LightView {
            center: Vec2::ZERO,
            extent: 16.0,
        };
        // Wall occupying world x in [4, 8], all of y.
        let wall = Geometry::quad(Vec2::new(6.0, 0.0), Vec2::new(4.0, 16.0));
        let batch = batch_for(&backend, wall, Material::default());
        backend.render_occlusion(&view, &[batch]).unwrap();
        backend.render_polar_distances().unwrap();

        let polar = backend.intermediate(LightingTarget::PolarDistance).unwrap();
        // Slice 8 looks along +x; the wall starts half way to the edge.
        let toward_wall = polar.pixel(8, 0)[0];
        assert!(toward_wall >= 0.5 && toward_wall < 0.7, "got {toward_wall}");
        // Slice 0 looks along -x, which is open.
        assert_eq!(polar.pixel(0, 0)[0], 1.0);
    }

    #[test]
    fn test_light_map_is_additive_and_bounded_by_range() {
        let mut backend = framed_backend(4, 32);
        let light = LightDraw {
            center: Vec2::new(16.0, 16.0),
            range: 8.0,
            color: [1.0, 0.5, 0.25],
            intensity: 1.0,
        };
        backend.render_light_map(&screen(32, 32), &[light, light]).unwrap();

        let map = backend.intermediate(LightingTarget::LightMap).unwrap();
        let center = map.pixel(16, 16);
        let single = attenuation(Vec2::new(16.5, 16.5).distance(light.center), 8.0);
        approx::assert_relative_eq!(center[3], 2.0 * single, epsilon = 1e-5);
        approx::assert_relative_eq!(center[1], single, epsilon = 1e-5);
        assert_eq!(map.pixel(16, 26), [0.0; 4]);
        assert_eq!(map.pixel(2, 2), [0.0; 4]);
    }

    #[test]
    fn test_unknown_render_target_is_rejected() {
        let mut backend = SoftwareBackend::new(4, 4);
        backend.resize_screen_targets((4, 4), (4, 4)).unwrap();
        let err = backend.begin_frame(Some(&RenderTargetId(3))).unwrap_err();
        assert_eq!(
            err.downcast_ref::<LightingError>(),
            Some(&LightingError::UnknownRenderTarget(3))
        );
    }

    #[test]
    fn test_missing_targets_are_reported() {
        let mut backend = SoftwareBackend::new(4, 4);
        backend.resize_screen_targets((4, 4), (4, 4)).unwrap();
        backend.begin_frame(None).unwrap();
        let err = backend.render_polar_distances().unwrap_err();
        assert_eq!(
            err.downcast_ref::<LightingError>(),
            Some(&LightingError::MissingFramebuffer {
                target: LightingTarget::Occlusion
            })
        );
    }

    #[test]
    fn test_passes_outside_a_frame_fail_fast() {
        let mut backend = SoftwareBackend::new(4, 4);
        backend.resize_shadow_targets(4).unwrap();
        backend.resize_screen_targets((4, 4), (4, 4)).unwrap();
        let err = backend.render_polar_distances().unwrap_err();
        assert_eq!(
            err.downcast_ref::<LightingError>(),
            Some(&LightingError::NoActiveFrame {
                pass: "polar distance"
            })
        );
        let err = backend.render_light_map(&screen(4, 4), &[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LightingError>(),
            Some(LightingError::NoActiveFrame { .. })
        ));

        backend.begin_frame(None).unwrap();
        backend.render_polar_distances().unwrap();
        backend.abort_frame();
        assert!(backend.render_polar_distances().is_err());
        assert!(backend.end_frame(None).is_err());
    }

    #[test]
    fn test_released_texture_slots_are_reused() {
        let mut backend = SoftwareBackend::new(4, 4);
        let first = backend
            .create_texture(&[255; 4], 1, 1, TextureKind::Color)
            .unwrap();
        assert_eq!(backend.texture_count(), 3);

        backend.release_texture(first);
        assert_eq!(backend.texture_size(first), None);
        assert_eq!(backend.texture_count(), 2);

        let second = backend
            .create_texture(&[0; 16], 2, 2, TextureKind::Color)
            .unwrap();
        assert_eq!(second, first);
        assert_eq!(backend.texture_size(second), Some((2, 2)));
    }

    #[test]
    fn test_default_textures_survive_release() {
        let mut backend = SoftwareBackend::new(4, 4);
        let default = backend.default_texture(TextureKind::Normal);
        backend.release_texture(default);
        assert_eq!(backend.texture_size(default), Some((1, 1)));
    }
}
