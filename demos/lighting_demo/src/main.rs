use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use lumen2d::{
    Camera2D, Engine, EngineContext, Game, Geometry, LightingConfig, Material, PointLight,
    TextureKind, Transform2D, Vec2,
};

const CRATE_TEXTURE: &str = "crate";
const CRATE_NORMALS: &str = "crate_normals";
const FLOOR_TEXTURE: &str = "floor";
const TEXTURE_SIZE: u32 = 32;

struct Prop {
    geometry: Arc<Geometry>,
    material: Arc<Material>,
    layer: i32,
}

struct LightingDemo {
    camera: Camera2D,
    props: Vec<Prop>,
    lights: Vec<(Transform2D, PointLight)>,
    time: f32,
}

impl LightingDemo {
    fn new() -> Self {
        let floor = Arc::new(Material::new(FLOOR_TEXTURE).with_tint([0.6, 0.6, 0.7, 1.0]));
        let crate_material = Arc::new(
            Material::new(CRATE_TEXTURE)
                .with_normal_texture(CRATE_NORMALS)
                .casting_shadows(true),
        );

        let mut props = vec![Prop {
            geometry: Arc::new(Geometry::quad(Vec2::ZERO, Vec2::new(1600.0, 1000.0))),
            material: floor,
            layer: 0,
        }];
        for i in 0..6 {
            let angle = i as f32 / 6.0 * std::f32::consts::TAU;
            let transform = Transform2D::new(
                Vec2::new(angle.cos(), angle.sin()) * 220.0,
                Vec2::new(1.0, 1.0),
                angle,
            );
            props.push(Prop {
                geometry: Arc::new(Geometry::from_transform(&transform, Vec2::new(64.0, 64.0))),
                material: Arc::clone(&crate_material),
                layer: 1,
            });
        }

        let lights = vec![
            (
                Transform2D::from_position(Vec2::ZERO),
                PointLight::new([1.0, 0.9, 0.7], 1.5, 400.0).with_shadows(true),
            ),
            (
                Transform2D::from_position(Vec2::new(-300.0, 0.0)),
                PointLight::new([0.3, 0.5, 1.0], 1.0, 300.0).with_shadows(true),
            ),
            // Fill light; everything in the scene receives shadows, so it
            // must cast them to light anything.
            (
                Transform2D::from_position(Vec2::new(350.0, -250.0)),
                PointLight::new([1.0, 0.3, 0.3], 0.6, 250.0).with_shadows(true),
            ),
        ];

        Self {
            camera: Camera2D::default(),
            props,
            lights,
            time: 0.0,
        }
    }
}

impl Game for LightingDemo {
    fn init(&mut self, ctx: &mut EngineContext<'_>) -> Result<()> {
        ctx.load_texture_from_rgba(
            CRATE_TEXTURE,
            &crate_texels(),
            TEXTURE_SIZE,
            TEXTURE_SIZE,
            TextureKind::Color,
        )?;
        ctx.load_texture_from_rgba(
            CRATE_NORMALS,
            &bevel_normals(),
            TEXTURE_SIZE,
            TEXTURE_SIZE,
            TextureKind::Normal,
        )?;
        ctx.load_texture_from_rgba(FLOOR_TEXTURE, &[255, 255, 255, 255], 1, 1, TextureKind::Color)?;
        Ok(())
    }

    fn update(&mut self, ctx: &mut EngineContext<'_>) -> Result<()> {
        self.time += ctx.delta_time().as_secs_f32();

        let (first, rest) = self.lights.split_at_mut(1);
        first[0].0.position = Vec2::new((self.time * 0.7).cos(), (self.time * 0.5).sin()) * 120.0;
        rest[0].0.position = Vec2::new(-300.0 + (self.time * 0.4).sin() * 80.0, 0.0);

        let (width, height) = ctx.window_size();
        self.camera = Camera2D::centered_on(Vec2::ZERO, width, height);
        Ok(())
    }

    fn draw(&mut self, ctx: &mut EngineContext<'_>) -> Result<()> {
        let renderer = ctx.renderer();
        for (transform, light) in &self.lights {
            renderer.submit_light(transform, light);
        }
        for prop in &self.props {
            renderer.submit_object(&prop.geometry, &prop.material, false, false, prop.layer);
        }
        ctx.render(&self.camera)
    }
}

fn crate_texels() -> Vec<u8> {
    let mut texels = Vec::with_capacity((TEXTURE_SIZE * TEXTURE_SIZE * 4) as usize);
    for y in 0..TEXTURE_SIZE {
        for x in 0..TEXTURE_SIZE {
            let border = x < 3 || y < 3 || x >= TEXTURE_SIZE - 3 || y >= TEXTURE_SIZE - 3;
            let plank = (y / 8) % 2 == 0;
            let texel = match (border, plank) {
                (true, _) => [110, 70, 30, 255],
                (false, true) => [170, 120, 60, 255],
                (false, false) => [150, 100, 50, 255],
            };
            texels.extend_from_slice(&texel);
        }
    }
    texels
}

/// Normals tilting outward near the edges, flat in the middle.
fn bevel_normals() -> Vec<u8> {
    let mut texels = Vec::with_capacity((TEXTURE_SIZE * TEXTURE_SIZE * 4) as usize);
    let encode = |v: f32| ((v * 0.5 + 0.5) * 255.0).round() as u8;
    for y in 0..TEXTURE_SIZE {
        for x in 0..TEXTURE_SIZE {
            let mut n = [0.0f32, 0.0, 1.0];
            if x < 4 {
                n[0] = -0.6;
            } else if x >= TEXTURE_SIZE - 4 {
                n[0] = 0.6;
            }
            if y < 4 {
                n[1] = -0.6;
            } else if y >= TEXTURE_SIZE - 4 {
                n[1] = 0.6;
            }
            let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
            texels.extend_from_slice(&[
                encode(n[0] / len),
                encode(n[1] / len),
                encode(n[2] / len),
                255,
            ]);
        }
    }
    texels
}

fn main() -> Result<()> {
    env_logger::init();

    // Optional JSON file with lighting overrides as the first argument.
    let lighting = match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read lighting config '{path}'"))?;
            info!("Loaded lighting config from {path}");
            LightingConfig::from_json_str(&json)?
        }
        None => LightingConfig {
            ambient_color: [0.6, 0.6, 0.8],
            ambient_intensity: 0.15,
            ..LightingConfig::default()
        },
    };

    Engine::new()
        .with_title("Lighting Demo - Lumen2D")
        .with_size(1280, 720)
        .with_vsync(true)
        .with_lighting(lighting)
        .run(LightingDemo::new())
}
