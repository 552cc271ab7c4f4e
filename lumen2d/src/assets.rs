use std::collections::{HashMap, HashSet};
use std::fs;

use anyhow::Context;

use crate::render::{LightingBackend, TextureHandle, TextureKind};

/// Resolves the texture paths named by materials.
///
/// Returning `None` is not an error: the renderer substitutes a default
/// texture and logs the path once.
pub trait TextureProvider {
    fn resolve(&self, path: &str) -> Option<TextureHandle>;
}

impl TextureProvider for HashMap<String, TextureHandle> {
    fn resolve(&self, path: &str) -> Option<TextureHandle> {
        self.get(path).copied()
    }
}

/// Manages cached textures, keyed by the path materials refer to them by.
pub struct AssetManager {
    textures: HashMap<String, TextureHandle>,
}

impl AssetManager {
    /// Create a new asset manager with no cached assets.
    pub fn new() -> Self {
        Self {
            textures: HashMap::new(),
        }
    }

    /// Load a texture from a file path, caching it if already loaded.
    ///
    /// Returns the texture handle. If the texture was previously loaded,
    /// returns the cached handle without reloading from disk.
    pub fn load_texture<B: LightingBackend>(
        &mut self,
        backend: &mut B,
        path: &str,
        kind: TextureKind,
    ) -> anyhow::Result<TextureHandle> {
        if let Some(handle) = self.textures.get(path) {
            return Ok(*handle);
        }

        let bytes = fs::read(path).with_context(|| format!("failed to read texture '{path}'"))?;
        let handle = decode_and_upload(backend, &bytes, kind)?;
        self.textures.insert(path.to_string(), handle);
        Ok(handle)
    }

    /// Load an encoded image (PNG) from bytes, caching it by a given key.
    ///
    /// Useful for embedded assets or dynamically generated textures.
    pub fn load_texture_from_bytes<B: LightingBackend>(
        &mut self,
        backend: &mut B,
        key: &str,
        bytes: &[u8],
        kind: TextureKind,
    ) -> anyhow::Result<TextureHandle> {
        if let Some(handle) = self.textures.get(key) {
            return Ok(*handle);
        }

        let handle = decode_and_upload(backend, bytes, kind)?;
        self.textures.insert(key.to_string(), handle);
        Ok(handle)
    }

    /// Upload raw RGBA8 texels under `key`, replacing any previous entry.
    pub fn load_texture_from_rgba<B: LightingBackend>(
        &mut self,
        backend: &mut B,
        key: &str,
        rgba: &[u8],
        width: u32,
        height: u32,
        kind: TextureKind,
    ) -> anyhow::Result<TextureHandle> {
        let handle = backend.create_texture(rgba, width, height, kind)?;
        if let Some(previous) = self.textures.insert(key.to_string(), handle) {
            self.release_if_unused(backend, previous);
        }
        Ok(handle)
    }

    /// Register a texture created elsewhere under `key`.
    pub fn insert_texture(&mut self, key: &str, handle: TextureHandle) {
        self.textures.insert(key.to_string(), handle);
    }

    /// Get a cached texture handle by key, if it exists.
    pub fn get_texture(&self, key: &str) -> Option<TextureHandle> {
        self.textures.get(key).copied()
    }

    pub fn has_texture(&self, key: &str) -> bool {
        self.textures.contains_key(key)
    }

    /// Remove a texture from the cache and free it on `backend` once no
    /// other key refers to it.
    pub fn unload_texture<B: LightingBackend>(&mut self, backend: &mut B, key: &str) {
        if let Some(handle) = self.textures.remove(key) {
            self.release_if_unused(backend, handle);
        }
    }

    /// Unload every cached texture.
    pub fn clear<B: LightingBackend>(&mut self, backend: &mut B) {
        let handles: HashSet<TextureHandle> = self.textures.drain().map(|(_, h)| h).collect();
        for handle in handles {
            backend.release_texture(handle);
        }
    }

    fn release_if_unused<B: LightingBackend>(&self, backend: &mut B, handle: TextureHandle) {
        if !self.textures.values().any(|&h| h == handle) {
            backend.release_texture(handle);
        }
    }
}

impl Default for AssetManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TextureProvider for AssetManager {
    fn resolve(&self, path: &str) -> Option<TextureHandle> {
        self.get_texture(path)
    }
}

fn decode_and_upload<B: LightingBackend>(
    backend: &mut B,
    bytes: &[u8],
    kind: TextureKind,
) -> anyhow::Result<TextureHandle> {
    let image = image::load_from_memory(bytes)?.to_rgba8();
    let (width, height) = image.dimensions();
    backend.create_texture(&image, width, height, kind)
}
