use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Liveness of the window/GL context that owns the main thread. Polled by
/// [`crate::StagedLoader`] so an in-flight pipeline can abort when the context dies
/// mid-load.
pub trait GfxContext {
    fn is_alive(&self) -> bool;
}

/// Trivial [`GfxContext`] backed by a flag. The engine's window wrapper implements the
/// trait directly; this one exists for tests and headless tooling.
#[derive(Default)]
pub struct FlagContext {
    dead: AtomicBool,
}

impl FlagContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kill(&self) {
        self.dead.store(true, Ordering::Release);
    }
}

impl GfxContext for FlagContext {
    fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::Acquire)
    }
}

// GPU-side objects are represented by their ready-to-upload payloads plus a ready flag.
// setup() stands in for the GL-object creation that must happen on the context thread.

pub struct Texture {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
    ready: bool,
}

impl Texture {
    pub fn new(
        name: String,
        width: u32,
        height: u32,
        rgba: Vec<u8>,
    ) -> Self {
        debug_assert_eq!(rgba.len(), (width * height * 4) as usize);
        Texture {
            name,
            width,
            height,
            rgba,
            ready: false,
        }
    }

    /// The visibly-wrong stand-in used when an asset failed to load: a 2x2 magenta
    /// texture.
    pub fn placeholder(name: &str) -> Self {
        let magenta = [0xff, 0x00, 0xff, 0xff];
        Texture::new(name.to_string(), 2, 2, magenta.repeat(4))
    }

    pub fn setup(&mut self) {
        self.ready = true;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

pub struct Model {
    pub name: String,
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub tex_coords: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
    ready: bool,
}

impl Model {
    pub fn new(name: String) -> Self {
        Model {
            name,
            positions: Vec::default(),
            normals: Vec::default(),
            tex_coords: Vec::default(),
            indices: Vec::default(),
            ready: false,
        }
    }

    pub fn setup(&mut self) {
        self.ready = true;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

pub struct Skybox {
    pub name: String,
    pub faces: Vec<Texture>,
    ready: bool,
}

impl Skybox {
    pub fn new(
        name: String,
        faces: Vec<Texture>,
    ) -> Self {
        debug_assert_eq!(faces.len(), 6);
        Skybox {
            name,
            faces,
            ready: false,
        }
    }

    pub fn setup(&mut self) {
        self.ready = true;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

/// Registry of finished engine resources, keyed by name. Loaders publish into it from
/// the main thread; game code looks resources up by name.
#[derive(Default)]
pub struct GfxStore {
    textures: HashMap<String, Arc<Texture>>,
    models: HashMap<String, Arc<Model>>,
    skyboxes: HashMap<String, Arc<Skybox>>,
}

pub type SharedGfxStore = Arc<Mutex<GfxStore>>;

impl GfxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedGfxStore {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn insert_texture(
        &mut self,
        texture: Texture,
    ) {
        let old = self
            .textures
            .insert(texture.name.clone(), Arc::new(texture));
        if old.is_some() {
            log::warn!("texture registered twice, replacing the old one");
        }
    }

    pub fn insert_model(
        &mut self,
        model: Model,
    ) {
        let old = self.models.insert(model.name.clone(), Arc::new(model));
        if old.is_some() {
            log::warn!("model registered twice, replacing the old one");
        }
    }

    pub fn insert_skybox(
        &mut self,
        skybox: Skybox,
    ) {
        let old = self.skyboxes.insert(skybox.name.clone(), Arc::new(skybox));
        if old.is_some() {
            log::warn!("skybox registered twice, replacing the old one");
        }
    }

    pub fn texture(
        &self,
        name: &str,
    ) -> Option<Arc<Texture>> {
        self.textures.get(name).cloned()
    }

    pub fn model(
        &self,
        name: &str,
    ) -> Option<Arc<Model>> {
        self.models.get(name).cloned()
    }

    pub fn skybox(
        &self,
        name: &str,
    ) -> Option<Arc<Skybox>> {
        self.skyboxes.get(name).cloned()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn skybox_count(&self) -> usize {
        self.skyboxes.len()
    }
}
