use crate::gfx::{GfxContext, Model, Skybox, Texture};
use crate::io::IoReader;
use crate::pipelines::{decode_skybox_faces, decode_texture, parse_obj, AssetRef, SkyboxRef};
use crate::staged_loader::{StageFlags, StagedLoader};
use crate::{LoaderResult, SharedGfxStore};
use ember_jobs::JobSystem;
use std::sync::{Arc, Mutex};

/// Declarative description of the assets one loading pass brings in.
///
/// ```json
/// {
///     "textures": [{ "name": "crate", "path": "textures/crate.png" }],
///     "models": [{ "name": "cube", "path": "models/cube.obj" }],
///     "skyboxes": [{ "name": "day", "faces": ["sky/px.png", "..."] }]
/// }
/// ```
#[derive(Debug, Default, serde::Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub textures: Vec<AssetRef>,
    #[serde(default)]
    pub models: Vec<AssetRef>,
    #[serde(default)]
    pub skyboxes: Vec<SkyboxRef>,
}

impl Manifest {
    pub fn load(
        reader: &dyn IoReader,
        path: &str,
    ) -> LoaderResult<Manifest> {
        let json = reader.get_string(path)?;
        let manifest: Manifest = serde_json::from_str(&json)?;
        log::debug!(
            "manifest {}: {} textures, {} models, {} skyboxes",
            path,
            manifest.textures.len(),
            manifest.models.len(),
            manifest.skyboxes.len()
        );
        Ok(manifest)
    }

    pub fn asset_count(&self) -> usize {
        self.textures.len() + self.models.len() + self.skyboxes.len()
    }
}

// Stage layout of the manifest pipeline
const STAGE_DECODE: u32 = 0;
const STAGE_CREATE: u32 = 1;

// Hand-off cell between a decode task (worker thread) and its create task (main
// thread). The stage barrier orders the accesses; the mutex makes the hand-off safe.
type DecodeCell<T> = Arc<Mutex<Option<T>>>;

/// Drives a whole [`Manifest`] through a two-stage [`StagedLoader`]: a job-parallel
/// decode stage, then a main-thread create stage throttled to `creates_per_frame`
/// engine objects per `update` call.
pub struct ManifestLoader {
    staged: StagedLoader,
}

impl ManifestLoader {
    pub fn new(
        manifest: Manifest,
        reader: Arc<dyn IoReader>,
        store: SharedGfxStore,
        creates_per_frame: usize,
    ) -> Self {
        let mut staged = StagedLoader::new("manifest load");
        staged.add_stage(
            "decode",
            STAGE_DECODE,
            0,
            StageFlags {
                silent: false,
                use_jobs: true,
            },
        );
        staged.add_stage(
            "create",
            STAGE_CREATE,
            creates_per_frame,
            StageFlags {
                silent: false,
                use_jobs: false,
            },
        );

        for asset in manifest.textures {
            Self::queue_texture(&mut staged, asset, &reader, &store);
        }
        for asset in manifest.models {
            Self::queue_model(&mut staged, asset, &reader, &store);
        }
        for skybox in manifest.skyboxes {
            Self::queue_skybox(&mut staged, skybox, &reader, &store);
        }

        ManifestLoader { staged }
    }

    fn queue_texture(
        staged: &mut StagedLoader,
        asset: AssetRef,
        reader: &Arc<dyn IoReader>,
        store: &SharedGfxStore,
    ) {
        let cell: DecodeCell<Texture> = Arc::default();

        let decode_cell = cell.clone();
        let decode_reader = reader.clone();
        let decode_asset = asset.clone();
        staged.enqueue(
            STAGE_DECODE,
            move || {
                let decoded = decode_reader
                    .get_bytes(&decode_asset.path)
                    .and_then(|bytes| decode_texture(&decode_asset.name, &bytes));
                match decoded {
                    Ok(texture) => *decode_cell.lock().unwrap() = Some(texture),
                    Err(e) => log::warn!("texture {} decode failed: {}", decode_asset.name, e),
                }
            },
            &format!("decode texture {}", asset.name),
        );

        let create_store = store.clone();
        let create_name = asset.name.clone();
        staged.enqueue(
            STAGE_CREATE,
            move || {
                let mut texture = cell.lock().unwrap().take().unwrap_or_else(|| {
                    log::warn!("texture {} missing, using placeholder", create_name);
                    Texture::placeholder(&create_name)
                });
                texture.setup();
                create_store.lock().unwrap().insert_texture(texture);
            },
            &format!("create texture {}", asset.name),
        );
    }

    fn queue_model(
        staged: &mut StagedLoader,
        asset: AssetRef,
        reader: &Arc<dyn IoReader>,
        store: &SharedGfxStore,
    ) {
        let cell: DecodeCell<Model> = Arc::default();

        let decode_cell = cell.clone();
        let decode_reader = reader.clone();
        let decode_asset = asset.clone();
        staged.enqueue(
            STAGE_DECODE,
            move || {
                let parsed = decode_reader
                    .get_string(&decode_asset.path)
                    .and_then(|text| parse_obj(&decode_asset.name, &text));
                match parsed {
                    Ok(model) => *decode_cell.lock().unwrap() = Some(model),
                    Err(e) => log::error!("model {} parse failed: {}", decode_asset.name, e),
                }
            },
            &format!("decode model {}", asset.name),
        );

        let create_store = store.clone();
        let create_name = asset.name.clone();
        staged.enqueue(
            STAGE_CREATE,
            move || match cell.lock().unwrap().take() {
                Some(mut model) => {
                    model.setup();
                    create_store.lock().unwrap().insert_model(model);
                }
                // No placeholder model, the object is just visibly absent
                None => log::error!("model {} failed to load", create_name),
            },
            &format!("create model {}", asset.name),
        );
    }

    fn queue_skybox(
        staged: &mut StagedLoader,
        skybox: SkyboxRef,
        reader: &Arc<dyn IoReader>,
        store: &SharedGfxStore,
    ) {
        let cell: DecodeCell<Skybox> = Arc::default();

        let decode_cell = cell.clone();
        let decode_reader = reader.clone();
        let decode_skybox = skybox.clone();
        staged.enqueue(
            STAGE_DECODE,
            move || {
                let decoded = decode_skybox_faces(&decode_skybox, &*decode_reader);
                match decoded {
                    Ok(faces) => {
                        *decode_cell.lock().unwrap() =
                            Some(Skybox::new(decode_skybox.name.clone(), faces))
                    }
                    Err(e) => log::error!("skybox {} decode failed: {}", decode_skybox.name, e),
                }
            },
            &format!("decode skybox {}", skybox.name),
        );

        let create_store = store.clone();
        let create_name = skybox.name.clone();
        staged.enqueue(
            STAGE_CREATE,
            move || match cell.lock().unwrap().take() {
                Some(mut skybox) => {
                    skybox.setup();
                    create_store.lock().unwrap().insert_skybox(skybox);
                }
                None => log::error!("skybox {} failed to load", create_name),
            },
            &format!("create skybox {}", skybox.name),
        );
    }

    pub fn start(
        &mut self,
        jobs: &JobSystem,
    ) {
        self.staged.start(jobs);
    }

    /// Per-frame drive. Returns true once every asset has been decoded and created (or
    /// recorded as a failure).
    pub fn update(
        &mut self,
        jobs: &JobSystem,
        context: &dyn GfxContext,
    ) -> bool {
        self.staged.update(jobs, context)
    }

    pub fn is_done(&self) -> bool {
        self.staged.is_done()
    }

    pub fn progress(&self) -> (u64, u64) {
        self.staged.progress()
    }
}
