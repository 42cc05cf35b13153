use crate::gfx::{Model, Skybox, Texture};
use crate::io::IoReader;
use crate::resource_loader::{ApplyStatus, LoadBatch, ResourceLoader, ResourcePipeline};
use crate::{LoaderError, LoaderResult, SharedGfxStore};
use ember_jobs::JobSystem;
use std::sync::Arc;

/// One named asset in the manifest, resolved through an [`IoReader`] path.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct AssetRef {
    pub name: String,
    pub path: String,
}

/// A skybox is six face images, in +x/-x/+y/-y/+z/-z order.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct SkyboxRef {
    pub name: String,
    pub faces: Vec<String>,
}

pub(crate) fn decode_texture(
    name: &str,
    bytes: &[u8],
) -> LoaderResult<Texture> {
    profiling::scope!("decode_texture");
    let decoded = image::load_from_memory(bytes)?.to_rgba8();
    Ok(Texture::new(
        name.to_string(),
        decoded.width(),
        decoded.height(),
        decoded.into_raw(),
    ))
}

/// Parses the subset of Wavefront OBJ the engine's models use: v/vt/vn records and
/// triangulated (fan) f records with `v`, `v/vt`, `v//vn` or `v/vt/vn` references.
pub(crate) fn parse_obj(
    name: &str,
    text: &str,
) -> LoaderResult<Model> {
    profiling::scope!("parse_obj");

    let mut positions: Vec<[f32; 3]> = Vec::default();
    let mut tex_coords: Vec<[f32; 2]> = Vec::default();
    let mut normals: Vec<[f32; 3]> = Vec::default();
    let mut model = Model::new(name.to_string());

    fn parse_floats<const N: usize>(
        fragments: &[&str],
        line: &str,
    ) -> LoaderResult<[f32; N]> {
        if fragments.len() < N {
            return Err(format!("malformed record: {}", line).into());
        }
        let mut out = [0.0; N];
        for i in 0..N {
            out[i] = fragments[i]
                .parse::<f32>()
                .map_err(|_| LoaderError::from(format!("malformed number in: {}", line)))?;
        }
        Ok(out)
    }

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fragments: Vec<&str> = line.split_whitespace().collect();
        match fragments[0] {
            "v" => positions.push(parse_floats::<3>(&fragments[1..], line)?),
            "vt" => tex_coords.push(parse_floats::<2>(&fragments[1..], line)?),
            "vn" => normals.push(parse_floats::<3>(&fragments[1..], line)?),
            "f" => {
                let corners = &fragments[1..];
                if corners.len() < 3 {
                    return Err(format!("face with fewer than 3 vertices: {}", line).into());
                }

                let mut emit = |corner: &str| -> LoaderResult<()> {
                    let indices: Vec<&str> = corner.split('/').collect();

                    let lookup = |list_len: usize, fragment: &str| -> LoaderResult<usize> {
                        let index: i64 = fragment
                            .parse()
                            .map_err(|_| LoaderError::from(format!("bad face index: {}", line)))?;
                        // OBJ indices are 1-based
                        if index < 1 || index as usize > list_len {
                            return Err(format!("face index out of range: {}", line).into());
                        }
                        Ok(index as usize - 1)
                    };

                    let position = positions[lookup(positions.len(), indices[0])?];
                    let tex_coord = match indices.get(1) {
                        Some(fragment) if !fragment.is_empty() => {
                            tex_coords[lookup(tex_coords.len(), fragment)?]
                        }
                        _ => [0.0, 0.0],
                    };
                    let normal = match indices.get(2) {
                        Some(fragment) if !fragment.is_empty() => {
                            normals[lookup(normals.len(), fragment)?]
                        }
                        _ => [0.0, 0.0, 0.0],
                    };

                    model.indices.push(model.positions.len() as u32);
                    model.positions.push(position);
                    model.tex_coords.push(tex_coord);
                    model.normals.push(normal);
                    Ok(())
                };

                // Triangle fan around the first corner
                for i in 2..corners.len() {
                    emit(corners[0])?;
                    emit(corners[i - 1])?;
                    emit(corners[i])?;
                }
            }
            // mtllib/usemtl/o/g/s records are not used by this engine
            _ => {}
        }
    }

    if model.indices.is_empty() {
        return Err(format!("model {} has no faces", name).into());
    }

    Ok(model)
}

pub(crate) fn decode_skybox_faces(
    skybox: &SkyboxRef,
    reader: &dyn IoReader,
) -> LoaderResult<Vec<Texture>> {
    if skybox.faces.len() != 6 {
        return Err(format!(
            "skybox {} has {} faces, expected 6",
            skybox.name,
            skybox.faces.len()
        )
        .into());
    }

    let mut faces = Vec::with_capacity(6);
    for (face_index, path) in skybox.faces.iter().enumerate() {
        let bytes = reader.get_bytes(path)?;
        faces.push(decode_texture(
            &format!("{}:{}", skybox.name, face_index),
            &bytes,
        )?);
    }
    Ok(faces)
}

/// Decodes png/jpeg bytes on worker threads and creates [`Texture`] objects on the main
/// thread. A missing or undecodable file publishes the magenta placeholder instead of
/// blocking the batch.
pub struct TexturePipeline {
    store: SharedGfxStore,
}

impl TexturePipeline {
    pub fn new(store: SharedGfxStore) -> Self {
        TexturePipeline { store }
    }
}

impl ResourcePipeline for TexturePipeline {
    type Input = AssetRef;
    type Output = Texture;

    fn decode(
        &self,
        input: &AssetRef,
        reader: &dyn IoReader,
    ) -> LoaderResult<Texture> {
        let bytes = reader.get_bytes(&input.path)?;
        decode_texture(&input.name, &bytes)
    }

    fn apply(
        &self,
        _input: &AssetRef,
        output: &mut Texture,
    ) -> ApplyStatus {
        output.setup();
        ApplyStatus::Loaded
    }

    fn publish(
        &self,
        results: Vec<(AssetRef, Option<Texture>)>,
    ) {
        let mut store = self.store.lock().unwrap();
        for (input, output) in results {
            let texture = output.unwrap_or_else(|| {
                log::warn!("texture {} failed to load, using placeholder", input.name);
                let mut placeholder = Texture::placeholder(&input.name);
                placeholder.setup();
                placeholder
            });
            store.insert_texture(texture);
        }
    }
}

/// Parses OBJ text on worker threads and creates [`Model`] objects on the main thread.
/// There is no placeholder model; a failed model is logged and simply absent from the
/// store.
pub struct ModelPipeline {
    store: SharedGfxStore,
}

impl ModelPipeline {
    pub fn new(store: SharedGfxStore) -> Self {
        ModelPipeline { store }
    }
}

impl ResourcePipeline for ModelPipeline {
    type Input = AssetRef;
    type Output = Model;

    fn decode(
        &self,
        input: &AssetRef,
        reader: &dyn IoReader,
    ) -> LoaderResult<Model> {
        let text = reader.get_string(&input.path)?;
        parse_obj(&input.name, &text)
    }

    fn apply(
        &self,
        _input: &AssetRef,
        output: &mut Model,
    ) -> ApplyStatus {
        output.setup();
        ApplyStatus::Loaded
    }

    fn publish(
        &self,
        results: Vec<(AssetRef, Option<Model>)>,
    ) {
        let mut store = self.store.lock().unwrap();
        for (input, output) in results {
            match output {
                Some(model) => store.insert_model(model),
                None => log::error!("model {} failed to load", input.name),
            }
        }
    }
}

/// Decodes the six face images of each skybox on worker threads.
pub struct SkyboxPipeline {
    store: SharedGfxStore,
}

impl SkyboxPipeline {
    pub fn new(store: SharedGfxStore) -> Self {
        SkyboxPipeline { store }
    }
}

impl ResourcePipeline for SkyboxPipeline {
    type Input = SkyboxRef;
    type Output = Skybox;

    fn decode(
        &self,
        input: &SkyboxRef,
        reader: &dyn IoReader,
    ) -> LoaderResult<Skybox> {
        let faces = decode_skybox_faces(input, reader)?;
        Ok(Skybox::new(input.name.clone(), faces))
    }

    fn apply(
        &self,
        _input: &SkyboxRef,
        output: &mut Skybox,
    ) -> ApplyStatus {
        output.setup();
        ApplyStatus::Loaded
    }

    fn publish(
        &self,
        results: Vec<(SkyboxRef, Option<Skybox>)>,
    ) {
        let mut store = self.store.lock().unwrap();
        for (input, output) in results {
            match output {
                Some(skybox) => store.insert_skybox(skybox),
                None => log::error!("skybox {} failed to load", input.name),
            }
        }
    }
}

pub type AsyncTexturesLoader = ResourceLoader<TexturePipeline>;
pub type AsyncModelsLoader = ResourceLoader<ModelPipeline>;
pub type AsyncSkyboxLoader = ResourceLoader<SkyboxPipeline>;

pub fn load_textures(
    jobs: &JobSystem,
    reader: Arc<dyn IoReader>,
    store: SharedGfxStore,
    resources: Vec<AssetRef>,
) -> AsyncTexturesLoader {
    ResourceLoader::new(
        LoadBatch {
            name: "textures".to_string(),
            id_prefix: "textures".to_string(),
            resources,
            reader,
            pipeline: Arc::new(TexturePipeline::new(store)),
        },
        jobs,
    )
}

pub fn load_models(
    jobs: &JobSystem,
    reader: Arc<dyn IoReader>,
    store: SharedGfxStore,
    resources: Vec<AssetRef>,
) -> AsyncModelsLoader {
    ResourceLoader::new(
        LoadBatch {
            name: "models".to_string(),
            id_prefix: "models".to_string(),
            resources,
            reader,
            pipeline: Arc::new(ModelPipeline::new(store)),
        },
        jobs,
    )
}

pub fn load_skyboxes(
    jobs: &JobSystem,
    reader: Arc<dyn IoReader>,
    store: SharedGfxStore,
    resources: Vec<SkyboxRef>,
) -> AsyncSkyboxLoader {
    ResourceLoader::new(
        LoadBatch {
            name: "skyboxes".to_string(),
            id_prefix: "skyboxes".to_string(),
            resources,
            reader,
            pipeline: Arc::new(SkyboxPipeline::new(store)),
        },
        jobs,
    )
}
