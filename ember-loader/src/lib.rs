mod error;
mod gfx;
mod io;
mod manifest;
mod pipelines;
mod resource_loader;
mod staged_loader;

pub use error::{LoaderError, LoaderResult};
pub use gfx::{FlagContext, GfxContext, GfxStore, Model, SharedGfxStore, Skybox, Texture};
pub use io::{DiskReader, IoReader, MemoryReader};
pub use manifest::{Manifest, ManifestLoader};
pub use pipelines::{
    load_models, load_skyboxes, load_textures, AssetRef, AsyncModelsLoader, AsyncSkyboxLoader,
    AsyncTexturesLoader, ModelPipeline, SkyboxPipeline, SkyboxRef, TexturePipeline,
};
pub use resource_loader::{ApplyStatus, LoadBatch, LoadPhase, ResourceLoader, ResourcePipeline};
pub use staged_loader::{StageFlags, StagedLoader};

#[cfg(test)]
mod tests;
