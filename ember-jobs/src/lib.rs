mod catalog;
mod handle;
mod system;
mod worker;

pub use catalog::JobCatalog;
pub use handle::JobHandle;
pub use system::JobSystem;
