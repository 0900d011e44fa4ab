pub mod error;
pub mod flux;
pub mod loader;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod reclaim;
pub mod registry;
pub mod remote;
mod remover;
pub mod session;
mod util;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::*;
pub use flux::{FluxPipeline, FluxVariant};
pub use loader::*;
pub use normalize::*;
pub use orchestrator::*;
pub use pipeline::*;
pub use reclaim::*;
pub use registry::*;
pub use remote::*;
pub use remover::SamRemover;
pub use session::*;
pub(crate) use util::*;
