//! Capability modules: discovery, dependency ordering, and guarded fan-out.

pub mod builtin;
pub mod commands;
pub mod pipeline;
pub mod registry;
pub mod traits;

pub use commands::{CommandContribution, CommandSpec, CommandSurface};
pub use pipeline::ExtensionPipeline;
pub use registry::{ExtensionRegistry, Manifest, Resolved};
pub use traits::{Extension, Hook, HookContext, ModuleDescriptor, Services};
