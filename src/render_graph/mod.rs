//! Render graph composition
//!
//! A blueprint names an ordered list of modules and wires them through
//! numbered slots. The graph builder turns it into a [`WorldPipeline`] whose
//! frame contexts record every module's work with explicit barriers.

pub mod allocator;
pub mod blueprint;
pub mod executor;
pub mod graph;
pub mod module;
pub mod registry;
pub mod resource;

pub use allocator::*;
pub use blueprint::*;
pub use executor::*;
pub use graph::*;
pub use module::*;
pub use registry::*;
pub use resource::*;
