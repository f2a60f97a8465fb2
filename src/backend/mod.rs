//! Backend abstraction layer
//!
//! Provides the GPU backend trait the graph records into, the recording
//! backend used for tests and inspection, and Vulkan barrier emission.

pub mod recording;
pub mod traits;
pub mod types;

#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use recording::*;
pub use traits::*;
pub use types::*;
