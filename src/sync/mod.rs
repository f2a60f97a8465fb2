//! Resource synchronization
//!
//! State tags, barrier descriptions and the tracker that owns the tags.

pub mod barrier;
pub mod state;
pub mod tracker;

pub use barrier::*;
pub use state::*;
pub use tracker::*;
