//! Error types for pipeline configuration, graph construction and frame recording

use crate::backend::{BackendError, Format, ImageHandle};
use crate::render_graph::Slot;
use crate::sync::ResourceId;
use std::fmt;
use thiserror::Error;

/// Which side of a module a slot list belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotDirection {
    Input,
    Output,
}

impl fmt::Display for SlotDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotDirection::Input => write!(f, "input"),
            SlotDirection::Output => write!(f, "output"),
        }
    }
}

/// Configuration and resource-resolution errors.
///
/// Everything raised while building a blueprint is a configuration error and is
/// detected before any GPU object exists. Everything raised while building the
/// world pipeline aborts that build; the caller keeps its previous pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unknown module '{name}'")]
    UnknownModule { name: String },
    #[error("Module '{name}' is already registered")]
    DuplicateModule { name: String },
    #[error("Blueprint references no modules or no slots")]
    EmptyBlueprint,
    #[error("Module '{module}' declares {expected} {direction} slot(s) but {actual} were supplied")]
    SlotCountMismatch {
        module: String,
        direction: SlotDirection,
        expected: usize,
        actual: usize,
    },
    #[error("Slot indices are not contiguous: slot {missing} is never referenced but slot {next} is")]
    NonContiguousSlots { missing: Slot, next: Slot },
    #[error("No pixel format supplied for slot {slot}")]
    MissingFormat { slot: Slot },
    #[error("Slot {slot} is produced by both '{first}' and '{second}'")]
    DuplicateProducer {
        slot: Slot,
        first: String,
        second: String,
    },
    #[error("Module '{module}' rejected attribute '{key}' = '{value}'")]
    InvalidAttribute {
        module: String,
        key: String,
        value: String,
    },
    #[error("Module '{module}' could not set or create its output images for frame {frame}")]
    OutputResourceMismatch { module: String, frame: usize },
    #[error("Module '{module}' could not set or create its input images for frame {frame}")]
    InputResourceMismatch { module: String, frame: usize },
    #[error("Module '{module}' left output slot {slot} unresolved for frame {frame}")]
    UnresolvedOutput {
        module: String,
        slot: Slot,
        frame: usize,
    },
    #[error("Module '{module}' left input slot {slot} unresolved for frame {frame}")]
    UnresolvedInput {
        module: String,
        slot: Slot,
        frame: usize,
    },
    #[error("Slot {slot} expects format {expected} but module '{module}' bound {actual}")]
    FormatMismatch {
        module: String,
        slot: Slot,
        expected: Format,
        actual: Format,
    },
    #[error("Module '{module}' replaced the image already bound to slot {slot} (frame {frame})")]
    SlotRebound {
        module: String,
        slot: Slot,
        frame: usize,
    },
    #[error("Module '{module}' produced {actual} frame contexts, expected {expected}")]
    ContextCountMismatch {
        module: String,
        expected: usize,
        actual: usize,
    },
    #[error("No blueprint has been installed")]
    NoBlueprint,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// A problem noticed while recording a frame.
///
/// These are never fatal: the frame context logs them and skips the module
/// step that raised them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderAnomaly {
    #[error("resource {0:?} is not tracked")]
    UntrackedResource(ResourceId),
    #[error("module '{module}' has no {what} bound")]
    MissingResource { module: String, what: String },
    #[error("image {0:?} is no longer alive")]
    StaleImage(ImageHandle),
}

impl RenderAnomaly {
    pub fn missing(module: &str, what: &str) -> Self {
        RenderAnomaly::MissingResource {
            module: module.to_string(),
            what: what.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::NonContiguousSlots {
            missing: Slot(1),
            next: Slot(2),
        };
        assert_eq!(
            err.to_string(),
            "Slot indices are not contiguous: slot 1 is never referenced but slot 2 is"
        );

        let err = PipelineError::SlotCountMismatch {
            module: "bloom".into(),
            direction: SlotDirection::Input,
            expected: 1,
            actual: 2,
        };
        assert_eq!(
            err.to_string(),
            "Module 'bloom' declares 1 input slot(s) but 2 were supplied"
        );

        let anomaly = RenderAnomaly::missing("bloom", "output image");
        assert_eq!(anomaly.to_string(), "module 'bloom' has no output image bound");
    }

    #[test]
    fn test_backend_error_converts() {
        let err: PipelineError = BackendError::OutOfMemory.into();
        assert!(matches!(err, PipelineError::Backend(BackendError::OutOfMemory)));
    }
}
