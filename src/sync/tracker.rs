//! Per-resource state tracking and barrier emission.
//!
//! Every image and buffer the graph knows about carries exactly one
//! [`ResourceState`] tag here. The only way to change a tag is [`transition`],
//! which reads the current tag, decides whether a barrier is required, and
//! overwrites the tag with the requested state:
//!
//! ```text
//!   current tag ──┐
//!                 ├── needs_barrier? ──yes──► Barrier { src: current, dst: required }
//!   required    ──┘         │
//!                           └──────────────► tag := required
//! ```
//!
//! [`transition`]: ResourceStateTracker::transition

use std::collections::HashMap;

use crate::error::RenderAnomaly;
use crate::sync::barrier::{needs_barrier, Barrier, ResourceId};
use crate::sync::state::ResourceState;

/// Owns the state tag of every tracked resource.
#[derive(Debug, Default)]
pub struct ResourceStateTracker {
    states: HashMap<ResourceId, ResourceState>,
}

impl ResourceStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a resource. New GPU objects start as `UNDEFINED`.
    pub fn register(&mut self, resource: impl Into<ResourceId>, initial: ResourceState) {
        let resource = resource.into();
        if self.states.insert(resource, initial).is_some() {
            log::warn!("Resource {:?} registered twice, state reset", resource);
        }
    }

    /// Stop tracking a resource that is about to be destroyed.
    pub fn forget(&mut self, resource: impl Into<ResourceId>) -> Option<ResourceState> {
        self.states.remove(&resource.into())
    }

    pub fn state(&self, resource: impl Into<ResourceId>) -> Option<ResourceState> {
        self.states.get(&resource.into()).copied()
    }

    pub fn is_tracked(&self, resource: impl Into<ResourceId>) -> bool {
        self.states.contains_key(&resource.into())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Move `resource` into `required`, returning the barrier to record if one is needed.
    ///
    /// The tag is updated whether or not a barrier was produced, so the caller
    /// must record the returned barrier before touching the resource.
    pub fn transition(
        &mut self,
        resource: impl Into<ResourceId>,
        required: ResourceState,
    ) -> Result<Option<Barrier>, RenderAnomaly> {
        let resource = resource.into();
        let current = self
            .states
            .get_mut(&resource)
            .ok_or(RenderAnomaly::UntrackedResource(resource))?;

        if !needs_barrier(current, &required) {
            return Ok(None);
        }

        let barrier = Barrier {
            resource,
            src: *current,
            dst: required,
        };
        *current = required;
        Ok(Some(barrier))
    }

    /// Transition several resources as one batch.
    ///
    /// Either every resource is tracked and all tags are updated, or nothing
    /// changes and the first untracked resource is reported.
    pub fn transition_batch(
        &mut self,
        requests: &[(ResourceId, ResourceState)],
    ) -> Result<Vec<Barrier>, RenderAnomaly> {
        if let Some((missing, _)) = requests.iter().find(|(id, _)| !self.states.contains_key(id)) {
            return Err(RenderAnomaly::UntrackedResource(*missing));
        }

        let mut barriers = Vec::with_capacity(requests.len());
        for (resource, required) in requests {
            if let Some(barrier) = self.transition(*resource, *required)? {
                barriers.push(barrier);
            }
        }
        Ok(barriers)
    }
}
