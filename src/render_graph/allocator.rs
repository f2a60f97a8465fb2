//! Resolution tiering
//!
//! Decides which slots live at presentation resolution and which at the
//! internal render resolution:
//!
//! ```text
//!  module:   [0] ── [1] ── [p: resolution-changing] ── [p+1] ── ... ── [N-1]
//!  outputs:  render render        presentation / lazily decided by module
//!            └──── produced strictly before p ────┘
//! ```
//!
//! Slot 0 is always at presentation resolution.

use std::collections::BTreeSet;

use crate::backend::Extent2D;
use crate::error::PipelineResult;
use crate::render_graph::{Blueprint, ModuleRegistry, Slot};

/// Resolution decisions for one graph build.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionPlan {
    pub presentation: Extent2D,
    pub render: Extent2D,
    /// Blueprint index of the honored resolution-changing module.
    pub resolution_module: Option<usize>,
    /// Slots pre-allocated at `render`.
    pub render_slots: BTreeSet<Slot>,
}

impl ResolutionPlan {
    /// Plan without tiering: everything at presentation resolution.
    pub fn native(presentation: Extent2D) -> Self {
        Self {
            presentation,
            render: presentation,
            resolution_module: None,
            render_slots: BTreeSet::new(),
        }
    }

    pub fn compute(
        registry: &ModuleRegistry,
        blueprint: &Blueprint,
        presentation: Extent2D,
    ) -> PipelineResult<Self> {
        let mut plan = Self::native(presentation);
        let mut scale = 1.0_f32;

        for (index, spec) in blueprint.modules().iter().enumerate() {
            let descriptor = registry.lookup(&spec.name)?;
            let Some(module_scale) = descriptor.render_scale(&spec.attributes)? else {
                continue;
            };
            match plan.resolution_module {
                None => {
                    plan.resolution_module = Some(index);
                    scale = module_scale;
                }
                Some(first) => {
                    log::warn!(
                        "Module '{}' at {} changes resolution too; only the module at {} is honored",
                        spec.name,
                        index,
                        first
                    );
                }
            }
        }

        let Some(position) = plan.resolution_module else {
            return Ok(plan);
        };
        if scale.is_nan() || scale <= 0.0 || scale >= 1.0 {
            return Ok(plan);
        }

        plan.render = presentation.scaled(scale);
        plan.render_slots = blueprint.modules()[..position]
            .iter()
            .flat_map(|spec| spec.outputs.iter().copied())
            .filter(|slot| *slot != Slot::PRESENT)
            .collect();

        log::debug!(
            "Render resolution {} (scale {:.3}) for {} slot(s), presentation {}",
            plan.render,
            scale,
            plan.render_slots.len(),
            plan.presentation
        );
        Ok(plan)
    }

    /// True when some slots render below presentation resolution.
    pub fn is_tiered(&self) -> bool {
        self.render != self.presentation
    }

    /// Pre-allocation extent of `slot`, or `None` if the slot is left to its producer.
    pub fn extent_for(&self, slot: Slot) -> Option<Extent2D> {
        if slot == Slot::PRESENT {
            Some(self.presentation)
        } else if self.render_slots.contains(&slot) {
            Some(self.render)
        } else {
            None
        }
    }
}
