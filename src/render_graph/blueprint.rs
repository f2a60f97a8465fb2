//! Blueprint: the validated, immutable description of a world pipeline.
//!
//! A [`BlueprintDesc`] is the raw configuration (ordered module specs plus a
//! flat per-slot format list). [`Blueprint::build`] checks it against the
//! registry before any GPU object is created.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::backend::Format;
use crate::error::{PipelineError, PipelineResult, SlotDirection};
use crate::render_graph::registry::ModuleRegistry;

/// Index of one shared resource in the frame's resource table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot(pub u32);

impl Slot {
    /// The final presented output.
    pub const PRESENT: Slot = Slot(0);

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Slot {
    fn from(index: u32) -> Self {
        Slot(index)
    }
}

/// One module entry of the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub inputs: Vec<Slot>,
    pub outputs: Vec<Slot>,
}

impl ModuleSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, slot: u32) -> Self {
        self.inputs.push(Slot(slot));
        self
    }

    pub fn inputs(mut self, slots: impl IntoIterator<Item = u32>) -> Self {
        self.inputs.extend(slots.into_iter().map(Slot));
        self
    }

    pub fn output(mut self, slot: u32) -> Self {
        self.outputs.push(Slot(slot));
        self
    }

    pub fn outputs(mut self, slots: impl IntoIterator<Item = u32>) -> Self {
        self.outputs.extend(slots.into_iter().map(Slot));
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// Last value given for `key`, if any.
    pub fn attribute_value(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Raw configuration input of the blueprint builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlueprintDesc {
    pub modules: Vec<ModuleSpec>,
    /// Pixel format per slot, indexed by slot number.
    pub formats: Vec<Format>,
}

impl BlueprintDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module(mut self, spec: ModuleSpec) -> Self {
        self.modules.push(spec);
        self
    }

    pub fn formats(mut self, formats: impl IntoIterator<Item = Format>) -> Self {
        self.formats = formats.into_iter().collect();
        self
    }
}

/// Validated pipeline description. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blueprint {
    modules: Vec<ModuleSpec>,
    formats: Vec<Format>,
}

impl Blueprint {
    /// Validate `desc` against `registry`.
    ///
    /// Checks, in order: every module is registered, every module supplies
    /// exactly its declared number of input and output slots, the attributes
    /// a resolution-changing module derives its scale from parse, every slot
    /// has at most one producer, and the referenced slots are exactly `0..K`.
    pub fn build(registry: &ModuleRegistry, desc: &BlueprintDesc) -> PipelineResult<Self> {
        if desc.modules.is_empty() {
            return Err(PipelineError::EmptyBlueprint);
        }

        let mut referenced = BTreeSet::new();
        let mut producers: BTreeMap<Slot, &str> = BTreeMap::new();

        for spec in &desc.modules {
            let descriptor = registry.lookup(&spec.name)?;

            check_count(&spec.name, SlotDirection::Input, descriptor.input_count(), spec.inputs.len())?;
            check_count(&spec.name, SlotDirection::Output, descriptor.output_count(), spec.outputs.len())?;
            descriptor.render_scale(&spec.attributes)?;

            for slot in &spec.outputs {
                if let Some(first) = producers.insert(*slot, &spec.name) {
                    return Err(PipelineError::DuplicateProducer {
                        slot: *slot,
                        first: first.to_string(),
                        second: spec.name.clone(),
                    });
                }
            }

            referenced.extend(spec.inputs.iter().copied());
            referenced.extend(spec.outputs.iter().copied());
        }

        if referenced.is_empty() {
            return Err(PipelineError::EmptyBlueprint);
        }

        let mut formats = Vec::with_capacity(referenced.len());
        for (expected, slot) in referenced.iter().enumerate() {
            if slot.index() != expected {
                return Err(PipelineError::NonContiguousSlots {
                    missing: Slot(expected as u32),
                    next: *slot,
                });
            }
            let format = desc
                .formats
                .get(expected)
                .copied()
                .ok_or(PipelineError::MissingFormat { slot: *slot })?;
            formats.push(format);
        }

        if desc.formats.len() > formats.len() {
            log::warn!(
                "Blueprint supplies {} formats for {} slots, extra entries ignored",
                desc.formats.len(),
                formats.len()
            );
        }

        log::debug!(
            "Built blueprint with {} module(s) over {} slot(s)",
            desc.modules.len(),
            formats.len()
        );

        Ok(Self {
            modules: desc.modules.clone(),
            formats,
        })
    }

    /// Modules in execution order.
    pub fn modules(&self) -> &[ModuleSpec] {
        &self.modules
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Number of slots `K`; valid slots are `0..K`.
    pub fn slot_count(&self) -> usize {
        self.formats.len()
    }

    pub fn formats(&self) -> &[Format] {
        &self.formats
    }

    /// Format of `slot`. Every slot of a built blueprint has one.
    pub fn format(&self, slot: Slot) -> Format {
        self.formats[slot.index()]
    }

    /// Index of the module producing `slot`, if any.
    pub fn producer_of(&self, slot: Slot) -> Option<usize> {
        self.modules
            .iter()
            .position(|spec| spec.outputs.contains(&slot))
    }
}

fn check_count(module: &str, direction: SlotDirection, expected: usize, actual: usize) -> PipelineResult<()> {
    if expected != actual {
        return Err(PipelineError::SlotCountMismatch {
            module: module.to_string(),
            direction,
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_graph::module::tests::NullModule;
    use crate::render_graph::module::PipelineModule;

    fn registry() -> ModuleRegistry {
        fn null() -> Box<dyn PipelineModule> {
            Box::new(NullModule::default())
        }
        let mut registry = ModuleRegistry::new();
        registry.register("source", null, 0, 1).unwrap();
        registry.register("filter", null, 1, 1).unwrap();
        registry.register("merge", null, 2, 1).unwrap();
        registry
    }

    #[test]
    fn test_valid_blueprint() {
        let desc = BlueprintDesc::new()
            .module(ModuleSpec::new("source").output(1))
            .module(ModuleSpec::new("filter").input(1).output(0))
            .formats([Format::Rgba8Unorm, Format::Rgba16Float]);

        let blueprint = Blueprint::build(&registry(), &desc).unwrap();
        assert_eq!(blueprint.slot_count(), 2);
        assert_eq!(blueprint.format(Slot(1)), Format::Rgba16Float);
        assert_eq!(blueprint.producer_of(Slot(0)), Some(1));
    }

    #[test]
    fn test_unknown_module() {
        let desc = BlueprintDesc::new()
            .module(ModuleSpec::new("nope").output(0))
            .formats([Format::Rgba8Unorm]);

        assert!(matches!(
            Blueprint::build(&registry(), &desc),
            Err(PipelineError::UnknownModule { .. })
        ));
    }

    #[test]
    fn test_slot_count_mismatch() {
        let desc = BlueprintDesc::new()
            .module(ModuleSpec::new("merge").input(1).output(0))
            .formats([Format::Rgba8Unorm, Format::Rgba8Unorm]);

        assert!(matches!(
            Blueprint::build(&registry(), &desc),
            Err(PipelineError::SlotCountMismatch {
                direction: SlotDirection::Input,
                expected: 2,
                actual: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_non_contiguous_slots() {
        let desc = BlueprintDesc::new()
            .module(ModuleSpec::new("source").output(2))
            .module(ModuleSpec::new("filter").input(2).output(0))
            .formats([Format::Rgba8Unorm; 3]);

        assert!(matches!(
            Blueprint::build(&registry(), &desc),
            Err(PipelineError::NonContiguousSlots {
                missing: Slot(1),
                next: Slot(2)
            })
        ));
    }

    #[test]
    fn test_slot_zero_must_be_referenced() {
        let desc = BlueprintDesc::new()
            .module(ModuleSpec::new("source").output(1))
            .formats([Format::Rgba8Unorm; 2]);

        assert!(matches!(
            Blueprint::build(&registry(), &desc),
            Err(PipelineError::NonContiguousSlots { missing: Slot(0), .. })
        ));
    }

    #[test]
    fn test_missing_format() {
        let desc = BlueprintDesc::new()
            .module(ModuleSpec::new("source").output(1))
            .module(ModuleSpec::new("filter").input(1).output(0))
            .formats([Format::Rgba8Unorm]);

        assert!(matches!(
            Blueprint::build(&registry(), &desc),
            Err(PipelineError::MissingFormat { slot: Slot(1) })
        ));
    }

    #[test]
    fn test_extra_formats_are_projected_away() {
        let desc = BlueprintDesc::new()
            .module(ModuleSpec::new("source").output(0))
            .formats([Format::Bgra8Unorm, Format::R32Float, Format::R32Float]);

        let blueprint = Blueprint::build(&registry(), &desc).unwrap();
        assert_eq!(blueprint.formats(), &[Format::Bgra8Unorm]);
    }

    #[test]
    fn test_duplicate_producer() {
        let desc = BlueprintDesc::new()
            .module(ModuleSpec::new("source").output(0))
            .module(ModuleSpec::new("source").output(0))
            .formats([Format::Rgba8Unorm]);

        assert!(matches!(
            Blueprint::build(&registry(), &desc),
            Err(PipelineError::DuplicateProducer { slot: Slot(0), .. })
        ));
    }

    #[test]
    fn test_empty_blueprint() {
        assert!(matches!(
            Blueprint::build(&registry(), &BlueprintDesc::new()),
            Err(PipelineError::EmptyBlueprint)
        ));
    }

    #[test]
    fn test_attribute_value_takes_last() {
        let spec = ModuleSpec::new("filter")
            .attribute("k", "1")
            .attribute("k", "2");
        assert_eq!(spec.attribute_value("k"), Some("2"));
        assert_eq!(spec.attribute_value("missing"), None);
    }
}
