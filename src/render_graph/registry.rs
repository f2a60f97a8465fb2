//! Module registry
//!
//! Maps a module name to its constructor and declared slot counts. The registry
//! is an ordinary value: populate it once at startup and pass it by reference
//! to the blueprint builder and the graph builder.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{PipelineError, PipelineResult};
use crate::render_graph::module::{Attributes, PipelineModule};

/// Creates a fresh module instance.
pub type ModuleConstructor = Arc<dyn Fn() -> Box<dyn PipelineModule> + Send + Sync>;

/// Maps a resolution-changing module's attributes to its render scale.
///
/// A returned scale below 1.0 makes everything upstream of the module render at
/// the reduced resolution. Attributes that cannot be parsed are an error.
pub type RenderScaleFn = fn(&Attributes) -> PipelineResult<f32>;

/// Process-wide teardown run once when the pipeline closes.
pub type ShutdownHook = fn();

/// Immutable description of a registered module type.
#[derive(Clone)]
pub struct ModuleDescriptor {
    name: String,
    input_count: usize,
    output_count: usize,
    constructor: ModuleConstructor,
    render_scale: Option<RenderScaleFn>,
    shutdown: Option<ShutdownHook>,
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("input_count", &self.input_count)
            .field("output_count", &self.output_count)
            .field("resolution_changing", &self.render_scale.is_some())
            .field("has_shutdown_hook", &self.shutdown.is_some())
            .finish()
    }
}

impl ModuleDescriptor {
    pub fn new<F>(name: impl Into<String>, constructor: F, input_count: usize, output_count: usize) -> Self
    where
        F: Fn() -> Box<dyn PipelineModule> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            input_count,
            output_count,
            constructor: Arc::new(constructor),
            render_scale: None,
            shutdown: None,
        }
    }

    /// Mark this module type as resolution-changing.
    pub fn with_render_scale(mut self, render_scale: RenderScaleFn) -> Self {
        self.render_scale = Some(render_scale);
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownHook) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn output_count(&self) -> usize {
        self.output_count
    }

    pub fn is_resolution_changing(&self) -> bool {
        self.render_scale.is_some()
    }

    /// Render scale for the given attributes, if this module changes resolution.
    pub fn render_scale(&self, attributes: &Attributes) -> PipelineResult<Option<f32>> {
        self.render_scale.map(|scale| scale(attributes)).transpose()
    }

    /// Instantiate a new module.
    pub fn construct(&self) -> Box<dyn PipelineModule> {
        (self.constructor)()
    }
}

/// Name -> descriptor lookup table.
#[derive(Debug, Default, Clone)]
pub struct ModuleRegistry {
    descriptors: BTreeMap<String, ModuleDescriptor>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every module shipped with this crate.
    pub fn with_builtin_modules() -> Self {
        Self {
            descriptors: crate::pipeline::builtin_module_descriptors()
                .into_iter()
                .map(|descriptor| (descriptor.name().to_string(), descriptor))
                .collect(),
        }
    }

    /// Register a module type by name.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        constructor: F,
        input_count: usize,
        output_count: usize,
    ) -> PipelineResult<()>
    where
        F: Fn() -> Box<dyn PipelineModule> + Send + Sync + 'static,
    {
        self.register_descriptor(ModuleDescriptor::new(name, constructor, input_count, output_count))
    }

    /// Register a fully configured descriptor.
    pub fn register_descriptor(&mut self, descriptor: ModuleDescriptor) -> PipelineResult<()> {
        if self.descriptors.contains_key(descriptor.name()) {
            return Err(PipelineError::DuplicateModule {
                name: descriptor.name().to_string(),
            });
        }
        log::debug!(
            "Registered module '{}' ({} in, {} out)",
            descriptor.name(),
            descriptor.input_count(),
            descriptor.output_count()
        );
        self.descriptors.insert(descriptor.name().to_string(), descriptor);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> PipelineResult<&ModuleDescriptor> {
        self.descriptors
            .get(name)
            .ok_or_else(|| PipelineError::UnknownModule {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Run every registered shutdown hook, in name order.
    pub fn run_shutdown_hooks(&self) {
        for descriptor in self.descriptors.values() {
            if let Some(shutdown) = descriptor.shutdown {
                log::info!("Running shutdown hook of module '{}'", descriptor.name());
                shutdown();
            }
        }
    }
}
