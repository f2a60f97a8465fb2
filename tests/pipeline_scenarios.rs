//! End-to-end world pipeline scenarios against the recording backend

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use rstest::rstest;

use common::*;
use render_pipeline::backend::*;
use render_pipeline::error::PipelineError;
use render_pipeline::pipeline::{default_world_blueprint, QualityMode, BLOOM_MODULE_NAME, UPSCALER_MODULE_NAME};
use render_pipeline::render_graph::*;
use render_pipeline::sync::{Barrier, ResourceId, ResourceState};
use render_pipeline::{Pipeline, PipelineConfig};

const FMT_A: Format = Format::Rgba8Unorm;
const FMT_B: Format = Format::Rgba16Float;

/// m1 writes slot 0, m2 reads slot 0 and writes slot 1.
fn two_module_registry(log: &EventLog) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    register_probe(&mut registry, log, "m1", 0, 1);
    register_probe(&mut registry, log, "m2", 1, 1);
    registry
}

fn two_module_blueprint() -> BlueprintDesc {
    BlueprintDesc::new()
        .module(ModuleSpec::new("m1").output(0))
        .module(ModuleSpec::new("m2").input(0).output(1))
        .formats([FMT_A, FMT_B])
}

fn config(frames_in_flight: usize, width: u32, height: u32) -> PipelineConfig {
    PipelineConfig::new(frames_in_flight, Extent2D::new(width, height))
}

fn build_world(
    registry: &ModuleRegistry,
    desc: &BlueprintDesc,
    config: &PipelineConfig,
    backend: &mut RecordingBackend,
) -> WorldPipeline {
    let blueprint = Arc::new(Blueprint::build(registry, desc).unwrap());
    WorldPipeline::build(registry, blueprint, config, backend).unwrap()
}

#[test]
fn test_two_module_chain_shares_images() {
    init_logging();
    let log = event_log();
    let registry = two_module_registry(&log);
    let mut backend = RecordingBackend::new();

    let blueprint = Blueprint::build(&registry, &two_module_blueprint()).unwrap();
    assert_eq!(blueprint.slot_count(), 2);

    let world = build_world(&registry, &two_module_blueprint(), &config(2, 64, 64), &mut backend);

    // consumers are built before producers
    assert_eq!(events(&log, "build:"), vec!["m2", "m1"]);
    assert_eq!(world.build_order(), &[1, 0]);

    for frame in 0..2 {
        let m1_output = world.shared_image(Slot(0), frame).unwrap();
        assert_eq!(m1_output.format, FMT_A);
        assert_eq!(world.shared_image(Slot(1), frame).unwrap().format, FMT_B);
        assert_eq!(world.frame_context(frame).output(), Some(m1_output));

        // m2 reads exactly the image m1 writes
        let shared = vec![format!("{:?}", m1_output.handle)];
        assert_eq!(events(&log, &format!("output:m1@{}=", frame)), shared);
        assert_eq!(events(&log, &format!("input:m2@{}=", frame)), shared);
    }
    assert_ne!(
        world.shared_image(Slot(0), 0).unwrap().handle,
        world.shared_image(Slot(0), 1).unwrap().handle
    );
}

#[test]
fn test_frames_record_in_blueprint_order() {
    let log = event_log();
    let registry = two_module_registry(&log);
    let mut backend = RecordingBackend::new();
    let mut world = build_world(&registry, &two_module_blueprint(), &config(2, 64, 64), &mut backend);

    let report = world.render(0, &mut backend);
    assert!(report.is_complete());
    assert_eq!(report.executed, vec!["m1".to_string(), "m2".to_string()]);
    world.render(3, &mut backend);

    assert_eq!(events(&log, "render:"), vec!["m1@0", "m2@0", "m1@1", "m2@1"]);
    let output = report.output.unwrap();
    assert_eq!(world.resource_state(output.handle), Some(ResourceState::PRESENT));
}

#[rstest]
#[case::skipped_slot(
    BlueprintDesc::new()
        .module(ModuleSpec::new("m1").output(0))
        .module(ModuleSpec::new("m2").input(0).output(2))
        .formats([FMT_A, FMT_B, FMT_B])
)]
#[case::unknown_module(
    BlueprintDesc::new()
        .module(ModuleSpec::new("m1").output(0))
        .module(ModuleSpec::new("missing").input(0).output(1))
        .formats([FMT_A, FMT_B])
)]
#[case::too_many_inputs(
    BlueprintDesc::new()
        .module(ModuleSpec::new("m1").output(0))
        .module(ModuleSpec::new("m2").inputs([0, 1]).output(1))
        .formats([FMT_A, FMT_B])
)]
#[case::missing_format(
    BlueprintDesc::new()
        .module(ModuleSpec::new("m1").output(0))
        .module(ModuleSpec::new("m2").input(0).output(1))
        .formats([FMT_A])
)]
#[case::empty(BlueprintDesc::new())]
fn test_invalid_blueprint_allocates_nothing(#[case] desc: BlueprintDesc) {
    let log = event_log();
    let registry = two_module_registry(&log);
    let backend = RecordingBackend::new();
    let mut pipeline = Pipeline::new(PipelineConfig::default());

    assert!(pipeline.set_blueprint(&registry, &desc).is_err());
    assert!(pipeline.blueprint().is_none());
    assert!(!pipeline.needs_rebuild());
    assert_eq!(backend.live_object_count(), 0);
    assert!(log.lock().is_empty());
}

#[test]
fn test_non_contiguous_slots_are_reported() {
    let log = event_log();
    let registry = two_module_registry(&log);
    let desc = BlueprintDesc::new()
        .module(ModuleSpec::new("m1").output(0))
        .module(ModuleSpec::new("m2").input(0).output(2))
        .formats([FMT_A, FMT_B, FMT_B]);

    assert!(matches!(
        Blueprint::build(&registry, &desc),
        Err(PipelineError::NonContiguousSlots { missing: Slot(1), next: Slot(2) })
    ));
}

#[test]
fn test_unknown_module_is_reported_by_name() {
    let registry = ModuleRegistry::with_builtin_modules();
    let desc = BlueprintDesc::new()
        .module(ModuleSpec::new("denoiser").output(0))
        .formats([FMT_A]);

    match Blueprint::build(&registry, &desc) {
        Err(PipelineError::UnknownModule { name }) => assert_eq!(name, "denoiser"),
        other => panic!("expected UnknownModule, got {:?}", other.map(|b| b.module_count())),
    }
}

#[rstest]
#[case::unset(None, 1920, 1080)]
#[case::native_aa(Some(QualityMode::NativeAa), 1920, 1080)]
#[case::quality(Some(QualityMode::Quality), 1280, 720)]
#[case::balanced(Some(QualityMode::Balanced), 1129, 635)]
#[case::performance(Some(QualityMode::Performance), 960, 540)]
#[case::ultra_performance(Some(QualityMode::UltraPerformance), 640, 360)]
fn test_render_resolution_tiers(#[case] quality: Option<QualityMode>, #[case] width: u32, #[case] height: u32) {
    let registry = ModuleRegistry::with_builtin_modules();
    let mut backend = RecordingBackend::new();
    let presentation = Extent2D::new(1920, 1080);
    let mut desc = default_world_blueprint(quality.unwrap_or_default());
    if quality.is_none() {
        for spec in &mut desc.modules {
            spec.attributes.clear();
        }
    }
    let world = build_world(&registry, &desc, &PipelineConfig::new(2, presentation), &mut backend);

    let render = Extent2D::new(width, height);
    assert_eq!(world.render_extent(), render);
    assert_eq!(world.presentation_extent(), presentation);
    assert_eq!(world.resolution_plan().is_tiered(), render != presentation);

    for frame in 0..2 {
        for slot in 1..=6 {
            assert_eq!(world.shared_image(Slot(slot), frame).unwrap().extent, render);
        }
        for slot in [0, 7, 8] {
            assert_eq!(world.shared_image(Slot(slot), frame).unwrap().extent, presentation);
        }
    }
}

#[test]
fn test_unknown_quality_mode_is_rejected_before_allocation() {
    let registry = ModuleRegistry::with_builtin_modules();
    let backend = RecordingBackend::new();
    let mut desc = default_world_blueprint(QualityMode::Quality);
    desc.modules[1] = desc.modules[1]
        .clone()
        .attribute(attribute_key(UPSCALER_MODULE_NAME, "quality_mode"), "sharpest");
    let mut pipeline = Pipeline::new(config(2, 1920, 1080));

    match pipeline.set_blueprint(&registry, &desc) {
        Err(PipelineError::InvalidAttribute { module, value, .. }) => {
            assert_eq!(module, UPSCALER_MODULE_NAME);
            assert_eq!(value, "sharpest");
        }
        other => panic!("expected InvalidAttribute, got {:?}", other),
    }
    assert!(pipeline.blueprint().is_none());
    assert_eq!(backend.live_object_count(), 0);
}

#[test]
fn test_default_pipeline_renders_every_module() {
    init_logging();
    let registry = ModuleRegistry::with_builtin_modules();
    let mut backend = RecordingBackend::new();
    let mut world = build_world(
        &registry,
        &default_world_blueprint(QualityMode::Quality),
        &config(3, 1280, 720),
        &mut backend,
    );
    assert_eq!(world.build_order(), &[3, 2, 1, 0]);

    for frame in 0..6 {
        let report = world.render(frame, &mut backend);
        assert!(report.is_complete(), "frame {} skipped {:?}", frame, report.skipped);
        assert_eq!(report.executed, vec!["ray_tracing", "upscaler", "bloom", "tone_mapping"]);
        let output = report.output.unwrap();
        assert_eq!(world.resource_state(output.handle), Some(ResourceState::PRESENT));
    }
}

#[test]
fn test_barriers_chain_resource_states() {
    let registry = ModuleRegistry::with_builtin_modules();
    let mut backend = RecordingBackend::new();
    let mut world = build_world(
        &registry,
        &default_world_blueprint(QualityMode::Balanced),
        &config(2, 800, 600),
        &mut backend,
    );
    for frame in 0..4 {
        world.render(frame, &mut backend);
    }

    let barriers = backend.barriers();
    assert!(!barriers.is_empty());

    let mut last: HashMap<ResourceId, ResourceState> = HashMap::new();
    for barrier in &barriers {
        let previous = last.get(&barrier.resource).copied().unwrap_or(ResourceState::UNDEFINED);
        assert_eq!(barrier.src, previous, "broken state chain for {:?}", barrier.resource);
        assert!(barrier.src != barrier.dst || barrier.src.is_write());
        last.insert(barrier.resource, barrier.dst);
    }

    for (resource, state) in last {
        assert_eq!(world.resource_state(resource), Some(state));
    }
}

#[test]
fn test_rebuild_reproduces_slot_assignments() {
    let registry = ModuleRegistry::with_builtin_modules();
    let desc = default_world_blueprint(QualityMode::Performance);
    let config = config(3, 1600, 900);

    let mut first_backend = RecordingBackend::new();
    let first = build_world(&registry, &desc, &config, &mut first_backend);
    let mut second_backend = RecordingBackend::new();
    let second = build_world(&registry, &desc, &config, &mut second_backend);

    assert_eq!(first.slot_assignments(), second.slot_assignments());
    assert_eq!(first.slot_assignments().len(), 3 * 9);
    assert_eq!(first_backend.live_object_count(), second_backend.live_object_count());
}

#[test]
fn test_failed_rebuild_keeps_running_pipeline() {
    init_logging();
    let log = event_log();
    let registry = two_module_registry(&log);
    let mut backend = RecordingBackend::new();
    let mut pipeline = Pipeline::new(config(2, 64, 64));

    pipeline.set_blueprint(&registry, &two_module_blueprint()).unwrap();
    pipeline.rebuild(&registry, &mut backend, 0).unwrap();
    let presented = pipeline.world().unwrap().shared_image(Slot(0), 0).unwrap();
    let live_images = backend.live_image_count();

    backend.set_image_budget(Some(live_images + 1));
    pipeline.resize(Extent2D::new(128, 128));
    assert!(matches!(
        pipeline.rebuild(&registry, &mut backend, 1),
        Err(PipelineError::Backend(_))
    ));

    // the partial build was torn down and the old pipeline is untouched
    assert_eq!(backend.live_image_count(), live_images);
    assert!(pipeline.needs_rebuild());
    assert_eq!(pipeline.collector().pending_count(), 0);
    assert_eq!(pipeline.world().unwrap().shared_image(Slot(0), 0), Some(presented));
    assert!(pipeline.render(0, &mut backend).unwrap().is_complete());

    backend.set_image_budget(None);
    pipeline.rebuild(&registry, &mut backend, 1).unwrap();
    assert_eq!(
        pipeline.world().unwrap().presentation_extent(),
        Extent2D::new(128, 128)
    );
}

/// m1 writes slot 1, `faulty` reads slot 1 and writes slot 2, m2 reads
/// `m2_input` and presents.
fn faulty_blueprint(m2_input: u32) -> BlueprintDesc {
    BlueprintDesc::new()
        .module(ModuleSpec::new("m1").output(1))
        .module(ModuleSpec::new("faulty").input(1).output(2))
        .module(ModuleSpec::new("m2").input(m2_input).output(0))
        .formats([FMT_A, FMT_B, FMT_B])
}

fn error_kind(err: &PipelineError) -> &'static str {
    match err {
        PipelineError::OutputResourceMismatch { .. } => "OutputResourceMismatch",
        PipelineError::InputResourceMismatch { .. } => "InputResourceMismatch",
        PipelineError::UnresolvedOutput { .. } => "UnresolvedOutput",
        PipelineError::UnresolvedInput { .. } => "UnresolvedInput",
        PipelineError::FormatMismatch { .. } => "FormatMismatch",
        PipelineError::SlotRebound { .. } => "SlotRebound",
        PipelineError::ContextCountMismatch { .. } => "ContextCountMismatch",
        _ => "other",
    }
}

#[rstest]
#[case::rejected_outputs(Fault::RejectOutputs, 1, "OutputResourceMismatch")]
#[case::rejected_inputs(Fault::RejectInputs, 1, "InputResourceMismatch")]
#[case::unresolved_output(Fault::LeaveUnbound, 1, "UnresolvedOutput")]
#[case::unresolved_input(Fault::LeaveUnbound, 2, "UnresolvedInput")]
#[case::wrong_format(Fault::WrongFormat, 1, "FormatMismatch")]
#[case::rebound_input(Fault::RebindInputs, 1, "SlotRebound")]
#[case::extra_context(Fault::ExtraContext, 1, "ContextCountMismatch")]
fn test_fatal_build_error_keeps_running_pipeline(
    #[case] fault: Fault,
    #[case] m2_input: u32,
    #[case] expected: &str,
) {
    init_logging();
    let log = event_log();
    let mut registry = two_module_registry(&log);
    register_faulty_module(&mut registry, &log, "faulty", 1, 1, fault);
    let mut backend = RecordingBackend::new();
    let mut pipeline = Pipeline::new(config(2, 64, 64));

    pipeline.set_blueprint(&registry, &two_module_blueprint()).unwrap();
    pipeline.rebuild(&registry, &mut backend, 0).unwrap();
    let presented = pipeline.world().unwrap().shared_image(Slot(0), 0).unwrap();
    let live_objects = backend.live_object_count();
    log.lock().clear();

    pipeline.set_blueprint(&registry, &faulty_blueprint(m2_input)).unwrap();
    let err = pipeline.rebuild(&registry, &mut backend, 1).unwrap_err();
    assert_eq!(error_kind(&err), expected, "got {}", err);

    // every module of the attempt was released and every image it made destroyed
    assert_eq!(backend.live_object_count(), live_objects);
    let mut released = events(&log, "release:");
    released.sort();
    assert_eq!(released, vec!["faulty", "m2"]);

    assert!(pipeline.needs_rebuild());
    assert_eq!(pipeline.collector().pending_count(), 0);
    assert_eq!(pipeline.world().unwrap().shared_image(Slot(0), 0), Some(presented));
    assert!(pipeline.render(0, &mut backend).unwrap().is_complete());
}

#[test]
fn test_replaced_pipeline_outlives_its_frame() {
    let log = event_log();
    let registry = two_module_registry(&log);
    let mut backend = RecordingBackend::new();
    let mut pipeline = Pipeline::new(config(3, 64, 64));
    pipeline.set_blueprint(&registry, &two_module_blueprint()).unwrap();
    pipeline.rebuild(&registry, &mut backend, 0).unwrap();
    let old_image = pipeline.world().unwrap().shared_image(Slot(1), 0).unwrap();

    pipeline.resize(Extent2D::new(32, 32));
    pipeline.rebuild(&registry, &mut backend, 1).unwrap();
    assert_eq!(pipeline.collector().pending_for(1), 1);
    assert!(backend.is_image_alive(old_image.handle));

    // frames 2 and 0 may still be in flight on the GPU
    assert_eq!(pipeline.begin_frame(2, &mut backend), 0);
    assert_eq!(pipeline.begin_frame(0, &mut backend), 0);
    assert!(backend.is_image_alive(old_image.handle));

    assert_eq!(pipeline.begin_frame(1, &mut backend), 1);
    assert!(!backend.is_image_alive(old_image.handle));
    assert_eq!(events(&log, "release:"), vec!["m1", "m2"]);
}

#[test]
fn test_anomaly_skips_only_the_failing_module() {
    let log = event_log();
    let mut registry = ModuleRegistry::new();
    register_probe(&mut registry, &log, "source", 0, 1);
    register_failing_probe(&mut registry, &log, "broken", 1, 1);
    register_probe(&mut registry, &log, "sink", 1, 1);
    let desc = BlueprintDesc::new()
        .module(ModuleSpec::new("source").output(1))
        .module(ModuleSpec::new("broken").input(1).output(2))
        .module(ModuleSpec::new("sink").input(2).output(0))
        .formats([FMT_A, FMT_B, FMT_B]);

    let mut backend = RecordingBackend::new();
    let mut world = build_world(&registry, &desc, &config(1, 32, 32), &mut backend);
    let report = world.render(0, &mut backend);

    assert!(!report.is_complete());
    assert_eq!(report.executed, vec!["source", "sink"]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, "broken");
    assert_eq!(events(&log, "render:"), vec!["source@0", "sink@0"]);
    let output = report.output.unwrap();
    assert_eq!(world.resource_state(output.handle), Some(ResourceState::PRESENT));
}

#[test]
fn test_bloom_dispatches_one_pass_per_level() {
    let log = event_log();
    let mut registry = ModuleRegistry::with_builtin_modules();
    register_probe(&mut registry, &log, "hdr_source", 0, 1);
    let desc = BlueprintDesc::new()
        .module(ModuleSpec::new("hdr_source").output(1))
        .module(ModuleSpec::new(BLOOM_MODULE_NAME).input(1).output(0))
        .formats([Format::Rgba8Unorm, Format::Rgba16Float]);

    let mut backend = RecordingBackend::new();
    let mut world = build_world(&registry, &desc, &config(1, 1024, 576), &mut backend);
    assert_eq!(world.shared_image(Slot(1), 0).unwrap().extent, Extent2D::new(1024, 576));

    let mips: Vec<(ImageHandle, Extent2D)> = backend
        .commands()
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::CreateImage { image, desc }
                if desc.label.as_deref().is_some_and(|label| label.starts_with("bloom mip")) =>
            {
                Some((*image, desc.extent))
            }
            _ => None,
        })
        .collect();
    let extents: Vec<Extent2D> = mips.iter().map(|(_, extent)| *extent).collect();
    assert_eq!(
        extents,
        vec![
            Extent2D::new(512, 288),
            Extent2D::new(256, 144),
            Extent2D::new(128, 72),
            Extent2D::new(64, 36),
            Extent2D::new(32, 18),
            Extent2D::new(16, 9),
        ]
    );
    backend.clear_commands();

    let report = world.render(0, &mut backend);
    assert!(report.is_complete());

    // one probe dispatch, then 6 downsample + 5 upsample + 1 composite
    let dispatches = backend.dispatches();
    assert_eq!(dispatches.len(), 1 + 6 + 5 + 1);

    // barriers recorded between each dispatch and the next one
    let mut after_dispatch: Vec<Vec<Barrier>> = Vec::new();
    for command in backend.commands() {
        match command {
            RecordedCommand::Dispatch { .. } => after_dispatch.push(Vec::new()),
            RecordedCommand::PipelineBarrier(batch) => {
                if let Some(barriers) = after_dispatch.last_mut() {
                    barriers.extend(batch.iter().copied());
                }
            }
            _ => {}
        }
    }

    // downsample writes levels 0..=5, upsample writes 4 down to 0
    let written = (0..6).chain((0..5).rev());
    for (pass, level) in written.enumerate() {
        let src = if pass < 6 {
            ResourceState::STORAGE_WRITE_COMPUTE
        } else {
            ResourceState::STORAGE_READ_WRITE_COMPUTE
        };
        let expected = Barrier::new(mips[level].0, src, ResourceState::STORAGE_READ_WRITE_COMPUTE);
        assert_eq!(
            after_dispatch[1 + pass].first(),
            Some(&expected),
            "pass {} must be fenced on mip {} before the next dispatch",
            pass,
            level
        );
    }
}
