//! Record frames of the default world pipeline into the recording backend.
//!
//! Builds ray tracing, upscaling, bloom and tone mapping, records a number of
//! frames, resizes halfway through and prints what each frame recorded.
//!
//! ```text
//! cargo run --example record_frames -- --width 1920 --height 1080 --quality balanced
//! ```

use clap::Parser;

use render_pipeline::backend::{Extent2D, RecordedCommand, RecordingBackend};
use render_pipeline::pipeline::{default_world_blueprint, QualityMode};
use render_pipeline::{ModuleRegistry, Pipeline, PipelineConfig};

#[derive(Debug, Parser)]
#[command(name = "record_frames", about = "Record frames of the default world pipeline")]
struct Args {
    /// Presentation width in pixels
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Presentation height in pixels
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Number of frames to record
    #[arg(long, default_value_t = 6)]
    frames: usize,

    /// Frames in flight
    #[arg(long, default_value_t = 3)]
    frames_in_flight: usize,

    /// Upscaler quality mode (name or index 0-4)
    #[arg(long, default_value_t = QualityMode::Quality)]
    quality: QualityMode,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(err) = run(&args) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let registry = ModuleRegistry::with_builtin_modules();
    let mut backend = RecordingBackend::new();
    let config = PipelineConfig::new(args.frames_in_flight, Extent2D::new(args.width, args.height));
    let frames_in_flight = config.frames_in_flight.max(1);

    let mut pipeline = Pipeline::new(config);
    pipeline.set_blueprint(&registry, &default_world_blueprint(args.quality))?;

    for frame_number in 0..args.frames {
        let frame = frame_number % frames_in_flight;
        let released = pipeline.begin_frame(frame, &mut backend);

        if frame_number == args.frames / 2 {
            pipeline.resize(Extent2D::new(args.width / 2, args.height / 2));
        }
        if pipeline.needs_rebuild() {
            pipeline.rebuild(&registry, &mut backend, frame)?;
            if let Some(world) = pipeline.world() {
                println!(
                    "built world pipeline: render {} -> presentation {}",
                    world.render_extent(),
                    world.presentation_extent()
                );
            }
        }

        let report = pipeline.render(frame, &mut backend)?;
        let commands = backend.take_commands();
        let barriers = commands
            .iter()
            .filter(|command| matches!(command, RecordedCommand::PipelineBarrier(_)))
            .count();
        let gpu_work = commands.iter().filter(|command| command.is_gpu_work()).count();

        println!(
            "frame {:>3} (slot set {}): {} module(s) executed, {} skipped, {} barrier batch(es), {} GPU command(s), {} resource(s) released",
            frame_number,
            frame,
            report.executed.len(),
            report.skipped.len(),
            barriers,
            gpu_work,
            released
        );
        for (module, anomaly) in &report.skipped {
            println!("    skipped {}: {}", module, anomaly);
        }
    }

    println!("live GPU objects before close: {}", backend.live_object_count());
    pipeline.close(&registry, &mut backend);
    println!("live GPU objects after close: {}", backend.live_object_count());
    Ok(())
}
