//! demo - end-to-end synthetic occupancy run
//!
//! Drives one session over a scripted `stub://` scene: a person walks in, the
//! detector occasionally misses them, they leave, and the actuator switches
//! OFF once the vacancy timeout has passed. Frames are timestamped on a
//! virtual clock at the requested frame rate, so the run takes well under a
//! second regardless of `--seconds`.

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::Parser;
use std::fs::{self, File};
use std::io::{BufWriter, IsTerminal, Write};
use std::path::PathBuf;

use occupancy_kernel::config::parse_vacancy_timeout;
use occupancy_kernel::{
    write_records_csv, ActuatorNotifier, AnnotatorStyle, BackendRegistry, DetectorBackend,
    FrameSink, FrameSource, JpegSnapshotSink, LogNotifier, OccupancySession, PresencePolicy,
    SessionClock, SessionSettings, SourceConfig, SteppedClock, StreamEnd, SyntheticSource,
    EXPORT_FILE_NAME,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Length of the synthetic run in seconds of virtual time.
    #[arg(long, default_value_t = 12)]
    seconds: u64,
    /// Frames per second of the synthetic source.
    #[arg(long, default_value_t = 10)]
    fps: u32,
    /// Seconds of continuous absence before switching OFF.
    #[arg(long, default_value_t = 3.0)]
    vacancy_timeout: f64,
    /// Seconds the scene is empty at the start of each cycle.
    #[arg(long, default_value_t = 5)]
    absent_secs: u64,
    /// Seconds a person is in view after that.
    #[arg(long, default_value_t = 2)]
    present_secs: u64,
    /// Drop the person from every Nth occupied frame (0 disables).
    #[arg(long, default_value_t = 4)]
    dropout: u64,
    /// Minimum detection confidence (exclusive).
    #[arg(long, default_value_t = 0.4)]
    min_confidence: f32,
    /// Caption label for the actuator.
    #[arg(long, default_value = "AC")]
    label: String,
    /// Output directory for the CSV log and the last annotated frame.
    #[arg(long, default_value = "demo_out")]
    out: String,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }
    let vacancy_timeout = parse_vacancy_timeout(args.vacancy_timeout)?;
    let ui = ui::Ui::from_args(
        Some(&args.ui),
        std::io::stderr().is_terminal(),
        !std::io::stdout().is_terminal(),
    );

    let out_dir = PathBuf::from(&args.out);
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("create output directory {}", out_dir.display()))?;

    let fps = u64::from(args.fps);
    let frames_for = |secs: u64, what: &str| {
        secs.checked_mul(fps)
            .ok_or_else(|| anyhow!("{} of {}s at {} fps overflows", what, secs, fps))
    };
    let total_frames = frames_for(args.seconds, "run length")?;
    let uri = format!(
        "stub://demo?absent={}&present={}&frames={}&dropout={}",
        frames_for(args.absent_secs, "absent phase")?,
        frames_for(args.present_secs, "present phase")?,
        total_frames,
        args.dropout
    );

    let mut source = {
        let _stage = ui.stage("Open synthetic source");
        let mut source = SyntheticSource::new(SourceConfig {
            uri,
            target_fps: args.fps,
            width: 320,
            height: 240,
        })?;
        source.connect()?;
        source
    };
    let policy = PresencePolicy {
        min_confidence: args.min_confidence,
        ..PresencePolicy::default()
    };
    let mut detector = {
        let _stage = ui.stage("Load detector");
        BackendRegistry::with_builtin(None, policy).create_default()?
    };

    let settings = SessionSettings {
        vacancy_timeout,
        policy,
        log_capacity: None,
        style: AnnotatorStyle {
            actuator_label: args.label.clone(),
            ..AnnotatorStyle::default()
        },
    };
    let mut session = OccupancySession::new("demo", &settings);
    let mut clock = SteppedClock::from_fps(args.fps);
    let mut notifier = LogNotifier;
    let snapshot_path = out_dir.join("last_frame.jpg");
    let mut sink = JpegSnapshotSink::new(&snapshot_path).every(fps);
    let mut notices = Vec::new();

    let wall_start = Local::now().naive_local();
    let end = {
        let _stage = ui.stage("Process frames");
        let mut progress = ui.frames(total_frames);
        loop {
            let Some(mut frame) = source.next_frame()? else {
                break StreamEnd::Exhausted;
            };
            let now = clock.now();
            frame.captured_at = wall_start + chrono::Duration::from_std(now)?;

            let detections = detector.detect(frame.pixels(), frame.width, frame.height);
            let outcome = session.process_frame(&mut frame, detections, now);
            if let Some(transition) = &outcome.transition {
                notifier.notify(transition)?;
                notices.push(transition.notice());
            }
            sink.present(&frame)?;
            progress.tick(outcome.state.as_str());
        }
    };

    let finished = session.finish(end);
    let csv_path = out_dir.join(EXPORT_FILE_NAME);
    {
        let _stage = ui.stage("Write activity log");
        let mut writer = BufWriter::new(File::create(&csv_path)?);
        write_records_csv(&finished.records, &mut writer)?;
        writer.flush()?;
    }

    for notice in &notices {
        println!("{}", notice);
    }
    println!("{}", finished.summary());
    println!("activity log written to {}", csv_path.display());
    println!("last annotated frame written to {}", snapshot_path.display());
    Ok(())
}
