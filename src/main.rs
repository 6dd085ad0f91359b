use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
    thread::JoinHandle,
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use crossbeam_channel::bounded;
use iq_slurper::{
    args::{convert_filter, Args},
    config::{ControlSettings, Settings},
    monitoring::spawn_load_monitor,
    pipeline::{HeadlessRenderer, Pipeline},
    rig::{spawn_rig_task, Control, MemoryTuner, RetryPolicy, RigHandle, Rigctld},
    source::SampleSource,
    waterfall::Waterfall,
};
use tracing::{error, info, warn};

const MEMORY_POLL: Duration = Duration::from_secs(1);

fn start_rig(
    control: &ControlSettings,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<(RigHandle, Option<JoinHandle<()>>)> {
    let (rig, interval) = match control {
        ControlSettings::None => return Ok((RigHandle::unavailable(), None)),
        ControlSettings::Memory { hz } => (Control::Memory(MemoryTuner::new(*hz)), MEMORY_POLL),
        ControlSettings::Hamlib { address, interval } => match Rigctld::connect(address) {
            Ok(r) => (Control::Hamlib(r), *interval),
            Err(e) => {
                warn!(%e, %address, "Could not reach rigctld, continuing without rig control");
                return Ok((RigHandle::unavailable(), None));
            }
        },
    };
    let (handle, join) = spawn_rig_task(rig, interval, RetryPolicy::default(), stop)?;
    Ok((handle, Some(join)))
}

fn write_snapshot(dir: &Path, waterfall: &Waterfall) -> anyhow::Result<PathBuf> {
    let path = dir.join(Utc::now().format("iqwf-%Y-%m-%d-%H:%M:%S.ppm").to_string());
    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    waterfall.write_ppm(BufWriter::new(file))?;
    Ok(path)
}

fn main() -> anyhow::Result<()> {
    // Get the CLI options
    let args = Args::parse();

    // Set the log level
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    let settings = Settings::from_args(&args)?;
    info!(?settings, "Starting iq_slurper");

    // Everything in the background watches this
    let stop = Arc::new(AtomicBool::new(false));

    // Ctrl-C asks the display loop to wind down
    let (sd_s, sd_r) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = sd_s.try_send(());
    })?;

    let (cpu, cpu_task) = spawn_load_monitor(settings.cpu_load_interval, stop.clone())?;
    let (rig, rig_task) = start_rig(&settings.control, stop.clone())?;

    let source = SampleSource::open(&settings.source).context("opening sample source")?;
    let mut pipeline = Pipeline::start(&settings, source, stop.clone())?
        .with_cpu_load(cpu)
        .with_rig(rig);

    let mut renderer = HeadlessRenderer::default();
    let outcome = loop {
        if sd_r.try_recv().is_ok() {
            info!("Interrupted");
            break Ok(());
        }
        if matches!(settings.frames, Some(n) if pipeline.frames() >= n) {
            break Ok(());
        }
        match pipeline.run_frame(&mut renderer) {
            Ok(Some(_)) => {}
            Ok(None) => break Ok(()),
            Err(e) => {
                error!(%e, "Display loop failed");
                break Err(e);
            }
        }
    };

    let stopped = pipeline.stop();
    if let (Some(dir), Some(wf)) = (&settings.snapshot_dir, pipeline.waterfall()) {
        let path = write_snapshot(dir, wf)?;
        info!(path = %path.display(), rows = wf.len(), "Waterfall snapshot written");
    }
    if cpu_task.join().is_err() {
        warn!("CPU load task panicked");
    }
    if let Some(task) = rig_task {
        if task.join().is_err() {
            warn!("Rig control task panicked");
        }
    }

    outcome?;
    stopped?;
    Ok(())
}
