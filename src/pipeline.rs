//! The consumer side: one display frame per queued block
//!
//! The pipeline owns everything touched by the render loop (engine, waterfall,
//! graticule, LEDs) and only talks to the other threads through the sample
//! queue and the shared cells. Renderers get read-only views of each frame and
//! change ranges only through the `set_*_range`/`reset_*_range` calls.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_utils::atomic::AtomicCell;
use tracing::{debug, info, warn};

use crate::{
    capture::{sample_queue, QueueConsumer, QueueStatus, MIN_FILL},
    config::Settings,
    error::{PipelineError, QueueError, RangeError, SourceError},
    f_engine::{FftSize, Spectrum, SpectralEngine},
    graticule::{Graticule, Grid},
    monitoring::{CpuLoad, Led, SharedCell},
    range::DbRange,
    rig::RigHandle,
    source::SampleSource,
    waterfall::{Palette, Waterfall},
};

/// Frames between status summaries of the headless renderer
pub const STATUS_EVERY: u64 = 50;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Leds {
    pub overflow: bool,
    pub clip: bool,
}

/// Everything a renderer needs for one frame
pub struct Frame<'a> {
    pub number: u64,
    pub spectrum: &'a Spectrum,
    /// Spectrum polyline in plot coordinates, zero frequency centered
    pub trace: &'a [(f32, f32)],
    pub grid: &'a Grid,
    pub waterfall: Option<&'a Waterfall>,
    /// A waterfall row was completed this frame
    pub new_row: bool,
    pub leds: Leds,
    pub sample_rate: u32,
    pub cpu: Option<CpuLoad>,
    /// Tuned frequency, if a rig is connected
    pub frequency: Option<u64>,
}

pub trait Renderer {
    fn render(&mut self, frame: &Frame<'_>);
}

/// What a processed frame looked like, for the caller
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameSummary {
    pub number: u64,
    pub seq: u64,
    pub peak_bin: usize,
    pub peak_db: f32,
    /// Peak offset from the tuned frequency, Hz
    pub peak_offset_hz: f64,
    pub new_row: bool,
    pub leds: Leds,
}

pub struct Pipeline {
    consumer: QueueConsumer,
    status: Arc<QueueStatus>,
    min_fill: usize,
    /// Samples per block requested from the acquisition thread
    chunk: SharedCell<usize>,
    /// Length of blocks queued before the last FFT size change
    stale_len: Option<usize>,
    engine: SpectralEngine,
    waterfall: Option<Waterfall>,
    nsum: usize,
    graticule: Graticule,
    display_width: usize,
    overflow: Led,
    stop: Arc<AtomicBool>,
    producer: Option<JoinHandle<Result<(), SourceError>>>,
    rig: RigHandle,
    cpu: Option<SharedCell<CpuLoad>>,
    sample_rate: u32,
    frames: u64,
}

impl Pipeline {
    /// Build the queue and processing state and start `source` feeding it
    pub fn start(
        settings: &Settings,
        source: SampleSource,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, PipelineError> {
        let (producer, consumer) = sample_queue(
            settings.queue_capacity,
            settings.skip,
            settings.discard_first,
        );
        let chunk = Arc::new(AtomicCell::new(settings.chunk_size()));
        let handle = source.spawn(producer, chunk.clone(), stop.clone())?;
        info!(
            fft = settings.fft.size,
            buffers = settings.engine.buffers,
            sample_rate = settings.sample_rate(),
            skip = settings.skip.0,
            capacity = settings.queue_capacity,
            "Pipeline started"
        );
        Ok(Self::assemble(settings, consumer, chunk, Some(handle), stop))
    }

    fn assemble(
        settings: &Settings,
        consumer: QueueConsumer,
        chunk: SharedCell<usize>,
        producer: Option<JoinHandle<Result<(), SourceError>>>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let waterfall = settings.waterfall.as_ref().map(|wf| {
            Waterfall::new(settings.fft.size, wf.lines, wf.steps, wf.range, wf.palette)
                .with_combine(wf.combine)
        });
        Self {
            status: consumer.status(),
            consumer,
            min_fill: MIN_FILL,
            chunk,
            stale_len: None,
            engine: SpectralEngine::new(settings.fft, settings.engine, settings.sp_range),
            waterfall,
            nsum: settings.waterfall.as_ref().map_or(1, |wf| wf.nsum),
            graticule: Graticule::new(
                settings.sp_range,
                settings.sample_rate(),
                settings.display_width as u32,
                settings.display_height,
            ),
            display_width: settings.display_width,
            overflow: Led::default(),
            stop,
            producer,
            rig: RigHandle::unavailable(),
            cpu: None,
            sample_rate: settings.sample_rate(),
            frames: 0,
        }
    }

    pub fn with_rig(mut self, rig: RigHandle) -> Self {
        self.rig = rig;
        self
    }

    pub fn with_cpu_load(mut self, cpu: SharedCell<CpuLoad>) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// How long to wait for data before declaring the stream stalled
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.consumer = self
            .consumer
            .with_timeout(timeout)
            .with_poll_interval(timeout / 20);
        self
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn engine(&self) -> &SpectralEngine {
        &self.engine
    }

    pub fn waterfall(&self) -> Option<&Waterfall> {
        self.waterfall.as_ref()
    }

    pub fn graticule(&self) -> &Graticule {
        &self.graticule
    }

    pub fn rig(&self) -> &RigHandle {
        &self.rig
    }

    /// Process one block and hand the result to `renderer`.
    ///
    /// `Ok(None)` means the run is over: stop was requested or a finite source
    /// ran dry. A stalled stream is an error.
    pub fn run_frame<R: Renderer + ?Sized>(
        &mut self,
        renderer: &mut R,
    ) -> Result<Option<FrameSummary>, PipelineError> {
        if self.stopped() {
            return Ok(None);
        }
        let block = loop {
            let block = match self.consumer.pop_when_ready(self.min_fill) {
                Ok(block) => block,
                Err(QueueError::Closed) => {
                    info!(frames = self.frames, "Sample stream ended");
                    self.join_producer()?;
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            match self.stale_len {
                Some(len) if block.len() == len => {
                    debug!(seq = block.seq, len, "Dropped block sized for the old FFT");
                }
                _ => {
                    if block.len() == self.engine.chunk_size() {
                        self.stale_len = None;
                    }
                    break block;
                }
            }
        };
        // Stop may have been raised while we were waiting
        if self.stopped() {
            return Ok(None);
        }

        let spectrum = self.engine.process(block);
        let new_row = match self.waterfall.as_mut() {
            Some(wf) => wf.accumulate(&spectrum, self.nsum).is_some(),
            None => false,
        };

        let overrun = self.status.take_hardware_overrun();
        if self.status.take_overflow() || overrun {
            warn!(
                drops = self.status.drops(),
                overrun, "Sample queue overflow"
            );
            self.overflow.trip();
        }
        let leds = Leds {
            overflow: self.overflow.poll(),
            clip: self.engine.take_clip(),
        };

        let (peak_bin, peak_db) = spectrum.peak().unwrap_or((0, f32::NEG_INFINITY));
        let summary = FrameSummary {
            number: self.frames,
            seq: spectrum.seq,
            peak_bin,
            peak_db,
            peak_offset_hz: spectrum.bin_offset_hz(peak_bin, self.sample_rate),
            new_row,
            leds,
        };

        let trace = self.graticule.trace(&spectrum);
        let frame = Frame {
            number: self.frames,
            spectrum: &spectrum,
            trace: &trace,
            grid: self.graticule.make(),
            waterfall: self.waterfall.as_ref(),
            new_row,
            leds,
            sample_rate: self.sample_rate,
            cpu: self.cpu.as_ref().map(|c| c.load()),
            frequency: self.rig.frequency(),
        };
        renderer.render(&frame);
        self.frames += 1;
        Ok(Some(summary))
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn join_producer(&mut self) -> Result<(), PipelineError> {
        match self.producer.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| PipelineError::ProducerPanicked)?
                .map_err(PipelineError::from),
            None => Ok(()),
        }
    }

    /// Stop acquisition. Pending blocks and any partial waterfall row are thrown away.
    pub fn stop(&mut self) -> Result<(), PipelineError> {
        self.stop.store(true, Ordering::Release);
        let joined = self.join_producer();
        let dropped = self.consumer.drain();
        if let Some(wf) = self.waterfall.as_mut() {
            wf.discard_partial();
        }
        info!(frames = self.frames, dropped, "Pipeline stopped");
        joined
    }

    /// Change the FFT size; later spectra (and waterfall rows) take the new width.
    /// The acquisition thread switches to the new block length and blocks
    /// already queued at the old length are dropped.
    pub fn set_fft_size(&mut self, requested: usize) -> FftSize {
        let old = self.engine.chunk_size();
        let fitted = self.engine.set_fft_size(requested, self.display_width);
        let new = self.engine.chunk_size();
        if new != old {
            self.chunk.store(new);
            self.stale_len = Some(old);
            debug!(old, new, "Block length changed");
        }
        fitted
    }

    /// Set the 2D spectrum range. A rejected range changes nothing.
    pub fn set_sp_range(&mut self, min: f32, max: f32) -> Result<(), RangeError> {
        let range = DbRange::new(min, max)?;
        self.engine.set_range(range.min(), range.max())?;
        self.graticule.set_range(range.min(), range.max())
    }

    pub fn reset_sp_range(&mut self) -> (f32, f32) {
        let (min, max) = self.graticule.reset_range();
        if let Err(e) = self.engine.set_range(min, max) {
            // The startup range was validated already
            debug!(%e, "Engine kept its range");
        }
        (min, max)
    }

    /// Set the waterfall palette range. A rejected range changes nothing.
    pub fn set_v_range(&mut self, min: f32, max: f32) -> Result<(), RangeError> {
        match self.waterfall.as_mut() {
            Some(wf) => wf.set_range(min, max),
            None => DbRange::new(min, max).map(|_| ()),
        }
    }

    pub fn reset_v_range(&mut self) -> Option<(f32, f32)> {
        self.waterfall.as_mut().map(Waterfall::reset_range)
    }

    pub fn set_palette(&mut self, palette: Palette) {
        if let Some(wf) = self.waterfall.as_mut() {
            wf.set_palette(palette);
        }
    }
}

/// Renderer for running without a display: logs a status line per frame
#[derive(Debug, Default)]
pub struct HeadlessRenderer {
    rows: u64,
    overflows: u64,
    clips: u64,
}

impl HeadlessRenderer {
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

impl Renderer for HeadlessRenderer {
    fn render(&mut self, frame: &Frame<'_>) {
        self.rows += frame.new_row as u64;
        self.overflows += frame.leds.overflow as u64;
        self.clips += frame.leds.clip as u64;
        let (bin, db) = frame.spectrum.peak().unwrap_or((0, f32::NEG_INFINITY));
        let offset = frame.spectrum.bin_offset_hz(bin, frame.sample_rate);
        let peak_hz = frame.frequency.map(|f| f as f64 + offset);
        debug!(
            frame = frame.number,
            bin,
            db,
            offset,
            ?peak_hz,
            overflow = frame.leds.overflow,
            clip = frame.leds.clip,
            "Frame"
        );
        if frame.number % STATUS_EVERY == 0 {
            let cpu = frame.cpu.unwrap_or_default();
            info!(
                frame = frame.number,
                peak_db = %format!("{db:.1}"),
                peak_offset_hz = %format!("{offset:.0}"),
                ?peak_hz,
                rows = self.rows,
                overflows = self.overflows,
                clips = self.clips,
                cpu_user = %format!("{:.1}%", cpu.user * 100.0),
                cpu_system = %format!("{:.1}%", cpu.system * 100.0),
                load = cpu.load_avg,
                "Status"
            );
        }
    }
}
