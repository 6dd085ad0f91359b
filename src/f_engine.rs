//! The spectral engine, turning sample blocks into calibrated log-power spectra

// For each block from the queue (`buffers` FFT segments back to back) we
// * fix the channel lag and swap I/Q if asked
// * collect peak statistics for the clip LED
// * multiply each segment with the window function
// * FFT and accumulate |X|^2 over the accepted segments
// * scale so a full-scale complex tone reads 0 dB, then take 10*log10

use std::{f32::consts::PI, sync::Arc};

use rustfft::{Fft, FftPlanner};
use tracing::{debug, warn};

use crate::{
    complex::{Iq, SampleBlock},
    error::RangeError,
    range::DbRange,
};

/// FFT sizes the engine will run, largest first
pub const SUPPORTED_SIZES: [usize; 5] = [1024, 512, 256, 128, 64];
const POWER_FLOOR: f32 = 1.0e-20;

/// The outcome of fitting a requested FFT size to the display
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FftSize {
    pub size: usize,
    pub requested: usize,
}

impl FftSize {
    pub fn adjusted(&self) -> bool {
        self.size != self.requested
    }
}

/// Largest supported power of two that is no bigger than the request and
/// leaves at least one pixel per bin. Never goes below the smallest supported size.
pub fn clamp_fft_size(requested: usize, display_width: usize) -> FftSize {
    let limit = requested.min(display_width);
    let size = SUPPORTED_SIZES
        .iter()
        .copied()
        .find(|&n| n <= limit)
        .unwrap_or(SUPPORTED_SIZES[SUPPORTED_SIZES.len() - 1]);
    FftSize { size, requested }
}

/// Periodic Hann window of length `n`
pub fn hann(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EngineOptions {
    /// FFT segments per sample block
    pub buffers: usize,
    /// Rotate Q by one sample to undo the PCM290x interchannel lag
    pub lagfix: bool,
    /// Exchange I and Q, mirroring the spectrum
    pub rev_iq: bool,
    /// Peak level (fraction of full scale) that counts as clipping
    pub clip_level: f32,
    /// Reject segments whose peak exceeds this multiple of the block median; 0 disables
    pub pulse: f32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            buffers: 1,
            lagfix: false,
            rev_iq: false,
            clip_level: 0.99,
            pulse: 0.0,
        }
    }
}

/// Raw-sample statistics of the block a spectrum was computed from
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BlockStats {
    /// Largest |I| in the block, fraction of full scale
    pub max_i: f32,
    /// Largest |Q| in the block, fraction of full scale
    pub max_q: f32,
    pub clipped: bool,
    pub segments: usize,
    /// Segments thrown out by the pulse clipper
    pub rejected: usize,
}

/// One log-power spectrum in natural FFT order (bin `k` is `k * fs / size`,
/// the upper half holds negative frequencies)
#[derive(Clone, Debug, PartialEq)]
pub struct Spectrum {
    pub seq: u64,
    pub bins: Vec<f32>,
    pub range: DbRange,
    pub stats: BlockStats,
}

impl Spectrum {
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Index and level of the strongest bin
    pub fn peak(&self) -> Option<(usize, f32)> {
        self.bins
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (i, v)| match best {
                Some((_, b)) if b >= v => best,
                _ => Some((i, v)),
            })
    }

    /// Zero-centered view, most negative frequency first
    pub fn centered(&self) -> Vec<f32> {
        let mut out = self.bins.clone();
        out.rotate_left(self.bins.len() / 2);
        out
    }

    /// Signed offset from the tuned frequency of `bin`, in Hz
    pub fn bin_offset_hz(&self, bin: usize, sample_rate: u32) -> f64 {
        let n = self.bins.len() as i64;
        let k = bin as i64;
        let signed = if k >= n / 2 { k - n } else { k };
        signed as f64 * sample_rate as f64 / n as f64
    }
}

pub struct SpectralEngine {
    size: usize,
    window: Vec<f32>,
    norm: f32,
    planner: FftPlanner<f32>,
    fft: Arc<dyn Fft<f32>>,
    segment: Vec<Iq>,
    scratch: Vec<Iq>,
    power: Vec<f32>,
    magnitudes: Vec<f32>,
    options: EngineOptions,
    range: DbRange,
    clip_count: u32,
}

impl SpectralEngine {
    pub fn new(size: FftSize, options: EngineOptions, range: DbRange) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size.size);
        let mut engine = Self {
            size: size.size,
            window: vec![],
            norm: 1.0,
            planner,
            fft,
            segment: vec![],
            scratch: vec![],
            power: vec![],
            magnitudes: vec![],
            options,
            range,
            clip_count: 0,
        };
        engine.update_window();
        engine
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn set_lagfix(&mut self, on: bool) {
        self.options.lagfix = on;
    }

    pub fn set_rev_iq(&mut self, on: bool) {
        self.options.rev_iq = on;
    }

    pub fn set_buffers(&mut self, buffers: usize) {
        self.options.buffers = buffers.max(1);
    }

    /// Samples per block this engine expects
    pub fn chunk_size(&self) -> usize {
        self.options.buffers * self.size
    }

    /// Change the transform length, clamped to the display. Spectra produced
    /// after this call have the new length.
    pub fn set_fft_size(&mut self, requested: usize, display_width: usize) -> FftSize {
        let fitted = clamp_fft_size(requested, display_width);
        if fitted.adjusted() {
            warn!(
                requested,
                size = fitted.size,
                "FFT size was reset to fit the display"
            );
        }
        if fitted.size != self.size {
            self.size = fitted.size;
            self.update_window();
        }
        fitted
    }

    /// Re-derive the window, normalization and FFT plan for the current size
    pub fn update_window(&mut self) {
        self.window = hann(self.size);
        let gain: f32 = self.window.iter().sum();
        self.norm = 1.0 / (gain * gain);
        self.fft = self.planner.plan_fft_forward(self.size);
        self.segment = vec![Iq::default(); self.size];
        self.scratch = vec![Iq::default(); self.fft.get_inplace_scratch_len()];
        self.power = vec![0.0; self.size];
        debug!(size = self.size, "Analysis window updated");
    }

    pub fn range(&self) -> DbRange {
        self.range
    }

    /// Set the display range carried by subsequent spectra; rejected ranges leave the old one
    pub fn set_range(&mut self, min: f32, max: f32) -> Result<(), RangeError> {
        self.range = DbRange::new(min, max)?;
        Ok(())
    }

    /// Pending clip events not yet shown
    pub fn clip_count(&self) -> u32 {
        self.clip_count
    }

    /// Called once per display cycle: true if the clip LED should be lit, consuming one event
    pub fn take_clip(&mut self) -> bool {
        if self.clip_count > 0 {
            self.clip_count -= 1;
            true
        } else {
            false
        }
    }

    pub fn process(&mut self, block: SampleBlock) -> Spectrum {
        let SampleBlock { seq, mut samples } = block;

        if self.options.lagfix {
            shift_q(&mut samples);
        }

        let mut stats = BlockStats::default();
        for s in &samples {
            stats.max_i = stats.max_i.max(s.re.abs());
            stats.max_q = stats.max_q.max(s.im.abs());
        }
        if stats.max_i.max(stats.max_q) >= self.options.clip_level {
            stats.clipped = true;
            self.clip_count = self.clip_count.saturating_add(1);
        }

        if self.options.rev_iq {
            for s in samples.iter_mut() {
                *s = Iq::new(s.im, s.re);
            }
        }

        // Short blocks become a single zero-padded segment
        if samples.len() < self.size {
            samples.resize(self.size, Iq::default());
        }
        let segments = samples.len() / self.size;
        stats.segments = segments;

        let accept = self.pulse_filter(&samples[..segments * self.size]);
        stats.rejected = accept.iter().filter(|a| !**a).count();
        if stats.rejected > 0 {
            self.clip_count = self.clip_count.saturating_add(1);
        }
        let use_all = stats.rejected == segments;

        self.power.iter_mut().for_each(|p| *p = 0.0);
        let mut taken = 0usize;
        for (chunk, keep) in samples.chunks_exact(self.size).zip(accept) {
            if !keep && !use_all {
                continue;
            }
            for ((out, x), w) in self.segment.iter_mut().zip(chunk).zip(&self.window) {
                *out = *x * *w;
            }
            self.fft.process_with_scratch(&mut self.segment, &mut self.scratch);
            for (p, x) in self.power.iter_mut().zip(&self.segment) {
                *p += x.norm_sqr();
            }
            taken += 1;
        }

        let scale = self.norm / taken.max(1) as f32;
        let bins = self
            .power
            .iter()
            .map(|p| 10.0 * (p * scale).max(POWER_FLOOR).log10())
            .collect();

        Spectrum {
            seq,
            bins,
            range: self.range,
            stats,
        }
    }

    /// Which segments survive the pulse clipper
    fn pulse_filter(&mut self, samples: &[Iq]) -> Vec<bool> {
        let segments = samples.len() / self.size;
        if self.options.pulse <= 0.0 {
            return vec![true; segments];
        }
        self.magnitudes.clear();
        self.magnitudes.extend(samples.iter().map(|s| s.norm()));
        let mid = self.magnitudes.len() / 2;
        let (_, median, _) = self.magnitudes.select_nth_unstable_by(mid, f32::total_cmp);
        // No reference level in a block that is mostly silence
        if *median <= 0.0 {
            return vec![true; segments];
        }
        let threshold = self.options.pulse * *median;
        samples
            .chunks_exact(self.size)
            .map(|chunk| chunk.iter().all(|s| s.norm() < threshold))
            .collect()
    }
}

/// Circularly delay the Q channel by one sample
fn shift_q(samples: &mut [Iq]) {
    if let Some(last) = samples.last().map(|s| s.im) {
        for i in (1..samples.len()).rev() {
            samples[i].im = samples[i - 1].im;
        }
        samples[0].im = last;
    }
}
