//! Validated run settings
//!
//! Command line values are checked and clamped here, once, before anything is
//! started. Values that can be fitted (FFT size, accumulation count, palette)
//! are clamped with a warning. Values that cannot (dB ranges, zero counts) are
//! rejected.

use std::{net::ToSocketAddrs, path::PathBuf, time::Duration};

use tracing::warn;

use crate::{
    args::Args,
    capture::SkipPolicy,
    error::ConfigError,
    f_engine::{clamp_fft_size, EngineOptions, FftSize},
    range::DbRange,
    rig::ControlKind,
    source::SourceSettings,
    waterfall::{Combine, Palette, DEFAULT_STEPS, MAX_NSUM},
};

const TONE_AMPLITUDE: f32 = 0.5;

#[derive(Clone, Debug, PartialEq)]
pub struct WaterfallSettings {
    pub lines: usize,
    pub nsum: usize,
    pub steps: usize,
    pub palette: Palette,
    pub combine: Combine,
    pub range: DbRange,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ControlSettings {
    None,
    Memory { hz: u64 },
    Hamlib { address: String, interval: Duration },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub source: SourceSettings,
    pub fft: FftSize,
    pub engine: EngineOptions,
    pub sp_range: DbRange,
    pub display_width: usize,
    pub display_height: u32,
    pub waterfall: Option<WaterfallSettings>,
    pub skip: SkipPolicy,
    pub queue_capacity: usize,
    pub discard_first: usize,
    pub control: ControlSettings,
    pub cpu_load_interval: Duration,
    /// Stop after this many frames
    pub frames: Option<u64>,
    pub snapshot_dir: Option<PathBuf>,
}

fn nonzero<T: Default + PartialEq>(name: &'static str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        Err(ConfigError::Zero { name })
    } else {
        Ok(value)
    }
}

fn range(name: &'static str, min: f32, max: f32) -> Result<DbRange, ConfigError> {
    DbRange::new(min, max).map_err(|source| ConfigError::Range { name, source })
}

fn interval(name: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    if secs.is_finite() && secs > 0.0 {
        Ok(Duration::from_secs_f64(secs))
    } else {
        Err(ConfigError::Zero { name })
    }
}

impl Settings {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let sample_rate = nonzero("sample rate", args.sample_rate)?;
        let buffers = nonzero("buffers", args.buffers)?;
        let queue_capacity = nonzero("queue capacity", args.queue_capacity)?;
        let display_width = nonzero("display width", args.display_width)?;
        let display_height = nonzero("display height", args.display_height)?;

        let fft = clamp_fft_size(args.size, display_width);
        if fft.adjusted() {
            warn!(
                requested = fft.requested,
                size = fft.size,
                display_width,
                "FFT size was reset to fit the display"
            );
        }

        let sp_range = range("spectrum range", args.sp_min, args.sp_max)?;
        // The palette range is checked even with the waterfall off so a bad value is not a surprise later
        let v_range = range("waterfall range", args.v_min, args.v_max)?;
        let waterfall = if args.waterfall {
            let nsum = args.waterfall_accumulation.clamp(1, MAX_NSUM);
            if nsum != args.waterfall_accumulation {
                warn!(
                    requested = args.waterfall_accumulation,
                    nsum, "Waterfall accumulation clamped"
                );
            }
            let palette = Palette::from_index(args.waterfall_palette);
            if palette.index() != args.waterfall_palette {
                warn!(
                    requested = args.waterfall_palette,
                    palette = palette.index(),
                    "Waterfall palette clamped"
                );
            }
            Some(WaterfallSettings {
                lines: nonzero("waterfall lines", args.waterfall_lines)?,
                nsum,
                steps: DEFAULT_STEPS,
                palette,
                combine: if args.max_hold {
                    Combine::MaxHold
                } else {
                    Combine::Mean
                },
                range: v_range,
            })
        } else {
            None
        };

        let control = match args.control {
            ControlKind::None => ControlSettings::None,
            ControlKind::Memory => ControlSettings::Memory { hz: args.frequency },
            ControlKind::Hamlib => {
                let resolves = args
                    .hamlib_address
                    .to_socket_addrs()
                    .map(|mut a| a.next().is_some())
                    .unwrap_or(false);
                if !resolves {
                    return Err(ConfigError::RigAddress(args.hamlib_address.clone()));
                }
                ControlSettings::Hamlib {
                    address: args.hamlib_address.clone(),
                    interval: interval("hamlib interval", args.hamlib_interval)?,
                }
            }
        };

        Ok(Self {
            source: SourceSettings {
                kind: args.source,
                input: args.input.clone(),
                sample_rate,
                tone_offset_hz: args.tone_offset,
                tone_amplitude: TONE_AMPLITUDE,
                noise: args.noise.clamp(0.0, 1.0),
                looping: args.looping,
                realtime: !args.no_pace,
            },
            fft,
            engine: EngineOptions {
                buffers,
                lagfix: args.lagfix,
                rev_iq: args.rev_iq,
                clip_level: args.clip_level,
                pulse: args.pulse.max(0.0),
            },
            sp_range,
            display_width,
            display_height,
            waterfall,
            skip: SkipPolicy(args.skip),
            queue_capacity,
            discard_first: args.discard_first,
            control,
            cpu_load_interval: interval("cpu load interval", args.cpu_load_interval)?,
            frames: (args.frames > 0).then_some(args.frames),
            snapshot_dir: args.snapshot.clone(),
        })
    }

    /// Samples per queued block
    pub fn chunk_size(&self) -> usize {
        self.engine.buffers * self.fft.size
    }

    pub fn sample_rate(&self) -> u32 {
        self.source.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RangeError;
    use clap::Parser;

    fn settings(extra: &[&str]) -> Result<Settings, ConfigError> {
        let argv: Vec<&str> = std::iter::once("iq_slurper").chain(extra.iter().copied()).collect();
        Settings::from_args(&Args::parse_from(argv))
    }

    #[test]
    fn defaults_are_valid() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.fft.size, 512);
        assert_eq!(s.chunk_size(), 12 * 512);
        assert_eq!(s.waterfall, None);
        assert_eq!(s.control, ControlSettings::None);
        assert_eq!(s.frames, None);
        assert!(s.source.realtime);
    }

    #[test]
    fn fft_size_fits_display() {
        let s = settings(&["--size", "1024", "--display-width", "800"]).unwrap();
        assert_eq!(s.fft.size, 512);
        assert!(s.fft.adjusted());
        let s = settings(&["--size", "300"]).unwrap();
        assert_eq!(s.fft.size, 256);
    }

    #[test]
    fn waterfall_clamps() {
        let s = settings(&[
            "--waterfall",
            "--waterfall-accumulation",
            "50",
            "--waterfall-palette",
            "9",
        ])
        .unwrap();
        let wf = s.waterfall.unwrap();
        assert_eq!(wf.nsum, MAX_NSUM);
        assert_eq!(wf.palette, Palette::Phosphor);
        assert_eq!(wf.range, DbRange::new(-130.0, -20.0).unwrap());
    }

    #[test]
    fn bad_ranges_are_rejected() {
        assert_eq!(
            settings(&["--sp-min", "-20", "--sp-max", "-20"]),
            Err(ConfigError::Range {
                name: "spectrum range",
                source: RangeError::NotIncreasing {
                    min: -20.0,
                    max: -20.0
                }
            })
        );
        assert!(matches!(
            settings(&["--v-min", "0", "--v-max", "-10"]),
            Err(ConfigError::Range {
                name: "waterfall range",
                ..
            })
        ));
    }

    #[test]
    fn zero_counts_are_rejected() {
        assert_eq!(
            settings(&["--buffers", "0"]),
            Err(ConfigError::Zero { name: "buffers" })
        );
        assert_eq!(
            settings(&["--sample-rate", "0"]),
            Err(ConfigError::Zero {
                name: "sample rate"
            })
        );
    }

    #[test]
    fn control_selection() {
        let s = settings(&["--control", "memory", "--frequency", "7074000"]).unwrap();
        assert_eq!(s.control, ControlSettings::Memory { hz: 7_074_000 });
        let s = settings(&["--control", "hamlib", "--hamlib-interval", "0.5"]).unwrap();
        assert_eq!(
            s.control,
            ControlSettings::Hamlib {
                address: "127.0.0.1:4532".into(),
                interval: Duration::from_millis(500)
            }
        );
        assert!(matches!(
            settings(&["--control", "hamlib", "--hamlib-address", "not an address"]),
            Err(ConfigError::RigAddress(_))
        ));
    }
}
