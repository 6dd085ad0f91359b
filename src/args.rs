//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::Parser;

use crate::{rig::ControlKind, source::SourceKind};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Where the I/Q samples come from
    #[clap(long, value_enum, default_value = "tone")]
    pub source: SourceKind,
    /// Raw capture file for the pcm and rtl sources
    #[clap(short, long)]
    pub input: Option<PathBuf>,
    /// Rewind the input file when it runs out
    #[clap(long = "loop")]
    pub looping: bool,
    /// Read files as fast as possible instead of at the sample rate
    #[clap(long)]
    pub no_pace: bool,
    /// Offset of the synthetic tone from the center frequency, Hz
    #[clap(long, default_value_t = 5000.0, allow_hyphen_values = true)]
    pub tone_offset: f64,
    /// Noise amplitude of the synthetic source, fraction of full scale
    #[clap(long, default_value_t = 0.001)]
    pub noise: f32,
    /// FFT size (power of two, 64 to 1024)
    #[clap(short, long, default_value_t = 512)]
    pub size: usize,
    /// FFT segments averaged per sample block
    #[clap(short, long, default_value_t = 12)]
    pub buffers: usize,
    /// Sample rate in Hz
    #[clap(short = 'r', long, default_value_t = 48_000)]
    pub sample_rate: u32,
    /// Block skip policy: N > 0 drops every N+1th block, N < 0 keeps every -N+1th
    #[clap(long, default_value_t = 0, allow_hyphen_values = true)]
    pub skip: i32,
    /// Display width in pixels, the FFT size never exceeds it
    #[clap(long, default_value_t = 1280)]
    pub display_width: usize,
    /// Height of the 2D spectrum plot in pixels
    #[clap(long, default_value_t = 400)]
    pub display_height: u32,
    /// Enable the waterfall
    #[clap(short, long)]
    pub waterfall: bool,
    /// Waterfall history, in rows
    #[clap(long, default_value_t = 100)]
    pub waterfall_lines: usize,
    /// Spectra combined into one waterfall row (1 to 20)
    #[clap(long, default_value_t = 4)]
    pub waterfall_accumulation: usize,
    /// Waterfall palette (1 to 5)
    #[clap(long, default_value_t = 1)]
    pub waterfall_palette: u8,
    /// Combine waterfall spectra by peak instead of mean
    #[clap(long)]
    pub max_hold: bool,
    /// Bottom of the 2D spectrum, dB
    #[clap(long, default_value_t = -120.0, allow_hyphen_values = true)]
    pub sp_min: f32,
    /// Top of the 2D spectrum, dB
    #[clap(long, default_value_t = -20.0, allow_hyphen_values = true)]
    pub sp_max: f32,
    /// Bottom of the waterfall palette, dB
    #[clap(long, default_value_t = -130.0, allow_hyphen_values = true)]
    pub v_min: f32,
    /// Top of the waterfall palette, dB
    #[clap(long, default_value_t = -20.0, allow_hyphen_values = true)]
    pub v_max: f32,
    /// Undo the one sample I/Q lag of PCM290x sound cards
    #[clap(long)]
    pub lagfix: bool,
    /// Swap I and Q, mirroring the spectrum
    #[clap(long)]
    pub rev_iq: bool,
    /// Pulse clipper threshold as a multiple of the median level, 0 disables
    #[clap(long, default_value_t = 0.0)]
    pub pulse: f32,
    /// Sample level (fraction of full scale) that lights the clip LED
    #[clap(long, default_value_t = 0.99)]
    pub clip_level: f32,
    /// Sample queue capacity, in blocks
    #[clap(long, default_value_t = 32)]
    pub queue_capacity: usize,
    /// Blocks thrown away when the stream starts
    #[clap(long, default_value_t = 1)]
    pub discard_first: usize,
    /// Frequency control
    #[clap(long, value_enum, default_value = "none")]
    pub control: ControlKind,
    /// Initial frequency for memory control, Hz
    #[clap(long, default_value_t = 0)]
    pub frequency: u64,
    /// rigctld host:port
    #[clap(long, default_value = crate::rig::RIGCTLD_ADDRESS)]
    pub hamlib_address: String,
    /// Rig polling interval, seconds
    #[clap(long, default_value_t = 1.0)]
    pub hamlib_interval: f64,
    /// CPU load polling interval, seconds
    #[clap(long, default_value_t = 3.0)]
    pub cpu_load_interval: f64,
    /// Stop after this many frames, 0 runs until interrupted
    #[clap(short, long, default_value_t = 0)]
    pub frames: u64,
    /// Directory to write a waterfall snapshot into on exit
    #[clap(long)]
    pub snapshot: Option<PathBuf>,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}
