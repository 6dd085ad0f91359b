//! Sample sources
//!
//! The producers that feed the sample queue, chosen once at startup. A pull
//! source is read block by block ([`BlockReader`]); a push source runs its own
//! callback loop and hands blocks over as they are ready. Either way the blocks
//! end up in [`QueueProducer::push`] on the acquisition thread.

use std::{
    f64::consts::TAU,
    fs::File,
    io::{BufReader, ErrorKind, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_utils::atomic::AtomicCell;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info};

use crate::{
    capture::QueueProducer,
    complex::{Iq, RawFormat},
    error::SourceError,
    monitoring::SharedCell,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum SourceKind {
    /// Synthetic tone plus noise, paced like a sound card callback
    Tone,
    /// Raw stereo s16le capture from a sound card (Q left, I right)
    Pcm,
    /// Raw unsigned 8 bit I/Q from an RTL-SDR dongle
    Rtl,
}

/// What a push source hands to its callback
#[derive(Clone, Debug, PartialEq)]
pub enum Delivery {
    Block(Vec<Iq>),
    /// The source lost data on its side
    Overrun,
}

pub trait BlockReader: Send {
    /// Read the next `n` samples. `Ok(None)` means the source is exhausted.
    fn read_block(&mut self, n: usize) -> Result<Option<Vec<Iq>>, SourceError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceSettings {
    pub kind: SourceKind,
    pub input: Option<PathBuf>,
    pub sample_rate: u32,
    /// Tone offset from the center frequency, Hz
    pub tone_offset_hz: f64,
    /// Tone amplitude, fraction of full scale
    pub tone_amplitude: f32,
    /// Noise amplitude, fraction of full scale
    pub noise: f32,
    /// Rewind file sources at end of file
    pub looping: bool,
    /// Deliver blocks at the real sample rate rather than as fast as possible
    pub realtime: bool,
}

/// Push source generating a complex tone in white noise
pub struct ToneSource {
    step: f64,
    phase: f64,
    amplitude: f32,
    noise: f32,
    rng: StdRng,
    sample_rate: u32,
    realtime: bool,
}

impl ToneSource {
    pub fn new(settings: &SourceSettings) -> Self {
        Self {
            step: TAU * settings.tone_offset_hz / settings.sample_rate as f64,
            phase: 0.0,
            amplitude: settings.tone_amplitude,
            noise: settings.noise,
            rng: StdRng::seed_from_u64(0x1a_2b_3c),
            sample_rate: settings.sample_rate,
            realtime: settings.realtime,
        }
    }

    fn generate(&mut self, n: usize) -> Vec<Iq> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let tone = Iq::from_polar(self.amplitude, self.phase as f32);
            let noise = if self.noise > 0.0 {
                Iq::new(
                    self.rng.gen_range(-self.noise..self.noise),
                    self.rng.gen_range(-self.noise..self.noise),
                )
            } else {
                Iq::default()
            };
            out.push(tone + noise);
            self.phase = (self.phase + self.step) % TAU;
        }
        out
    }

    /// Run the callback loop until `stop` is raised. Each block holds the
    /// number of samples in `chunk` at the time it is generated.
    pub fn run(
        mut self,
        chunk: &AtomicCell<usize>,
        stop: &AtomicBool,
        mut on_block_ready: impl FnMut(Delivery),
    ) {
        let mut deadline = Instant::now();
        while !stop.load(Ordering::Acquire) {
            let n = chunk.load().max(1);
            let period = Duration::from_secs_f64(n as f64 / self.sample_rate as f64);
            if self.realtime {
                let now = Instant::now();
                if now < deadline {
                    thread::sleep(deadline - now);
                } else if now - deadline > period {
                    // We fell a whole block behind, like a sound card input overflow
                    on_block_ready(Delivery::Overrun);
                    deadline = now;
                }
                deadline += period;
            }
            on_block_ready(Delivery::Block(self.generate(n)));
        }
    }
}

/// Pull source replaying a raw capture file
pub struct FileSource {
    reader: BufReader<File>,
    format: RawFormat,
    looping: bool,
    bytes: Vec<u8>,
}

impl FileSource {
    pub fn open(path: &Path, format: RawFormat, looping: bool) -> Result<Self, SourceError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < format.bytes_per_sample() {
            return Err(SourceError::Truncated {
                got: len,
                want: format.bytes_per_sample(),
            });
        }
        info!(path = %path.display(), ?format, len, "Opened capture file");
        Ok(Self {
            reader: BufReader::new(file),
            format,
            looping,
            bytes: vec![],
        })
    }

    /// Fill `self.bytes` completely, returning how much was actually read
    fn fill(&mut self) -> Result<usize, SourceError> {
        let mut filled = 0;
        while filled < self.bytes.len() {
            match self.reader.read(&mut self.bytes[filled..]) {
                Ok(0) => {
                    if !self.looping || filled == 0 && self.at_start()? {
                        break;
                    }
                    self.reader.seek(SeekFrom::Start(0))?;
                    debug!("Capture file rewound");
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn at_start(&mut self) -> Result<bool, SourceError> {
        Ok(self.reader.stream_position()? == 0)
    }
}

impl BlockReader for FileSource {
    fn read_block(&mut self, n: usize) -> Result<Option<Vec<Iq>>, SourceError> {
        let want = n * self.format.bytes_per_sample();
        self.bytes.resize(want, 0);
        let got = self.fill()?;
        if got < want {
            // A partial block at the end of a one-shot file is dropped
            return Ok(None);
        }
        let mut samples = Vec::with_capacity(n);
        self.format.unpack(&self.bytes, &mut samples);
        Ok(Some(samples))
    }
}

/// The sample source selected at startup
pub enum SampleSource {
    Tone(ToneSource),
    File {
        source: FileSource,
        sample_rate: u32,
        realtime: bool,
    },
}

impl SampleSource {
    pub fn open(settings: &SourceSettings) -> Result<Self, SourceError> {
        let format = match settings.kind {
            SourceKind::Tone => return Ok(SampleSource::Tone(ToneSource::new(settings))),
            SourceKind::Pcm => RawFormat::PcmS16,
            SourceKind::Rtl => RawFormat::RtlU8,
        };
        let path = settings
            .input
            .as_deref()
            .ok_or(SourceError::MissingInput(match settings.kind {
                SourceKind::Rtl => "rtl",
                _ => "pcm",
            }))?;
        Ok(SampleSource::File {
            source: FileSource::open(path, format, settings.looping)?,
            sample_rate: settings.sample_rate,
            realtime: settings.realtime,
        })
    }

    /// Start the acquisition thread, delivering blocks into `producer` until
    /// `stop` is raised or the source runs dry. Block length follows `chunk`,
    /// which the display loop updates when the FFT size changes.
    pub fn spawn(
        self,
        mut producer: QueueProducer,
        chunk: SharedCell<usize>,
        stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<Result<(), SourceError>>, SourceError> {
        producer.restart();
        let builder = thread::Builder::new().name("acquisition".into());
        let spawned = match self {
            SampleSource::Tone(tone) => builder.spawn(move || -> Result<(), SourceError> {
                tone.run(&chunk, &stop, |delivery| match delivery {
                    Delivery::Block(samples) => {
                        producer.push(samples);
                    }
                    Delivery::Overrun => producer.report_overrun(),
                });
                Ok(())
            }),
            SampleSource::File {
                mut source,
                sample_rate,
                realtime,
            } => builder.spawn(move || -> Result<(), SourceError> {
                let mut deadline = Instant::now();
                while !stop.load(Ordering::Acquire) {
                    let n = chunk.load().max(1);
                    let Some(samples) = source.read_block(n)? else {
                        info!("Capture file exhausted");
                        break;
                    };
                    producer.push(samples);
                    if realtime {
                        deadline += Duration::from_secs_f64(n as f64 / sample_rate as f64);
                        if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
                            thread::sleep(wait);
                        }
                    }
                }
                Ok(())
            }),
        };
        spawned.map_err(|e| SourceError::Spawn(e.to_string()))
    }
}
