pub use rustfft::num_complex::Complex;

/// One normalized I/Q sample, full scale is ±1.0 on each channel
pub type Iq = Complex<f32>;

const PCM_FULL_SCALE: f32 = 32768.0;
// RTL dongles deliver offset binary, 0..=255 centered on 127.5
const RTL_OFFSET: f32 = 127.5;

/// A fixed-length run of samples tagged with its arrival number.
///
/// Blocks move by value from the producer through the queue into the engine,
/// so exactly one stage owns a block at any time.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleBlock {
    pub seq: u64,
    pub samples: Vec<Iq>,
}

impl SampleBlock {
    pub fn new(seq: u64, samples: Vec<Iq>) -> Self {
        Self { seq, samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Raw on-the-wire sample encodings we know how to unpack
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawFormat {
    /// Interleaved stereo s16le from a sound card, Q on the left channel and I on the right
    PcmS16,
    /// Interleaved unsigned 8 bit I/Q as produced by an RTL-SDR dongle
    RtlU8,
}

impl RawFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            RawFormat::PcmS16 => 4,
            RawFormat::RtlU8 => 2,
        }
    }

    /// Unpack whole samples from `bytes` onto the end of `out`; trailing partial samples are ignored
    pub fn unpack(self, bytes: &[u8], out: &mut Vec<Iq>) {
        match self {
            RawFormat::PcmS16 => unpack_pcm(bytes, out),
            RawFormat::RtlU8 => unpack_rtl(bytes, out),
        }
    }
}

fn unpack_pcm(bytes: &[u8], out: &mut Vec<Iq>) {
    out.extend(bytes.chunks_exact(4).map(|frame| {
        let left = i16::from_le_bytes([frame[0], frame[1]]);
        let right = i16::from_le_bytes([frame[2], frame[3]]);
        Iq::new(right as f32 / PCM_FULL_SCALE, left as f32 / PCM_FULL_SCALE)
    }));
}

fn unpack_rtl(bytes: &[u8], out: &mut Vec<Iq>) {
    out.extend(bytes.chunks_exact(2).map(|pair| {
        Iq::new(
            (pair[0] as f32 - RTL_OFFSET) / RTL_OFFSET,
            (pair[1] as f32 - RTL_OFFSET) / RTL_OFFSET,
        )
    }));
}

/// Pack a normalized sample as one s16le stereo frame (Q left, I right)
pub fn pack_pcm(sample: Iq) -> [u8; 4] {
    let to_i16 = |v: f32| (v * PCM_FULL_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    let [l0, l1] = to_i16(sample.im).to_le_bytes();
    let [r0, r1] = to_i16(sample.re).to_le_bytes();
    [l0, l1, r0, r1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_channel_order() {
        // left = Q = -16384, right = I = 16384
        let bytes = [0x00, 0xc0, 0x00, 0x40];
        let mut out = vec![];
        RawFormat::PcmS16.unpack(&bytes, &mut out);
        assert_eq!(out, vec![Iq::new(0.5, -0.5)]);
        assert_eq!(pack_pcm(out[0]), bytes);
    }

    #[test]
    fn rtl_offset_binary() {
        let mut out = vec![];
        RawFormat::RtlU8.unpack(&[255, 0, 128], &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].re, 1.0);
        assert_eq!(out[0].im, -1.0);
    }
}
