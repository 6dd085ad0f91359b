//! This module turns successive spectra into waterfall rows
//!
//! `nsum` spectra are combined into one row, the row is mapped through the
//! palette range into a fixed number of color steps and pushed onto a bounded
//! history, newest first. Rows keep their dB values so a range change can
//! recolor the whole history without new data.

use std::{
    collections::VecDeque,
    io::{self, Write},
};

use tracing::debug;

use crate::{error::RangeError, f_engine::Spectrum, range::DbRange};

/// Number of distinct colors in a palette
pub const DEFAULT_STEPS: usize = 50;
/// Waterfall history height
pub const DEFAULT_LINES: usize = 100;
/// Largest accepted spectra-per-row count
pub const MAX_NSUM: usize = 20;

type Rgb = [u8; 3];

/// Selectable color ramps, numbered 1 to 5 on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Palette {
    #[default]
    Classic,
    Heat,
    Grayscale,
    Ocean,
    Phosphor,
}

impl Palette {
    pub const ALL: [Palette; 5] = [
        Palette::Classic,
        Palette::Heat,
        Palette::Grayscale,
        Palette::Ocean,
        Palette::Phosphor,
    ];

    /// Palette for a 1-based index, clamped into range
    pub fn from_index(index: u8) -> Self {
        Self::ALL[(index.clamp(1, 5) - 1) as usize]
    }

    pub fn index(self) -> u8 {
        self as u8 + 1
    }

    fn stops(self) -> &'static [Rgb] {
        match self {
            Palette::Classic => &[
                [0, 0, 32],
                [0, 0, 255],
                [0, 255, 255],
                [0, 255, 0],
                [255, 255, 0],
                [255, 0, 0],
                [255, 255, 255],
            ],
            Palette::Heat => &[
                [0, 0, 0],
                [128, 0, 0],
                [255, 0, 0],
                [255, 128, 0],
                [255, 255, 0],
                [255, 255, 255],
            ],
            Palette::Grayscale => &[[0, 0, 0], [255, 255, 255]],
            Palette::Ocean => &[
                [0, 0, 0],
                [0, 32, 96],
                [0, 128, 192],
                [64, 224, 208],
                [224, 255, 255],
            ],
            Palette::Phosphor => &[[0, 0, 0], [0, 96, 0], [0, 255, 0], [200, 255, 200]],
        }
    }

    /// Sample the ramp at `steps` evenly spaced points
    pub fn colors(self, steps: usize) -> Vec<Rgb> {
        let stops = self.stops();
        let last = (stops.len() - 1) as f32;
        (0..steps)
            .map(|i| {
                let t = if steps > 1 {
                    i as f32 / (steps - 1) as f32
                } else {
                    0.0
                };
                let pos = t * last;
                let lo = (pos.floor() as usize).min(stops.len() - 1);
                let hi = (lo + 1).min(stops.len() - 1);
                let frac = pos - lo as f32;
                let mut rgb = [0u8; 3];
                for c in 0..3 {
                    let a = stops[lo][c] as f32;
                    let b = stops[hi][c] as f32;
                    rgb[c] = (a + (b - a) * frac).round() as u8;
                }
                rgb
            })
            .collect()
    }
}

/// How the spectra of one row are combined
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Combine {
    #[default]
    Mean,
    MaxHold,
}

/// Map a level onto `0..steps`, clamping values outside the range to the ends
pub fn palette_index(db: f32, range: &DbRange, steps: usize) -> u8 {
    let top = steps.clamp(1, 256) - 1;
    let scaled = (range.fraction(db) * steps as f32).floor();
    if scaled.is_nan() || scaled <= 0.0 {
        0
    } else {
        (scaled as usize).min(top) as u8
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WaterfallRow {
    /// Sequence number of the last block folded into this row
    pub seq: u64,
    pub db: Vec<f32>,
    pub indices: Vec<u8>,
}

pub struct Waterfall {
    palette: Palette,
    colors: Vec<Rgb>,
    steps: usize,
    range: DbRange,
    default_range: DbRange,
    combine: Combine,
    lines: usize,
    width: usize,
    acc: Vec<f32>,
    acc_count: usize,
    rows: VecDeque<WaterfallRow>,
}

impl Waterfall {
    pub fn new(width: usize, lines: usize, steps: usize, range: DbRange, palette: Palette) -> Self {
        let steps = steps.clamp(2, 256);
        let lines = lines.max(1);
        Self {
            palette,
            colors: palette.colors(steps),
            steps,
            range,
            default_range: range,
            combine: Combine::Mean,
            lines,
            width,
            acc: vec![0.0; width],
            acc_count: 0,
            rows: VecDeque::with_capacity(lines + 1),
        }
    }

    pub fn with_combine(mut self, combine: Combine) -> Self {
        self.combine = combine;
        self
    }

    /// Fold one spectrum into the running row. Every `nsum`th call completes the
    /// row, pushes it onto the history and returns it.
    pub fn accumulate(&mut self, spectrum: &Spectrum, nsum: usize) -> Option<&WaterfallRow> {
        let nsum = nsum.clamp(1, MAX_NSUM);
        if spectrum.len() != self.width {
            self.rebuild(spectrum.len());
        }

        if self.acc_count == 0 {
            self.acc.copy_from_slice(&spectrum.bins);
        } else {
            match self.combine {
                Combine::Mean => {
                    for (a, v) in self.acc.iter_mut().zip(&spectrum.bins) {
                        *a += v;
                    }
                }
                Combine::MaxHold => {
                    for (a, v) in self.acc.iter_mut().zip(&spectrum.bins) {
                        *a = a.max(*v);
                    }
                }
            }
        }
        self.acc_count += 1;
        if self.acc_count < nsum {
            return None;
        }

        let db: Vec<f32> = match self.combine {
            Combine::Mean => {
                let n = self.acc_count as f32;
                self.acc.iter().map(|a| a / n).collect()
            }
            Combine::MaxHold => self.acc.clone(),
        };
        self.acc_count = 0;
        let indices = self.map_row(&db);
        self.rows.push_front(WaterfallRow {
            seq: spectrum.seq,
            db,
            indices,
        });
        if self.rows.len() > self.lines {
            self.rows.pop_back();
        }
        self.rows.front()
    }

    /// Throw away the width-mismatched history and start over at `width`
    fn rebuild(&mut self, width: usize) {
        debug!(
            old = self.width,
            new = width,
            "Spectrum width changed, rebuilding waterfall"
        );
        self.width = width;
        self.rows.clear();
        self.acc = vec![0.0; width];
        self.acc_count = 0;
    }

    fn map_row(&self, db: &[f32]) -> Vec<u8> {
        db.iter()
            .map(|&v| palette_index(v, &self.range, self.steps))
            .collect()
    }

    /// Drop a partially accumulated row
    pub fn discard_partial(&mut self) {
        self.acc_count = 0;
    }

    pub fn set_range(&mut self, min: f32, max: f32) -> Result<(), RangeError> {
        self.range = DbRange::new(min, max)?;
        self.recolor();
        Ok(())
    }

    /// Restore the startup range and hand it back for display
    pub fn reset_range(&mut self) -> (f32, f32) {
        self.range = self.default_range;
        self.recolor();
        (self.range.min(), self.range.max())
    }

    pub fn set_palette(&mut self, palette: Palette) {
        self.palette = palette;
        self.colors = palette.colors(self.steps);
    }

    fn recolor(&mut self) {
        let (range, steps) = (self.range, self.steps);
        for row in self.rows.iter_mut() {
            for (i, &v) in row.indices.iter_mut().zip(&row.db) {
                *i = palette_index(v, &range, steps);
            }
        }
    }

    pub fn range(&self) -> DbRange {
        self.range
    }

    pub fn palette(&self) -> Palette {
        self.palette
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// History, newest row first
    pub fn rows(&self) -> impl Iterator<Item = &WaterfallRow> {
        self.rows.iter()
    }

    pub fn color(&self, index: u8) -> Rgb {
        self.colors[(index as usize).min(self.colors.len() - 1)]
    }

    /// Write the history as a binary PPM, newest row on top, zero frequency centered
    pub fn write_ppm<W: Write>(&self, mut out: W) -> io::Result<()> {
        write!(out, "P6\n{} {}\n255\n", self.width, self.rows.len())?;
        let half = self.width / 2;
        let mut line = Vec::with_capacity(self.width * 3);
        for row in &self.rows {
            line.clear();
            for &i in row.indices[half..].iter().chain(&row.indices[..half]) {
                line.extend_from_slice(&self.color(i));
            }
            out.write_all(&line)?;
        }
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::f_engine::BlockStats;

    fn range() -> DbRange {
        DbRange::new(-130.0, -20.0).unwrap()
    }

    fn flat(db: f32, width: usize, seq: u64) -> Spectrum {
        Spectrum {
            seq,
            bins: vec![db; width],
            range: range(),
            stats: BlockStats::default(),
        }
    }

    #[test]
    fn mapping_is_monotonic_and_clamped() {
        let r = range();
        let mut last = 0;
        for step in 0..400 {
            let db = -160.0 + step as f32 * 0.5;
            let idx = palette_index(db, &r, DEFAULT_STEPS);
            assert!(idx >= last);
            last = idx;
        }
        assert_eq!(palette_index(-130.0, &r, 50), 0);
        assert_eq!(palette_index(-500.0, &r, 50), 0);
        assert_eq!(palette_index(-20.0, &r, 50), 49);
        assert_eq!(palette_index(40.0, &r, 50), 49);
        assert_eq!(palette_index(f32::NAN, &r, 50), 0);
    }

    #[test]
    fn averaged_constant_row_maps_like_a_single_value() {
        let mut wf = Waterfall::new(64, 10, DEFAULT_STEPS, range(), Palette::Classic);
        for seq in 0..3 {
            assert!(wf.accumulate(&flat(-60.0, 64, seq), 4).is_none());
        }
        let row = wf.accumulate(&flat(-60.0, 64, 3), 4).unwrap();
        let want = palette_index(-60.0, &range(), 50);
        assert_eq!(want, 31);
        assert!(row.indices.iter().all(|&i| i == want));
        assert!(row.db.iter().all(|&v| (v + 60.0).abs() < 1e-4));
        assert_eq!(row.seq, 3);
        assert_eq!(wf.len(), 1);
    }

    #[test]
    fn mean_and_max_hold() {
        let mut wf = Waterfall::new(4, 10, 50, range(), Palette::Heat);
        wf.accumulate(&flat(-100.0, 4, 0), 2);
        let row = wf.accumulate(&flat(-40.0, 4, 1), 2).unwrap();
        assert_eq!(row.db, vec![-70.0; 4]);

        let mut wf = Waterfall::new(4, 10, 50, range(), Palette::Heat).with_combine(Combine::MaxHold);
        wf.accumulate(&flat(-100.0, 4, 0), 2);
        let row = wf.accumulate(&flat(-40.0, 4, 1), 2).unwrap();
        assert_eq!(row.db, vec![-40.0; 4]);
    }

    #[test]
    fn history_is_bounded_newest_first() {
        let mut wf = Waterfall::new(8, 3, 50, range(), Palette::Classic);
        for seq in 0..5 {
            wf.accumulate(&flat(-50.0, 8, seq), 1);
        }
        assert_eq!(wf.len(), 3);
        let seqs: Vec<u64> = wf.rows().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![4, 3, 2]);
    }

    #[test]
    fn width_change_rebuilds() {
        let mut wf = Waterfall::new(8, 5, 50, range(), Palette::Classic);
        wf.accumulate(&flat(-50.0, 8, 0), 1);
        wf.accumulate(&flat(-50.0, 8, 1), 2);
        let row = wf.accumulate(&flat(-50.0, 16, 2), 2);
        assert!(row.is_none());
        assert_eq!(wf.len(), 0);
        assert_eq!(wf.width(), 16);
        let row = wf.accumulate(&flat(-50.0, 16, 3), 2).unwrap();
        assert_eq!(row.indices.len(), 16);
    }

    #[test]
    fn range_changes_recolor_history() {
        let mut wf = Waterfall::new(4, 5, 50, range(), Palette::Classic);
        wf.accumulate(&flat(-60.0, 4, 0), 1);
        let before: Vec<u8> = wf.rows().next().unwrap().indices.clone();
        assert!(wf.set_range(-20.0, -130.0).is_err());
        assert_eq!(wf.range(), range());
        assert_eq!(wf.rows().next().unwrap().indices, before);

        wf.set_range(-60.0, 0.0).unwrap();
        assert!(wf.rows().next().unwrap().indices.iter().all(|&i| i == 0));
        assert_eq!(wf.rows().next().unwrap().db, vec![-60.0; 4]);

        assert_eq!(wf.reset_range(), (-130.0, -20.0));
        assert_eq!(wf.rows().next().unwrap().indices, before);
    }

    #[test]
    fn palette_switch_keeps_levels() {
        let mut wf = Waterfall::new(4, 5, 50, range(), Palette::Classic);
        wf.accumulate(&flat(-20.0, 4, 0), 1);
        let top = wf.rows().next().unwrap().indices[0];
        assert_eq!(wf.color(top), [255, 255, 255]);
        wf.set_palette(Palette::from_index(5));
        assert_eq!(wf.palette(), Palette::Phosphor);
        assert_eq!(wf.rows().next().unwrap().indices[0], top);
        assert_eq!(wf.color(top), [200, 255, 200]);
        assert_eq!(wf.color(0), [0, 0, 0]);
    }

    #[test]
    fn palette_indices_clamp() {
        assert_eq!(Palette::from_index(0), Palette::Classic);
        assert_eq!(Palette::from_index(9), Palette::Phosphor);
        assert_eq!(Palette::Ocean.index(), 4);
        assert_eq!(Palette::Grayscale.colors(3), vec![[0, 0, 0], [128, 128, 128], [255, 255, 255]]);
    }

    #[test]
    fn discard_partial_restarts_row() {
        let mut wf = Waterfall::new(4, 5, 50, range(), Palette::Classic);
        wf.accumulate(&flat(-100.0, 4, 0), 2);
        wf.discard_partial();
        wf.accumulate(&flat(-40.0, 4, 1), 2);
        let row = wf.accumulate(&flat(-40.0, 4, 2), 2).unwrap();
        assert_eq!(row.db, vec![-40.0; 4]);
    }

    #[test]
    fn ppm_snapshot() {
        let mut wf = Waterfall::new(4, 5, 50, range(), Palette::Grayscale);
        wf.accumulate(&flat(-20.0, 4, 0), 1);
        wf.accumulate(&flat(-130.0, 4, 1), 1);
        let mut out = vec![];
        wf.write_ppm(&mut out).unwrap();
        let header = b"P6\n4 2\n255\n";
        assert_eq!(&out[..header.len()], header);
        let pixels = &out[header.len()..];
        assert_eq!(pixels.len(), 4 * 2 * 3);
        assert!(pixels[..12].iter().all(|&b| b == 0));
        assert!(pixels[12..].iter().all(|&b| b == 255));
    }
}
