//! Display scaling: the dB / frequency grid and spectrum-to-pixel mapping
//!
//! The grid is a pure function of the dB range, sample rate and plot size.
//! It is built lazily by [`Graticule::make`] and cached until one of those changes.

use crate::{error::RangeError, f_engine::Spectrum, range::DbRange};

/// Half-span candidates for the frequency axis, in kHz, largest first
pub const FREQ_TICK_CANDIDATES_KHZ: [u32; 8] = [800, 400, 200, 100, 80, 40, 20, 10];
const DB_TICK_STEP: f64 = 10.0;
// Wider ranges step by powers of ten instead
const MAX_DB_TICKS: f64 = 20.0;
// Keeps the bottom line off the plot edge
const BASELINE_PX: f32 = 3.0;

#[derive(Clone, Debug, PartialEq)]
pub struct DbTick {
    pub db: f32,
    pub y: f32,
    pub label: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FreqTick {
    pub offset_khz: f32,
    pub x: f32,
    pub label: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Grid {
    pub db_ticks: Vec<DbTick>,
    pub freq_ticks: Vec<FreqTick>,
    /// Chosen half-span of the frequency axis in kHz
    pub half_span_khz: u32,
}

pub struct Graticule {
    range: DbRange,
    default_range: DbRange,
    sample_rate: u32,
    width: f32,
    height: f32,
    grid: Option<Grid>,
    builds: usize,
}

/// Largest candidate half-span strictly inside the Nyquist half-bandwidth
pub fn freq_half_span_khz(sample_rate: u32) -> u32 {
    let half_khz = sample_rate as f32 / 2000.0;
    FREQ_TICK_CANDIDATES_KHZ
        .iter()
        .copied()
        .find(|&t| (t as f32) < half_khz)
        .unwrap_or(FREQ_TICK_CANDIDATES_KHZ[FREQ_TICK_CANDIDATES_KHZ.len() - 1])
}

impl Graticule {
    pub fn new(range: DbRange, sample_rate: u32, width: u32, height: u32) -> Self {
        Self {
            range,
            default_range: range,
            sample_rate,
            width: width as f32,
            height: height as f32,
            grid: None,
            builds: 0,
        }
    }

    pub fn range(&self) -> DbRange {
        self.range
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn set_range(&mut self, min: f32, max: f32) -> Result<(), RangeError> {
        let range = DbRange::new(min, max)?;
        if range != self.range {
            self.range = range;
            self.grid = None;
        }
        Ok(())
    }

    pub fn reset_range(&mut self) -> (f32, f32) {
        if self.range != self.default_range {
            self.range = self.default_range;
            self.grid = None;
        }
        (self.range.min(), self.range.max())
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        if sample_rate != self.sample_rate {
            self.sample_rate = sample_rate;
            self.grid = None;
        }
    }

    /// How many times the grid has been rebuilt
    pub fn builds(&self) -> usize {
        self.builds
    }

    /// The current grid, rebuilt only if the range or sample rate changed
    pub fn make(&mut self) -> &Grid {
        if self.grid.is_none() {
            self.builds += 1;
        }
        let (range, sample_rate, width, height) =
            (self.range, self.sample_rate, self.width, self.height);
        self.grid
            .get_or_insert_with(|| build(range, sample_rate, width, height))
    }

    /// Screen y of a level, growing downwards
    pub fn db_to_y(&self, db: f32) -> f32 {
        db_to_y(&self.range, self.height, db)
    }

    /// Polyline of a spectrum, zero frequency in the middle of the plot
    pub fn trace(&self, spectrum: &Spectrum) -> Vec<(f32, f32)> {
        let centered = spectrum.centered();
        let n = centered.len().max(1) as f32;
        centered
            .iter()
            .enumerate()
            .map(|(i, &db)| (i as f32 * self.width / n, self.db_to_y(db)))
            .collect()
    }
}

fn db_to_y(range: &DbRange, height: f32, db: f32) -> f32 {
    let yscale = height / range.span();
    height - ((db - range.min()) * yscale + BASELINE_PX)
}

fn build(range: DbRange, sample_rate: u32, width: f32, height: f32) -> Grid {
    let (min, max) = (range.min() as f64, range.max() as f64);
    let span = max - min;
    let mut step = DB_TICK_STEP;
    while span / step > MAX_DB_TICKS {
        step *= 10.0;
    }
    let count = (span / step).ceil() as usize;
    let mut db_ticks: Vec<DbTick> = (0..count)
        .map(|i| min + i as f64 * step)
        .take_while(|&db| db < max)
        .map(|db| DbTick {
            db: db as f32,
            y: db_to_y(&range, height, db as f32),
            label: format!("{:3}", db.round() as i64),
        })
        .collect();
    if let Some(top) = db_ticks.last_mut() {
        top.label.push_str(" dB");
    }

    let span_khz = sample_rate as f32 / 1000.0;
    let xscale = width / span_khz;
    let half_span_khz = freq_half_span_khz(sample_rate);
    let t = half_span_khz as f32;
    let freq_ticks = [-t, -t / 2.0, 0.0, t / 2.0, t]
        .into_iter()
        .map(|offset_khz| FreqTick {
            offset_khz,
            x: offset_khz * xscale + width / 2.0,
            label: if offset_khz == 0.0 {
                "0 kHz".to_owned()
            } else {
                format!("{:+}", offset_khz as i32)
            },
        })
        .collect();

    Grid {
        db_ticks,
        freq_ticks,
        half_span_khz,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graticule() -> Graticule {
        Graticule::new(DbRange::new(-120.0, -20.0).unwrap(), 48_000, 1280, 400)
    }

    #[test]
    fn half_span_choice() {
        assert_eq!(freq_half_span_khz(48_000), 20);
        assert_eq!(freq_half_span_khz(96_000), 40);
        assert_eq!(freq_half_span_khz(192_000), 80);
        assert_eq!(freq_half_span_khz(2_048_000), 800);
        // 40 kHz is not strictly inside an 80 kHz sample rate
        assert_eq!(freq_half_span_khz(80_000), 20);
        assert_eq!(freq_half_span_khz(8_000), 10);
    }

    #[test]
    fn db_ticks_every_ten() {
        let mut g = graticule();
        let grid = g.make();
        let dbs: Vec<f32> = grid.db_ticks.iter().map(|t| t.db).collect();
        assert_eq!(
            dbs,
            vec![-120.0, -110.0, -100.0, -90.0, -80.0, -70.0, -60.0, -50.0, -40.0, -30.0]
        );
        assert_eq!(grid.db_ticks[0].label, "-120");
        assert_eq!(grid.db_ticks[9].label, "-30 dB");
        // Bottom line sits just above the lower edge, lines go up with level
        assert_eq!(grid.db_ticks[0].y, 397.0);
        assert!(grid.db_ticks[9].y < grid.db_ticks[0].y);
    }

    #[test]
    fn wide_range_ticks_stay_bounded() {
        let mut g = graticule();
        g.set_range(-1e10, 0.0).unwrap();
        let dbs: Vec<f32> = g.make().db_ticks.iter().map(|t| t.db).collect();
        assert_eq!(dbs.len(), 10);
        assert_eq!(dbs[0], -1e10);
        assert!(dbs.windows(2).all(|w| w[0] < w[1]));
        assert!(dbs.iter().all(|&db| db < 0.0));

        g.set_range(-1000.0, 0.0).unwrap();
        let grid = g.make();
        assert_eq!(grid.db_ticks.len(), 10);
        assert_eq!(grid.db_ticks[1].db, -900.0);
        assert_eq!(grid.db_ticks[9].label, "-100 dB");
    }

    #[test]
    fn narrow_range_has_one_tick() {
        let mut g = graticule();
        g.set_range(-50.0, -45.0).unwrap();
        let grid = g.make();
        assert_eq!(grid.db_ticks.len(), 1);
        assert_eq!(grid.db_ticks[0].label, "-50 dB");
    }

    #[test]
    fn freq_ticks_centered() {
        let mut g = graticule();
        let grid = g.make();
        let labels: Vec<&str> = grid.freq_ticks.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, vec!["-20", "-10", "0 kHz", "+10", "+20"]);
        assert_eq!(grid.freq_ticks[2].x, 640.0);
        // 48 kHz over 1280 px
        assert!((grid.freq_ticks[4].x - (640.0 + 20.0 * 1280.0 / 48.0)).abs() < 1e-3);
    }

    #[test]
    fn grid_is_cached_until_inputs_change() {
        let mut g = graticule();
        g.make();
        g.make();
        assert_eq!(g.builds(), 1);
        g.set_range(-120.0, -20.0).unwrap();
        g.make();
        assert_eq!(g.builds(), 1);
        g.set_range(-100.0, 0.0).unwrap();
        g.make();
        assert_eq!(g.builds(), 2);
        g.set_sample_rate(96_000);
        assert_eq!(g.make().half_span_khz, 40);
        assert_eq!(g.builds(), 3);
    }

    #[test]
    fn bad_range_leaves_state() {
        let mut g = graticule();
        g.make();
        assert!(g.set_range(-20.0, -20.0).is_err());
        assert_eq!(g.range(), DbRange::new(-120.0, -20.0).unwrap());
        g.make();
        assert_eq!(g.builds(), 1);
        g.set_range(-90.0, -10.0).unwrap();
        assert_eq!(g.reset_range(), (-120.0, -20.0));
    }

    #[test]
    fn trace_spans_the_width() {
        use crate::f_engine::BlockStats;
        let g = graticule();
        let sp = Spectrum {
            seq: 0,
            bins: vec![-120.0, -20.0, -70.0, -70.0],
            range: g.range(),
            stats: BlockStats::default(),
        };
        let pts = g.trace(&sp);
        assert_eq!(pts.len(), 4);
        assert_eq!(pts[0], (0.0, 200.0 - 3.0));
        assert_eq!(pts[2], (640.0, 397.0));
        assert_eq!(pts[3].1, -3.0);
    }
}
