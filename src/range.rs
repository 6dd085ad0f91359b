//! Validated dB ranges shared by the scaler, engine and waterfall palette

use crate::error::RangeError;

/// A strictly increasing `[min, max]` interval in dB
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DbRange {
    min: f32,
    max: f32,
}

impl DbRange {
    pub fn new(min: f32, max: f32) -> Result<Self, RangeError> {
        // `!(max > min)` also rejects NaN on either side
        if !(max > min) || !min.is_finite() || !max.is_finite() {
            return Err(RangeError::NotIncreasing { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn span(&self) -> f32 {
        self.max - self.min
    }

    /// Position of `db` within the range, 0 at `min` and 1 at `max` (unclamped)
    pub fn fraction(&self, db: f32) -> f32 {
        (db - self.min) / self.span()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_increasing() {
        assert!(DbRange::new(-20.0, -20.0).is_err());
        assert!(DbRange::new(-20.0, -120.0).is_err());
        assert!(DbRange::new(f32::NAN, 0.0).is_err());
        assert_eq!(
            DbRange::new(0.0, -1.0),
            Err(RangeError::NotIncreasing { min: 0.0, max: -1.0 })
        );
    }

    #[test]
    fn fraction() {
        let r = DbRange::new(-120.0, -20.0).unwrap();
        assert_eq!(r.fraction(-120.0), 0.0);
        assert_eq!(r.fraction(-20.0), 1.0);
        assert_eq!(r.fraction(-70.0), 0.5);
    }
}
