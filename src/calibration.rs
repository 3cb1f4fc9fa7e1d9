//! Declination calibration.
//!
//! The declinometer reports an uncalibrated angle reading. A calibration
//! table maps a handful of raw readings, taken with the telescope parked at
//! known declinations, to true declination; everything in between is
//! linearly interpolated and everything outside is extrapolated from the
//! nearest segment.
//!
//! Tables are stored as one raw reading per line, aligned to the fixed
//! declination steps −25°, −15°, … , 95°.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

/// Southernmost calibration declination, degrees.
pub const SOUTH_DECLINATION: f64 = -25.0;
/// Northernmost calibration declination, degrees.
pub const NORTH_DECLINATION: f64 = 95.0;
/// Spacing of calibration declinations, degrees.
pub const DECLINATION_STEP: f64 = 10.0;

/// Errors from loading or building calibration tables.
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// Fewer than two calibration points.
    #[error("Insufficient calibration data: {0} point(s), at least 2 required")]
    InsufficientData(usize),

    /// Raw readings are not strictly ascending.
    #[error("Calibration table is not monotonic at entry {index} (raw {raw})")]
    NonMonotonic { index: usize, raw: f64 },

    /// A line of the table file is not a number.
    #[error("Calibration file line {line}: '{value}' is not a number")]
    Parse { line: usize, value: String },

    /// Recording continued past the last declination step.
    #[error("Declination calibration walk already complete")]
    WalkComplete,

    /// Reading or writing the table file failed.
    #[error("Calibration file I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Declinations a calibration file is aligned to, south to north.
pub fn declination_steps() -> Vec<f64> {
    let count = ((NORTH_DECLINATION - SOUTH_DECLINATION) / DECLINATION_STEP).round() as usize + 1;
    (0..count)
        .map(|i| SOUTH_DECLINATION + DECLINATION_STEP * i as f64)
        .collect()
}

/// One (raw reading, true declination) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationPoint {
    /// Declinometer reading.
    pub raw: f64,
    /// True declination in degrees.
    pub declination: f64,
}

/// Ordered calibration pairs, strictly ascending in raw reading.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    points: Vec<CalibrationPoint>,
}

impl CalibrationTable {
    /// Build a table from `(raw, declination)` pairs.
    ///
    /// Rejects tables with fewer than two points or raw readings that are
    /// not strictly ascending; a non-monotonic table would silently
    /// miscalibrate every reading.
    pub fn new(pairs: impl IntoIterator<Item = (f64, f64)>) -> Result<Self, CalibrationError> {
        let points: Vec<CalibrationPoint> = pairs
            .into_iter()
            .map(|(raw, declination)| CalibrationPoint { raw, declination })
            .collect();
        if points.len() < 2 {
            return Err(CalibrationError::InsufficientData(points.len()));
        }
        if let Some(index) = points.windows(2).position(|w| !(w[1].raw > w[0].raw)) {
            return Err(CalibrationError::NonMonotonic {
                index: index + 1,
                raw: points[index + 1].raw,
            });
        }
        Ok(Self { points })
    }

    /// Build a table from raw readings aligned to [`declination_steps`].
    ///
    /// Extra readings beyond the last step are ignored.
    pub fn from_readings(readings: &[f64]) -> Result<Self, CalibrationError> {
        Self::new(readings.iter().copied().zip(declination_steps()))
    }

    /// Table used when no calibration file exists.
    pub fn fallback() -> Self {
        let points = declination_steps()
            .into_iter()
            .enumerate()
            .map(|(i, declination)| CalibrationPoint {
                raw: -0.90 + 0.15 * i as f64,
                declination,
            })
            .collect();
        Self { points }
    }

    /// The calibration pairs in ascending raw order.
    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    /// Convert a raw reading to true declination.
    pub fn calibrate(&self, raw: f64) -> f64 {
        let points = &self.points;
        let last = points.len() - 1;
        let segment = if raw < points[0].raw {
            0
        } else if raw > points[last].raw {
            last - 1
        } else {
            // first segment whose upper bound reaches `raw`
            points
                .windows(2)
                .position(|w| raw <= w[1].raw)
                .unwrap_or(last - 1)
        };
        let (lo, hi) = (points[segment], points[segment + 1]);
        let slope = (hi.declination - lo.declination) / (hi.raw - lo.raw);
        slope * (raw - lo.raw) + lo.declination
    }

    /// Parse a table file body: one raw reading per line.
    pub fn parse(text: &str) -> Result<Self, CalibrationError> {
        let mut readings = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let raw = line.parse::<f64>().map_err(|_| CalibrationError::Parse {
                line: i + 1,
                value: line.to_string(),
            })?;
            readings.push(raw);
        }
        Self::from_readings(&readings)
    }

    /// Serialize raw readings, one per line, south to north.
    pub fn to_file_body(&self) -> String {
        self.points
            .iter()
            .map(|p| p.raw.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Whether the active table came from a calibration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStatus {
    /// Loaded from the operator's calibration file.
    Calibrated,
    /// Using [`CalibrationTable::fallback`].
    Uncalibrated,
}

/// Converts declinometer readings to true declination.
#[derive(Debug, Clone)]
pub struct DeclinationCalibrator {
    table: CalibrationTable,
    status: CalibrationStatus,
}

impl DeclinationCalibrator {
    /// Use an explicit table.
    pub fn new(table: CalibrationTable) -> Self {
        Self {
            table,
            status: CalibrationStatus::Calibrated,
        }
    }

    /// Use the fallback table.
    pub fn uncalibrated() -> Self {
        Self {
            table: CalibrationTable::fallback(),
            status: CalibrationStatus::Uncalibrated,
        }
    }

    /// Load the table at `path`.
    ///
    /// A missing file is not an error: the fallback table is used and the
    /// calibrator reports [`CalibrationStatus::Uncalibrated`]. A present but
    /// unusable file is an error.
    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let table = CalibrationTable::parse(&text)?;
                info!(path = %path.display(), points = table.points().len(), "Declination calibration loaded");
                Ok(Self::new(table))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Declination calibration file not found, using default table");
                Ok(Self::uncalibrated())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Replace the table wholesale.
    pub fn replace(&mut self, table: CalibrationTable) {
        self.table = table;
        self.status = CalibrationStatus::Calibrated;
    }

    /// Convert a raw reading to true declination in degrees.
    pub fn calibrate(&self, raw: f64) -> f64 {
        self.table.calibrate(raw)
    }

    /// Whether the table came from a calibration file.
    pub fn status(&self) -> CalibrationStatus {
        self.status
    }

    /// The active table.
    pub fn table(&self) -> &CalibrationTable {
        &self.table
    }
}

/// Direction the operator walks the telescope during calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkDirection {
    /// Start at the south bound and step north.
    SouthToNorth,
    /// Start at the north bound and step south.
    NorthToSouth,
}

/// Outcome of recording one calibration step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WalkProgress {
    /// Move the telescope to this declination next.
    Next(f64),
    /// All steps recorded.
    Complete,
}

/// Records one raw reading per declination step.
#[derive(Debug, Clone)]
pub struct DecCalibrationRecorder {
    direction: WalkDirection,
    targets: Vec<f64>,
    readings: Vec<f64>,
}

impl DecCalibrationRecorder {
    /// Start a walk.
    pub fn new(direction: WalkDirection) -> Self {
        let mut targets = declination_steps();
        if direction == WalkDirection::NorthToSouth {
            targets.reverse();
        }
        Self {
            direction,
            targets,
            readings: Vec::new(),
        }
    }

    /// Declination the telescope should be parked at for the next reading.
    pub fn current_target(&self) -> Option<f64> {
        self.targets.get(self.readings.len()).copied()
    }

    /// Whether every step has a reading.
    pub fn is_complete(&self) -> bool {
        self.readings.len() == self.targets.len()
    }

    /// Record the reading for the current step.
    ///
    /// Readings must move monotonically with the walk (rising when walking
    /// north, falling when walking south). A reading that doubles back
    /// fails the walk; the operator must start over.
    pub fn record(&mut self, raw: f64) -> Result<WalkProgress, CalibrationError> {
        let target = self.current_target().ok_or(CalibrationError::WalkComplete)?;
        if let Some(&previous) = self.readings.last() {
            let in_order = match self.direction {
                WalkDirection::SouthToNorth => raw > previous,
                WalkDirection::NorthToSouth => raw < previous,
            };
            if !in_order {
                return Err(CalibrationError::NonMonotonic {
                    index: self.readings.len(),
                    raw,
                });
            }
        }
        debug!(target, raw, "Declination calibration step recorded");
        self.readings.push(raw);
        Ok(match self.current_target() {
            Some(next) => WalkProgress::Next(next),
            None => WalkProgress::Complete,
        })
    }

    /// The finished table, readings ordered south to north.
    pub fn table(&self) -> Result<CalibrationTable, CalibrationError> {
        let mut readings = self.readings.clone();
        if self.direction == WalkDirection::NorthToSouth {
            readings.reverse();
        }
        if !self.is_complete() {
            return Err(CalibrationError::InsufficientData(readings.len()));
        }
        CalibrationTable::from_readings(&readings)
    }

    /// Write the finished table to `path`, first copying any existing file to `backup`.
    pub fn save(&self, path: &Path, backup: &Path) -> Result<CalibrationTable, CalibrationError> {
        let table = self.table()?;
        if path.exists() {
            fs::copy(path, backup)?;
        }
        fs::write(path, table.to_file_body())?;
        info!(path = %path.display(), "Declination calibration saved");
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn stepped_table() -> CalibrationTable {
        // raw 0, 10, .., 120 -> dec -25, -15, .., 95
        CalibrationTable::new((0..13).map(|i| (10.0 * i as f64, -25.0 + 10.0 * i as f64))).unwrap()
    }

    #[test]
    fn interpolates_and_extrapolates() {
        let table = stepped_table();
        assert_relative_eq!(table.calibrate(5.0), -20.0);
        assert_relative_eq!(table.calibrate(-10.0), -35.0);
        assert_relative_eq!(table.calibrate(125.0), 100.0);
        assert_relative_eq!(table.calibrate(120.0), 95.0);
        assert_relative_eq!(table.calibrate(0.0), -25.0);
    }

    #[test]
    fn rejects_small_tables() {
        assert!(matches!(
            CalibrationTable::new([(0.0, 1.0)]),
            Err(CalibrationError::InsufficientData(1))
        ));
        assert!(matches!(
            CalibrationTable::new(Vec::new()),
            Err(CalibrationError::InsufficientData(0))
        ));
    }

    #[test]
    fn rejects_non_monotonic_tables() {
        let err = CalibrationTable::new([(0.0, 0.0), (2.0, 1.0), (1.0, 2.0)]).unwrap_err();
        assert!(matches!(err, CalibrationError::NonMonotonic { index: 2, .. }));
    }

    #[test]
    fn fallback_has_one_point_per_step() {
        let table = CalibrationTable::fallback();
        assert_eq!(table.points().len(), 13);
        assert_relative_eq!(table.points()[0].raw, -0.9);
        assert_relative_eq!(table.points()[12].raw, 0.9, epsilon = 1e-12);
        assert_relative_eq!(table.points()[12].declination, 95.0);
    }

    #[test]
    fn missing_file_is_uncalibrated_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let calibrator = DeclinationCalibrator::load(&dir.path().join("dec-cal.txt")).unwrap();
        assert_eq!(calibrator.status(), CalibrationStatus::Uncalibrated);
        assert_relative_eq!(calibrator.calibrate(-0.9), -25.0);
    }

    #[test]
    fn loads_table_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dec-cal.txt");
        fs::write(&path, "0.1\n0.2\n0.3\n").unwrap();
        let calibrator = DeclinationCalibrator::load(&path).unwrap();
        assert_eq!(calibrator.status(), CalibrationStatus::Calibrated);
        assert_relative_eq!(calibrator.calibrate(0.15), -20.0, epsilon = 1e-9);
    }

    #[test]
    fn one_line_file_is_insufficient() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dec-cal.txt");
        fs::write(&path, "0.1\n").unwrap();
        assert!(matches!(
            DeclinationCalibrator::load(&path),
            Err(CalibrationError::InsufficientData(1))
        ));
    }

    #[test]
    fn garbage_line_is_reported() {
        assert!(matches!(
            CalibrationTable::parse("0.1\nnorth\n0.3"),
            Err(CalibrationError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn walk_north_to_south_saves_ascending_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dec-cal.txt");
        let backup = dir.path().join("dec-cal-backup.txt");
        fs::write(&path, "old").unwrap();

        let mut recorder = DecCalibrationRecorder::new(WalkDirection::NorthToSouth);
        assert_eq!(recorder.current_target(), Some(95.0));
        let mut progress = WalkProgress::Next(95.0);
        for i in 0..13 {
            progress = recorder.record(1.2 - 0.1 * i as f64).unwrap();
        }
        assert_eq!(progress, WalkProgress::Complete);
        assert!(matches!(recorder.record(0.0), Err(CalibrationError::WalkComplete)));

        let table = recorder.save(&path, &backup).unwrap();
        assert_eq!(fs::read_to_string(&backup).unwrap(), "old");
        assert_relative_eq!(table.points()[0].declination, -25.0);
        assert_relative_eq!(table.points()[0].raw, 0.0, epsilon = 1e-9);
        let reloaded = DeclinationCalibrator::load(&path).unwrap();
        assert_relative_eq!(reloaded.calibrate(1.2), 95.0, epsilon = 1e-9);
    }

    #[test]
    fn walk_rejects_reversal() {
        let mut recorder = DecCalibrationRecorder::new(WalkDirection::SouthToNorth);
        recorder.record(0.1).unwrap();
        recorder.record(0.2).unwrap();
        assert!(matches!(
            recorder.record(0.15),
            Err(CalibrationError::NonMonotonic { index: 2, .. })
        ));
        assert_eq!(recorder.current_target(), Some(-5.0));
    }

    fn monotonic_table() -> impl Strategy<Value = Vec<(f64, f64)>> {
        prop::collection::vec((0.01f64..10.0, -5.0f64..5.0), 2..16).prop_flat_map(|steps| {
            (-100.0f64..100.0, -90.0f64..90.0).prop_map(move |(raw0, dec0)| {
                let mut raw = raw0;
                let mut dec = dec0;
                steps
                    .iter()
                    .map(|&(dr, dd)| {
                        let point = (raw, dec);
                        raw += dr;
                        dec += dd;
                        point
                    })
                    .collect()
            })
        })
    }

    proptest! {
        #[test]
        fn interior_points_interpolate_exactly(pairs in monotonic_table(), t in 0.0f64..1.0, pick in any::<prop::sample::Index>()) {
            let table = CalibrationTable::new(pairs.clone()).unwrap();
            let i = pick.index(pairs.len() - 1);
            let (x0, y0) = pairs[i];
            let (x1, y1) = pairs[i + 1];
            let x = x0 + t * (x1 - x0);
            prop_assume!(x > x0 && x < x1);
            let expected = y0 + (y1 - y0) / (x1 - x0) * (x - x0);
            prop_assert!((table.calibrate(x) - expected).abs() < 1e-9);
        }

        #[test]
        fn extrapolation_meets_interpolation_at_bounds(pairs in monotonic_table(), beyond in 0.001f64..50.0) {
            let table = CalibrationTable::new(pairs.clone()).unwrap();
            let (first, last) = (pairs[0], pairs[pairs.len() - 1]);
            prop_assert!((table.calibrate(first.0) - first.1).abs() < 1e-9);
            prop_assert!((table.calibrate(last.0) - last.1).abs() < 1e-9);

            let (x1, y1) = pairs[1];
            let below = first.1 + (y1 - first.1) / (x1 - first.0) * (-beyond);
            prop_assert!((table.calibrate(first.0 - beyond) - below).abs() < 1e-6);

            let (xp, yp) = pairs[pairs.len() - 2];
            let above = last.1 + (last.1 - yp) / (last.0 - xp) * beyond;
            prop_assert!((table.calibrate(last.0 + beyond) - above).abs() < 1e-6);
        }
    }
}
