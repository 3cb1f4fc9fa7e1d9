//! Wall-clock to sidereal-time conversion.
//!
//! The station has no GPS-disciplined sidereal source. Instead an operator
//! reads local sidereal time off the observatory clock and enters it once;
//! from that (sidereal, wall-clock) pair every later sidereal instant is
//! extrapolated at [`SIDEREAL_RATE`]. The pair is persisted as an
//! [`RaCalibration`] record so a restart does not lose it.

use std::fs;
use std::path::Path;

use chrono::{Local, NaiveTime, TimeZone, Timelike};
use tracing::{debug, info};

use super::time::SharedTimeSource;
use super::ClockError;

/// Sidereal seconds elapsed per solar second.
pub const SIDEREAL_RATE: f64 = 1.002_737_909_35;

/// Seconds in one (sidereal) day.
pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// Longitude of the Green Bank 40 ft telescope, degrees east.
pub const GREEN_BANK_LONGITUDE: f64 = -79.839_835;

/// Convert a solar duration into the equivalent sidereal duration.
pub fn solar_to_sidereal(solar_seconds: f64) -> f64 {
    solar_seconds * SIDEREAL_RATE
}

/// Convert a sidereal duration into the equivalent solar duration.
pub fn sidereal_to_solar(sidereal_seconds: f64) -> f64 {
    sidereal_seconds / SIDEREAL_RATE
}

/// Format sidereal seconds as `HH:MM:SS`, wrapping hours at 24.
pub fn format_sidereal(sidereal_seconds: f64) -> String {
    let total = sidereal_seconds.rem_euclid(SECONDS_PER_DAY);
    let hours = (total / 3600.0).floor();
    let minutes = ((total - hours * 3600.0) / 60.0).floor();
    let seconds = (total - hours * 3600.0 - minutes * 60.0).floor();
    format!("{:02.0}:{:02.0}:{:02.0}", hours, minutes, seconds)
}

/// Parse `HH:MM:SS` (optionally with fractional seconds) into seconds.
pub fn parse_sidereal(text: &str) -> Result<f64, ClockError> {
    let time = NaiveTime::parse_from_str(text.trim(), "%H:%M:%S%.f")
        .map_err(|_| ClockError::InvalidTimeString(text.to_string()))?;
    Ok(f64::from(time.num_seconds_from_midnight()) + f64::from(time.nanosecond()) / 1e9)
}

/// Local-time slug suitable for default file names, e.g. `2024.03.01-21.15`.
pub fn time_slug(epoch: f64) -> String {
    match Local.timestamp_opt(epoch.floor() as i64, 0).single() {
        Some(local) => local.format("%Y.%m.%d-%H.%M").to_string(),
        None => format!("{:.0}", epoch),
    }
}

/// Estimate local mean sidereal time (seconds since sidereal midnight) at
/// `epoch` for an observer at `longitude` degrees east.
///
/// Good to a few seconds, which is enough to seed the clock before the
/// operator calibrates it against the observatory clock.
pub fn estimate_local_sidereal(epoch: f64, longitude: f64) -> f64 {
    let jd = epoch / SECONDS_PER_DAY + 2_440_587.5;
    let d = jd - 2_451_545.0;
    let t = d / 36_525.0;
    let gmst_degrees =
        280.460_618_37 + 360.985_647_366_29 * d + 0.000_387_933 * t * t - t * t * t / 38_710_000.0;
    let lst_degrees = (gmst_degrees + longitude).rem_euclid(360.0);
    lst_degrees / 15.0 * 3600.0
}

/// A persisted (sidereal, wall-clock) calibration pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaCalibration {
    /// Sidereal seconds since sidereal midnight at the calibration instant.
    pub sidereal_seconds: f64,
    /// Wall-clock instant (Unix seconds) of the calibration.
    pub epoch: f64,
}

impl RaCalibration {
    /// Read a two-line record: sidereal seconds, then epoch.
    pub fn load(path: &Path) -> Result<Self, ClockError> {
        let text = fs::read_to_string(path)?;
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let mut next_value = |line: usize| -> Result<f64, ClockError> {
            let raw = lines.next().ok_or(ClockError::RecordParse {
                line,
                value: String::new(),
            })?;
            raw.parse::<f64>().map_err(|_| ClockError::RecordParse {
                line,
                value: raw.to_string(),
            })
        };
        let sidereal_seconds = next_value(1)?;
        let epoch = next_value(2)?;
        Ok(Self {
            sidereal_seconds,
            epoch,
        })
    }

    /// Rewrite the record wholesale.
    pub fn save(&self, path: &Path) -> Result<(), ClockError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{}\n{}\n", self.sidereal_seconds, self.epoch))?;
        debug!(path = %path.display(), "RA calibration record written");
        Ok(())
    }
}

/// Extrapolates sidereal time from the last calibration.
#[derive(Clone)]
pub struct SiderealClock {
    source: SharedTimeSource,
    calibrated_sidereal: f64,
    anchor_epoch: f64,
}

impl SiderealClock {
    /// Create a clock calibrated to read `sidereal_seconds` right now.
    pub fn new(source: SharedTimeSource, sidereal_seconds: f64) -> Self {
        let anchor_epoch = source.now();
        Self {
            source,
            calibrated_sidereal: sidereal_seconds.rem_euclid(SECONDS_PER_DAY),
            anchor_epoch,
        }
    }

    /// Create a clock from a persisted record.
    pub fn from_record(source: SharedTimeSource, record: RaCalibration) -> Self {
        Self {
            source,
            calibrated_sidereal: record.sidereal_seconds.rem_euclid(SECONDS_PER_DAY),
            anchor_epoch: record.epoch,
        }
    }

    /// Create a clock seeded from the astronomical estimate for `longitude`.
    pub fn estimated(source: SharedTimeSource, longitude: f64) -> Self {
        let now = source.now();
        Self {
            calibrated_sidereal: estimate_local_sidereal(now, longitude),
            anchor_epoch: now,
            source,
        }
    }

    /// Record that at `epoch` (default: now) sidereal time read `sidereal_seconds`.
    pub fn calibrate(&mut self, sidereal_seconds: f64, epoch: Option<f64>) -> RaCalibration {
        let epoch = epoch.unwrap_or_else(|| self.source.now());
        self.calibrated_sidereal = sidereal_seconds.rem_euclid(SECONDS_PER_DAY);
        self.anchor_epoch = epoch;
        info!(
            sidereal = %format_sidereal(self.calibrated_sidereal),
            epoch,
            "Sidereal clock calibrated"
        );
        self.record()
    }

    /// Current calibration pair.
    pub fn record(&self) -> RaCalibration {
        RaCalibration {
            sidereal_seconds: self.calibrated_sidereal,
            epoch: self.anchor_epoch,
        }
    }

    /// Wall-clock instant of the last calibration.
    pub fn anchor_epoch(&self) -> f64 {
        self.anchor_epoch
    }

    /// Sidereal seconds read at the last calibration.
    pub fn calibrated_sidereal(&self) -> f64 {
        self.calibrated_sidereal
    }

    /// Current wall-clock instant from the underlying source.
    pub fn now_epoch(&self) -> f64 {
        self.source.now()
    }

    /// Sidereal seconds since the sidereal midnight before calibration.
    ///
    /// Not wrapped at one day; use [`format_sidereal`] for display.
    pub fn now_sidereal(&self) -> f64 {
        self.sidereal_at(self.source.now())
    }

    /// Sidereal seconds at an arbitrary wall-clock instant.
    pub fn sidereal_at(&self, epoch: f64) -> f64 {
        self.calibrated_sidereal + SIDEREAL_RATE * (epoch - self.anchor_epoch)
    }

    /// Wall-clock instant at which sidereal time reads `sidereal_seconds`,
    /// counted from the sidereal midnight before calibration.
    pub fn epoch_of_sidereal(&self, sidereal_seconds: f64) -> f64 {
        self.anchor_epoch + sidereal_to_solar(sidereal_seconds - self.calibrated_sidereal)
    }

    /// `HH:MM:SS` display of the current sidereal time.
    pub fn formatted(&self) -> String {
        format_sidereal(self.now_sidereal())
    }
}

impl std::fmt::Debug for SiderealClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiderealClock")
            .field("calibrated_sidereal", &self.calibrated_sidereal)
            .field("anchor_epoch", &self.anchor_epoch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::time::ManualTime;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    #[test]
    fn calibrate_wraps_into_one_day() {
        let time = ManualTime::shared(1_000.0);
        let mut clock = SiderealClock::new(time.clone(), 0.0);
        let record = clock.calibrate(SECONDS_PER_DAY + 30.0, None);
        assert_relative_eq!(record.sidereal_seconds, 30.0);
        assert_relative_eq!(record.epoch, 1_000.0);
    }

    #[test]
    fn sidereal_runs_fast() {
        let time = ManualTime::shared(0.0);
        let clock = SiderealClock::new(time.clone(), 3600.0);
        time.advance(1000.0);
        assert_relative_eq!(clock.now_sidereal(), 3600.0 + 1000.0 * SIDEREAL_RATE);
    }

    #[test]
    fn epoch_of_sidereal_inverts_sidereal_at() {
        let time = ManualTime::shared(50_000.0);
        let clock = SiderealClock::new(time, 7_200.0);
        let epoch = clock.epoch_of_sidereal(10_000.0);
        assert_relative_eq!(clock.sidereal_at(epoch), 10_000.0, epsilon = 1e-9);
    }

    #[test]
    fn format_and_parse() {
        assert_eq!(format_sidereal(3_723.0), "01:02:03");
        assert_eq!(format_sidereal(SECONDS_PER_DAY + 61.0), "00:01:01");
        assert_relative_eq!(parse_sidereal("01:02:03").unwrap(), 3_723.0);
        assert!(parse_sidereal("01:02").is_err());
        assert!(parse_sidereal("aa:02:03").is_err());
        assert_relative_eq!(parse_sidereal(" 23:59:30.5 ").unwrap(), 86_370.5);
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        for text in ["25:00:00", "24:00:00", "25:99:99", "12:60:00", "-1:00:00", "01:-2:03"] {
            assert!(
                matches!(parse_sidereal(text), Err(ClockError::InvalidTimeString(_))),
                "{text} should not parse"
            );
        }
    }

    #[test]
    fn record_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ra-cal.txt");
        let record = RaCalibration {
            sidereal_seconds: 12_345.5,
            epoch: 1_700_000_000.25,
        };
        record.save(&path).unwrap();
        assert_eq!(RaCalibration::load(&path).unwrap(), record);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ra-cal.txt");
        std::fs::write(&path, "123.0\n").unwrap();
        assert!(matches!(
            RaCalibration::load(&path),
            Err(ClockError::RecordParse { line: 2, .. })
        ));
    }

    #[test]
    fn estimate_is_within_one_day() {
        let time: SharedTimeSource = Arc::new(ManualTime::new(1_700_000_000.0));
        let clock = SiderealClock::estimated(time, GREEN_BANK_LONGITUDE);
        assert!((0.0..SECONDS_PER_DAY).contains(&clock.calibrated_sidereal()));
    }

    #[test]
    fn estimate_matches_j2000_reference() {
        // 2000-01-01T12:00:00Z, GMST = 18h41m50.5s
        let lst = estimate_local_sidereal(946_728_000.0, 0.0);
        assert_relative_eq!(lst, 18.0 * 3600.0 + 41.0 * 60.0 + 50.5, epsilon = 1.0);
    }
}
