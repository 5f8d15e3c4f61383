//! Transformation to standard magnitudes
//!
//! Extinction corrected B and V magnitudes are taken to the standard system
//! with two linear relations fitted per observing day from the standard
//! stars:
//!
//! ```text
//! V_std - V_obs = slope1 * (B-V)_std + intercept1
//! (B-V)_std     = slope2 * (B-V)_obs + intercept2
//! ```
//!
//! and applied to every star as
//!
//! ```text
//! (B-V)_cal = slope2 * (B-V)_obs + intercept2
//! V_cal     = V_obs + slope1 * (B-V)_cal + intercept1
//! B_cal     = (B-V)_cal + V_cal
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::common::ObservingDay;
use crate::magnitude::{
    star_file_path, write_rows, CalibratedMagnitude, CorrectedMagnitude, MeasurementError,
    CAL_MAG_SUFFIX,
};
use crate::math::{linear_regression, mean};
use crate::stars::Star;

pub const B_FILTER: &str = "B";
pub const V_FILTER: &str = "V";
pub const DEFAULT_MIN_STARS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformationCoefficients {
    pub day: ObservingDay,
    pub slope1: f64,
    pub intercept1: f64,
    pub slope2: f64,
    pub intercept2: f64,
}

impl TransformationCoefficients {
    /// Calibrated (B, V) for one observed (B, V) pair.
    pub fn transform(&self, b_obs: f64, v_obs: f64) -> (f64, f64) {
        let bv_cal = self.slope2 * (b_obs - v_obs) + self.intercept2;
        let v_cal = v_obs + self.slope1 * bv_cal + self.intercept1;
        (bv_cal + v_cal, v_cal)
    }
}

/// Observed and standard values of one standard star on one day.
#[derive(Debug, Clone, Copy)]
struct CalibrationPoint {
    v_obs: f64,
    bv_obs: f64,
    v_std: f64,
    bv_std: f64,
}

/// B and V records of one star on one day, in series order.
#[derive(Debug, Default)]
struct DayPairs<'m> {
    b: Vec<(usize, &'m CorrectedMagnitude)>,
    v: Vec<(usize, &'m CorrectedMagnitude)>,
}

impl DayPairs<'_> {
    fn paired(&self) -> bool {
        !self.b.is_empty() && self.b.len() == self.v.len()
    }
}

fn group_by_day(magnitudes: &[CorrectedMagnitude]) -> BTreeMap<ObservingDay, DayPairs<'_>> {
    let mut days: BTreeMap<ObservingDay, DayPairs> = BTreeMap::new();
    for (i, m) in magnitudes.iter().enumerate() {
        let pairs = days.entry(m.day).or_default();
        match m.filter.as_str() {
            B_FILTER => pairs.b.push((i, m)),
            V_FILTER => pairs.v.push((i, m)),
            _ => {}
        }
    }
    days
}

fn corrected_values(records: &[(usize, &CorrectedMagnitude)]) -> Vec<f64> {
    records.iter().map(|(_, m)| m.corrected).collect()
}

#[derive(Debug, Clone, Copy)]
pub struct MagnitudeCalibrator {
    /// Standard stars needed on a day to fit its coefficients
    pub min_stars: usize,
}

impl Default for MagnitudeCalibrator {
    fn default() -> Self {
        Self {
            min_stars: DEFAULT_MIN_STARS,
        }
    }
}

impl MagnitudeCalibrator {
    pub fn new(min_stars: usize) -> Self {
        Self { min_stars }
    }

    /// Fit the coefficients of every day from the corrected magnitudes of
    /// the standard stars.
    ///
    /// Each standard star contributes the mean of its B and V magnitudes of
    /// the day, provided it has as many B as V measurements.
    pub fn compute(
        &self,
        standards: &[(&Star, &[CorrectedMagnitude])],
    ) -> BTreeMap<ObservingDay, TransformationCoefficients> {
        let mut points: BTreeMap<ObservingDay, Vec<CalibrationPoint>> = BTreeMap::new();

        for (star, magnitudes) in standards {
            let (b_std, v_std) = match (
                star.standard_magnitude(B_FILTER),
                star.standard_magnitude(V_FILTER),
            ) {
                (Ok(b), Ok(v)) => (b, v),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("{} not used for calibration: {e}", star.name());
                    continue;
                }
            };

            for (day, pairs) in group_by_day(magnitudes) {
                if !pairs.paired() {
                    warn!(
                        "There is not enough measurements in all filters for star {} at day {day}: {} B, {} V",
                        star.name(),
                        pairs.b.len(),
                        pairs.v.len()
                    );
                    continue;
                }
                let (Some(b_mean), Some(v_mean)) = (
                    mean(&corrected_values(&pairs.b)),
                    mean(&corrected_values(&pairs.v)),
                ) else {
                    continue;
                };
                points.entry(day).or_default().push(CalibrationPoint {
                    v_obs: v_mean,
                    bv_obs: b_mean - v_mean,
                    v_std,
                    bv_std: b_std - v_std,
                });
            }
        }

        let mut coefficients = BTreeMap::new();
        for (day, day_points) in points {
            if day_points.len() < self.min_stars {
                warn!(
                    "No transformation coefficients for day {day}: only {} standard stars",
                    day_points.len()
                );
                continue;
            }

            let bv_std: Vec<f64> = day_points.iter().map(|p| p.bv_std).collect();
            let bv_obs: Vec<f64> = day_points.iter().map(|p| p.bv_obs).collect();
            let v_diff: Vec<f64> = day_points.iter().map(|p| p.v_std - p.v_obs).collect();

            match (
                linear_regression(&bv_std, &v_diff),
                linear_regression(&bv_obs, &bv_std),
            ) {
                (Some(fit1), Some(fit2)) => {
                    let tc = TransformationCoefficients {
                        day,
                        slope1: fit1.slope,
                        intercept1: fit1.intercept,
                        slope2: fit2.slope,
                        intercept2: fit2.intercept,
                    };
                    debug!(
                        "Day {day} C1: {:.5} C2: {:.5} C3: {:.5} C4: {:.5}",
                        tc.slope1, tc.intercept1, tc.slope2, tc.intercept2
                    );
                    coefficients.insert(day, tc);
                }
                _ => warn!(
                    "No transformation coefficients for day {day}: standard colours do not differ"
                ),
            }
        }

        info!(
            "Calculated transformation coefficients for {} days",
            coefficients.len()
        );
        coefficients
    }

    /// Calibrated magnitudes of one star, in series order.
    ///
    /// Days without coefficients, or without as many B as V magnitudes, are
    /// left out.
    pub fn calibrate(
        &self,
        coefficients: &BTreeMap<ObservingDay, TransformationCoefficients>,
        star_name: &str,
        magnitudes: &[CorrectedMagnitude],
    ) -> Vec<CalibratedMagnitude> {
        let mut calibrated: Vec<(usize, CalibratedMagnitude)> = Vec::new();

        for (day, pairs) in group_by_day(magnitudes) {
            let Some(tc) = coefficients.get(&day) else {
                debug!("No transformation coefficients for {star_name} at day {day}");
                continue;
            };
            if !pairs.paired() {
                debug!(
                    "Calibrated magnitudes are not calculated for star {star_name} at day {day}, magnitudes not available for all the filters"
                );
                continue;
            }

            for (&(bi, b), &(vi, v)) in pairs.b.iter().zip(&pairs.v) {
                let (b_cal, v_cal) = tc.transform(b.corrected, v.corrected);
                calibrated.push((bi, calibrated_row(b, b_cal)));
                calibrated.push((vi, calibrated_row(v, v_cal)));
            }
            debug!("Calibrated magnitudes are calculated for star {star_name} on day {day}");
        }

        calibrated.sort_by_key(|(i, _)| *i);
        calibrated.into_iter().map(|(_, m)| m).collect()
    }
}

fn calibrated_row(m: &CorrectedMagnitude, calibrated: f64) -> CalibratedMagnitude {
    CalibratedMagnitude {
        time: m.time,
        calibrated,
        corrected: m.corrected,
        instrumental: m.instrumental,
        filter: m.filter.clone(),
    }
}

/// Append to `<star>_cal_mag.tsv`.
pub fn write_calibrated(
    output_dir: &Path,
    star_name: &str,
    magnitudes: &[CalibratedMagnitude],
) -> Result<(), MeasurementError> {
    let path = star_file_path(output_dir, star_name, CAL_MAG_SUFFIX);
    debug!("Appending {} calibrated magnitudes to {path:?}", magnitudes.len());
    write_rows(&path, magnitudes, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SkyCoord;
    use crate::magnitude::Measure;
    use crate::stars::StandardMagnitude;
    use approx::assert_relative_eq;

    const DAY: i64 = 2457234;

    fn standard(name: &str, b: f64, v: f64) -> Star {
        Star::standard(
            name,
            SkyCoord::new(10.0, 20.0),
            vec![
                StandardMagnitude {
                    filter: B_FILTER.to_string(),
                    magnitude: b,
                },
                StandardMagnitude {
                    filter: V_FILTER.to_string(),
                    magnitude: v,
                },
            ],
        )
    }

    fn corrected(time: f64, filter: &str, value: f64) -> CorrectedMagnitude {
        CorrectedMagnitude {
            time,
            day: ObservingDay::new(DAY),
            filter: filter.to_string(),
            corrected: value,
            instrumental: value + 0.4,
            error: Measure::Value(0.01),
        }
    }

    /// Standards built for slope1 0.1, intercept1 0.3, slope2 1.2, intercept2 0.
    fn standards() -> (Star, Vec<CorrectedMagnitude>, Star, Vec<CorrectedMagnitude>) {
        // (B-V)_std 0.6: V_std - V_obs = 0.36, (B-V)_obs = 0.5
        let s1 = standard("SA98-185", 10.6, 10.0);
        let m1 = vec![
            corrected(2457234.60, B_FILTER, 10.14),
            corrected(2457234.61, V_FILTER, 9.64),
        ];
        // (B-V)_std 1.2: V_std - V_obs = 0.42, (B-V)_obs = 1.0
        let s2 = standard("SA98-193", 12.2, 11.0);
        let m2 = vec![
            corrected(2457234.62, B_FILTER, 11.58),
            corrected(2457234.63, V_FILTER, 10.58),
        ];
        (s1, m1, s2, m2)
    }

    #[test]
    fn test_two_standards_calibrate_third_star() {
        let (s1, m1, s2, m2) = standards();
        let calibrator = MagnitudeCalibrator::default();
        let coefficients = calibrator.compute(&[(&s1, &m1[..]), (&s2, &m2[..])]);

        let tc = coefficients[&ObservingDay::new(DAY)];
        assert_relative_eq!(tc.slope1, 0.1, epsilon = 1e-9);
        assert_relative_eq!(tc.intercept1, 0.3, epsilon = 1e-9);
        assert_relative_eq!(tc.slope2, 1.2, epsilon = 1e-9);
        assert_relative_eq!(tc.intercept2, 0.0, epsilon = 1e-9);

        let target = vec![
            corrected(2457234.70, V_FILTER, 12.5),
            corrected(2457234.71, B_FILTER, 13.0),
        ];
        let calibrated = calibrator.calibrate(&coefficients, "BQCam", &target);
        assert_eq!(calibrated.len(), 2);
        // series order kept: V first
        assert_eq!(calibrated[0].filter, V_FILTER);
        assert_relative_eq!(calibrated[0].calibrated, 12.86, epsilon = 1e-9);
        assert_relative_eq!(calibrated[1].calibrated, 13.46, epsilon = 1e-9);
        assert_relative_eq!(calibrated[1].corrected, 13.0);
        assert_relative_eq!(calibrated[1].instrumental, 13.4, epsilon = 1e-12);
    }

    #[test]
    fn test_single_standard_gives_no_coefficients() {
        let (s1, m1, _, _) = standards();
        let coefficients = MagnitudeCalibrator::default().compute(&[(&s1, &m1[..])]);
        assert!(coefficients.is_empty());
    }

    #[test]
    fn test_unpaired_filters_are_skipped() {
        let (s1, m1, s2, mut m2) = standards();
        m2.push(corrected(2457234.64, V_FILTER, 10.58));
        let calibrator = MagnitudeCalibrator::default();
        assert!(calibrator
            .compute(&[(&s1, &m1[..]), (&s2, &m2[..])])
            .is_empty());

        let (s1, m1, s2, m2) = standards();
        let coefficients = calibrator.compute(&[(&s1, &m1[..]), (&s2, &m2[..])]);
        let target = vec![
            corrected(2457234.70, V_FILTER, 12.5),
            corrected(2457234.71, V_FILTER, 12.6),
            corrected(2457234.72, B_FILTER, 13.0),
        ];
        assert!(calibrator
            .calibrate(&coefficients, "BQCam", &target)
            .is_empty());
    }

    #[test]
    fn test_append_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![CalibratedMagnitude {
            time: 2457234.7,
            calibrated: 12.86,
            corrected: 12.5,
            instrumental: 12.9,
            filter: V_FILTER.to_string(),
        }];
        write_calibrated(dir.path(), "BQCam", &rows).unwrap();
        write_calibrated(dir.path(), "BQCam", &rows).unwrap();
        let content = std::fs::read_to_string(dir.path().join("BQCam_cal_mag.tsv")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
