//! Atmospheric extinction
//!
//! For every standard star the difference between instrumental and standard
//! magnitude grows linearly with airmass:
//!
//! ```text
//! m_inst - m_std = intercept + slope * airmass
//! ```
//!
//! One (slope, intercept) pair is fitted per observing day and filter from
//! the standard stars observed that day, and then removed from the magnitudes
//! of every star.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::common::{ObservingDay, TimeScale};
use crate::magnitude::{
    star_file_path, write_rows, CorrectedMagnitude, InstrumentalRecord, MeasurementError,
    CORR_MAG_SUFFIX,
};
use crate::math::linear_regression;
use crate::stars::{CatalogError, Star};

pub const DEFAULT_MIN_MEASURES: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtinctionCoefficient {
    pub day: ObservingDay,
    pub filter: String,
    pub slope: f64,
    pub intercept: f64,
}

impl ExtinctionCoefficient {
    /// `instrumental - intercept - slope * airmass`
    pub fn correct(&self, instrumental: f64, airmass: f64) -> f64 {
        instrumental - self.intercept - self.slope * airmass
    }
}

/// At most one coefficient per day and filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtinctionCoefficients {
    coefficients: BTreeMap<(ObservingDay, String), ExtinctionCoefficient>,
}

impl ExtinctionCoefficients {
    pub fn insert(&mut self, coefficient: ExtinctionCoefficient) {
        self.coefficients.insert(
            (coefficient.day, coefficient.filter.clone()),
            coefficient,
        );
    }

    pub fn get(
        &self,
        day: ObservingDay,
        filter: &str,
    ) -> Result<&ExtinctionCoefficient, ExtinctionError> {
        self.coefficients
            .get(&(day, filter.to_string()))
            .ok_or_else(|| ExtinctionError::CoefficientNotFound {
                day,
                filter: filter.to_string(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtinctionCoefficient> {
        self.coefficients.values()
    }

    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }
}

/// One usable standard star observation.
#[derive(Debug, Clone)]
struct StandardPoint {
    day: ObservingDay,
    filter: String,
    airmass: f64,
    /// instrumental minus standard magnitude
    difference: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtinctionEstimator {
    pub time_scale: TimeScale,
    /// Observations a standard star needs on one day to be used that day
    pub min_measures: usize,
}

impl Default for ExtinctionEstimator {
    fn default() -> Self {
        Self {
            time_scale: TimeScale::default(),
            min_measures: DEFAULT_MIN_MEASURES,
        }
    }
}

impl ExtinctionEstimator {
    pub fn new(time_scale: TimeScale, min_measures: usize) -> Self {
        Self {
            time_scale,
            min_measures,
        }
    }

    /// Fit the coefficients from the object series of the standard stars.
    ///
    /// A star's data for one day is only used if it has enough observations
    /// and its magnitude difference increases with airmass. Stars that are
    /// not standard are ignored.
    pub fn compute(&self, standards: &[(&Star, &[InstrumentalRecord])]) -> ExtinctionCoefficients {
        let mut accepted: Vec<StandardPoint> = Vec::new();

        for (star, records) in standards {
            if !star.is_standard() {
                continue;
            }
            let mut by_day: BTreeMap<ObservingDay, Vec<StandardPoint>> = BTreeMap::new();
            for point in self.standard_points(star, records) {
                by_day.entry(point.day).or_default().push(point);
            }

            for (day, points) in by_day {
                if points.len() < self.min_measures {
                    debug!(
                        "Only {} measures of {} for day {day}, not used for extinction",
                        points.len(),
                        star.name()
                    );
                    continue;
                }
                let (airmass, difference) = columns(&points);
                match linear_regression(&airmass, &difference) {
                    Some(fit) if fit.slope > 0.0 => accepted.extend(points),
                    Some(fit) => warn!(
                        "Data to calculate extinction coefficient discarded from star {} for day {day}: slope {:.4}",
                        star.name(),
                        fit.slope
                    ),
                    None => warn!(
                        "Data to calculate extinction coefficient discarded from star {} for day {day}: no airmass spread",
                        star.name()
                    ),
                }
            }
        }

        let mut cells: BTreeMap<(ObservingDay, String), Vec<StandardPoint>> = BTreeMap::new();
        for point in accepted {
            cells
                .entry((point.day, point.filter.clone()))
                .or_default()
                .push(point);
        }

        let mut coefficients = ExtinctionCoefficients::default();
        for ((day, filter), points) in cells {
            let (airmass, difference) = columns(&points);
            match linear_regression(&airmass, &difference) {
                Some(fit) => {
                    debug!(
                        "Linear regression for day {day} filter {filter} slope: {} intercept: {} r-value: {} std_err: {}",
                        fit.slope, fit.intercept, fit.r_value, fit.std_err
                    );
                    coefficients.insert(ExtinctionCoefficient {
                        day,
                        filter,
                        slope: fit.slope,
                        intercept: fit.intercept,
                    });
                }
                None => debug!(
                    "No extinction coefficient for day {day} filter {filter} from {} measures",
                    points.len()
                ),
            }
        }

        if coefficients.is_empty() {
            warn!("There is not enough data to calculate extinction coefficients");
        } else {
            info!("Calculated {} extinction coefficients", coefficients.len());
        }
        coefficients
    }

    fn standard_points(&self, star: &Star, records: &[InstrumentalRecord]) -> Vec<StandardPoint> {
        records
            .iter()
            .filter_map(|record| {
                let Some(instrumental) = record.magnitude.value() else {
                    debug!("Undefined magnitude for standard star {}", star.name());
                    return None;
                };
                match star.standard_magnitude(&record.filter) {
                    Ok(standard) => Some(StandardPoint {
                        day: self.time_scale.observing_day(record.time),
                        filter: record.filter.clone(),
                        airmass: record.airmass,
                        difference: instrumental - standard,
                    }),
                    Err(e @ CatalogError::FilterNotFound { .. }) => {
                        warn!("{e}");
                        None
                    }
                    Err(e) => {
                        debug!("{e}");
                        None
                    }
                }
            })
            .collect()
    }

    /// Correct one record for extinction.
    pub fn correct(
        &self,
        coefficients: &ExtinctionCoefficients,
        record: &InstrumentalRecord,
    ) -> Result<CorrectedMagnitude, ExtinctionError> {
        let instrumental = record
            .magnitude
            .value()
            .ok_or(ExtinctionError::UndefinedMagnitude { time: record.time })?;
        let day = self.time_scale.observing_day(record.time);
        let coefficient = coefficients.get(day, &record.filter)?;
        Ok(CorrectedMagnitude {
            time: record.time,
            day,
            filter: record.filter.clone(),
            corrected: coefficient.correct(instrumental, record.airmass),
            instrumental,
            error: record.error,
        })
    }

    /// Correct a whole series, leaving out the records that cannot be.
    pub fn correct_all(
        &self,
        coefficients: &ExtinctionCoefficients,
        star_name: &str,
        records: &[InstrumentalRecord],
    ) -> Vec<CorrectedMagnitude> {
        records
            .iter()
            .filter_map(|record| match self.correct(coefficients, record) {
                Ok(corrected) => Some(corrected),
                Err(e @ ExtinctionError::CoefficientNotFound { .. }) => {
                    warn!("{star_name}: {e}");
                    None
                }
                Err(e) => {
                    debug!("{star_name}: {e}");
                    None
                }
            })
            .collect()
    }
}

fn columns(points: &[StandardPoint]) -> (Vec<f64>, Vec<f64>) {
    points.iter().map(|p| (p.airmass, p.difference)).unzip()
}

/// Write `<star>_ec_mag.tsv`.
pub fn write_corrected(
    output_dir: &Path,
    star_name: &str,
    magnitudes: &[CorrectedMagnitude],
) -> Result<(), ExtinctionError> {
    let path = star_file_path(output_dir, star_name, CORR_MAG_SUFFIX);
    debug!("Writing {} corrected magnitudes to {path:?}", magnitudes.len());
    write_rows(&path, magnitudes, false)?;
    Ok(())
}

#[derive(Error, Debug)]
pub enum ExtinctionError {
    #[error(transparent)]
    Measurement(#[from] MeasurementError),
    #[error("Extinction coefficient not found for day {day} and filter {filter}")]
    CoefficientNotFound { day: ObservingDay, filter: String },
    #[error("Undefined instrumental magnitude at {time}")]
    UndefinedMagnitude { time: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SkyCoord;
    use crate::magnitude::Measure;
    use crate::stars::StandardMagnitude;
    use approx::assert_relative_eq;

    fn standard(name: &str, v: f64) -> Star {
        Star::standard(
            name,
            SkyCoord::new(10.0, 20.0),
            vec![StandardMagnitude {
                filter: "V".to_string(),
                magnitude: v,
            }],
        )
    }

    fn record(time: f64, magnitude: Measure, airmass: f64) -> InstrumentalRecord {
        InstrumentalRecord {
            time,
            magnitude,
            airmass,
            error: Measure::Value(0.01),
            filter: "V".to_string(),
        }
    }

    /// m_inst = m_std + intercept + slope * airmass
    fn series(v: f64, slope: f64, intercept: f64) -> Vec<InstrumentalRecord> {
        [(2457234.6, 1.1), (2457234.7, 1.4), (2457234.8, 1.9)]
            .iter()
            .map(|&(t, x)| record(t, Measure::Value(v + intercept + slope * x), x))
            .collect()
    }

    #[test]
    fn test_recovers_known_coefficient() {
        let a = standard("SA98-185", 10.0);
        let b = standard("SA98-193", 12.0);
        let ra = series(10.0, 0.25, 0.5);
        let rb = series(12.0, 0.25, 0.5);

        let estimator = ExtinctionEstimator::default();
        let coefficients = estimator.compute(&[(&a, &ra[..]), (&b, &rb[..])]);
        assert_eq!(coefficients.len(), 1);

        let c = coefficients.get(ObservingDay::new(2457234), "V").unwrap();
        assert_relative_eq!(c.slope, 0.25, epsilon = 1e-9);
        assert_relative_eq!(c.intercept, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_rejects_non_positive_slope() {
        let a = standard("SA98-185", 10.0);
        let ra = series(10.0, -0.2, 0.5);
        let coefficients = ExtinctionEstimator::default().compute(&[(&a, &ra[..])]);
        assert!(coefficients.is_empty());
        assert!(matches!(
            coefficients.get(ObservingDay::new(2457234), "V"),
            Err(ExtinctionError::CoefficientNotFound { .. })
        ));
    }

    #[test]
    fn test_too_few_measures_and_indef() {
        let a = standard("SA98-185", 10.0);
        let mut ra = series(10.0, 0.25, 0.5);
        ra[2].magnitude = Measure::Indef;
        let coefficients = ExtinctionEstimator::default().compute(&[(&a, &ra[..])]);
        assert!(coefficients.is_empty());

        let coefficients = ExtinctionEstimator::new(TimeScale::Julian, 2).compute(&[(&a, &ra[..])]);
        assert_eq!(coefficients.len(), 1);
    }

    #[test]
    fn test_correct_all_omits_missing_coefficient() {
        let mut coefficients = ExtinctionCoefficients::default();
        coefficients.insert(ExtinctionCoefficient {
            day: ObservingDay::new(2457234),
            filter: "V".to_string(),
            slope: 0.25,
            intercept: 0.5,
        });

        let records = vec![
            record(2457234.6, Measure::Value(13.0), 1.2),
            // previous night
            record(2457234.2, Measure::Value(13.0), 1.2),
            record(2457234.7, Measure::Indef, 1.3),
        ];
        let estimator = ExtinctionEstimator::default();
        let corrected = estimator.correct_all(&coefficients, "BQCam", &records);
        assert_eq!(corrected.len(), 1);
        assert_relative_eq!(corrected[0].corrected, 13.0 - 0.5 - 0.25 * 1.2);
        assert_eq!(corrected[0].instrumental, 13.0);

        let err = estimator.correct(&coefficients, &records[1]).unwrap_err();
        assert!(matches!(
            err,
            ExtinctionError::CoefficientNotFound { day, .. } if day == ObservingDay::new(2457233)
        ));
    }
}
