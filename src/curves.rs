//! Differential light curves
//!
//! The star of interest is compared against the mean of its field on each
//! image, which removes most of the atmospheric variation without any
//! standard star.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info};

use crate::magnitude::{
    read_field_records, star_file_path, write_rows, FieldRecord, MeasurementError, TsvRow,
    ALL_INST_MAG_SUFFIX, DIFF_MAG_SUFFIX,
};
use crate::math::mean;

/// Curves need at least this many points to be written.
const MIN_CURVE_POINTS: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct DiffPoint {
    pub filter: String,
    pub time: f64,
    /// star magnitude minus the mean magnitude of the field
    pub magnitude: f64,
    /// star error plus the mean error of the field
    pub error: f64,
}

impl TsvRow for DiffPoint {
    fn fields(&self) -> Vec<String> {
        vec![
            self.filter.clone(),
            self.time.to_string(),
            self.magnitude.to_string(),
            self.error.to_string(),
        ]
    }
}

/// Differential magnitude of one field record, if the star and at least one
/// reference star were measured.
pub fn differential(record: &FieldRecord) -> Option<DiffPoint> {
    let ((star_mag, star_err), references) = record.magnitudes.split_first()?;
    let star_mag = star_mag.value()?;
    let star_err = star_err.value()?;

    let (mags, errs): (Vec<f64>, Vec<f64>) = references
        .iter()
        .filter_map(|(m, e)| Some((m.value()?, e.value()?)))
        .unzip();

    Some(DiffPoint {
        filter: record.filter.clone(),
        time: record.time,
        magnitude: star_mag - mean(&mags)?,
        error: star_err + mean(&errs)?,
    })
}

/// Differential points grouped by filter, each filter sorted by time.
pub fn differential_curve(records: &[FieldRecord]) -> Vec<DiffPoint> {
    let mut by_filter: BTreeMap<&str, Vec<DiffPoint>> = BTreeMap::new();
    for (record, point) in records
        .iter()
        .filter_map(|r| differential(r).map(|p| (r, p)))
    {
        by_filter.entry(record.filter.as_str()).or_default().push(point);
    }

    by_filter
        .into_values()
        .flat_map(|mut points| {
            points.sort_by(|a, b| a.time.total_cmp(&b.time));
            points
        })
        .collect()
}

/// Turn `<star>_all_inst_mag.tsv` into `<star>_diff_mag.tsv`.
///
/// Returns whether a curve was written.
pub fn write_star_curve(output_dir: &Path, star_name: &str) -> Result<bool, MeasurementError> {
    let source = star_file_path(output_dir, star_name, ALL_INST_MAG_SUFFIX);
    if !source.exists() {
        debug!("No field magnitudes for {star_name}");
        return Ok(false);
    }

    let curve = differential_curve(&read_field_records(&source)?);
    if curve.len() < MIN_CURVE_POINTS {
        debug!("Only {} differential points for {star_name}", curve.len());
        return Ok(false);
    }

    let path = star_file_path(output_dir, star_name, DIFF_MAG_SUFFIX);
    write_rows(&path, &curve, false)?;
    info!("Differential curve of {star_name} with {} points", curve.len());
    Ok(true)
}
