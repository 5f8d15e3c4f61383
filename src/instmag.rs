//! Collecting instrumental magnitudes
//!
//! The photometry tool leaves one measurement file per image next to it,
//! `<stem>_mag.csv`, holding one row per row of the pixel catalog `<stem>.cat`
//! it was run with. Rows are joined to the catalog by position, so the
//! catalog tells which field identifier each measurement belongs to.
//!
//! Two series are built per star: the star of interest alone, and every
//! identifier of its field side by side (see [FieldRecord]).

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use glam::DVec2;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::magnitude::{
    star_file_path, write_rows, FieldRecord, InstrumentalRecord, Measure, MeasurementError,
    ALL_INST_MAG_SUFFIX, INST_MAG_SUFFIX,
};
use crate::starcat::{PixelCatalog, StarCatalogError, CATALOG_EXTENSION};
use crate::stars::{Star, StarCatalog, STAR_OF_INTEREST_ID};

pub const MEASUREMENT_SUFFIX: &str = "_mag.csv";
const STAR_NAME_DELIMITER: char = '-';
const MEASUREMENT_COLUMNS: usize = 7;

/// One row of a measurement file: `id x y time magnitude airmass error`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Sequence number given by the photometry tool, not the field identifier
    pub number: u32,
    pub position: DVec2,
    pub time: Measure,
    pub magnitude: Measure,
    pub airmass: Measure,
    pub error: Measure,
}

impl Measurement {
    fn parse(line: &str) -> Option<Self> {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < MEASUREMENT_COLUMNS {
            return None;
        }
        Some(Self {
            number: cols[0].parse().ok()?,
            position: DVec2::new(cols[1].parse().ok()?, cols[2].parse().ok()?),
            time: Measure::parse(cols[3]).ok()?,
            magnitude: Measure::parse(cols[4]).ok()?,
            airmass: Measure::parse(cols[5]).ok()?,
            error: Measure::parse(cols[6]).ok()?,
        })
    }
}

pub fn read_measurements(path: &Path) -> Result<Vec<Measurement>, MeasurementError> {
    debug!("Processing magnitudes file: {path:?}");
    let reader = BufReader::new(File::open(path)?);
    let mut rows = Vec::new();
    for (line_number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let row = Measurement::parse(&line).ok_or_else(|| MeasurementError::MalformedRow {
            path: path.to_path_buf(),
            line: line_number + 1,
        })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Star name encoded in an image derived file name: everything up to the
/// first `-`.
pub fn star_name_from_path(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    let name = file_name.split(STAR_NAME_DELIMITER).next()?;
    (!name.is_empty() && name.len() < file_name.len()).then(|| name.to_string())
}

/// Filter of an image derived file: the name of the directory holding it.
pub fn filter_from_path(path: &Path) -> Option<String> {
    path.parent()?
        .file_name()?
        .to_str()
        .map(str::to_string)
}

/// `<stem>.cat` for a `<stem>_mag.csv` measurement file.
pub fn catalog_path_for(mag_file: &Path) -> Option<PathBuf> {
    let file_name = mag_file.file_name()?.to_str()?;
    let stem = file_name.strip_suffix(MEASUREMENT_SUFFIX)?;
    Some(mag_file.with_file_name(format!("{stem}.{CATALOG_EXTENSION}")))
}

/// Series collected for one star.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StarMagnitudes {
    /// The star of interest, one record per image
    pub object: Vec<InstrumentalRecord>,
    /// The whole field, one record per image
    pub field: Vec<FieldRecord>,
}

pub struct InstrumentalCollector<'a> {
    stars: &'a StarCatalog,
    magnitudes: BTreeMap<String, StarMagnitudes>,
}

impl<'a> InstrumentalCollector<'a> {
    pub fn new(stars: &'a StarCatalog) -> Self {
        Self {
            stars,
            magnitudes: BTreeMap::new(),
        }
    }

    /// Read every measurement file found under `<data_dir>/<filter>/`.
    ///
    /// Files that cannot be read are logged and skipped. Returns the number of
    /// files read.
    pub fn collect_dir(&mut self, data_dir: &Path) -> usize {
        let pattern = format!(
            "{}/*/*{MEASUREMENT_SUFFIX}",
            glob::Pattern::escape(&data_dir.to_string_lossy())
        );
        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                error!("Invalid search pattern {pattern}: {e}");
                return 0;
            }
        };

        let mut files_read = 0;
        for path in paths.filter_map(Result::ok) {
            match self.add_measurement_file(&path) {
                Ok(()) => files_read += 1,
                Err(e) => warn!("Skipping magnitudes file {path:?}: {e}"),
            }
        }
        info!("Read {files_read} magnitudes files from {data_dir:?}");
        files_read
    }

    pub fn add_measurement_file(&mut self, mag_file: &Path) -> Result<(), CollectError> {
        let unexpected = || CollectError::UnexpectedFileName(mag_file.to_path_buf());
        let star_name = star_name_from_path(mag_file).ok_or_else(unexpected)?;
        let filter = filter_from_path(mag_file).ok_or_else(unexpected)?;
        let catalog_path = catalog_path_for(mag_file).ok_or_else(unexpected)?;

        let stars = self.stars;
        let star = stars
            .get_star(&star_name)
            .ok_or_else(|| CollectError::UnknownStar(star_name.clone()))?;

        let catalog = PixelCatalog::read(&catalog_path)?;
        let measurements = read_measurements(mag_file)?;
        self.add_measurements(star, &filter, &measurements, &catalog);
        Ok(())
    }

    /// Join the measurements of one image to its pixel catalog.
    ///
    /// Rows with an undefined time are skipped but still consume their
    /// catalog row, so later rows stay aligned.
    pub fn add_measurements(
        &mut self,
        star: &Star,
        filter: &str,
        measurements: &[Measurement],
        catalog: &PixelCatalog,
    ) {
        if measurements.len() != catalog.len() {
            warn!(
                "{} has {} measurements for {} catalog rows in filter {filter}",
                star.name(),
                measurements.len(),
                catalog.len()
            );
        }

        let mut time = None;
        let mut by_id: HashMap<u32, (Measure, Measure)> = HashMap::new();
        let entry = self.magnitudes.entry(star.name().to_string()).or_default();

        for (row, measurement) in measurements.iter().enumerate() {
            let Some(id) = catalog.id(row) else {
                warn!("No catalog row {row} for a measurement of {}", star.name());
                break;
            };
            let Some(t) = measurement.time.value() else {
                debug!("Found INDEF value for the observation time");
                continue;
            };
            time.get_or_insert(t);

            if id == STAR_OF_INTEREST_ID {
                match measurement.airmass.value() {
                    Some(airmass) => entry.object.push(InstrumentalRecord {
                        time: t,
                        magnitude: measurement.magnitude,
                        airmass,
                        error: measurement.error,
                        filter: filter.to_string(),
                    }),
                    None => debug!("Found INDEF airmass for {} at {t}", star.name()),
                }
            }
            by_id.insert(id, (measurement.magnitude, measurement.error));
        }

        let Some(time) = time else {
            return;
        };
        let magnitudes = field_identifiers(star)
            .into_iter()
            .map(|id| {
                by_id
                    .get(&id)
                    .copied()
                    .unwrap_or((Measure::Indef, Measure::Indef))
            })
            .collect();
        entry.field.push(FieldRecord {
            time,
            filter: filter.to_string(),
            magnitudes,
        });
    }

    pub fn magnitudes(&self, star_name: &str) -> Option<&StarMagnitudes> {
        self.magnitudes.get(star_name)
    }

    pub fn into_magnitudes(self) -> BTreeMap<String, StarMagnitudes> {
        self.magnitudes
    }

    /// Write `<star>_inst_mag.tsv` and `<star>_all_inst_mag.tsv` for every
    /// star with data. Returns the number of files written.
    pub fn save(&self, output_dir: &Path) -> usize {
        let mut written = 0;
        for (name, series) in &self.magnitudes {
            if !series.object.is_empty() {
                let path = star_file_path(output_dir, name, INST_MAG_SUFFIX);
                match write_rows(&path, &series.object, false) {
                    Ok(()) => written += 1,
                    Err(e) => error!("Writing instrumental magnitudes to {path:?}: {e}"),
                }
            }
            if !series.field.is_empty() {
                let path = star_file_path(output_dir, name, ALL_INST_MAG_SUFFIX);
                match write_rows(&path, &series.field, false) {
                    Ok(()) => written += 1,
                    Err(e) => error!("Writing field magnitudes to {path:?}: {e}"),
                }
            }
        }
        written
    }
}

/// Identifiers expected in the field of `star`, star of interest first.
fn field_identifiers(star: &Star) -> Vec<u32> {
    let mut ids: Vec<u32> = star
        .field_stars()
        .iter()
        .map(|f| f.id)
        .filter(|&id| id != STAR_OF_INTEREST_ID)
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids.insert(0, STAR_OF_INTEREST_ID);
    ids
}

#[derive(Error, Debug)]
pub enum CollectError {
    #[error(transparent)]
    Measurement(#[from] MeasurementError),
    #[error(transparent)]
    Catalog(#[from] StarCatalogError),
    #[error("Star {0} is not in the stars file")]
    UnknownStar(String),
    #[error("Cannot tell star and filter from file name {0:?}")]
    UnexpectedFileName(PathBuf),
}
