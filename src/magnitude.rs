//! Magnitude records flowing through the calibration stages and their
//! tab-separated persistence.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, Terminator, WriterBuilder};
use thiserror::Error;

use crate::common::ObservingDay;

/// Token the photometry tool writes for a value it could not compute.
pub const INDEF: &str = "INDEF";

pub const INST_MAG_SUFFIX: &str = "_inst_mag";
pub const ALL_INST_MAG_SUFFIX: &str = "_all_inst_mag";
pub const CORR_MAG_SUFFIX: &str = "_ec_mag";
pub const CAL_MAG_SUFFIX: &str = "_cal_mag";
pub const DIFF_MAG_SUFFIX: &str = "_diff_mag";
pub const TSV_EXTENSION: &str = "tsv";

/// A measured quantity that may be undefined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Measure {
    Value(f64),
    Indef,
}
impl Measure {
    pub fn parse(s: &str) -> Result<Self, MeasurementError> {
        let s = s.trim();
        if s == INDEF {
            return Ok(Measure::Indef);
        }
        match s.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Measure::Value(v)),
            _ => Err(MeasurementError::InvalidValue(s.to_string())),
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Measure::Value(v) => Some(*v),
            Measure::Indef => None,
        }
    }

    pub fn is_indef(&self) -> bool {
        matches!(self, Measure::Indef)
    }
}
impl fmt::Display for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Measure::Value(v) => write!(f, "{v}"),
            Measure::Indef => f.write_str(INDEF),
        }
    }
}
impl From<f64> for Measure {
    fn from(v: f64) -> Self {
        Measure::Value(v)
    }
}

/// One star measured on one image.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentalRecord {
    pub time: f64,
    pub magnitude: Measure,
    pub airmass: f64,
    pub error: Measure,
    pub filter: String,
}

/// All identifiers of one image in identifier order, gaps filled with
/// `Measure::Indef`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRecord {
    pub time: f64,
    pub filter: String,
    /// (magnitude, error) per identifier
    pub magnitudes: Vec<(Measure, Measure)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedMagnitude {
    pub time: f64,
    pub day: ObservingDay,
    pub filter: String,
    pub corrected: f64,
    pub instrumental: f64,
    pub error: Measure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibratedMagnitude {
    pub time: f64,
    pub calibrated: f64,
    pub corrected: f64,
    pub instrumental: f64,
    pub filter: String,
}

/// Rows that can be written as one tab-separated line.
pub trait TsvRow {
    fn fields(&self) -> Vec<String>;
}

impl TsvRow for InstrumentalRecord {
    fn fields(&self) -> Vec<String> {
        vec![
            self.time.to_string(),
            self.magnitude.to_string(),
            self.airmass.to_string(),
            self.error.to_string(),
            self.filter.clone(),
        ]
    }
}

impl TsvRow for FieldRecord {
    fn fields(&self) -> Vec<String> {
        let mut fields = vec![self.time.to_string(), self.filter.clone()];
        for (mag, err) in &self.magnitudes {
            fields.push(mag.to_string());
            fields.push(err.to_string());
        }
        fields
    }
}

impl TsvRow for CorrectedMagnitude {
    fn fields(&self) -> Vec<String> {
        vec![
            self.time.to_string(),
            self.day.to_string(),
            self.filter.clone(),
            self.corrected.to_string(),
            self.instrumental.to_string(),
            self.error.to_string(),
        ]
    }
}

impl TsvRow for CalibratedMagnitude {
    fn fields(&self) -> Vec<String> {
        vec![
            self.time.to_string(),
            self.calibrated.to_string(),
            self.corrected.to_string(),
            self.instrumental.to_string(),
            self.filter.clone(),
        ]
    }
}

/// `<dir>/<star><suffix>.tsv`
pub fn star_file_path(dir: &Path, star_name: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{star_name}{suffix}.{TSV_EXTENSION}"))
}

/// Write rows to `path`, replacing or appending to its content.
pub fn write_rows<R: TsvRow>(
    path: &Path,
    rows: &[R],
    append: bool,
) -> Result<(), MeasurementError> {
    let file = if append {
        OpenOptions::new().create(true).append(true).open(path)?
    } else {
        File::create(path)?
    };
    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(file);
    for row in rows {
        writer.write_record(row.fields())?;
    }
    writer.flush()?;
    Ok(())
}

/// Read back an all-magnitudes file written by the collector.
pub fn read_field_records(path: &Path) -> Result<Vec<FieldRecord>, MeasurementError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut records = Vec::new();
    for result in reader.records() {
        let row = result?;
        let line = row.position().map_or(0, |p| p.line() as usize);
        if row.len() < 2 || row.len() % 2 != 0 {
            return Err(MeasurementError::MalformedRow {
                path: path.to_path_buf(),
                line,
            });
        }
        let time = row[0]
            .trim()
            .parse::<f64>()
            .map_err(|_| MeasurementError::InvalidValue(row[0].to_string()))?;
        let fields: Vec<&str> = row.iter().skip(2).collect();
        let magnitudes = fields
            .chunks_exact(2)
            .map(|pair| Ok((Measure::parse(pair[0])?, Measure::parse(pair[1])?)))
            .collect::<Result<Vec<_>, MeasurementError>>()?;
        records.push(FieldRecord {
            time,
            filter: row[1].to_string(),
            magnitudes,
        });
    }
    Ok(records)
}

#[derive(Error, Debug)]
pub enum MeasurementError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("Invalid measurement value: '{0}'")]
    InvalidValue(String),
    #[error("Malformed row {line} in {path:?}")]
    MalformedRow { path: PathBuf, line: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_parse() {
        assert_eq!(Measure::parse("INDEF").unwrap(), Measure::Indef);
        assert_eq!(Measure::parse(" 12.5 ").unwrap(), Measure::Value(12.5));
        assert!(Measure::parse("nope").is_err());
        assert!(Measure::parse("nan").is_err());
        assert!(Measure::parse("-inf").is_err());
        assert_eq!(Measure::Indef.value(), None);
        assert!(Measure::Indef.is_indef());
        assert!(!Measure::from(1.5).is_indef());
        assert_eq!(Measure::Indef.to_string(), "INDEF");
    }

    #[test]
    fn test_field_records_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = star_file_path(dir.path(), "BQCam", ALL_INST_MAG_SUFFIX);
        let rows = vec![
            FieldRecord {
                time: 57234.61,
                filter: "V".to_string(),
                magnitudes: vec![
                    (Measure::Value(12.1), Measure::Value(0.01)),
                    (Measure::Indef, Measure::Indef),
                ],
            },
            FieldRecord {
                time: 57234.62,
                filter: "B".to_string(),
                magnitudes: vec![(Measure::Value(13.0), Measure::Value(0.02))],
            },
        ];
        write_rows(&path, &rows, false).unwrap();
        assert_eq!(read_field_records(&path).unwrap(), rows);
    }

    #[test]
    fn test_append_keeps_previous_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = star_file_path(dir.path(), "SA98", CAL_MAG_SUFFIX);
        let row = CalibratedMagnitude {
            time: 2457234.6,
            calibrated: 11.0,
            corrected: 10.5,
            instrumental: 10.9,
            filter: "V".to_string(),
        };
        write_rows(&path, std::slice::from_ref(&row), true).unwrap();
        write_rows(&path, std::slice::from_ref(&row), true).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert_eq!(
            content.lines().next().unwrap(),
            "2457234.6\t11\t10.5\t10.9\tV"
        );
    }

    #[test]
    fn test_malformed_field_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = star_file_path(dir.path(), "BQCam", ALL_INST_MAG_SUFFIX);
        std::fs::write(&path, "57234.61\tV\t12.1\t0.01\n57234.62\tV\t12.2\n").unwrap();
        assert!(matches!(
            read_field_records(&path),
            Err(MeasurementError::MalformedRow { line: 2, .. })
        ));
        std::fs::write(&path, "57234.61\tV\tnan\t0.01\n").unwrap();
        assert!(matches!(
            read_field_records(&path),
            Err(MeasurementError::InvalidValue(_))
        ));
    }
}
