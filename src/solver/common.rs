//! Primitives and traits for image registration
//!
//! Provides the [Registration] trait as well as the [RegisteredField] type
//! to help standardize registration implementations.
//!
//! A registered image is described by two row-aligned tables: the sky
//! coordinates of every detected object and its pixel position.
//!
//! ```text
//! BQCam-001.rdls.txt    BQCam-001.xyls.txt
//! 41.0349 57.1171       512.25 498.5
//! 41.0512 57.0934       610.75 402
//! ```

use std::error::Error;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use glam::DVec2;
use thiserror::Error;
use tracing::debug;

use crate::common::SkyCoord;

use super::tool::ToolError;

pub const SKY_TABLE_SUFFIX: &str = ".rdls.txt";
pub const PIXEL_TABLE_SUFFIX: &str = ".xyls.txt";

/// Image Registration Trait
pub trait Registration {
    type E: Error;

    fn register(&self, img: &Path) -> Result<RegisteredField, Self::E>;
}

/// Sky and pixel coordinates of the objects detected on one image. Row `i`
/// of `coords` and row `i` of `pixels` are the same object.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RegisteredField {
    pub coords: Vec<SkyCoord>,
    pub pixels: Vec<DVec2>,
}

impl RegisteredField {
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// `<dir>/<stem>.rdls.txt` and `<dir>/<stem>.xyls.txt` for `img`.
    pub fn table_paths(img: &Path) -> (PathBuf, PathBuf) {
        let stem = img
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = img.parent().unwrap_or_else(|| Path::new(""));
        (
            dir.join(format!("{stem}{SKY_TABLE_SUFFIX}")),
            dir.join(format!("{stem}{PIXEL_TABLE_SUFFIX}")),
        )
    }

    pub fn tables_exist(img: &Path) -> bool {
        let (sky, pixel) = Self::table_paths(img);
        sky.is_file() && pixel.is_file()
    }

    /// Read both tables written for `img`.
    pub fn read(img: &Path) -> Result<Self, RegistrationError> {
        let (sky_path, pixel_path) = Self::table_paths(img);
        let coords = read_pairs(&sky_path)?
            .into_iter()
            .map(|(ra, dec)| SkyCoord::new(ra, dec))
            .collect::<Vec<_>>();
        let pixels = read_pairs(&pixel_path)?
            .into_iter()
            .map(|(x, y)| DVec2::new(x, y))
            .collect::<Vec<_>>();

        if coords.len() != pixels.len() {
            return Err(RegistrationError::LengthMismatch {
                coords: coords.len(),
                pixels: pixels.len(),
            });
        }
        debug!("Read {} registered objects for {img:?}", coords.len());
        Ok(Self { coords, pixels })
    }
}

/// First two columns of every non-comment row.
fn read_pairs(path: &Path) -> Result<Vec<(f64, f64)>, RegistrationError> {
    let reader = BufReader::new(File::open(path)?);
    let mut pairs = Vec::new();
    for (line_number, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let malformed = || RegistrationError::MalformedRow {
            path: path.to_path_buf(),
            line: line_number + 1,
        };
        let mut cols = line.split_whitespace();
        let a = cols.next().ok_or_else(malformed)?;
        let b = cols.next().ok_or_else(malformed)?;
        pairs.push((
            a.parse::<f64>().map_err(|_| malformed())?,
            b.parse::<f64>().map_err(|_| malformed())?,
        ));
    }
    Ok(pairs)
}

/// Registration runtime errors
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("Malformed registration row {line} in {path:?}")]
    MalformedRow { path: PathBuf, line: usize },
    #[error("Registration tables differ in length: {coords} coordinates, {pixels} pixels")]
    LengthMismatch { coords: usize, pixels: usize },
    #[error("Registration produced no tables for {0:?}")]
    NoOutput(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_table_paths() {
        let (sky, pixel) = RegisteredField::table_paths(Path::new("/data/V/BQCam-001.fit"));
        assert_eq!(sky, Path::new("/data/V/BQCam-001.rdls.txt"));
        assert_eq!(pixel, Path::new("/data/V/BQCam-001.xyls.txt"));
    }

    #[test]
    fn test_read_tables() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("BQCam-001.fit");
        let (sky, pixel) = RegisteredField::table_paths(&img);
        std::fs::write(&sky, "# ra dec\n41.0349 57.1171\n41.0512 57.0934\n").unwrap();
        std::fs::write(&pixel, "# x y\n512.25 498.5\n610.75 402\n").unwrap();

        assert!(RegisteredField::tables_exist(&img));
        let field = RegisteredField::read(&img).unwrap();
        assert_eq!(field.len(), 2);
        assert_relative_eq!(field.coords[1].dec.degrees(), 57.0934);
        assert_eq!(field.pixels[0], DVec2::new(512.25, 498.5));
    }

    #[test]
    fn test_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("BQCam-002.fit");
        let (sky, pixel) = RegisteredField::table_paths(&img);
        std::fs::write(&sky, "41.0349 57.1171\n41.0512 57.0934\n").unwrap();
        std::fs::write(&pixel, "512.25 498.5\n").unwrap();
        assert!(matches!(
            RegisteredField::read(&img),
            Err(RegistrationError::LengthMismatch {
                coords: 2,
                pixels: 1
            })
        ));
    }
}
