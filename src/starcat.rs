//! Pixel catalog files
//!
//! One catalog is written per registered image. Each row holds the X, Y pixel
//! position of a matched object and its field identifier, `0` being the star
//! of interest:
//!
//! ```text
//! 512.25 498.5 0
//! 610.75 402 3
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use glam::DVec2;
use thiserror::Error;
use tracing::debug;

pub const CATALOG_EXTENSION: &str = "cat";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CatalogEntry {
    pub position: DVec2,
    pub id: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PixelCatalog {
    entries: Vec<CatalogEntry>,
}

impl PixelCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    /// Build the catalog of matched objects: `indices` point into `pixels`,
    /// `identifiers` runs parallel to `indices`.
    pub fn from_matches(
        indices: &[usize],
        identifiers: &[u32],
        pixels: &[DVec2],
    ) -> Result<Self, StarCatalogError> {
        let entries = indices
            .iter()
            .zip(identifiers)
            .map(|(&index, &id)| {
                pixels
                    .get(index)
                    .map(|&position| CatalogEntry { position, id })
                    .ok_or(StarCatalogError::InvalidIndex(index))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identifier of the object at catalog row `row`.
    pub fn id(&self, row: usize) -> Option<u32> {
        self.entries.get(row).map(|e| e.id)
    }

    pub fn read(path: &Path) -> Result<Self, StarCatalogError> {
        debug!("Reading coordinates from: {path:?}");
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for (line_number, line) in reader.lines().enumerate() {
            let line = line?;
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.is_empty() {
                continue;
            }
            let malformed = || StarCatalogError::MalformedRow {
                path: path.to_path_buf(),
                line: line_number + 1,
            };
            if cols.len() < 3 {
                return Err(malformed());
            }
            let x = cols[0].parse::<f64>().map_err(|_| malformed())?;
            let y = cols[1].parse::<f64>().map_err(|_| malformed())?;
            let id = cols[2].parse::<u32>().map_err(|_| malformed())?;
            entries.push(CatalogEntry {
                position: DVec2::new(x, y),
                id,
            });
        }
        debug!("Read {} catalog entries from {path:?}", entries.len());
        Ok(Self { entries })
    }

    pub fn write(&self, path: &Path) -> Result<(), StarCatalogError> {
        debug!("Writing catalog file: {path:?}");
        let mut writer = BufWriter::new(File::create(path)?);
        for entry in &self.entries {
            writeln!(
                writer,
                "{} {} {}",
                entry.position.x, entry.position.y, entry.id
            )?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum StarCatalogError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Malformed catalog row {line} in {path:?}")]
    MalformedRow { path: PathBuf, line: usize },
    #[error("Index {0} outside the pixel coordinate list")]
    InvalidIndex(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BQCam-001.cat");
        let catalog = PixelCatalog::new(vec![
            CatalogEntry {
                position: DVec2::new(512.25, 498.5),
                id: 0,
            },
            CatalogEntry {
                position: DVec2::new(610.123456789012, 402.0),
                id: 3,
            },
        ]);
        catalog.write(&path).unwrap();
        let read = PixelCatalog::read(&path).unwrap();
        assert_eq!(read, catalog);
        assert_eq!(read.id(0), Some(0));
        assert_eq!(read.id(2), None);
    }

    #[test]
    fn test_from_matches() {
        let pixels = vec![
            DVec2::new(1.0, 2.0),
            DVec2::new(3.0, 4.0),
            DVec2::new(5.0, 6.0),
        ];
        let catalog = PixelCatalog::from_matches(&[2, 0], &[0, 7], &pixels).unwrap();
        assert_eq!(catalog.entries()[0].position, DVec2::new(5.0, 6.0));
        assert_eq!(catalog.entries()[1].id, 7);
        assert!(PixelCatalog::from_matches(&[9], &[0], &pixels).is_err());
    }

    #[test]
    fn test_malformed_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.cat");
        std::fs::write(&path, "1 2 0\n1 x 3\n").unwrap();
        assert!(matches!(
            PixelCatalog::read(&path),
            Err(StarCatalogError::MalformedRow { line: 2, .. })
        ));
    }
}
