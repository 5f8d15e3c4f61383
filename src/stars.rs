//! The stars to process
//!
//! Loaded from a comma-delimited file, one star per line:
//!
//! ```text
//! name, ra, dec, YES|NO, [group]...
//! ```
//!
//! A standard star (`YES`) continues with `filter, magnitude` groups, any other
//! star with `id, ra, dec` groups describing the reference stars in its field.
//! Only whole groups are read; a truncated trailing group is dropped.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Trim};
use thiserror::Error;
use tracing::{debug, warn};

use crate::common::{CoordParseError, SkyCoord};

/// Identifier reserved for the star of interest inside its own field.
pub const STAR_OF_INTEREST_ID: u32 = 0;

const MIN_FIELDS_IN_RECORD: usize = 4;
const STANDARD_VALUE: &str = "YES";
const STANDARD_GROUP_LEN: usize = 2;
const FIELD_STAR_GROUP_LEN: usize = 3;

/// A reference object in the same image field as a target star.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldStar {
    pub id: u32,
    pub coord: SkyCoord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StandardMagnitude {
    pub filter: String,
    pub magnitude: f64,
}

#[derive(Debug, Clone, PartialEq)]
enum StarData {
    Standard(Vec<StandardMagnitude>),
    Target(Vec<FieldStar>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Star {
    name: String,
    coord: SkyCoord,
    synonyms: Vec<String>,
    data: StarData,
}

impl Star {
    pub fn standard(name: &str, coord: SkyCoord, magnitudes: Vec<StandardMagnitude>) -> Self {
        Self {
            name: name.to_string(),
            coord,
            synonyms: Vec::new(),
            data: StarData::Standard(magnitudes),
        }
    }

    pub fn target(name: &str, coord: SkyCoord, field_stars: Vec<FieldStar>) -> Self {
        Self {
            name: name.to_string(),
            coord,
            synonyms: Vec::new(),
            data: StarData::Target(field_stars),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coord(&self) -> SkyCoord {
        self.coord
    }

    pub fn synonyms(&self) -> &[String] {
        &self.synonyms
    }

    /// A star counts as standard only if at least one standard magnitude was
    /// parsed for it.
    pub fn is_standard(&self) -> bool {
        matches!(&self.data, StarData::Standard(mags) if !mags.is_empty())
    }

    pub fn standard_magnitudes(&self) -> &[StandardMagnitude] {
        match &self.data {
            StarData::Standard(mags) => mags,
            StarData::Target(_) => &[],
        }
    }

    pub fn field_stars(&self) -> &[FieldStar] {
        match &self.data {
            StarData::Standard(_) => &[],
            StarData::Target(field) => field,
        }
    }

    pub fn standard_magnitude(&self, filter: &str) -> Result<f64, CatalogError> {
        if !self.is_standard() {
            return Err(CatalogError::NotStandardStar(self.name.clone()));
        }
        self.standard_magnitudes()
            .iter()
            .find(|m| m.filter == filter)
            .map(|m| m.magnitude)
            .ok_or_else(|| CatalogError::FilterNotFound {
                star: self.name.clone(),
                filter: filter.to_string(),
            })
    }
}

/// All the stars of one run, looked up by name or synonym.
#[derive(Debug, Default, Clone)]
pub struct StarCatalog {
    stars: Vec<Star>,
    by_name: HashMap<String, usize>,
}

impl StarCatalog {
    pub fn new(stars: Vec<Star>) -> Self {
        let mut catalog = Self::default();
        for star in stars {
            catalog.push(star);
        }
        catalog
    }

    fn push(&mut self, star: Star) {
        if self.by_name.contains_key(star.name()) {
            warn!("Star {} defined twice, keeping the first one", star.name());
            return;
        }
        self.by_name.insert(star.name.clone(), self.stars.len());
        self.stars.push(star);
    }

    pub fn load(stars_file: &Path, synonyms_file: Option<&Path>) -> Result<Self, CatalogError> {
        debug!("Reading stars from file: {stars_file:?}");
        let content = fs::read_to_string(stars_file)?;
        let mut catalog = Self::parse(&content)?;
        debug!("Read {} stars from {stars_file:?}", catalog.len());

        if let Some(synonyms_file) = synonyms_file {
            debug!("Reading synonyms from file: {synonyms_file:?}");
            let content = fs::read_to_string(synonyms_file)?;
            catalog.add_synonyms(&content)?;
        }

        Ok(catalog)
    }

    pub fn parse(content: &str) -> Result<Self, CatalogError> {
        let mut catalog = Self::default();
        let mut reader = record_reader(content);
        for record in reader.records() {
            let (line, fields) = record_fields(record?);
            if fields.iter().all(|f| f.is_empty()) {
                continue;
            }
            catalog.push(parse_star(&fields, line)?);
        }
        Ok(catalog)
    }

    /// Register synonyms from `primary, synonym...` lines.
    pub fn add_synonyms(&mut self, content: &str) -> Result<(), CatalogError> {
        let mut reader = record_reader(content);
        for record in reader.records() {
            let (_, fields) = record_fields(record?);
            let Some((primary, synonyms)) = fields.split_first() else {
                continue;
            };
            if primary.is_empty() {
                continue;
            }
            let Some(&index) = self.by_name.get(primary.as_str()) else {
                warn!("Synonyms given for unknown star {primary}");
                continue;
            };
            for synonym in synonyms.iter().filter(|s| !s.is_empty()) {
                if self.by_name.contains_key(synonym.as_str()) {
                    warn!("Synonym {synonym} of {primary} is already a known name");
                    continue;
                }
                self.by_name.insert(synonym.clone(), index);
                self.stars[index].synonyms.push(synonym.clone());
            }
        }
        Ok(())
    }

    pub fn get_star(&self, name: &str) -> Option<&Star> {
        self.by_name.get(name).map(|&i| &self.stars[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Star> {
        self.stars.iter()
    }

    pub fn len(&self) -> usize {
        self.stars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stars.is_empty()
    }

    pub fn standard_stars(&self) -> impl Iterator<Item = &Star> {
        self.stars.iter().filter(|s| s.is_standard())
    }

    pub fn target_stars(&self) -> impl Iterator<Item = &Star> {
        self.stars.iter().filter(|s| !s.is_standard())
    }
}

/// Comma-delimited records; double quotes protect decimal commas.
fn record_reader(content: &str) -> csv::Reader<&[u8]> {
    ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(content.as_bytes())
}

/// Line number and owned fields of a record.
fn record_fields(record: StringRecord) -> (usize, Vec<String>) {
    let line = record.position().map_or(0, |p| p.line() as usize);
    (line, record.iter().map(str::to_string).collect())
}

/// Whole groups of `group_len` after the fixed columns.
fn whole_groups(fields: &[String], group_len: usize) -> std::slice::ChunksExact<'_, String> {
    fields[MIN_FIELDS_IN_RECORD..].chunks_exact(group_len)
}

fn parse_star(fields: &[String], line: usize) -> Result<Star, CatalogError> {
    if fields.len() < MIN_FIELDS_IN_RECORD {
        return Err(CatalogError::MalformedStarRecord {
            line,
            fields: fields.len(),
        });
    }

    let name = &fields[0];
    let coord = SkyCoord::parse(&fields[1], &fields[2])
        .map_err(|source| CatalogError::InvalidCoordinate { line, source })?;

    let group_len = if fields[3] == STANDARD_VALUE {
        STANDARD_GROUP_LEN
    } else {
        FIELD_STAR_GROUP_LEN
    };
    let groups = whole_groups(fields, group_len);
    if !groups.remainder().is_empty() {
        debug!(
            "Discarding truncated trailing group for star {name} at line {line}: {:?}",
            groups.remainder()
        );
    }

    if fields[3] == STANDARD_VALUE {
        let mut magnitudes: Vec<StandardMagnitude> = Vec::new();
        for group in groups {
            let magnitude = parse_number(&group[1], line)?;
            if magnitudes.iter().any(|m| m.filter == group[0]) {
                warn!(
                    "Repeated standard magnitude for star {name} in filter {}, keeping the first",
                    group[0]
                );
                continue;
            }
            magnitudes.push(StandardMagnitude {
                filter: group[0].clone(),
                magnitude,
            });
        }
        if magnitudes.is_empty() {
            warn!(
                "Star {name} is declared standard at line {line} but has no standard \
                 magnitudes, it will be processed as a non standard star"
            );
        }
        Ok(Star::standard(name, coord, magnitudes))
    } else {
        let mut field_stars: Vec<FieldStar> = Vec::new();
        for group in groups {
            let id = group[0]
                .parse::<u32>()
                .map_err(|_| CatalogError::InvalidValue {
                    line,
                    value: group[0].clone(),
                })?;
            let coord = SkyCoord::parse(&group[1], &group[2])
                .map_err(|source| CatalogError::InvalidCoordinate { line, source })?;
            if field_stars.iter().any(|f| f.id == id) {
                warn!("Repeated field star identifier {id} for star {name}");
            }
            field_stars.push(FieldStar { id, coord });
        }
        Ok(Star::target(name, coord, field_stars))
    }
}

fn parse_number(value: &str, line: usize) -> Result<f64, CatalogError> {
    value
        .replace(',', ".")
        .parse::<f64>()
        .map_err(|_| CatalogError::InvalidValue {
            line,
            value: value.to_string(),
        })
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("Star record at line {line} has {fields} fields, at least 4 are required")]
    MalformedStarRecord { line: usize, fields: usize },
    #[error("Invalid coordinate at line {line}: {source}")]
    InvalidCoordinate {
        line: usize,
        source: CoordParseError,
    },
    #[error("Invalid value '{value}' at line {line}")]
    InvalidValue { line: usize, value: String },
    #[error("Star {0} is not a standard star")]
    NotStandardStar(String),
    #[error("Star {star} has no standard magnitude in filter {filter}")]
    FilterNotFound { star: String, filter: String },
}
