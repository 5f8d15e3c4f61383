//! Running the reduction steps
//!
//! ```text
//! astrometry -> photometry -> magnitudes -> curves
//! ```
//!
//! Every step works from the files left by the previous one, so each can be
//! run on its own. A star, image or day that fails is logged and left out;
//! the others carry on.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use derive_more::Display;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::calibration::{write_calibrated, MagnitudeCalibrator, TransformationCoefficients};
use crate::common::ObservingDay;
use crate::config::{Config, ConfigError};
use crate::curves::write_star_curve;
use crate::extinction::{write_corrected, ExtinctionCoefficients, ExtinctionEstimator};
use crate::fits::{FitsHeaderReader, HeaderLookup};
use crate::instmag::{
    star_name_from_path, InstrumentalCollector, StarMagnitudes, MEASUREMENT_SUFFIX,
};
use crate::magnitude::CorrectedMagnitude;
use crate::matcher::CoordinateMatcher;
use crate::solver::{Registration, ToolCommand, ToolRegistration};
use crate::starcat::{PixelCatalog, StarCatalogError, CATALOG_EXTENSION};
use crate::stars::{CatalogError, StarCatalog};

pub const IMAGE_EXTENSION: &str = "fit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Step {
    Astrometry,
    Photometry,
    Magnitudes,
    Curves,
    All,
}

impl Step {
    /// Steps run by `All`, in order.
    pub const SEQUENCE: [Step; 4] = [
        Step::Astrometry,
        Step::Photometry,
        Step::Magnitudes,
        Step::Curves,
    ];
}

type StepHandler<R, H> = fn(&Pipeline<R, H>, &mut RunReport) -> Result<(), PipelineError>;

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub images_registered: usize,
    pub catalogs_written: usize,
    pub measurement_files: usize,
    pub stars_collected: usize,
    pub extinction_coefficients: usize,
    pub transformation_days: usize,
    pub stars_calibrated: usize,
    pub curves_written: usize,
    pub files_written: usize,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} images registered, {} catalogs, {} measurement files, {} stars collected, \
             {} extinction coefficients, {} days with transformation coefficients, \
             {} stars calibrated, {} curves, {} files written",
            self.images_registered,
            self.catalogs_written,
            self.measurement_files,
            self.stars_collected,
            self.extinction_coefficients,
            self.transformation_days,
            self.stars_calibrated,
            self.curves_written,
            self.files_written
        )
    }
}

pub struct Pipeline<R = ToolRegistration, H = FitsHeaderReader> {
    stars: StarCatalog,
    registration: R,
    headers: H,
    matcher: CoordinateMatcher,
    extinction: ExtinctionEstimator,
    calibrator: MagnitudeCalibrator,
    photometry: Option<ToolCommand>,
    tool_timeout: std::time::Duration,
    data_dir: PathBuf,
    output_dir: PathBuf,
}

impl Pipeline {
    /// Load the stars and set up the external programs named in `config`.
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        config.validate()?;
        let stars_file = config
            .stars_file
            .as_deref()
            .ok_or(ConfigError::Missing("stars_file"))?;
        let stars = StarCatalog::load(stars_file, config.synonyms_file.as_deref())?;
        info!("{} stars loaded from {stars_file:?}", stars.len());

        let registration =
            ToolRegistration::new(config.registration.clone(), config.tool_timeout());
        Self::new(config, stars, registration, FitsHeaderReader)
    }
}

impl<R, H> Pipeline<R, H>
where
    R: Registration,
    H: HeaderLookup,
{
    pub fn new(
        config: &Config,
        stars: StarCatalog,
        registration: R,
        headers: H,
    ) -> Result<Self, PipelineError> {
        let data_dir = config.data_dir().ok_or(ConfigError::Missing("target_dir"))?;
        let output_dir = config
            .output_dir()
            .ok_or(ConfigError::Missing("target_dir"))?;
        Ok(Self {
            stars,
            registration,
            headers,
            matcher: CoordinateMatcher::new(config.match_tolerance, config.center_deviation),
            extinction: ExtinctionEstimator::new(config.time_scale, config.min_extinction_measures),
            calibrator: MagnitudeCalibrator::new(config.min_calibration_stars),
            photometry: config.photometry.clone(),
            tool_timeout: config.tool_timeout(),
            data_dir,
            output_dir,
        })
    }

    fn handlers() -> [(Step, StepHandler<R, H>); 4] {
        [
            (Step::Astrometry, Self::astrometry),
            (Step::Photometry, Self::photometry),
            (Step::Magnitudes, Self::magnitudes),
            (Step::Curves, Self::curves),
        ]
    }

    pub fn run(&self, step: Step) -> Result<RunReport, PipelineError> {
        let steps: &[Step] = match step {
            Step::All => &Step::SEQUENCE,
            _ => std::slice::from_ref(&step),
        };

        let mut report = RunReport::default();
        for step in steps {
            let Some((_, handler)) = Self::handlers().into_iter().find(|(s, _)| s == step) else {
                continue;
            };
            info!("* Running step {step}");
            handler(self, &mut report)?;
        }
        Ok(report)
    }

    fn images(&self) -> Result<Vec<PathBuf>, PipelineError> {
        let pattern = format!(
            "{}/*/*.{IMAGE_EXTENSION}",
            glob::Pattern::escape(&self.data_dir.to_string_lossy())
        );
        Ok(glob::glob(&pattern)?.filter_map(Result::ok).collect())
    }

    /// Register each image, match its star field and write the pixel catalog.
    fn astrometry(&self, report: &mut RunReport) -> Result<(), PipelineError> {
        for image in self.images()? {
            let Some(star) = star_name_from_path(&image).and_then(|n| self.stars.get_star(&n))
            else {
                debug!("Image {image:?} is not of a known star");
                continue;
            };

            let field = match self.registration.register(&image) {
                Ok(field) => field,
                Err(e) => {
                    warn!("Registration of {image:?} failed: {e}");
                    continue;
                }
            };
            report.images_registered += 1;

            let matched = self.matcher.find_all_for_star_field(&field.coords, star);
            if matched.is_empty() {
                continue;
            }
            if !self.matcher.validate_match(
                &image,
                star,
                &matched,
                &field.coords,
                &field.pixels,
                &self.headers,
            ) {
                continue;
            }

            let catalog_path = image.with_extension(CATALOG_EXTENSION);
            let written = PixelCatalog::from_matches(
                &matched.indices,
                &matched.identifiers,
                &field.pixels,
            )
            .and_then(|catalog| catalog.write(&catalog_path));
            match written {
                Ok(()) => report.catalogs_written += 1,
                Err(e) => error!("Writing catalog {catalog_path:?}: {e}"),
            }
        }
        Ok(())
    }

    /// Measure every image that has a pixel catalog and no measurements yet.
    fn photometry(&self, report: &mut RunReport) -> Result<(), PipelineError> {
        let Some(command) = &self.photometry else {
            warn!("No photometry program configured, skipping photometry");
            return Ok(());
        };

        for image in self.images()? {
            let catalog = image.with_extension(CATALOG_EXTENSION);
            if !catalog.exists() {
                continue;
            }
            let Some(output) = measurement_path(&image) else {
                continue;
            };
            if output.exists() {
                debug!("Measurements already present for {image:?}");
                continue;
            }

            let vars = std::collections::HashMap::from([
                ("image", image.to_string_lossy().into_owned()),
                ("catalog", catalog.to_string_lossy().into_owned()),
                ("output", output.to_string_lossy().into_owned()),
            ]);
            match command.run(&vars, image.parent(), self.tool_timeout) {
                Ok(_) if output.exists() => report.measurement_files += 1,
                Ok(_) => warn!("Photometry of {image:?} wrote no measurements"),
                Err(e) => warn!("Photometry of {image:?} failed: {e}"),
            }
        }
        Ok(())
    }

    /// Collect instrumental magnitudes, then correct and calibrate them.
    fn magnitudes(&self, report: &mut RunReport) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.output_dir)?;

        let mut collector = InstrumentalCollector::new(&self.stars);
        collector.collect_dir(&self.data_dir);
        report.files_written += collector.save(&self.output_dir);
        let magnitudes = collector.into_magnitudes();
        report.stars_collected = magnitudes.len();

        if self.stars.target_stars().next().is_none() {
            warn!("No non-standard stars, extinction correction and calibration skipped");
            return Ok(());
        }

        let coefficients = self.extinction_coefficients(&magnitudes);
        report.extinction_coefficients = coefficients.len();
        let corrected = self.correct_all(&coefficients, &magnitudes, report);

        let transformations = self.transformations(&corrected);
        report.transformation_days = transformations.len();
        self.calibrate_all(&transformations, &corrected, report);
        Ok(())
    }

    fn extinction_coefficients(
        &self,
        magnitudes: &BTreeMap<String, StarMagnitudes>,
    ) -> ExtinctionCoefficients {
        let standards: Vec<_> = self
            .stars
            .standard_stars()
            .filter_map(|star| {
                magnitudes
                    .get(star.name())
                    .map(|series| (star, series.object.as_slice()))
            })
            .collect();
        self.extinction.compute(&standards)
    }

    fn correct_all(
        &self,
        coefficients: &ExtinctionCoefficients,
        magnitudes: &BTreeMap<String, StarMagnitudes>,
        report: &mut RunReport,
    ) -> BTreeMap<String, Vec<CorrectedMagnitude>> {
        let mut corrected = BTreeMap::new();
        for (name, series) in magnitudes {
            let star_corrected = self
                .extinction
                .correct_all(coefficients, name, &series.object);
            if star_corrected.is_empty() {
                debug!("No extinction corrected magnitudes for {name}");
                continue;
            }
            match write_corrected(&self.output_dir, name, &star_corrected) {
                Ok(()) => report.files_written += 1,
                Err(e) => error!("Writing corrected magnitudes of {name}: {e}"),
            }
            corrected.insert(name.clone(), star_corrected);
        }
        corrected
    }

    fn transformations(
        &self,
        corrected: &BTreeMap<String, Vec<CorrectedMagnitude>>,
    ) -> BTreeMap<ObservingDay, TransformationCoefficients> {
        let standards: Vec<_> = self
            .stars
            .standard_stars()
            .filter_map(|star| {
                corrected
                    .get(star.name())
                    .map(|series| (star, series.as_slice()))
            })
            .collect();
        self.calibrator.compute(&standards)
    }

    fn calibrate_all(
        &self,
        transformations: &BTreeMap<ObservingDay, TransformationCoefficients>,
        corrected: &BTreeMap<String, Vec<CorrectedMagnitude>>,
        report: &mut RunReport,
    ) {
        for (name, series) in corrected {
            let calibrated = self.calibrator.calibrate(transformations, name, series);
            if calibrated.is_empty() {
                continue;
            }
            match write_calibrated(&self.output_dir, name, &calibrated) {
                Ok(()) => {
                    report.stars_calibrated += 1;
                    report.files_written += 1;
                }
                Err(e) => error!("Writing calibrated magnitudes of {name}: {e}"),
            }
        }
    }

    /// Differential curves for every star with field magnitudes.
    fn curves(&self, report: &mut RunReport) -> Result<(), PipelineError> {
        for star in self.stars.iter() {
            match write_star_curve(&self.output_dir, star.name()) {
                Ok(true) => {
                    report.curves_written += 1;
                    report.files_written += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("Differential curve of {}: {e}", star.name()),
            }
        }
        Ok(())
    }
}

/// `<stem>_mag.csv` next to `image`.
fn measurement_path(image: &Path) -> Option<PathBuf> {
    let stem = image.file_stem()?.to_str()?;
    Some(image.with_file_name(format!("{stem}{MEASUREMENT_SUFFIX}")))
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    StarCatalog(#[from] StarCatalogError),
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SkyCoord;
    use crate::fits::HeaderError;
    use crate::magnitude::{star_file_path, CAL_MAG_SUFFIX, CORR_MAG_SUFFIX, INST_MAG_SUFFIX};
    use crate::solver::{RegisteredField, RegistrationError};
    use crate::stars::{FieldStar, StandardMagnitude, Star};
    use glam::DVec2;

    struct FixedField(RegisteredField);

    impl Registration for FixedField {
        type E = RegistrationError;

        fn register(&self, _img: &Path) -> Result<RegisteredField, Self::E> {
            Ok(self.0.clone())
        }
    }

    struct Center;

    impl HeaderLookup for Center {
        fn header_value(&self, _image: &Path, _key: &str) -> Result<String, HeaderError> {
            Ok("500".to_string())
        }
    }

    fn config(dir: &Path) -> Config {
        Config {
            stars_file: Some(dir.join("stars.csv")),
            target_dir: Some(dir.to_path_buf()),
            ..Config::default()
        }
    }

    #[test]
    fn test_measurement_path() {
        assert_eq!(
            measurement_path(Path::new("/d/V/BQCam-001.fit")).unwrap(),
            Path::new("/d/V/BQCam-001_mag.csv")
        );
    }

    #[test]
    fn test_astrometry_writes_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let image_dir = dir.path().join("data").join("V");
        std::fs::create_dir_all(&image_dir).unwrap();
        std::fs::write(image_dir.join("BQCam-001.fit"), "").unwrap();
        std::fs::write(image_dir.join("Other-001.fit"), "").unwrap();

        let star = Star::target(
            "BQCam",
            SkyCoord::new(41.0, 57.0),
            vec![FieldStar {
                id: 4,
                coord: SkyCoord::new(41.05, 57.01),
            }],
        );
        let field = RegisteredField {
            coords: vec![
                SkyCoord::new(40.9, 56.9),
                SkyCoord::new(41.05, 57.01),
                SkyCoord::new(41.0, 57.0),
                SkyCoord::new(41.1, 57.1),
            ],
            pixels: vec![
                DVec2::new(100.0, 100.0),
                DVec2::new(610.0, 402.0),
                DVec2::new(512.0, 498.0),
                DVec2::new(900.0, 900.0),
            ],
        };

        let pipeline = Pipeline::new(
            &config(dir.path()),
            StarCatalog::new(vec![star]),
            FixedField(field),
            Center,
        )
        .unwrap();
        let report = pipeline.run(Step::Astrometry).unwrap();
        assert_eq!(report.images_registered, 1);
        assert_eq!(report.catalogs_written, 1);

        let catalog = PixelCatalog::read(&image_dir.join("BQCam-001.cat")).unwrap();
        assert_eq!(catalog.id(0), Some(0));
        assert_eq!(catalog.entries()[0].position, DVec2::new(512.0, 498.0));
        assert_eq!(catalog.id(1), Some(4));
    }

    /// Three V images of a standard star, extinction 0.2 per airmass.
    fn write_standard_measurements(data: &Path, name: &str, magnitude: f64) {
        let dir = data.join("V");
        std::fs::create_dir_all(&dir).unwrap();
        for (seq, airmass) in [1.0, 1.5, 2.0].iter().enumerate() {
            let stem = format!("{name}-{seq:03}");
            let time = 2457234.6 + 0.01 * seq as f64;
            let inst = magnitude + 0.2 * airmass;
            std::fs::write(dir.join(format!("{stem}.cat")), "512 498 0\n").unwrap();
            std::fs::write(
                dir.join(format!("{stem}{MEASUREMENT_SUFFIX}")),
                format!("1 512 498 {time} {inst} {airmass} 0.01\n"),
            )
            .unwrap();
        }
    }

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

    #[test]
    fn test_only_standard_stars_skips_calibration() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        write_standard_measurements(&data, "SA98A", 9.6);
        write_standard_measurements(&data, "SA98B", 10.6);

        let pipeline = Pipeline::new(
            &config(dir.path()),
            StarCatalog::new(vec![standard("SA98A", 10.0), standard("SA98B", 11.0)]),
            FixedField(RegisteredField::default()),
            Center,
        )
        .unwrap();
        let report = pipeline.run(Step::Magnitudes).unwrap();
        assert_eq!(report.stars_collected, 2);
        assert_eq!(report.files_written, 4);
        assert_eq!(report.extinction_coefficients, 0);
        assert_eq!(report.transformation_days, 0);

        for name in ["SA98A", "SA98B"] {
            assert!(star_file_path(dir.path(), name, INST_MAG_SUFFIX).exists());
            assert!(!star_file_path(dir.path(), name, CORR_MAG_SUFFIX).exists());
            assert!(!star_file_path(dir.path(), name, CAL_MAG_SUFFIX).exists());
        }
    }
}
