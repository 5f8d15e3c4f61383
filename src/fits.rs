//! Read-only access to FITS header keywords
//!
//! Only the primary header of an image is consulted, e.g.
//!
//! ```text
//! CRPIX1  =                512.5 / Reference pixel on this axis
//! ```

use std::path::{Path, PathBuf};

use fitsio::errors::Error as FitsIoError;
use fitsio::headers::ReadsKey;
use fitsio::FitsFile;
use thiserror::Error;

/// cfitsio status for a keyword missing from the header.
const KEY_NO_EXIST: i32 = 202;

/// Source of header values for an image.
pub trait HeaderLookup {
    fn header_value(&self, image: &Path, key: &str) -> Result<String, HeaderError>;

    fn header_f64(&self, image: &Path, key: &str) -> Result<f64, HeaderError> {
        let value = self.header_value(image, key)?;
        value
            .trim()
            .parse::<f64>()
            .map_err(|_| HeaderError::InvalidValue {
                key: key.to_string(),
                value,
            })
    }
}

/// Opens the image file every time a value is requested.
#[derive(Debug, Default, Clone, Copy)]
pub struct FitsHeaderReader;

impl FitsHeaderReader {
    fn read_key<T: ReadsKey>(image: &Path, key: &str) -> Result<T, HeaderError> {
        let mut fptr = FitsFile::open(image)?;
        let hdu = fptr.primary_hdu()?;
        hdu.read_key::<T>(&mut fptr, key).map_err(|e| match e {
            FitsIoError::Fits(ref fits) if fits.status == KEY_NO_EXIST => HeaderError::NotFound {
                key: key.to_string(),
                path: image.to_path_buf(),
            },
            e => e.into(),
        })
    }
}

impl HeaderLookup for FitsHeaderReader {
    fn header_value(&self, image: &Path, key: &str) -> Result<String, HeaderError> {
        Self::read_key::<String>(image, key)
    }

    fn header_f64(&self, image: &Path, key: &str) -> Result<f64, HeaderError> {
        Self::read_key::<f64>(image, key)
    }
}

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("FITS I/O error: {0}")]
    FitsIo(#[from] FitsIoError),
    #[error("Header field {key} not found in {path:?}")]
    NotFound { key: String, path: PathBuf },
    #[error("Header field {key} has an invalid value: '{value}'")]
    InvalidValue { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_image(path: &Path) {
        let mut fptr = FitsFile::create(path).open().unwrap();
        let hdu = fptr.primary_hdu().unwrap();
        hdu.write_key(&mut fptr, "CRPIX1", 512.5).unwrap();
        hdu.write_key(&mut fptr, "CRPIX2", 384.0).unwrap();
        hdu.write_key(&mut fptr, "FILTER", "V").unwrap();
    }

    #[test]
    fn test_read_primary_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BQCam-001.fit");
        write_image(&path);

        let reader = FitsHeaderReader;
        assert_eq!(reader.header_f64(&path, "CRPIX1").unwrap(), 512.5);
        assert_eq!(reader.header_f64(&path, "CRPIX2").unwrap(), 384.0);
        assert_eq!(reader.header_value(&path, "FILTER").unwrap(), "V");
        assert!(matches!(
            reader.header_f64(&path, "AIRMASS"),
            Err(HeaderError::NotFound { .. })
        ));
        assert!(reader.header_f64(&path, "FILTER").is_err());
    }

    #[test]
    fn test_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let reader = FitsHeaderReader;
        assert!(matches!(
            reader.header_f64(&dir.path().join("none.fit"), "CRPIX1"),
            Err(HeaderError::FitsIo(_))
        ));
    }

    struct TextHeaders;

    impl HeaderLookup for TextHeaders {
        fn header_value(&self, _image: &Path, key: &str) -> Result<String, HeaderError> {
            Ok(match key {
                "CRPIX1" => " 512.5 ".to_string(),
                _ => "V".to_string(),
            })
        }
    }

    #[test]
    fn test_default_header_f64_parses_text() {
        let image = Path::new("BQCam-001.fit");
        assert_eq!(TextHeaders.header_f64(image, "CRPIX1").unwrap(), 512.5);
        assert!(matches!(
            TextHeaders.header_f64(image, "FILTER"),
            Err(HeaderError::InvalidValue { .. })
        ));
    }
}
