//! Registration through an external astrometry program
//!
//! Any program able to write the `.rdls.txt` / `.xyls.txt` tables next to the
//! image can be used, e.g. astrometry.net's `solve-field` followed by table
//! conversion in a wrapper script. The command template may use the
//! `{image}`, `{dir}` and `{stem}` placeholders.
//!
//! Tables already present are reused and the program is not run again.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use super::common::{RegisteredField, Registration, RegistrationError};
use super::tool::ToolCommand;

/// Registration wrapper around an external command
#[derive(Debug, Clone)]
pub struct ToolRegistration {
    command: Option<ToolCommand>,
    timeout: Duration,
}

impl ToolRegistration {
    /// Without a command only tables written beforehand can be used.
    pub fn new(command: Option<ToolCommand>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl Registration for ToolRegistration {
    type E = RegistrationError;

    fn register(&self, img: &Path) -> Result<RegisteredField, Self::E> {
        if RegisteredField::tables_exist(img) {
            debug!("Reusing registration tables of {img:?}");
            return RegisteredField::read(img);
        }

        let Some(command) = &self.command else {
            return Err(RegistrationError::NoOutput(img.to_path_buf()));
        };

        let dir = img.parent().unwrap_or_else(|| Path::new("."));
        let stem = img
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let vars = HashMap::from([
            ("image", img.to_string_lossy().into_owned()),
            ("dir", dir.to_string_lossy().into_owned()),
            ("stem", stem),
        ]);

        info!("Registering {img:?}");
        command.run(&vars, Some(dir), self.timeout)?;

        if !RegisteredField::tables_exist(img) {
            return Err(RegistrationError::NoOutput(img.to_path_buf()));
        }
        RegisteredField::read(img)
    }
}
