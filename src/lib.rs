//! Photometric calibration of CCD images in rust
//!
//! Images are registered and their star fields matched against a list of
//! stars, measured by an external photometry program, and the measurements
//! are corrected for atmospheric extinction and transformed to standard
//! magnitudes using the standard stars observed each night.

pub mod calibration;
pub mod common;
pub mod config;
pub mod curves;
pub mod extinction;
pub mod fits;
pub mod instmag;
pub mod magnitude;
pub mod matcher;
pub mod math;
pub mod pipeline;
pub mod solver;
pub mod starcat;
pub mod stars;
