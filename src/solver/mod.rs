//! Image registration and the external programs behind it

pub mod common;
pub mod external;
pub mod tool;

pub use common::{RegisteredField, Registration, RegistrationError};
pub use external::ToolRegistration;
pub use tool::{ToolCommand, ToolError};
