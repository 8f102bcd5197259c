/// Reading YAML configuration files with environment overrides.
pub mod config;
/// JPEG encoding helpers for frames leaving the camera.
pub mod image;
/// Macros for locating test resources.
pub mod tests;
/// Serde helpers for the timestamp formats used on the wire.
pub mod time;
