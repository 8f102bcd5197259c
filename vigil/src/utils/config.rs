use config::{ConfigError, Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use std::{ffi::OsStr, path::Path};

/// Prefix of environment variables that override file values, e.g.
/// `VIGIL__ANALYSIS__INTERVAL_SECS=5`.
pub const ENV_PREFIX: &str = "VIGIL";

/// Read a YAML config file into `T`, letting `VIGIL__*` environment
/// variables override individual keys. Nested keys are separated by `__`.
///
/// * `filepath`: path to the YAML file.
pub fn from_yaml_file<T, F>(filepath: F) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
    F: AsRef<OsStr>,
{
    let file = Path::new(&filepath);
    if !file.is_file() {
        return Err(ConfigError::NotFound(file.display().to_string()));
    }

    config::Config::builder()
        .add_source(File::new(&file.to_string_lossy(), FileFormat::Yaml))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serial_test::serial;
    use std::io::Write;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Sample {
        name: String,
        period_ms: u64,
    }

    fn sample_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("temp file");
        writeln!(file, "name: front door\nperiod_ms: 250").expect("write");
        file
    }

    #[test]
    #[serial]
    fn test_read_yaml_file() {
        let file = sample_file();
        let sample: Sample = from_yaml_file(file.path()).expect("read");
        assert_eq!(
            sample,
            Sample {
                name: "front door".to_string(),
                period_ms: 250
            }
        );
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let file = sample_file();
        std::env::set_var("VIGIL__PERIOD_MS", "1000");
        let sample: Result<Sample, _> = from_yaml_file(file.path());
        std::env::remove_var("VIGIL__PERIOD_MS");
        assert_eq!(sample.expect("read").period_ms, 1000);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let result: Result<Sample, _> = from_yaml_file("/definitely/not/here.yaml");
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
