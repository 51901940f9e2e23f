use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Prefix of environment overrides, e.g. `PRESSLINE_WORKER__LEASE_SECS=900`.
pub const ENV_PREFIX: &str = "PRESSLINE_";

/// Load configuration from file with environment variable overrides
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let config: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    Ok(config)
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_from_str_valid() {
        let toml = r#"
[worker]
lease_secs = 120
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.worker.lease_secs, 120);
        assert_eq!(config.worker.heartbeat_interval_secs, 60);
    }

    #[test]
    fn test_load_config_from_str_bad_type() {
        let toml = r#"
[pipeline]
max_attempts = "three"
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/pressline.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[storage]
root = "/srv/pressline"

[reaper]
interval_secs = 60
"#
        )
        .unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.storage.root.to_str().unwrap(), "/srv/pressline");
        assert_eq!(config.reaper.interval_secs, 60);
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "pressline.toml",
                r#"
[render]
idle_threshold_secs = 300
"#,
            )?;
            jail.set_env("PRESSLINE_RENDER__IDLE_THRESHOLD_SECS", "45");

            let config = load_config(Path::new("pressline.toml")).map_err(|e| e.to_string())?;
            assert_eq!(config.render.idle_threshold_secs, 45.0);
            Ok(())
        });
    }
}
