//! Configuration loader with layered sources.
//!
//! Grounded in the source's `arcana-config::ConfigLoader`, minus the
//! deployment-mode layer and runtime `reload()`/`get_value()` surface —
//! the control plane's six components read their config once at startup
//! and are recreated on restart rather than hot-reloaded.

use crate::AppConfig;
use config::{Config, ConfigError, Environment, File};
use milvaion_core::MilvaionError;
use std::path::Path;
use tracing::{debug, info, warn};

/// Loads and validates `AppConfig` from a layered set of sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration from `{config_dir}/default.toml` ->
    /// `{config_dir}/{environment}.toml` -> `{config_dir}/local.toml` ->
    /// `MILVAION_`-prefixed environment variables (double-underscore
    /// separated for nested keys, e.g. `MILVAION_DISPATCHER__POLL_INTERVAL_MS`).
    /// `.env` is loaded first, if present.
    pub fn load(config_dir: &str) -> Result<AppConfig, MilvaionError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("no .env file found or error loading it: {e}");
        }

        let environment =
            std::env::var("MILVAION_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        info!(environment = %environment, config_dir, "loading configuration");

        let mut builder = Config::builder();

        let default_path = format!("{config_dir}/default.toml");
        if Path::new(&default_path).exists() {
            builder = builder.add_source(File::with_name(&default_path).required(false));
        }

        let env_path = format!("{config_dir}/{environment}.toml");
        if Path::new(&env_path).exists() {
            builder = builder.add_source(File::with_name(&env_path).required(false));
        }

        let local_path = format!("{config_dir}/local.toml");
        if Path::new(&local_path).exists() {
            builder = builder.add_source(File::with_name(&local_path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("MILVAION")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_error)?;
        let app_config: AppConfig = config.try_deserialize().map_err(config_error)?;

        Self::validate(&app_config)?;
        Ok(app_config)
    }

    /// Loads from the default `./config` directory.
    pub fn load_default() -> Result<AppConfig, MilvaionError> {
        Self::load("./config")
    }

    fn validate(config: &AppConfig) -> Result<(), MilvaionError> {
        if config.database.url.is_empty() {
            return Err(MilvaionError::Configuration(
                "database.url is required (set DATABASE_URL or MILVAION_DATABASE__URL)".into(),
            ));
        }
        if config.redis.url.is_empty() {
            return Err(MilvaionError::Configuration("redis.url is required".into()));
        }
        if config.bus.url.is_empty() {
            return Err(MilvaionError::Configuration("bus.url is required".into()));
        }
        if config.app.environment == "production" && config.bus.url.contains("guest:guest") {
            warn!("using the default guest:guest AMQP credentials in production");
        }
        Ok(())
    }
}

fn config_error(err: ConfigError) -> MilvaionError {
    MilvaionError::Configuration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    /// `MILVAION_ENVIRONMENT` is process-global; serialize tests that touch
    /// it so they don't race with each other under the default parallel
    /// test runner.
    static ENV_GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn load_from_directory_applies_default_and_environment_layers() {
        let _guard = ENV_GUARD.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            "[database]\nurl = \"mysql://localhost/milvaion\"\n\
             [redis]\nurl = \"redis://localhost:6379\"\n\
             [bus]\nurl = \"amqp://localhost\"\n\
             [dispatcher]\nmax_batch_size = 50\n",
        )
        .unwrap();
        let mut env_file = std::fs::File::create(dir.path().join("test.toml")).unwrap();
        writeln!(env_file, "[dispatcher]\nmax_batch_size = 200").unwrap();

        std::env::set_var("MILVAION_ENVIRONMENT", "test");
        let config = ConfigLoader::load(dir.path().to_str().unwrap()).unwrap();
        std::env::remove_var("MILVAION_ENVIRONMENT");

        assert_eq!(config.dispatcher.max_batch_size, 200);
        assert_eq!(config.database.url, "mysql://localhost/milvaion");
    }

    #[test]
    fn missing_database_url_fails_validation() {
        let _guard = ENV_GUARD.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            "[redis]\nurl = \"redis://localhost:6379\"\n[bus]\nurl = \"amqp://localhost\"\n",
        )
        .unwrap();

        let result = ConfigLoader::load(dir.path().to_str().unwrap());
        assert!(result.is_err());
    }
}
