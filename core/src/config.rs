use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_dir: String,
    pub wal_flush_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .add_source(File::with_name("config/default"))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("EPIGRAPH"));

        builder.build()?.try_deserialize()
    }
}

/// Named environment variables the ambient stack reads directly, outside
/// the layered `config/*.toml` surface above: credentials, model pins,
/// and feature toggles a deployment sets without touching checked-in
/// files.
#[derive(Debug, Clone)]
pub struct EnvSettings {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_api_base_url: Option<String>,
    pub jina_api_key: Option<String>,
    pub model_id_graph_extraction: String,
    pub helicone_api_key: Option<String>,
    pub run_migrations: bool,
    pub debug_logs: bool,
    pub dream_probability: f64,
    pub dream_selection_probability: f64,
    pub minio_endpoint: Option<String>,
    pub minio_access_key: Option<String>,
    pub minio_secret_key: Option<String>,
    pub sources_bucket: String,
}

impl EnvSettings {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").ok(),
            redis_url: env::var("REDIS_URL").ok(),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            openai_api_base_url: env::var("OPENAI_API_BASE_URL").ok(),
            jina_api_key: env::var("JINA_API_KEY").ok(),
            model_id_graph_extraction: env::var("MODEL_ID_GRAPH_EXTRACTION")
                .unwrap_or_else(|_| "triplex-lite".to_string()),
            helicone_api_key: env::var("HELICONE_API_KEY").ok(),
            run_migrations: parse_bool_env("RUN_MIGRATIONS", false),
            debug_logs: parse_bool_env("DEBUG_LOGS", false),
            dream_probability: parse_f64_env("DREAM_PROBABILITY", 0.0),
            dream_selection_probability: parse_f64_env("DREAM_SELECTION_PROBABILITY", 0.0),
            minio_endpoint: env::var("MINIO_ENDPOINT").ok(),
            minio_access_key: env::var("MINIO_ACCESS_KEY").ok(),
            minio_secret_key: env::var("MINIO_SECRET_KEY").ok(),
            sources_bucket: env::var("SOURCES_BUCKET").unwrap_or_else(|_| "sources".to_string()),
        }
    }
}

fn parse_bool_env(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(default)
}

fn parse_f64_env(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_settings_fall_back_to_defaults_when_unset() {
        env::remove_var("RUN_MIGRATIONS");
        env::remove_var("SOURCES_BUCKET");
        let settings = EnvSettings::from_env();
        assert!(!settings.run_migrations);
        assert_eq!(settings.sources_bucket, "sources");
    }

    #[test]
    fn dream_probability_parses_from_env() {
        env::set_var("DREAM_PROBABILITY", "0.25");
        let settings = EnvSettings::from_env();
        assert_eq!(settings.dream_probability, 0.25);
        env::remove_var("DREAM_PROBABILITY");
    }
}
