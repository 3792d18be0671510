use chrono_tz::Tz;
use serde::Deserialize;
use std::env;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
    Io(std::io::Error),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
            ConfigError::Io(e) => write!(f, "Config IO error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub db_path: String,
    /// Presentation/bucketing zone. Always an explicit IANA zone, never the
    /// ambient system zone: bucket truncation is DST-sensitive.
    pub zone: Tz,
    pub rust_log: String,
    /// Optional JSON file mapping metric ids to human-readable labels.
    pub labels_path: Option<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = env::var("METERGRID_DB").unwrap_or_else(|_| "metergrid.db".to_string());

        let zone_str = env::var("METERGRID_TZ").unwrap_or_else(|_| "America/New_York".to_string());
        let zone: Tz = match zone_str.parse() {
            Ok(tz) => tz,
            Err(_) => {
                return Err(ConfigError::InvalidValue(format!(
                    "METERGRID_TZ is not a valid IANA zone: {}",
                    zone_str
                )));
            }
        };

        let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let labels_path = env::var("METERGRID_LABELS").ok();

        Ok(Self {
            db_path,
            zone,
            rust_log,
            labels_path,
        })
    }
}

/// One entry of the poll source list (the JSON side file handed to the
/// scheduler, one object per meter).
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source: String,
    pub interval_secs: u64,
    /// Metric names pushed to live subscribers; everything when absent.
    #[serde(default)]
    pub desired: Option<Vec<String>>,
}

/// Load the poll source list from a JSON file.
pub fn load_sources(path: impl AsRef<Path>) -> Result<Vec<SourceConfig>, ConfigError> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    let sources: Vec<SourceConfig> = serde_json::from_str(&raw)
        .map_err(|e| ConfigError::InvalidValue(format!("bad source list: {}", e)))?;

    for cfg in &sources {
        if cfg.source.is_empty() {
            return Err(ConfigError::InvalidValue(
                "source name cannot be empty".to_string(),
            ));
        }
        if cfg.interval_secs == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "interval_secs must be positive for {}",
                cfg.source
            )));
        }
    }

    Ok(sources)
}

/// Load the optional metric-id → label dictionary.
pub fn load_labels(path: &str) -> std::collections::HashMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(e) => {
                log::warn!("Ignoring malformed label file {}: {}", path, e);
                Default::default()
            }
        },
        Err(e) => {
            log::warn!("Could not read label file {}: {}", path, e);
            Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_sources() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"source": "x-pml:/diagrams/ud/main.dgm", "interval_secs": 60,
                 "desired": ["Total KW"]}},
                {{"source": "boiler", "interval_secs": 300}}]"#
        )
        .unwrap();

        let sources = load_sources(file.path()).unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].interval_secs, 60);
        assert_eq!(
            sources[0].desired.as_deref(),
            Some(&["Total KW".to_string()][..])
        );
        assert!(sources[1].desired.is_none());
    }

    #[test]
    fn test_load_sources_rejects_zero_interval() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"source": "m", "interval_secs": 0}}]"#).unwrap();
        assert!(load_sources(file.path()).is_err());
    }
}
