use config::{Config, ConfigError, Environment, File};
use log::debug;
use serde::Deserialize;

const DEFAULT_STATS_INTERVAL_SECONDS: u64 = 10;

/// Optional YAML file read before the environment overrides.
pub const CONFIG_FILE_ENV: &str = "LOCKWATCH_CONFIG";

/// Where uprobes go and which host-side helpers run.
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct ProbeSettings {
    /// Explicit libc/libpthread images. Skips discovery when set.
    pub library_paths: Option<Vec<String>>,
    pub discover: Option<bool>,
    pub exec_watch: Option<bool>,
    pub stats_interval: Option<u64>,
}

/// Namespace filter input. Ids are comma separated lists.
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct FilterSettings {
    pub allow_mntns: Option<String>,
    pub deny_mntns: Option<String>,
    pub allow_pids: Option<String>,
    pub deny_pids: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct OutputSettings {
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub filter: FilterSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(File::with_name(&path).required(true));
        }

        // Only library_paths is split on ","; filter lists stay strings so a
        // single id is not turned into an integer scalar.
        let s = builder
            .add_source(
                Environment::default()
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("probe.library_paths")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn discover(&self) -> bool {
        self.probe.discover.unwrap_or(true)
    }

    pub fn exec_watch(&self) -> bool {
        self.probe.exec_watch.unwrap_or(true)
    }

    pub fn stats_interval_secs(&self) -> u64 {
        match self.probe.stats_interval {
            Some(0) | None => DEFAULT_STATS_INTERVAL_SECONDS,
            Some(secs) => secs,
        }
    }

    pub fn output_format(&self) -> OutputFormat {
        self.output.format.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const KEYS: [&str; 6] = [
        "PROBE__DISCOVER",
        "PROBE__STATS_INTERVAL",
        "PROBE__LIBRARY_PATHS",
        "FILTER__DENY_MNTNS",
        "OUTPUT__FORMAT",
        CONFIG_FILE_ENV,
    ];

    fn clear_env() {
        for key in KEYS {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    #[serial]
    fn test_load_settings() {
        clear_env();
        unsafe {
            std::env::set_var("PROBE__DISCOVER", "false");
            std::env::set_var("PROBE__STATS_INTERVAL", "42");
            std::env::set_var("PROBE__LIBRARY_PATHS", "/lib/libc.so.6,/lib64/libc.so.6");
            std::env::set_var("FILTER__DENY_MNTNS", "4026531840");
            std::env::set_var("OUTPUT__FORMAT", "json");
        }

        let settings = Settings::new().expect("Failed to load settings");

        assert!(!settings.discover());
        assert_eq!(settings.stats_interval_secs(), 42);
        assert_eq!(
            settings.probe.library_paths,
            Some(vec![
                "/lib/libc.so.6".to_string(),
                "/lib64/libc.so.6".to_string()
            ])
        );
        assert_eq!(settings.filter.deny_mntns.as_deref(), Some("4026531840"));
        assert_eq!(settings.output_format(), OutputFormat::Json);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        clear_env();

        let settings = Settings::new().expect("Failed to load settings");

        assert!(settings.discover());
        assert!(settings.exec_watch());
        assert_eq!(settings.stats_interval_secs(), DEFAULT_STATS_INTERVAL_SECONDS);
        assert_eq!(settings.output_format(), OutputFormat::Text);
        assert!(settings.filter.allow_mntns.is_none());
    }

    #[test]
    #[serial]
    fn test_env_overrides_config_file() {
        clear_env();
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("tempfile");
        writeln!(file, "probe:\n  exec_watch: false\n  stats_interval: 5\noutput:\n  format: json")
            .expect("write config");

        unsafe {
            std::env::set_var(CONFIG_FILE_ENV, file.path());
            std::env::set_var("PROBE__STATS_INTERVAL", "7");
        }

        let settings = Settings::new().expect("Failed to load settings");
        assert!(!settings.exec_watch());
        assert_eq!(settings.stats_interval_secs(), 7);
        assert_eq!(settings.output_format(), OutputFormat::Json);

        clear_env();
    }
}
