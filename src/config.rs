use crate::settings::RuntimeSettings;
use config::{Config, ConfigError, File as ConfigFile};
use serde::Deserialize;
use std::path::Path;

fn default_store_path() -> String {
    "packrat.db".to_string()
}

fn default_crawl_workers() -> usize {
    2
}

fn default_archive_extensions() -> Vec<String> {
    vec!["zip".to_string()]
}

fn default_idle_cpu_percent() -> f32 {
    20.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub root_paths: Vec<String>,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default = "default_crawl_workers")]
    pub crawl_workers: usize,
    #[serde(default = "default_archive_extensions")]
    pub archive_extensions: Vec<String>,
    /// The host counts as idle while total CPU usage stays below this.
    #[serde(default = "default_idle_cpu_percent")]
    pub idle_cpu_percent: f32,
}

impl AppConfig {
    pub fn to_settings(&self) -> RuntimeSettings {
        let settings = RuntimeSettings::new(self.crawl_workers, self.store_path.clone());
        for extension in &self.archive_extensions {
            settings.set_archive_extension(extension.clone(), true);
        }
        settings
    }
}

pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Config").required(false))
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

/// Remove directories that are subdirectories of other directories in the
/// list; overlapping roots would leave the same rows contested between two
/// root subtrees.
pub fn non_overlapping_directories(dirs: Vec<String>) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    for dir in dirs {
        let dir_path = Path::new(&dir);
        if result
            .iter()
            .any(|kept| dir_path.starts_with(Path::new(kept)))
        {
            continue;
        }
        result.retain(|kept| !Path::new(kept).starts_with(dir_path));
        result.push(dir);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_overlapping_keeps_disjoint_directories() {
        let dirs = vec![
            "/home/user/photos".to_string(),
            "/home/user/docs".to_string(),
            "/var/data".to_string(),
        ];
        let result = non_overlapping_directories(dirs);
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn non_overlapping_drops_subdirectories_in_either_order() {
        let result = non_overlapping_directories(vec![
            "/home/user".to_string(),
            "/home/user/docs".to_string(),
        ]);
        assert_eq!(result, vec!["/home/user".to_string()]);

        let result = non_overlapping_directories(vec![
            "/home/user/docs".to_string(),
            "/home/user".to_string(),
        ]);
        assert_eq!(result, vec!["/home/user".to_string()]);
    }

    #[test]
    fn settings_are_seeded_from_config() {
        let config = AppConfig {
            root_paths: vec!["/data".to_string()],
            ignore_patterns: vec![],
            store_path: "x.db".to_string(),
            crawl_workers: 5,
            archive_extensions: vec!["zip".to_string(), "JAR".to_string()],
            idle_cpu_percent: 20.0,
        };
        let settings = config.to_settings();
        assert_eq!(settings.worker_ceiling(), 5);
        assert!(settings.archive_enabled("zip"));
        assert!(settings.archive_enabled("jar"));
        assert_eq!(settings.store_path(), "x.db");
    }
}
