//! armada.toml: the director's own configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectorConfig {
    #[serde(default)]
    pub director: DirectorSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tasks: TasksSection,
    #[serde(default)]
    pub compilation: CompilationSection,
    #[serde(default)]
    pub locks: LocksSection,
    #[serde(default)]
    pub cleanup: CleanupSection,
    /// VM env defaults; the manifest's `env` is merged over these.
    #[serde(default)]
    pub env: toml::Table,
    #[serde(default)]
    pub cpis: Vec<CpiSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectorSection {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TasksSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocksSection {
    #[serde(default = "default_lock_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CleanupSection {
    #[serde(default)]
    pub keep_orphaned_disks: usize,
    #[serde(default = "default_keep_configs")]
    pub keep_config_versions: usize,
}

/// A CPI known at boot. Runtime CPI configs uploaded through the config
/// API take precedence once present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpiSection {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: toml::Table,
}

fn default_name() -> String {
    "armada".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/armada")
}
fn default_port() -> u16 {
    25555
}
fn default_max_concurrent() -> usize {
    4
}
fn default_workers() -> usize {
    4
}
fn default_lock_timeout() -> u64 {
    60
}
fn default_keep_configs() -> usize {
    3
}

impl Default for DirectorSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl Default for CompilationSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

impl Default for LocksSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_lock_timeout(),
        }
    }
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            director: DirectorSection::default(),
            server: ServerSection::default(),
            tasks: TasksSection::default(),
            compilation: CompilationSection::default(),
            locks: LocksSection::default(),
            cleanup: CleanupSection {
                keep_orphaned_disks: 0,
                keep_config_versions: default_keep_configs(),
            },
            env: toml::Table::new(),
            cpis: vec![CpiSection {
                name: "default".to_string(),
                kind: "dummy".to_string(),
                properties: toml::Table::new(),
            }],
        }
    }
}

impl DirectorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: DirectorConfig = toml::from_str(content)?;
        if config.tasks.max_concurrent == 0 {
            anyhow::bail!("tasks.max_concurrent must be at least 1");
        }
        if config.compilation.workers == 0 {
            anyhow::bail!("compilation.workers must be at least 1");
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The `[env]` table as JSON, ready to merge with manifest env blocks.
    pub fn env_json(&self) -> Value {
        serde_json::to_value(&self.env).unwrap_or(Value::Object(Default::default()))
    }

    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.locks.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = DirectorConfig::from_toml("").unwrap();
        assert_eq!(config.director.name, "armada");
        assert_eq!(config.server.port, 25555);
        assert_eq!(config.cleanup.keep_config_versions, 3);
        assert!(config.cpis.is_empty());
    }

    #[test]
    fn parses_full_file() {
        let config = DirectorConfig::from_toml(
            r#"
            [director]
            name = "prod-director"
            data_dir = "/tmp/armada"

            [tasks]
            max_concurrent = 2

            [compilation]
            workers = 8

            [env]
            bosh = { password = "*" }

            [[cpis]]
            name = "z1-cpi"
            type = "dummy"
            "#,
        )
        .unwrap();
        assert_eq!(config.director.name, "prod-director");
        assert_eq!(config.tasks.max_concurrent, 2);
        assert_eq!(config.compilation.workers, 8);
        assert_eq!(config.cpis[0].name, "z1-cpi");
        assert_eq!(config.env_json()["bosh"]["password"], "*");
    }

    #[test]
    fn rejects_zero_workers() {
        assert!(DirectorConfig::from_toml("[compilation]\nworkers = 0").is_err());
    }

    #[test]
    fn default_round_trips_through_toml() {
        let config = DirectorConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(DirectorConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("armada.toml");
        std::fs::write(&path, "[server]\nport = 8080\n").unwrap();
        assert_eq!(DirectorConfig::from_file(&path).unwrap().server.port, 8080);
    }
}
