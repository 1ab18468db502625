//! Configuration surface consumed by the pull engine

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

fn default_scan_interval() -> u32 {
    60
}

fn default_keep_temporaries() -> u32 {
    24
}

/// One locally mirrored folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderConfig {
    pub id: String,
    pub path: PathBuf,
    /// Seconds between rescans; zero disables periodic rescanning.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_sec: u32,
    /// Do not sync permission bits; created entries get default modes.
    #[serde(default)]
    pub ignore_perms: bool,
    /// Tolerate failures to set modification times instead of failing
    /// the affected file.
    #[serde(default)]
    pub lenient_mtimes: bool,
    /// Non-empty when the folder has been taken out of service; holds
    /// the reason.
    #[serde(default)]
    pub invalid: String,
}

impl FolderConfig {
    pub fn is_invalid(&self) -> bool {
        !self.invalid.is_empty()
    }
}

/// Process-wide tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Hours an orphaned temporary survives before the sweep unlinks it.
    #[serde(default = "default_keep_temporaries")]
    pub keep_temporaries_h: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            keep_temporaries_h: default_keep_temporaries(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub folders: Vec<FolderConfig>,
    #[serde(default)]
    pub options: Options,
}

impl Config {
    pub fn folder(&self, id: &str) -> Option<&FolderConfig> {
        self.folders.iter().find(|f| f.id == id)
    }

    /// Filesystem root of the given folder, if configured.
    pub fn folder_path(&self, id: &str) -> Option<PathBuf> {
        self.folder(id).map(|f| f.path.clone())
    }

    pub fn load(path: &Path) -> Result<Config> {
        let file = File::open(path)
            .with_context(|| format!("open config {}", path.display()))?;
        let cfg = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("write config {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let cfg = Config {
            folders: vec![FolderConfig {
                id: "music".into(),
                path: "/srv/music".into(),
                scan_interval_sec: 30,
                ignore_perms: true,
                lenient_mtimes: false,
                invalid: String::new(),
            }],
            options: Options {
                keep_temporaries_h: 6,
            },
        };
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.folders.len(), 1);
        assert_eq!(loaded.folders[0].id, "music");
        assert!(loaded.folders[0].ignore_perms);
        assert_eq!(loaded.options.keep_temporaries_h, 6);
    }

    #[test]
    fn test_defaults_fill_in() {
        let cfg: Config =
            serde_json::from_str(r#"{"folders": [{"id": "a", "path": "/tmp/a"}]}"#).unwrap();
        assert_eq!(cfg.folders[0].scan_interval_sec, 60);
        assert!(!cfg.folders[0].is_invalid());
        assert_eq!(cfg.options.keep_temporaries_h, 24);
    }

    #[test]
    fn test_folder_lookup() {
        let cfg: Config =
            serde_json::from_str(r#"{"folders": [{"id": "a", "path": "/tmp/a"}]}"#).unwrap();
        assert!(cfg.folder("a").is_some());
        assert!(cfg.folder("b").is_none());
        assert_eq!(cfg.folder_path("a").unwrap(), PathBuf::from("/tmp/a"));
    }
}
