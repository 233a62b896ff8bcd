//! Config file discovery, loading, and overlay.
//!
//! Files are merged in load order (system, user, local, CLI override);
//! later files win key-by-key. Missing files are skipped silently.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub db_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = directories::BaseDirs::new()
            .map(|d| d.data_dir().join("riffbank"))
            .unwrap_or_else(|| PathBuf::from(".riffbank"));
        Self {
            db_path: base.join("corpus.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub grid_steps_per_bar: u8,
    pub chord_windows_per_bar: u8,
    /// Velocity-bucketed rhythm fingerprints; incompatible with binary
    /// fingerprints, so flip only on a fresh corpus.
    pub weighted_rhythm_fp: bool,
    pub workers: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            grid_steps_per_bar: 16,
            chord_windows_per_bar: 2,
            weighted_rhythm_fp: false,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub enable_lookup: bool,
    pub timeout_secs: u64,
    pub attempts: u32,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enable_lookup: false,
            timeout_secs: 10,
            attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RiffbankConfig {
    pub paths: PathsConfig,
    pub analysis: AnalysisConfig,
    pub metadata: MetadataConfig,
}

/// Discover config files in standard locations, in load order.
pub fn discover_config_files(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/riffbank/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf())
    {
        let user = config_dir.join("riffbank/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("riffbank.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load and merge all discovered config files.
pub fn load(cli_path: Option<&Path>) -> Result<RiffbankConfig> {
    let files = discover_config_files(cli_path);
    let mut merged = toml::Table::new();

    for path in &files {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let table: toml::Table = contents
            .parse()
            .with_context(|| format!("parsing config {}", path.display()))?;
        merge_tables(&mut merged, table);
    }

    let config: RiffbankConfig = toml::Value::Table(merged)
        .try_into()
        .context("deserializing merged config")?;
    Ok(config)
}

/// Recursive key-wise merge; values from `overlay` win.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_sub)), toml::Value::Table(overlay_sub)) => {
                merge_tables(base_sub, overlay_sub);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RiffbankConfig::default();
        assert_eq!(config.analysis.grid_steps_per_bar, 16);
        assert_eq!(config.analysis.chord_windows_per_bar, 2);
        assert!(!config.analysis.weighted_rhythm_fp);
        assert_eq!(config.metadata.timeout_secs, 10);
        assert_eq!(config.metadata.attempts, 3);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let table: toml::Table = "[analysis]\nworkers = 8\n".parse().unwrap();
        let config: RiffbankConfig = toml::Value::Table(table).try_into().unwrap();
        assert_eq!(config.analysis.workers, 8);
        assert_eq!(config.analysis.grid_steps_per_bar, 16);
    }

    #[test]
    fn overlay_wins_key_by_key() {
        let mut base: toml::Table = "[analysis]\nworkers = 2\ngrid_steps_per_bar = 8\n"
            .parse()
            .unwrap();
        let overlay: toml::Table = "[analysis]\nworkers = 16\n".parse().unwrap();
        merge_tables(&mut base, overlay);

        let config: RiffbankConfig = toml::Value::Table(base).try_into().unwrap();
        assert_eq!(config.analysis.workers, 16);
        assert_eq!(config.analysis.grid_steps_per_bar, 8);
    }
}
