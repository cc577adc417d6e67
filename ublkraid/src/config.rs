use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/ublkraid/ublkraid.toml";
const ENV_CONFIG_PATH: &str = "UBLKRAID_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub raid1: Raid1Config,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `UBLKRAID_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    #[serde(default = "default_max_io_size")]
    pub max_io_size: u32,
    #[serde(default = "default_nr_hw_queues")]
    pub nr_hw_queues: u16,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: u16,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            max_io_size: default_max_io_size(),
            nr_hw_queues: default_nr_hw_queues(),
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_max_io_size() -> u32 {
    crate::DEF_BUF_SIZE
}
fn default_nr_hw_queues() -> u16 {
    1
}
fn default_queue_depth() -> u16 {
    128
}

#[derive(Debug, Deserialize, Clone)]
pub struct Raid1Config {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    /// Resync prioritization level (0-32); higher copies more extents
    /// between yields to guest I/O.
    #[serde(default = "default_resync_level")]
    pub resync_level: u32,
    #[serde(default = "default_read_from_dirty")]
    pub read_from_dirty: bool,
}

impl Default for Raid1Config {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            resync_level: default_resync_level(),
            read_from_dirty: default_read_from_dirty(),
        }
    }
}

fn default_chunk_size() -> u32 {
    32768
}
fn default_resync_level() -> u32 {
    4
}
fn default_read_from_dirty() -> bool {
    true
}
