use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/mlpd/profilerd.toml";
const ENV_CONFIG_PATH: &str = "MLPD_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub heap_shot: HeapShotConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `MLPD_CONFIG` environment variable. If the file is missing or fails
    /// to parse, defaults are returned rather than aborting the host.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|err| {
                log::warn!("failed to parse config at {}: {err}, using defaults", path.display());
                Config::default()
            }),
            Err(_) => Config::default(),
        }
    }
}

/// Output sink selection: exactly one of plain file, named pipe, or a
/// gzip-wrapped file, matching the writer's three §2b sink backends.
#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    #[serde(default = "default_sink_path")]
    pub path: String,
    #[serde(default)]
    pub use_pipe: bool,
    #[serde(default)]
    pub use_gzip: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            path: default_sink_path(),
            use_pipe: false,
            use_gzip: false,
        }
    }
}

fn default_sink_path() -> String {
    "/var/log/mlpd/trace.mlpd".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: u32,
    #[serde(default = "default_arena_page_size")]
    pub arena_page_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_call_depth: default_max_call_depth(),
            arena_page_size: default_arena_page_size(),
        }
    }
}

fn default_max_call_depth() -> u32 {
    // Matches the original profiler's conservative default; deep recursion
    // beyond this depth is gated per the enter/leave depth-limit policy.
    64
}

fn default_arena_page_size() -> usize {
    64 * 1024
}

/// Heap-shot trigger mode, §4.I.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HeapShotConfig {
    None,
    Gc,
    Ms { interval_ms: u64 },
    Ondemand,
}

impl Default for HeapShotConfig {
    fn default() -> Self {
        HeapShotConfig::Gc
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SamplingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sample_interval_us")]
    pub interval_us: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_us: default_sample_interval_us(),
        }
    }
}

fn default_sample_interval_us() -> u64 {
    1_000
}

/// Optional loopback control channel the helper thread polls (§5).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ControlConfig {
    #[serde(default)]
    pub command_port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"
[sink]
path = "/tmp/out.mlpd"
use_gzip = true

[runtime]
max_call_depth = 32

[heap_shot]
mode = "ms"
interval_ms = 500

[sampling]
enabled = true
interval_us = 200

[control]
command_port = 9000
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.sink.path, "/tmp/out.mlpd");
        assert!(cfg.sink.use_gzip);
        assert_eq!(cfg.runtime.max_call_depth, 32);
        assert_eq!(cfg.heap_shot, HeapShotConfig::Ms { interval_ms: 500 });
        assert!(cfg.sampling.enabled);
        assert_eq!(cfg.sampling.interval_us, 200);
        assert_eq!(cfg.control.command_port, Some(9000));
    }

    #[test]
    fn malformed_toml_falls_back_to_defaults_without_panicking() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "this is not valid toml {{{{").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load();
        assert_eq!(cfg.sink.path, default_sink_path());
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }

    #[test]
    fn env_override_points_load_at_a_specific_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[runtime]\nmax_call_depth = 8").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load();
        assert_eq!(cfg.runtime.max_call_depth, 8);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }

    #[test]
    fn missing_file_uses_defaults() {
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, "/nonexistent/path/profilerd.toml");
        }
        let cfg = Config::load();
        assert_eq!(cfg.runtime.max_call_depth, default_max_call_depth());
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}
