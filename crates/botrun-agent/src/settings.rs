use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use botrun_config::StaticWorldCatalog;

const DEFAULT_DATA_ROOT: &str = "./botrun-data";
const DEFAULT_SETTLE_MS: u64 = 1000;
const STORE_FILE: &str = "configurations.bin";

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_flag(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn settle_delay(ms: Option<u64>) -> Duration {
    Duration::from_millis(ms.map(|v| v.min(60_000)).unwrap_or(DEFAULT_SETTLE_MS))
}

/// Agent settings, read from `BOTRUN_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_root: PathBuf,
    pub logs_dir: PathBuf,
    /// Runtime used to start the client.
    pub java: String,
    pub client_jar: PathBuf,
    /// Process name whose instances are diffed to find the client's pid.
    pub runtime_name: String,
    /// Pause after killing a client before the next script starts.
    pub settle_delay: Duration,
    /// Draw one world per run instead of one per script.
    pub shared_world: bool,
    pub worlds: String,
}

impl Settings {
    pub fn from_env() -> Self {
        let data_root = env_string("BOTRUN_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT));
        Self::with_root(&data_root)
    }

    fn with_root(data_root: &Path) -> Self {
        Self {
            data_root: data_root.to_path_buf(),
            logs_dir: env_string("BOTRUN_LOGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_root.join("logs")),
            java: env_string("BOTRUN_JAVA").unwrap_or_else(|| "java".to_string()),
            client_jar: env_string("BOTRUN_CLIENT_JAR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_root.join("client").join("client.jar")),
            runtime_name: env_string("BOTRUN_RUNTIME_NAME").unwrap_or_else(|| "java".to_string()),
            settle_delay: settle_delay(env_u64("BOTRUN_SETTLE_MS")),
            shared_world: env_string("BOTRUN_SHARED_WORLD").is_some_and(|v| parse_flag(&v)),
            worlds: env_string("BOTRUN_WORLDS").unwrap_or_default(),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_root.join(STORE_FILE)
    }

    pub fn world_catalog(&self) -> anyhow::Result<StaticWorldCatalog> {
        StaticWorldCatalog::parse(&self.worlds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_spellings() {
        for v in ["1", "true", "YES", " on "] {
            assert!(parse_flag(v), "{v}");
        }
        for v in ["0", "false", "", "nope"] {
            assert!(!parse_flag(v), "{v}");
        }
    }

    #[test]
    fn settle_delay_defaults_and_clamps() {
        assert_eq!(settle_delay(None), Duration::from_secs(1));
        assert_eq!(settle_delay(Some(0)), Duration::ZERO);
        assert_eq!(settle_delay(Some(600_000)), Duration::from_secs(60));
    }

    #[test]
    fn paths_derive_from_data_root() {
        let s = Settings::with_root(Path::new("/srv/botrun"));
        assert_eq!(s.store_path(), Path::new("/srv/botrun/configurations.bin"));
        if std::env::var_os("BOTRUN_CLIENT_JAR").is_none() {
            assert_eq!(s.client_jar, Path::new("/srv/botrun/client/client.jar"));
        }
    }
}
