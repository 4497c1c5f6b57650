//! Ambient configuration: env/dotenv-driven, following the teacher's
//! `get_str`/`get_bool`/`get_i64` helper pattern.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;

/// Runtime configuration, loaded via [`Config::from_env`].
#[derive(Debug, Clone)]
pub struct Config {
    /// `<storagePath>/plan-<id>.json`, `plans-index.json`, and `logs/` live here.
    pub storage_path: PathBuf,
    /// Used when a `PlanSpec` omits `repoPath`.
    pub default_repo_path: Option<PathBuf>,
    /// Global cap across all plans (default 8).
    pub max_parallel: u32,
    /// Pump tick interval (default 1000ms).
    pub pump_interval_ms: u64,
    /// `{"ours","theirs"}`, used by merge-fi/merge-ri delegate prompts.
    pub merge_prefer: String,
    /// Whether merge-ri pushes the target branch after a successful merge.
    pub merge_push_on_success: bool,
    /// `tracing_subscriber::EnvFilter` string.
    pub log_filter: String,
    /// Overrides the per-plan default of `<repoPath>/.worktrees/<planId>`.
    pub worktree_root: Option<PathBuf>,
    /// Consecutive pump-tick errors tolerated before the runner logs at
    /// error level and keeps going (the pump never aborts the process).
    pub max_consecutive_tick_errors: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./.dagforge"),
            default_repo_path: None,
            max_parallel: default_max_parallel(),
            pump_interval_ms: default_pump_interval_ms(),
            merge_prefer: default_merge_prefer(),
            merge_push_on_success: false,
            log_filter: default_log_filter(),
            worktree_root: None,
            max_consecutive_tick_errors: 5,
        }
    }
}

fn default_max_parallel() -> u32 {
    8
}

fn default_pump_interval_ms() -> u64 {
    1000
}

fn default_merge_prefer() -> String {
    "theirs".to_string()
}

fn default_log_filter() -> String {
    "dagforge_core=info,dagforge_agent=info".to_string()
}

fn parse_dotenv(path: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv(".env");

        let storage_path = PathBuf::from(get_str("DAGFORGE_STORAGE_PATH", &dotenv, "./.dagforge"));
        let default_repo_path = get("DAGFORGE_DEFAULT_REPO_PATH", &dotenv).map(PathBuf::from);
        let worktree_root = get("DAGFORGE_WORKTREE_ROOT", &dotenv).map(PathBuf::from);

        let merge_prefer = get_str("DAGFORGE_MERGE_PREFER", &dotenv, &default_merge_prefer());
        let merge_prefer = match merge_prefer.as_str() {
            "ours" => "ours".to_string(),
            _ => "theirs".to_string(),
        };

        Ok(Config {
            storage_path,
            default_repo_path,
            max_parallel: get_u32("DAGFORGE_MAX_PARALLEL", &dotenv, default_max_parallel()),
            pump_interval_ms: get_u64("DAGFORGE_PUMP_INTERVAL_MS", &dotenv, default_pump_interval_ms()),
            merge_prefer,
            merge_push_on_success: get_bool("DAGFORGE_MERGE_PUSH_ON_SUCCESS", &dotenv, false),
            log_filter: get_str("DAGFORGE_LOG_FILTER", &dotenv, &default_log_filter()),
            worktree_root,
            max_consecutive_tick_errors: get_u32("DAGFORGE_MAX_CONSECUTIVE_TICK_ERRORS", &dotenv, 5),
        })
    }

    #[cfg(test)]
    pub fn default_for_tests() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.max_parallel, 8);
        assert_eq!(config.pump_interval_ms, 1000);
        assert_eq!(config.merge_prefer, "theirs");
        assert!(!config.merge_push_on_success);
    }

    #[test]
    fn unknown_merge_prefer_falls_back_to_theirs() {
        std::env::set_var("DAGFORGE_MERGE_PREFER", "bogus");
        let config = Config::from_env().unwrap();
        assert_eq!(config.merge_prefer, "theirs");
        std::env::remove_var("DAGFORGE_MERGE_PREFER");
    }
}
