use std::path::PathBuf;
use std::time::Duration;

/// Close grace bounds: how long `run:close` waits for an adapter to emit its
/// own terminal event before the manager synthesizes one.
const CLOSE_GRACE_MIN_MS: u64 = 5_000;
const CLOSE_GRACE_MAX_MS: u64 = 15_000;
const CLOSE_GRACE_DEFAULT_MS: u64 = 10_000;

/// Server configuration loaded from environment variables at startup.
/// Nothing here is hot-reloadable.
pub struct Config {
    pub port: u16,
    /// Shared auth key. Required to serve; enforced in main.
    pub auth_key: Option<String>,
    /// Absolute prefix all session working directories must live under.
    pub workspace_root: PathBuf,
    /// SQLite database file for sessions + events.
    pub db_path: PathBuf,
    /// Grace period for `close_run_session` before force-termination.
    pub close_grace: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("PORT").ok().as_deref(),
            std::env::var("DISPATCH_AUTH_KEY").ok().as_deref(),
            std::env::var("DISPATCH_WORKSPACE_ROOT").ok().as_deref(),
            std::env::var("DISPATCH_DB_PATH").ok().as_deref(),
            std::env::var("DISPATCH_CLOSE_GRACE_MS").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(
        port: Option<&str>,
        auth_key: Option<&str>,
        workspace_root: Option<&str>,
        db_path: Option<&str>,
        close_grace_ms: Option<&str>,
    ) -> Self {
        let port = port.and_then(|v| v.parse().ok()).unwrap_or(3030);

        let auth_key = auth_key.filter(|s| !s.is_empty()).map(String::from);

        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dispatch");

        let workspace_root = workspace_root
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("workspaces"));

        let db_path = db_path
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("dispatch.db"));

        let close_grace_ms = close_grace_ms
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(CLOSE_GRACE_DEFAULT_MS)
            .clamp(CLOSE_GRACE_MIN_MS, CLOSE_GRACE_MAX_MS);

        Config {
            port,
            auth_key,
            workspace_root,
            db_path,
            close_grace: Duration::from_millis(close_grace_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_invalid_port_uses_default() {
        let config = Config::from_raw_values(Some("not-a-number"), None, None, None, None);
        assert_eq!(config.port, 3030);
    }

    #[test]
    fn test_config_valid_port() {
        let config = Config::from_raw_values(Some("8080"), None, None, None, None);
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_config_empty_auth_key_is_none() {
        let config = Config::from_raw_values(None, Some(""), None, None, None);
        assert!(config.auth_key.is_none());
    }

    #[test]
    fn test_config_present_auth_key() {
        let config = Config::from_raw_values(None, Some("hunter2"), None, None, None);
        assert_eq!(config.auth_key.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_config_explicit_paths() {
        let config = Config::from_raw_values(
            None,
            None,
            Some("/srv/workspaces"),
            Some("/var/lib/dispatch/events.db"),
            None,
        );
        assert_eq!(config.workspace_root, PathBuf::from("/srv/workspaces"));
        assert_eq!(config.db_path, PathBuf::from("/var/lib/dispatch/events.db"));
    }

    #[test]
    fn test_config_default_paths_under_home() {
        let config = Config::from_raw_values(None, None, None, None, None);
        assert!(config.workspace_root.ends_with(".dispatch/workspaces"));
        assert!(config.db_path.ends_with(".dispatch/dispatch.db"));
    }

    #[test]
    fn test_close_grace_clamped() {
        let low = Config::from_raw_values(None, None, None, None, Some("1000"));
        assert_eq!(low.close_grace, Duration::from_millis(5_000));

        let high = Config::from_raw_values(None, None, None, None, Some("60000"));
        assert_eq!(high.close_grace, Duration::from_millis(15_000));

        let mid = Config::from_raw_values(None, None, None, None, Some("12000"));
        assert_eq!(mid.close_grace, Duration::from_millis(12_000));
    }

    #[test]
    fn test_close_grace_default() {
        let config = Config::from_raw_values(None, None, None, None, Some("garbage"));
        assert_eq!(config.close_grace, Duration::from_millis(10_000));
    }
}
