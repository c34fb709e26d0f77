//! Configuration management
//!
//! 設定は以下の優先順位で読み込まれます:
//! 1. 環境変数
//! 2. switchyard.toml 設定ファイル
//! 3. デフォルト値
//!
//! 設定ファイル内では `${VAR_NAME}` 形式で環境変数を展開できます。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// State store backend kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    /// Shared SQLite file, the store "address" all supervisors point at
    #[default]
    Sqlite,
    /// In-process tables, for tests and single-node runs
    Memory,
}

/// Main configuration for switchyard
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// This supervisor's identity and routing limits
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Session store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Heartbeat / liveness configuration
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Supervisor id; generated at startup when empty
    #[serde(default)]
    pub id: String,

    /// Address advertised to peers for redirects
    #[serde(default = "default_address")]
    pub address: String,

    /// Ceiling on concurrently processed turns
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,

    /// Per-dispatch timeout in seconds
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,

    /// Bounded retry count for optimistic-write conflicts
    #[serde(default = "default_update_retries")]
    pub update_retries: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            address: default_address(),
            max_sessions: default_max_sessions(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            update_retries: default_update_retries(),
        }
    }
}

impl SupervisorConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend holds sessions and supervisor records
    #[serde(default)]
    pub backend: StoreBackendKind,

    /// Path to the shared SQLite database file
    #[serde(default = "default_store_path")]
    pub path: String,

    /// Default session TTL in seconds
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Sqlite,
            path: default_store_path(),
            session_ttl_secs: default_session_ttl(),
        }
    }
}

impl StoreConfig {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Publish interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,

    /// A heartbeat older than interval × multiplier counts as stale
    #[serde(default = "default_liveness_multiplier")]
    pub liveness_multiplier: u32,

    /// Directory records older than this are purged entirely
    #[serde(default = "default_grace")]
    pub grace_secs: u64,

    /// Expired-session reaper cadence in seconds
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            liveness_multiplier: default_liveness_multiplier(),
            grace_secs: default_grace(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Heartbeats older than this are stale (N missed beats).
    pub fn liveness_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.interval_secs * self.liveness_multiplier as u64) as i64)
    }

    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_secs as i64)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Bind host for the HTTP API server
    #[serde(default = "default_api_host")]
    pub host: String,

    /// Port for the HTTP API server
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_sessions() -> u32 {
    50
}

fn default_dispatch_timeout() -> u64 {
    60
}

fn default_update_retries() -> u32 {
    3
}

fn default_store_path() -> String {
    "data/switchyard.db".to_string()
}

fn default_session_ttl() -> u64 {
    3600
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_liveness_multiplier() -> u32 {
    3
}

fn default_grace() -> u64 {
    600
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// 設定ファイル内の環境変数を展開する
    ///
    /// `${VAR_NAME}` 形式の文字列を環境変数の値に置換します。
    /// 環境変数が存在しない場合は空文字列になります。
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::with_capacity(value.len());
        let mut rest = value;

        while let Some(start) = rest.find("${") {
            result.push_str(&rest[..start]);
            match rest[start + 2..].find('}') {
                Some(end) => {
                    let name = &rest[start + 2..start + 2 + end];
                    if let Ok(env_value) = std::env::var(name) {
                        result.push_str(&env_value);
                    }
                    rest = &rest[start + 2 + end + 1..];
                }
                None => {
                    // 閉じ括弧がない場合はそのまま残す
                    result.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }

        result.push_str(rest);
        result
    }

    /// TOML 設定ファイルから設定を読み込む
    ///
    /// # 引数
    /// * `path` - TOML ファイルのパス
    ///
    /// # 環境変数展開
    /// 設定ファイル内の `${VAR_NAME}` は環境変数の値に置換されます。
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();

        let toml_content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let expanded_content = Self::expand_env_vars(&toml_content);

        let toml: TomlConfig = toml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?;

        let mut cfg = Self::from_toml_config(toml);

        // 既存の環境変数で上書き（環境変数が優先）
        cfg.apply_env_overrides();

        Ok(cfg)
    }

    /// デフォルトパスから設定を読み込む
    ///
    /// 以下の順序で設定ファイルを探します:
    /// 1. `./switchyard.toml`
    /// 2. 見つからない場合は環境変数のみ
    pub fn load() -> crate::Result<Self> {
        if Path::new("switchyard.toml").exists() {
            return Self::from_toml_file("switchyard.toml");
        }

        Ok(Self::from_env())
    }

    /// TOML 構造から Config を構築
    fn from_toml_config(toml: TomlConfig) -> Self {
        let supervisor = toml.supervisor.unwrap_or_default();
        let supervisor_config = SupervisorConfig {
            id: supervisor.id.unwrap_or_default(),
            address: supervisor.address.unwrap_or_else(default_address),
            max_sessions: supervisor.max_sessions.unwrap_or_else(default_max_sessions),
            dispatch_timeout_secs: supervisor
                .dispatch_timeout_secs
                .unwrap_or_else(default_dispatch_timeout),
            update_retries: supervisor.update_retries.unwrap_or_else(default_update_retries),
        };

        let store = toml.store.unwrap_or_default();
        let backend = match store.backend.as_deref() {
            Some("memory") => StoreBackendKind::Memory,
            _ => StoreBackendKind::Sqlite,
        };
        let store_config = StoreConfig {
            backend,
            path: store.path.unwrap_or_else(default_store_path),
            session_ttl_secs: store.session_ttl_secs.unwrap_or_else(default_session_ttl),
        };

        let heartbeat = toml.heartbeat.unwrap_or_default();
        let heartbeat_config = HeartbeatConfig {
            interval_secs: heartbeat.interval_secs.unwrap_or_else(default_heartbeat_interval),
            liveness_multiplier: heartbeat
                .liveness_multiplier
                .unwrap_or_else(default_liveness_multiplier),
            grace_secs: heartbeat.grace_secs.unwrap_or_else(default_grace),
            reaper_interval_secs: heartbeat
                .reaper_interval_secs
                .unwrap_or_else(default_reaper_interval),
        };

        let api = toml.api.unwrap_or_default();
        let api_config = ApiConfig {
            host: api.host.unwrap_or_else(default_api_host),
            port: api.port.unwrap_or_else(default_api_port),
        };

        Config {
            supervisor: supervisor_config,
            store: store_config,
            heartbeat: heartbeat_config,
            api: api_config,
        }
    }

    /// 環境変数で設定を上書きする
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("SUPERVISOR_ID") {
            if !id.is_empty() {
                self.supervisor.id = id;
            }
        }
        if let Ok(address) = std::env::var("SUPERVISOR_ADDRESS") {
            if !address.is_empty() {
                self.supervisor.address = address;
            }
        }
        if let Ok(max) = std::env::var("MAX_SESSIONS") {
            if let Ok(n) = max.parse() {
                self.supervisor.max_sessions = n;
            }
        }
        if let Ok(timeout) = std::env::var("DISPATCH_TIMEOUT_SECS") {
            if let Ok(n) = timeout.parse() {
                self.supervisor.dispatch_timeout_secs = n;
            }
        }

        if let Ok(backend) = std::env::var("STORE_BACKEND") {
            match backend.to_lowercase().as_str() {
                "memory" => self.store.backend = StoreBackendKind::Memory,
                "sqlite" => self.store.backend = StoreBackendKind::Sqlite,
                _ => {}
            }
        }
        if let Ok(path) = std::env::var("STORE_PATH") {
            self.store.path = path;
        }
        if let Ok(ttl) = std::env::var("SESSION_TTL_SECS") {
            if let Ok(n) = ttl.parse() {
                self.store.session_ttl_secs = n;
            }
        }

        if let Ok(interval) = std::env::var("HEARTBEAT_INTERVAL_SECS") {
            if let Ok(n) = interval.parse() {
                self.heartbeat.interval_secs = n;
            }
        }
        if let Ok(mult) = std::env::var("LIVENESS_MULTIPLIER") {
            if let Ok(n) = mult.parse() {
                self.heartbeat.liveness_multiplier = n;
            }
        }

        if let Ok(host) = std::env::var("API_HOST") {
            if !host.is_empty() {
                self.api.host = host;
            }
        }
        if let Ok(port) = std::env::var("API_PORT") {
            if let Ok(p) = port.parse() {
                self.api.port = p;
            }
        }
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        cfg
    }
}

// ============================================================================
// TOML 構造体定義（ファイル解析用）
// ============================================================================

/// TOML ファイル用のトップレベル構造
#[derive(Debug, Deserialize)]
struct TomlConfig {
    /// スーパーバイザー設定
    supervisor: Option<TomlSupervisorConfig>,
    /// ストア設定
    store: Option<TomlStoreConfig>,
    /// ハートビート設定
    heartbeat: Option<TomlHeartbeatConfig>,
    /// HTTP API 設定
    api: Option<TomlApiConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlSupervisorConfig {
    /// スーパーバイザー ID（空なら起動時に生成）
    #[serde(default)]
    id: Option<String>,
    /// 公開アドレス
    #[serde(default)]
    address: Option<String>,
    /// 同時処理ターン数の上限
    #[serde(default)]
    max_sessions: Option<u32>,
    /// ディスパッチタイムアウト（秒）
    #[serde(default)]
    dispatch_timeout_secs: Option<u64>,
    /// 競合時のリトライ回数
    #[serde(default)]
    update_retries: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlStoreConfig {
    /// バックエンド種別 ("sqlite" または "memory")
    #[serde(default)]
    backend: Option<String>,
    /// データベースパス
    #[serde(default)]
    path: Option<String>,
    /// セッション TTL（秒）
    #[serde(default)]
    session_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlHeartbeatConfig {
    /// 送信間隔（秒）
    interval_secs: Option<u64>,
    /// 生存判定の倍率
    liveness_multiplier: Option<u32>,
    /// レコード削除までの猶予（秒）
    grace_secs: Option<u64>,
    /// 期限切れセッション掃除の間隔（秒）
    reaper_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlApiConfig {
    /// バインドホスト
    #[serde(default)]
    host: Option<String>,
    /// ポート番号
    #[serde(default)]
    port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supervisor_config_default() {
        let config = SupervisorConfig::default();
        assert!(config.id.is_empty());
        assert_eq!(config.address, "127.0.0.1:8080");
        assert_eq!(config.max_sessions, 50);
        assert_eq!(config.dispatch_timeout_secs, 60);
        assert_eq!(config.update_retries, 3);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.backend, StoreBackendKind::Sqlite);
        assert_eq!(config.path, "data/switchyard.db");
        assert_eq!(config.session_ttl_secs, 3600);
    }

    #[test]
    fn test_heartbeat_config_default() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.interval_secs, 30);
        assert_eq!(config.liveness_multiplier, 3);
        assert_eq!(config.liveness_threshold(), chrono::Duration::seconds(90));
    }

    #[test]
    fn test_api_config_default() {
        let config = ApiConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_expand_env_vars() {
        // テスト用環境変数を設定
        unsafe {
            std::env::set_var("SWITCHYARD_TEST_VAR", "test_value");
        }

        let result = Config::expand_env_vars("prefix_${SWITCHYARD_TEST_VAR}_suffix");
        assert_eq!(result, "prefix_test_value_suffix");

        // 存在しない環境変数
        let result = Config::expand_env_vars("prefix_${NONEXISTENT_VAR}_suffix");
        assert_eq!(result, "prefix__suffix");

        unsafe {
            std::env::remove_var("SWITCHYARD_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_no_braces() {
        let result = Config::expand_env_vars("no_vars_here");
        assert_eq!(result, "no_vars_here");
    }

    #[test]
    fn test_expand_env_vars_unclosed() {
        let result = Config::expand_env_vars("left_${UNCLOSED");
        assert_eq!(result, "left_${UNCLOSED");
    }

    #[test]
    fn test_toml_config_parsing() {
        let toml_content = r#"
[supervisor]
id = "sup-1"
address = "10.0.0.5:9000"
max_sessions = 10
dispatch_timeout_secs = 5

[store]
backend = "memory"
path = "/tmp/switchyard-test.db"
session_ttl_secs = 120

[heartbeat]
interval_secs = 2
liveness_multiplier = 2

[api]
host = "127.0.0.1"
port = 9000
"#;
        let toml: TomlConfig = toml::from_str(toml_content).unwrap();
        let cfg = Config::from_toml_config(toml);

        assert_eq!(cfg.supervisor.id, "sup-1");
        assert_eq!(cfg.supervisor.address, "10.0.0.5:9000");
        assert_eq!(cfg.supervisor.max_sessions, 10);
        assert_eq!(cfg.supervisor.update_retries, 3); // default kept
        assert_eq!(cfg.store.backend, StoreBackendKind::Memory);
        assert_eq!(cfg.store.session_ttl_secs, 120);
        assert_eq!(cfg.heartbeat.liveness_threshold(), chrono::Duration::seconds(4));
        assert_eq!(cfg.heartbeat.grace_secs, 600); // default kept
        assert_eq!(cfg.api.port, 9000);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml: TomlConfig = toml::from_str("[supervisor]\nmax_sessions = 7\n").unwrap();
        let cfg = Config::from_toml_config(toml);

        assert_eq!(cfg.supervisor.max_sessions, 7);
        assert_eq!(cfg.supervisor.address, "127.0.0.1:8080");
        assert_eq!(cfg.store.backend, StoreBackendKind::Sqlite);
        assert_eq!(cfg.api.port, 8080);
    }

    #[test]
    fn test_env_overrides_win_over_defaults() {
        unsafe {
            std::env::set_var("SUPERVISOR_ID", "sup-env");
            std::env::set_var("MAX_SESSIONS", "5");
            std::env::set_var("STORE_BACKEND", "memory");
            std::env::set_var("API_PORT", "9191");
            std::env::set_var("SESSION_TTL_SECS", "not-a-number");
        }

        let mut cfg = Config::default();
        cfg.apply_env_overrides();

        assert_eq!(cfg.supervisor.id, "sup-env");
        assert_eq!(cfg.supervisor.max_sessions, 5);
        assert_eq!(cfg.store.backend, StoreBackendKind::Memory);
        assert_eq!(cfg.api.port, 9191);
        // 不正な値は無視され、デフォルトが残る
        assert_eq!(cfg.store.session_ttl_secs, 3600);

        unsafe {
            std::env::remove_var("SUPERVISOR_ID");
            std::env::remove_var("MAX_SESSIONS");
            std::env::remove_var("STORE_BACKEND");
            std::env::remove_var("API_PORT");
            std::env::remove_var("SESSION_TTL_SECS");
        }
    }
}
