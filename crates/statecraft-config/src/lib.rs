pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use statecraft_core::Phase;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "STATECRAFT_CONFIG_PATH";
pub const STAGE_ENV: &str = "STATECRAFT_STAGE";
pub const PASSWORD_ENV: &str = "STATECRAFT_PASSWORD";
pub const PHASE_ENV: &str = "STATECRAFT_PHASE";

const DEFAULT_STAGE: &str = "dev";
const DEFAULT_TOKEN_ENV: &str = "STATECRAFT_STATE_TOKEN";
const CANDIDATES: [&str; 2] = ["statecraft.local.yaml", "statecraft.yaml"];

/// 実行環境の設定 (statecraft.yaml)
///
/// ```yaml
/// stage: prod
/// phase: up
/// store:
///   type: sqlite
///   path: .statecraft/state.db
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub stage: String,
    /// シークレット暗号化用パスワード。通常は STATECRAFT_PASSWORD で渡す
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub phase: Phase,
    pub store: StoreConfig,
    /// create/update/delete のログを抑制する
    pub quiet: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stage: DEFAULT_STAGE.to_string(),
            password: None,
            phase: Phase::default(),
            store: StoreConfig::default(),
            quiet: false,
        }
    }
}

/// ステート保存先
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// プロセス内のみ (テスト用)
    #[default]
    Memory,
    /// `<root>/<stage>/<scope>/.../<id>.json`
    File {
        #[serde(default = "default_file_root")]
        root: PathBuf,
    },
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
    Remote {
        url: String,
        #[serde(default = "default_token_env")]
        token_env: String,
    },
}

fn default_file_root() -> PathBuf {
    PathBuf::from(".statecraft").join("state")
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from(".statecraft").join("state.db")
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

impl StoreConfig {
    /// 相対パスを設定ファイルのディレクトリ基準に解決
    fn resolve_relative(&mut self, base: &Path) {
        match self {
            StoreConfig::File { root: path } | StoreConfig::Sqlite { path } => {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
            StoreConfig::Memory | StoreConfig::Remote { .. } => {}
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// 指定ファイルから読み込む（環境変数は適用しない）
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(base) = path.parent() {
            config.store.resolve_relative(base);
        }
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// 設定ファイルを探して読み込み、環境変数で上書きする
    ///
    /// 設定ファイルが無い場合はデフォルト設定を使う。
    pub fn load() -> Result<Self> {
        let config = match find_config_file() {
            Ok(path) => Self::load_from(&path)?,
            Err(ConfigError::ConfigFileNotFound) => Self::default(),
            Err(e) => return Err(e),
        };
        config.with_env_overrides()
    }

    /// STATECRAFT_STAGE / STATECRAFT_PASSWORD / STATECRAFT_PHASE を適用
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(stage) = std::env::var(STAGE_ENV) {
            self.stage = stage;
        }
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            self.password = Some(password);
        }
        if let Ok(phase) = std::env::var(PHASE_ENV) {
            self.phase = phase.parse().map_err(ConfigError::InvalidPhase)?;
        }
        if self.stage.trim().is_empty() {
            return Err(ConfigError::EmptyStage);
        }
        Ok(self)
    }
}

/// statecraft.yaml を探す
///
/// 以下の優先順位で設定ファイルを検索:
/// 1. 環境変数 STATECRAFT_CONFIG_PATH (直接パス指定)
/// 2. カレントディレクトリ: statecraft.local.yaml, statecraft.yaml
/// 3. ./.statecraft/ ディレクトリ内: 同様の順序
/// 4. ~/.config/statecraft/statecraft.yaml (グローバル設定)
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;

    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let local_dir = current_dir.join(".statecraft");
    if local_dir.is_dir() {
        for filename in &CANDIDATES {
            let path = local_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("statecraft").join("statecraft.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    /// カレントディレクトリを一時的に切り替えて実行
    fn in_dir<T>(dir: &Path, f: impl FnOnce() -> T) -> T {
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir).unwrap();
        let result = f();
        std::env::set_current_dir(original_dir).unwrap();
        result
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.stage, "dev");
        assert_eq!(config.phase, Phase::Up);
        assert_eq!(config.store, StoreConfig::Memory);
        assert!(config.password.is_none());
    }

    #[test]
    fn test_parse_store_variants() {
        let config = EngineConfig::from_yaml(
            "stage: prod\nphase: destroy\nstore:\n  type: sqlite\n  path: /var/lib/state.db\n",
        )
        .unwrap();
        assert_eq!(config.stage, "prod");
        assert_eq!(config.phase, Phase::Destroy);
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: PathBuf::from("/var/lib/state.db")
            }
        );

        let config =
            EngineConfig::from_yaml("store:\n  type: remote\n  url: https://state.example.com\n")
                .unwrap();
        assert_eq!(
            config.store,
            StoreConfig::Remote {
                url: "https://state.example.com".to_string(),
                token_env: "STATECRAFT_STATE_TOKEN".to_string(),
            }
        );

        let config = EngineConfig::from_yaml("store:\n  type: file\n").unwrap();
        assert_eq!(
            config.store,
            StoreConfig::File {
                root: PathBuf::from(".statecraft/state")
            }
        );
    }

    #[test]
    fn test_unknown_store_type_is_rejected() {
        assert!(EngineConfig::from_yaml("store:\n  type: etcd\n").is_err());
    }

    #[test]
    fn test_load_from_resolves_relative_paths() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("statecraft.yaml");
        fs::write(&path, "store:\n  type: file\n  root: state\n").unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(
            config.store,
            StoreConfig::File {
                root: temp_dir.path().join("state")
            }
        );
    }

    #[test]
    fn test_load_from_reports_parse_errors() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("statecraft.yaml");
        fs::write(&path, "phase: [up\n").unwrap();

        match EngineConfig::load_from(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected Parse error, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        temp_env::with_vars(
            [
                (STAGE_ENV, Some("prod")),
                (PASSWORD_ENV, Some("hunter2")),
                (PHASE_ENV, Some("READ")),
            ],
            || {
                let config = EngineConfig::default().with_env_overrides().unwrap();
                assert_eq!(config.stage, "prod");
                assert_eq!(config.password.as_deref(), Some("hunter2"));
                assert_eq!(config.phase, Phase::Read);
            },
        );
    }

    #[test]
    #[serial]
    fn test_invalid_phase_env() {
        temp_env::with_var(PHASE_ENV, Some("sideways"), || {
            let result = EngineConfig::default().with_env_overrides();
            assert!(matches!(result, Err(ConfigError::InvalidPhase(_))));
        });
    }

    #[test]
    #[serial]
    fn test_empty_stage_env_is_rejected() {
        temp_env::with_var(STAGE_ENV, Some(""), || {
            let result = EngineConfig::default().with_env_overrides();
            assert!(matches!(result, Err(ConfigError::EmptyStage)));
        });
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("statecraft.yaml"), "stage: dev\n").unwrap();

        temp_env::with_var_unset(CONFIG_PATH_ENV, || {
            let result = in_dir(temp_dir.path(), find_config_file).unwrap();
            assert!(result.ends_with("statecraft.yaml"));
        });
    }

    #[test]
    #[serial]
    fn test_find_config_file_local_priority() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("statecraft.yaml"), "stage: dev\n").unwrap();
        fs::write(temp_dir.path().join("statecraft.local.yaml"), "stage: me\n").unwrap();

        temp_env::with_var_unset(CONFIG_PATH_ENV, || {
            let result = in_dir(temp_dir.path(), find_config_file).unwrap();
            // statecraft.local.yaml が優先される
            assert!(result.ends_with("statecraft.local.yaml"));
        });
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_statecraft_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let local_dir = temp_dir.path().join(".statecraft");
        fs::create_dir(&local_dir).unwrap();
        fs::write(local_dir.join("statecraft.yaml"), "stage: dev\n").unwrap();

        temp_env::with_var_unset(CONFIG_PATH_ENV, || {
            let result = in_dir(temp_dir.path(), find_config_file).unwrap();
            assert!(result.ends_with(".statecraft/statecraft.yaml"));
        });
    }

    #[test]
    #[serial]
    fn test_find_config_file_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(&config_path, "stage: custom\n").unwrap();

        temp_env::with_var(CONFIG_PATH_ENV, Some(&config_path), || {
            assert_eq!(find_config_file().unwrap(), config_path);
        });
    }

    #[test]
    #[serial]
    fn test_load_without_config_file_uses_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let xdg = temp_dir.path().join("xdg");

        temp_env::with_vars(
            [
                (CONFIG_PATH_ENV, None),
                (STAGE_ENV, None),
                (PASSWORD_ENV, None),
                (PHASE_ENV, None),
                ("XDG_CONFIG_HOME", Some(xdg.as_os_str())),
            ],
            || {
                let found = in_dir(temp_dir.path(), find_config_file);
                assert!(matches!(found, Err(ConfigError::ConfigFileNotFound)));

                let config = in_dir(temp_dir.path(), EngineConfig::load).unwrap();
                assert_eq!(config, EngineConfig::default());
            },
        );
    }
}
