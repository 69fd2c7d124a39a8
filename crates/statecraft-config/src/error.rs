use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "設定ファイルが見つかりません。以下の場所を確認してください:\n\
        - カレントディレクトリ: statecraft.local.yaml, statecraft.yaml\n\
        - ./.statecraft/ ディレクトリ\n\
        - ~/.config/statecraft/statecraft.yaml\n\
        または STATECRAFT_CONFIG_PATH 環境変数で直接指定できます"
    )]
    ConfigFileNotFound,

    #[error("設定ファイルの解析に失敗しました ({path}): {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("不正なフェーズ指定: {0}")]
    InvalidPhase(String),

    #[error("ステージ名が空です")]
    EmptyStage,

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
