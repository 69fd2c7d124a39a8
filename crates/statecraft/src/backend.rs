use statecraft_config::{EngineConfig, StoreConfig};
use statecraft_core::store::{FileSystemBackend, MemoryBackend};
use statecraft_core::{Phase, RootOptions, Scope, ScopeOptions, StoreFactory};
use statecraft_remote::{RemoteBackend, RemoteConfig};
use statecraft_sqlite::SqliteBackend;
use std::sync::Arc;

/// 設定に応じたステートバックエンドを作成
pub fn build(store: &StoreConfig) -> anyhow::Result<Arc<dyn StoreFactory>> {
    let backend: Arc<dyn StoreFactory> = match store {
        StoreConfig::Memory => Arc::new(MemoryBackend::new()),
        StoreConfig::File { root } => Arc::new(FileSystemBackend::new(root)),
        StoreConfig::Sqlite { path } => Arc::new(SqliteBackend::open(path)),
        StoreConfig::Remote { url, token_env } => {
            let config = RemoteConfig::from_env(url.as_str(), token_env)?;
            Arc::new(RemoteBackend::new(config)?)
        }
    };
    tracing::debug!("Using {:?} state store", store);
    Ok(backend)
}

/// 読み取り専用のルートスコープ
///
/// ハンドラを呼び出さないので、リソースレジストリは空のままでよい。
pub fn root_scope(config: &EngineConfig, backend: Arc<dyn StoreFactory>) -> Scope {
    let mut opts = RootOptions::new(config.stage.as_str())
        .with_shared_backend(backend)
        .with_phase(Phase::Read)
        .quiet(true);
    if let Some(password) = &config.password {
        opts = opts.with_password(password.as_str());
    }
    Scope::root(opts)
}

/// "a/b" 形式のスコープパスを辿る
pub fn resolve_scope(root: &Scope, path: Option<&str>) -> anyhow::Result<Scope> {
    let mut scope = root.clone();
    for name in path.unwrap_or_default().split('/').filter(|s| !s.is_empty()) {
        scope = scope.child(name, ScopeOptions::default())?;
    }
    Ok(scope)
}
