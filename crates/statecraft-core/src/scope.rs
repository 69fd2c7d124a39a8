//! Scopes: named, nestable containers of resources
//!
//! A root scope is created per stage and owns the backend, the resource
//! registry, the KDF parameters and the per-stage salt. Child scopes inherit
//! stage, password, phase and backend from their parent and get their own
//! state store for their chain (`[stage, child, grandchild, ...]`).
//!
//! The scope a task is running in is tracked with a tokio task-local, so
//! resource declarations can find it without being handed one. Everything
//! that needs a scope also accepts one explicitly.

use crate::codec::{self, SerializeOptions};
use crate::destroy::{self, DestroyOptions};
use crate::encryption::{self, EncryptionKeys, KdfParams};
use crate::error::{Result, StatecraftError};
use crate::resource::{ResourceRegistry, SALT_KIND, SCOPE_KIND};
use crate::state::{ResourceStatus, State, StoredState};
use crate::store::{MemoryBackend, SALT_ID, StateStore, StoreFactory, is_reserved_id};
use crate::value::Value;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::{debug, info};

tokio::task_local! {
    static CURRENT: Scope;
}

/// What a run does with the declared resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Create or update declared resources, delete undeclared ones
    #[default]
    Up,
    /// Delete everything in the scope when it finalizes
    Destroy,
    /// Return persisted outputs without calling any handler
    Read,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Up => write!(f, "up"),
            Phase::Destroy => write!(f, "destroy"),
            Phase::Read => write!(f, "read"),
        }
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(Phase::Up),
            "destroy" => Ok(Phase::Destroy),
            "read" => Ok(Phase::Read),
            other => Err(format!("unknown phase '{other}' (expected up, destroy or read)")),
        }
    }
}

/// Settings for a root scope
pub struct RootOptions {
    pub stage: String,
    pub password: Option<String>,
    pub phase: Phase,
    pub quiet: bool,
    pub kdf: KdfParams,
    pub backend: Arc<dyn StoreFactory>,
    pub registry: Arc<ResourceRegistry>,
}

impl RootOptions {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            password: None,
            phase: Phase::default(),
            quiet: false,
            kdf: KdfParams::default(),
            backend: Arc::new(MemoryBackend::new()),
            registry: Arc::new(ResourceRegistry::new()),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn with_backend(mut self, backend: impl StoreFactory + 'static) -> Self {
        self.backend = Arc::new(backend);
        self
    }

    pub fn with_shared_backend(mut self, backend: Arc<dyn StoreFactory>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_registry(mut self, registry: Arc<ResourceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Suppress per-resource progress logs
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }
}

/// Overrides for a child scope; unset fields are inherited
#[derive(Debug, Clone, Default)]
pub struct ScopeOptions {
    /// Parent to nest under instead of the ambient scope
    pub parent: Option<Scope>,
    pub password: Option<String>,
    pub phase: Option<Phase>,
    pub quiet: Option<bool>,
}

/// Progress of a resource declared during the current run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declaration {
    Pending,
    Applied,
    Failed,
}

/// A resource declared in this scope during the current run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredResource {
    pub kind: String,
    pub seq: u64,
    pub status: Declaration,
}

struct ScopeInner {
    stage: String,
    chain: Vec<String>,
    parent: Option<Scope>,
    password: Option<String>,
    phase: Phase,
    quiet: bool,
    kdf: KdfParams,
    backend: Arc<dyn StoreFactory>,
    registry: Arc<ResourceRegistry>,
    store: Arc<dyn StateStore>,
    initialized: OnceCell<()>,
    seq: AtomicU64,
    declared: Mutex<IndexMap<String, DeclaredResource>>,
    keys: AsyncMutex<Option<EncryptionKeys>>,
    // Only used on the root scope
    salt: AsyncMutex<Option<Vec<u8>>>,
}

/// Handle to a scope; cheap to clone, compared by identity
#[derive(Clone)]
pub struct Scope(Arc<ScopeInner>);

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("chain", &self.0.chain)
            .field("phase", &self.0.phase)
            .finish()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Scope {
    /// Build a root scope for a stage. No I/O happens until first use.
    pub fn root(opts: RootOptions) -> Scope {
        let chain = vec![opts.stage.clone()];
        let store = opts.backend.create(&chain);
        Scope(Arc::new(ScopeInner {
            stage: opts.stage,
            chain,
            parent: None,
            password: opts.password,
            phase: opts.phase,
            quiet: opts.quiet,
            kdf: opts.kdf,
            backend: opts.backend,
            registry: opts.registry,
            store,
            initialized: OnceCell::new(),
            seq: AtomicU64::new(0),
            declared: Mutex::new(IndexMap::new()),
            keys: AsyncMutex::new(None),
            salt: AsyncMutex::new(None),
        }))
    }

    /// Build a child scope without entering it
    pub fn child(&self, name: &str, opts: ScopeOptions) -> Result<Scope> {
        validate_scope_name(name)?;
        let mut chain = self.0.chain.clone();
        chain.push(name.to_string());
        let store = self.0.backend.create(&chain);
        Ok(Scope(Arc::new(ScopeInner {
            stage: self.0.stage.clone(),
            chain,
            parent: Some(self.clone()),
            password: opts.password.or_else(|| self.0.password.clone()),
            phase: opts.phase.unwrap_or(self.0.phase),
            quiet: opts.quiet.unwrap_or(self.0.quiet),
            kdf: self.0.kdf,
            backend: self.0.backend.clone(),
            registry: self.0.registry.clone(),
            store,
            initialized: OnceCell::new(),
            seq: AtomicU64::new(0),
            declared: Mutex::new(IndexMap::new()),
            keys: AsyncMutex::new(None),
            salt: AsyncMutex::new(None),
        })))
    }

    /// The scope the current task runs in, if any
    pub fn current() -> Option<Scope> {
        CURRENT.try_with(Scope::clone).ok()
    }

    pub fn current_or_fail() -> Result<Scope> {
        Self::current().ok_or(StatecraftError::NoActiveScope)
    }

    /// Create a root scope, run `f` inside it and finalize it on success
    pub async fn enter_root<T, F, Fut>(opts: RootOptions, f: F) -> Result<T>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let root = Scope::root(opts);
        root.init().await?;
        let value = root.scoped(f(root.clone())).await?;
        root.finalize().await?;
        Ok(value)
    }

    /// Run `f` in a child scope of `opts.parent`, or of the ambient scope
    pub async fn run<T, F, Fut>(name: &str, opts: ScopeOptions, f: F) -> Result<T>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let parent = match &opts.parent {
            Some(parent) => parent.clone(),
            None => Scope::current_or_fail()?,
        };
        parent.run_child(name, opts, f).await
    }

    /// Run `f` in a child scope of this scope and finalize the child on success.
    ///
    /// The child is recorded in this scope's store so a later run can find and
    /// destroy it even after it is no longer declared.
    pub async fn run_child<T, F, Fut>(&self, name: &str, opts: ScopeOptions, f: F) -> Result<T>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let child = self.child(name, opts)?;
        self.record_child(name).await?;
        child.init().await?;

        let value = child.scoped(f(child.clone())).await;
        self.mark(
            name,
            if value.is_ok() {
                Declaration::Applied
            } else {
                Declaration::Failed
            },
        );
        let value = value?;
        child.finalize().await?;
        Ok(value)
    }

    /// Make this the ambient scope while `fut` runs.
    ///
    /// Task-locals do not cross `tokio::spawn`; wrap spawned futures with this.
    pub async fn scoped<F: Future>(&self, fut: F) -> F::Output {
        CURRENT.scope(self.clone(), fut).await
    }

    pub fn stage(&self) -> &str {
        &self.0.stage
    }

    /// Name of this scope; the stage for a root
    pub fn name(&self) -> &str {
        self.0.chain.last().map(String::as_str).unwrap_or_default()
    }

    pub fn chain(&self) -> &[String] {
        &self.0.chain
    }

    pub fn parent(&self) -> Option<&Scope> {
        self.0.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.0.parent.is_none()
    }

    pub fn root_scope(&self) -> &Scope {
        let mut scope = self;
        while let Some(parent) = scope.parent() {
            scope = parent;
        }
        scope
    }

    pub fn phase(&self) -> Phase {
        self.0.phase
    }

    pub fn password(&self) -> Option<&str> {
        self.0.password.as_deref()
    }

    pub fn is_quiet(&self) -> bool {
        self.0.quiet
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.0.registry
    }

    pub fn backend(&self) -> &Arc<dyn StoreFactory> {
        &self.0.backend
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.0.store
    }

    /// `<chain>/<id>`
    pub fn fqn(&self, id: &str) -> String {
        let mut fqn = self.0.chain.join("/");
        fqn.push('/');
        fqn.push_str(id);
        fqn
    }

    /// Next declaration index in this scope
    pub fn next_seq(&self) -> u64 {
        self.0.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Initialize the state store once
    pub async fn init(&self) -> Result<()> {
        self.0
            .initialized
            .get_or_try_init(|| async {
                debug!("Initializing state store for {}", self.0.chain.join("/"));
                self.0.store.init().await?;
                // Sequence numbers stay unique across runs
                let next = self
                    .0
                    .store
                    .all()
                    .await?
                    .values()
                    .map(|state| state.seq + 1)
                    .max()
                    .unwrap_or(0);
                self.0.seq.fetch_max(next, Ordering::SeqCst);
                Ok::<(), StatecraftError>(())
            })
            .await?;
        Ok(())
    }

    /// Close out a run of this scope.
    ///
    /// In the up phase, persisted resources that were not declared during the
    /// run are destroyed. In the destroy phase everything is. The store is
    /// released once the scope holds no records.
    pub async fn finalize(&self) -> Result<()> {
        match self.0.phase {
            Phase::Read => return Ok(()),
            Phase::Up => {
                let orphans = self.orphans().await?;
                if !orphans.is_empty() {
                    info!(
                        "Deleting {} orphaned resource(s) in {}",
                        orphans.len(),
                        self.0.chain.join("/")
                    );
                    destroy::destroy_ids(self, &orphans, &DestroyOptions::default()).await?;
                }
                if self.states().await?.is_empty() {
                    self.0.store.deinit().await?;
                }
            }
            Phase::Destroy => {
                destroy::destroy_scope(self, &DestroyOptions::default()).await?;
            }
        }
        Ok(())
    }

    /// Persisted ids not declared in this run, latest declaration first
    async fn orphans(&self) -> Result<Vec<String>> {
        let declared = self.declared();
        let mut orphans: Vec<(String, u64)> = self
            .states()
            .await?
            .into_iter()
            .filter(|(id, _)| !declared.contains_key(id))
            .map(|(id, state)| (id, state.seq))
            .collect();
        orphans.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(orphans.into_iter().map(|(id, _)| id).collect())
    }

    /// Claim `id` for this run and hand out its sequence number
    pub(crate) fn declare(&self, id: &str, kind: &str) -> Result<u64> {
        validate_resource_id(id)?;
        let mut declared = self.0.declared.lock().unwrap_or_else(|e| e.into_inner());
        if declared.contains_key(id) {
            return Err(StatecraftError::DuplicateResource(self.fqn(id)));
        }
        let seq = self.next_seq();
        declared.insert(
            id.to_string(),
            DeclaredResource {
                kind: kind.to_string(),
                seq,
                status: Declaration::Pending,
            },
        );
        Ok(seq)
    }

    pub(crate) fn mark(&self, id: &str, status: Declaration) {
        let mut declared = self.0.declared.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(resource) = declared.get_mut(id) {
            resource.status = status;
        }
    }

    /// Resources declared during the current run, in declaration order
    pub fn declared(&self) -> IndexMap<String, DeclaredResource> {
        self.0
            .declared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn record_child(&self, name: &str) -> Result<()> {
        self.init().await?;
        let seq = self.declare(name, SCOPE_KIND)?;
        if self.0.phase != Phase::Up {
            return Ok(());
        }
        if let Some(mut record) = self.0.store.get(name).await? {
            if record.seq != seq {
                record.seq = seq;
                self.0.store.set(name, &record).await?;
            }
            return Ok(());
        }
        let child_fqn = self.fqn(name);
        let state = State::new(SCOPE_KIND, name, child_fqn.clone(), seq)
            .with_status(ResourceStatus::Created)
            .with_output(Value::object([("chain", child_fqn)]));
        self.save_state(&state).await
    }

    /// Load and decode one record
    pub async fn get_state(&self, id: &str) -> Result<Option<State>> {
        self.init().await?;
        match self.0.store.get(id).await? {
            Some(stored) => Ok(Some(stored.into_state(self).await?)),
            None => Ok(None),
        }
    }

    /// Encode and persist one record
    pub async fn save_state(&self, state: &State) -> Result<()> {
        self.init().await?;
        let stored = state.to_stored(self).await?;
        self.0.store.set(&state.id, &stored).await
    }

    pub async fn delete_state(&self, id: &str) -> Result<()> {
        self.init().await?;
        self.0.store.delete(id).await
    }

    /// Every persisted record except engine-owned ones, still encoded
    pub async fn states(&self) -> Result<IndexMap<String, StoredState>> {
        self.init().await?;
        let mut states = self.0.store.all().await?;
        states.retain(|id, _| !is_reserved_id(id));
        Ok(states)
    }

    /// Keys for this scope's password, or `None` when it has none.
    ///
    /// With `create_salt` the per-stage salt is generated and persisted if it
    /// does not exist yet; otherwise a missing salt yields unsalted keys that
    /// can still read values written before salting.
    pub async fn encryption_keys(&self, create_salt: bool) -> Result<Option<EncryptionKeys>> {
        let Some(password) = self.0.password.as_deref() else {
            return Ok(None);
        };
        let mut cached = self.0.keys.lock().await;
        if let Some(keys) = cached.as_ref() {
            if keys.is_salted() || !create_salt {
                return Ok(Some(keys.clone()));
            }
        }
        let keys = self.derive_keys(password, create_salt).await?;
        *cached = Some(keys.clone());
        Ok(Some(keys))
    }

    /// Keys for an arbitrary password against this stage's salt
    pub async fn derive_keys(&self, password: &str, create_salt: bool) -> Result<EncryptionKeys> {
        let salt = self.root_scope().salt(create_salt).await?;
        EncryptionKeys::new(password, salt.as_deref(), self.0.kdf)
    }

    async fn salt(&self, create: bool) -> Result<Option<Vec<u8>>> {
        let mut cached = self.0.salt.lock().await;
        if cached.is_some() {
            return Ok(cached.clone());
        }

        self.init().await?;
        if let Some(record) = self.0.store.get(SALT_ID).await? {
            let salt = decode_salt(&record)?;
            *cached = Some(salt.clone());
            return Ok(Some(salt));
        }
        if !create {
            return Ok(None);
        }

        let salt = encryption::generate_salt();
        let record = StoredState {
            status: ResourceStatus::Created,
            kind: SALT_KIND.to_string(),
            id: SALT_ID.to_string(),
            fqn: self.fqn(SALT_ID),
            seq: 0,
            props: serde_json::Value::Null,
            old_props: None,
            output: Some(serde_json::json!({ "salt": BASE64.encode(&salt) })),
            data: serde_json::json!({}),
            updated_at: chrono::Utc::now(),
        };
        self.0.store.set(SALT_ID, &record).await?;
        info!("Created encryption salt for stage {}", self.0.stage);
        *cached = Some(salt.clone());
        Ok(Some(salt))
    }

    /// Forget the cached salt and keys, e.g. after the salt record was removed
    pub(crate) async fn reset_keys(&self) {
        *self.0.keys.lock().await = None;
        *self.root_scope().0.salt.lock().await = None;
    }

    /// Plaintext encoding of `value`, for structural comparison
    pub(crate) fn comparable(&self, value: &Value) -> Result<serde_json::Value> {
        codec::serialize_with_keys(self, None, value, SerializeOptions::plaintext())
    }
}

fn decode_salt(record: &StoredState) -> Result<Vec<u8>> {
    let encoded = record
        .output
        .as_ref()
        .and_then(|output| output.get("salt"))
        .and_then(|salt| salt.as_str())
        .ok_or_else(|| StatecraftError::store("salt record has no salt"))?;
    BASE64
        .decode(encoded)
        .map_err(|e| StatecraftError::store(format!("salt record is not base64: {e}")))
}

fn validate_resource_id(id: &str) -> Result<()> {
    let reason = if id.is_empty() {
        "must not be empty"
    } else if id.contains('/') {
        "must not contain '/'"
    } else if is_reserved_id(id) {
        "the '__' prefix is reserved"
    } else if id == "." || id == ".." {
        "must not be a relative path"
    } else {
        return Ok(());
    };
    Err(StatecraftError::InvalidResourceId {
        id: id.to_string(),
        reason,
    })
}

fn validate_scope_name(name: &str) -> Result<()> {
    validate_resource_id(name).map_err(|e| StatecraftError::InvalidScopeName(e.to_string()))
}
