//! Statecraft core engine
//!
//! Declarative resource reconciliation with durable, encrypted state.
//! A program declares resources inside scopes; each declaration is
//! reconciled against the state persisted by the previous run and the
//! matching provider handler is called to create, update or delete it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │          program / statecraft CLI               │
//! └─────────────────┬───────────────────────────────┘
//!                   │ Resource::apply / Scope::run
//! ┌─────────────────▼───────────────────────────────┐
//! │                statecraft-core                  │
//! │  ┌─────────┐  ┌─────────┐  ┌────────────────┐   │
//! │  │  Scope  │──│  apply  │──│ ResourceHandler│   │
//! │  │  tree   │  │ destroy │  │   (providers)  │   │
//! │  └────┬────┘  └─────────┘  └────────────────┘   │
//! │       │ codec (tagged JSON, AES-256-GCM secrets)│
//! │  ┌────▼─────────────────────────────────────┐   │
//! │  │        trait StateStore { ... }          │   │
//! │  └──────────────────────────────────────────┘   │
//! └───────┬──────────────┬──────────────┬───────────┘
//!         │              │              │
//!   ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼──────┐
//!   │ file/mem  │  │  sqlite   │  │   remote   │
//!   └───────────┘  └───────────┘  └────────────┘
//! ```

pub mod apply;
pub mod codec;
pub mod context;
pub mod destroy;
pub mod encryption;
pub mod error;
pub mod resource;
pub mod rotate;
pub mod scope;
pub mod secret;
pub mod state;
pub mod store;
pub mod value;

// Re-exports
pub use async_trait::async_trait;
pub use apply::{ApplyOptions, apply};
pub use context::Context;
pub use destroy::{
    DestroyOptions, DestroyStrategy, destroy_output, destroy_resource, destroy_scope,
};
pub use encryption::{EncryptionKeys, KdfParams};
pub use error::{Result, StatecraftError};
pub use resource::{
    Event, HandlerOutcome, Resource, ResourceHandler, ResourceRef, ResourceRegistry,
};
pub use rotate::{RotationReport, rotate_password};
pub use scope::{Phase, RootOptions, Scope, ScopeOptions};
pub use secret::Secret;
pub use state::{ResourceStatus, State, StoredState};
pub use store::{StateStore, StoreFactory};
pub use value::{Callable, Key, Object, Symbol, Value};
