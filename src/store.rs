//! The rendezvous protocol spoken through the shared configuration store.
//!
//! The store is a hierarchical key/value facility with per-path watches,
//! visible to both domains. The backend advertises its domain id under
//! [`BACKEND_ROOT`] and watches the [`FRONTEND_ROOT`] subtree; a frontend
//! requests a model by writing its name under its own id, then polls the
//! per-frontend `state` key until the grant directory is published.

use alloc::string::String;

use log::debug;

use crate::{
    error::Result,
    model::ModelName,
    platform::DomainId,
};

/// Where the backend advertises its domain id, as an unsigned decimal.
pub const BACKEND_ROOT: &str = "/backend";

/// Subtree the backend watches for frontend arrivals.
pub const FRONTEND_ROOT: &str = "/frontend";

/// Value a frontend writes under [`FRONTEND_ROOT`] to request teardown.
pub const CLOSE: &str = "close";

/// Sentinel seeded on the per-frontend backend node when publication
/// begins. Not a state machine value; frontends only ever wait for
/// [`STATE_READY`].
pub const STATE_PENDING: &str = "0";

/// `state` value once the grant directory is published and stable.
pub const STATE_READY: &str = "1";

/// Upper bound on the published directory list, in bytes.
pub const MAX_REFS_VALUE_LEN: usize = 1024;

/// Request key a frontend writes its model name (or `close`) to.
pub fn frontend_entry(frontend: DomainId) -> String {
    format!("{}/{}", FRONTEND_ROOT, frontend)
}

/// Per-frontend backend node, seeded with [`STATE_PENDING`].
pub fn backend_entry(frontend: DomainId) -> String {
    format!("{}/{}", BACKEND_ROOT, frontend)
}

/// Key carrying the space-separated directory references.
pub fn grant_dir_entry(frontend: DomainId) -> String {
    format!("{}/{}/grant-ref-ref", BACKEND_ROOT, frontend)
}

/// Key the frontend watches for [`STATE_READY`].
pub fn state_entry(frontend: DomainId) -> String {
    format!("{}/{}/state", BACKEND_ROOT, frontend)
}

/// The configuration store as seen by one domain.
pub trait Store {
    /// Handle returned by [`Store::watch`]; [`Store::wait`] blocks on it.
    type Watch: Send + Sync;

    /// Domain id of the caller.
    fn self_id(&self) -> DomainId;

    fn read(&self, path: &str) -> Result<String>;

    fn write(&self, path: &str, value: &str) -> Result<()>;

    /// Reads `path` and parses the value as an unsigned decimal.
    fn read_integer(&self, path: &str) -> Result<u64>;

    /// Registers a watch on `path` and the subtree below it.
    fn watch(&self, path: &str) -> Result<Self::Watch>;

    /// Cancels the watches on `path`; their pending and future
    /// [`Store::wait`] calls return `None`.
    fn unwatch(&self, path: &str);

    /// Blocks until a watched path changes and returns it, or `None` once
    /// the watch is cancelled.
    fn wait(&self, watch: &Self::Watch) -> Option<String>;
}

/// One store event as seen by the backend watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    /// A frontend wrote a model request under [`FRONTEND_ROOT`].
    NewFrontend {
        frontend: DomainId,
        model: ModelName,
    },
    /// A frontend wrote the [`CLOSE`] sentinel.
    CloseFrontend { frontend: DomainId },
    /// Anything else, including paths whose value cannot be read back.
    Ignore,
}

/// Classifies a changed path for the backend event loop.
///
/// The value is read at classification time; a failed read downgrades the
/// event to [`StoreEvent::Ignore`].
pub fn classify<S: Store + ?Sized>(store: &S, path: &str) -> StoreEvent {
    let Some(id) = path
        .strip_prefix(FRONTEND_ROOT)
        .and_then(|rest| rest.strip_prefix('/'))
        .and_then(|rest| rest.parse::<u32>().ok())
    else {
        return StoreEvent::Ignore;
    };
    let frontend = DomainId(id);

    let Ok(value) = store.read(path) else {
        return StoreEvent::Ignore;
    };
    let token = value.split_ascii_whitespace().next().unwrap_or("");
    if token == CLOSE {
        return StoreEvent::CloseFrontend { frontend };
    }
    match ModelName::from(token) {
        Ok(model) => StoreEvent::NewFrontend { frontend, model },
        Err(_) => {
            debug!("store: domain {} requested an oversized model name", frontend);
            StoreEvent::Ignore
        }
    }
}
