//! Backend half of the parameter-sharing protocol.
//!
//! The backend owns the canonical weights. A long-lived listener task waits
//! on the `/frontend` subtree; each arrival gets the requested model's
//! weight buffer granted page by page, with the grant list folded into a
//! two-level directory so the advertised store value stays small. Weight
//! buffers are built once per model and shared read-only across every
//! later session; per-session state lives in the registry until the
//! frontend writes `close`.

use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use core::{fmt::Write as _, ptr::NonNull};

use hashbrown::HashMap;
use log::{debug, error, info, warn};
use spin::Mutex;

use crate::{
    error::Result,
    grant::{self, GrantRef},
    model::{BackendModel, ModelName, ModelTable},
    platform::{DomainId, PAGE_SIZE, Platform},
    store::{self, Store, StoreEvent},
};

mod registry;

pub use registry::{Session, SessionRegistry};

/// Concatenated weights of one model. Built on the first request, then
/// shared read-only with every frontend of that model; never freed.
struct WeightBuffer {
    base: NonNull<u8>,
    total_pages: usize,
}

// Written once during construction, read-only afterwards; the raw base may
// travel with the service across tasks.
unsafe impl Send for WeightBuffer {}
unsafe impl Sync for WeightBuffer {}

/// Backend service: model table, per-model weight buffers, active-session
/// registry, and the store event loop.
pub struct NnpBack<P: Platform> {
    platform: Arc<P>,
    models: ModelTable<BackendModel>,
    buffers: Mutex<HashMap<ModelName, WeightBuffer>>,
    registry: Mutex<SessionRegistry>,
    watch: P::Watch,
}

impl<P: Platform> NnpBack<P> {
    /// Advertises this domain in the store and registers the frontend
    /// watch. The event loop is not started; see [`init_nnpback`].
    pub fn new(platform: Arc<P>, models: ModelTable<BackendModel>) -> Result<Self> {
        let self_id = platform.self_id();
        info!("nnpback: starting as domain {}", self_id);

        if let Err(err) = platform.write(store::BACKEND_ROOT, &format!("{}", self_id)) {
            error!("nnpback: unable to write backend id: {}", err);
        }

        let watch = match platform.watch(store::FRONTEND_ROOT) {
            Ok(watch) => watch,
            Err(err) => {
                error!("nnpback: watch on {} failed: {}", store::FRONTEND_ROOT, err);
                return Err(err);
            }
        };

        Ok(NnpBack {
            platform,
            models,
            buffers: Mutex::new(HashMap::new()),
            registry: Mutex::new(SessionRegistry::new()),
            watch,
        })
    }

    /// Runs the event loop until the frontend watch is cancelled.
    pub fn run(&self) {
        while let Some(path) = self.platform.wait(&self.watch) {
            self.handle_event(&path);
        }
    }

    /// Classifies and dispatches one changed store path.
    pub fn handle_event(&self, path: &str) {
        debug!("nnpback: store event: {}", path);
        match store::classify(&*self.platform, path) {
            StoreEvent::NewFrontend { frontend, model } => self.publish(frontend, &model),
            StoreEvent::CloseFrontend { frontend } => self.close(frontend),
            StoreEvent::Ignore => {}
        }
    }

    /// Number of live sessions.
    pub fn sessions(&self) -> usize {
        self.registry.lock().len()
    }

    /// Stops the listener and tears down every remaining session.
    pub fn shutdown(&self) {
        self.platform.unwatch(store::FRONTEND_ROOT);
        let mut registry = self.registry.lock();
        while let Some(session) = registry.pop() {
            info!(
                "nnpback: revoking session for domain {} at shutdown",
                session.frontend
            );
            self.revoke_session(session);
        }
    }

    fn publish(&self, frontend: DomainId, model: &ModelName) {
        let Some(descriptor) = self.models.get(model.as_str()) else {
            warn!(
                "nnpback: domain {} requested unknown model {:?}",
                frontend,
                model.as_str()
            );
            return;
        };
        if self.registry.lock().contains(frontend) {
            warn!(
                "nnpback: domain {} already has a live session, ignoring request",
                frontend
            );
            return;
        }

        let backend_path = store::backend_entry(frontend);
        if let Err(err) = self.platform.write(&backend_path, store::STATE_PENDING) {
            error!("nnpback: unable to seed {}: {}", backend_path, err);
        }

        let (base, total_pages) = self.buffer_for(model, descriptor);

        // Grant every weight page to the requester, and measure it.
        let started = self.platform.monotonic();
        let mut grants = Vec::with_capacity(total_pages);
        for page in 0..total_pages {
            let virt = unsafe { base.add(page * PAGE_SIZE) };
            grants.push(
                self.platform
                    .grant_read(frontend, self.platform.virt_to_mfn(virt)),
            );
        }
        let elapsed = self.platform.monotonic() - started;
        info!(
            "nnpback: granted {} pages of {} to domain {} in {} us",
            total_pages,
            model,
            frontend,
            elapsed / 1_000
        );

        let dir_pages = grant::dir_pages_for(total_pages);
        let dir = self.platform.alloc_pages(grant::alloc_order(dir_pages));
        let directory = grant::encode(&*self.platform, frontend, &grants, dir, dir_pages);

        let mut value = String::new();
        for gref in &directory {
            let _ = write!(value, "{} ", gref.0);
        }
        if value.len() > store::MAX_REFS_VALUE_LEN {
            // The session stays in the registry so a later close still
            // revokes its grants; the frontend stalls on its watch.
            error!(
                "nnpback: directory list for domain {} exceeds the store value limit",
                frontend
            );
        } else {
            let refs_path = store::grant_dir_entry(frontend);
            if let Err(err) = self.platform.write(&refs_path, &value) {
                error!("nnpback: unable to write {}: {}", refs_path, err);
            }
            let state_path = store::state_entry(frontend);
            if let Err(err) = self.platform.write(&state_path, store::STATE_READY) {
                error!("nnpback: unable to write {}: {}", state_path, err);
            }
        }

        self.registry.lock().push(Session {
            frontend,
            grants,
            directory,
        });
    }

    /// Returns the shared weight buffer for `model`, building it on first
    /// use by concatenating the tensors in descriptor order.
    fn buffer_for(&self, name: &ModelName, model: &BackendModel) -> (NonNull<u8>, usize) {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(*name).or_insert_with(|| {
            let total_bytes = model.total_bytes();
            let total_pages = total_bytes.div_ceil(PAGE_SIZE);
            let base = self.platform.alloc_pages(grant::alloc_order(total_pages));
            let mut dst = base.cast::<f32>();
            for tensor in model.tensors() {
                // The fresh buffer never aliases the source arrays.
                unsafe {
                    core::ptr::copy_nonoverlapping(tensor.as_ptr(), dst.as_ptr(), tensor.len());
                    dst = dst.add(tensor.len());
                }
            }
            debug!(
                "nnpback: built {} byte weight buffer for {}",
                total_bytes, name
            );
            WeightBuffer { base, total_pages }
        });
        (buffer.base, buffer.total_pages)
    }

    fn close(&self, frontend: DomainId) {
        let Some(session) = self.registry.lock().remove(frontend) else {
            // Close for an unknown or already-closed frontend is a no-op.
            debug!("nnpback: close from domain {} with no session", frontend);
            return;
        };
        self.revoke_session(session);
        info!("nnpback: closed session for domain {}", frontend);
    }

    fn revoke_session(&self, session: Session) {
        for gref in &session.grants {
            self.platform.revoke(*gref);
        }
        for gref in &session.directory {
            self.platform.revoke(*gref);
        }
    }

    /// Snapshot of the grants held for `frontend`: data refs, then
    /// directory refs.
    pub(crate) fn session_refs(&self, frontend: DomainId) -> Option<(Vec<GrantRef>, Vec<GrantRef>)> {
        let registry = self.registry.lock();
        let session = registry.get(frontend)?;
        Some((
            session.grants.clone(),
            session.directory.iter().copied().collect(),
        ))
    }
}

/// Initializes the backend service and starts the listener task.
pub fn init_nnpback<P: Platform>(
    platform: Arc<P>,
    models: ModelTable<BackendModel>,
) -> Result<Arc<NnpBack<P>>> {
    let back = Arc::new(NnpBack::new(Arc::clone(&platform), models)?);
    let listener = Arc::clone(&back);
    platform.spawn("nnpback-listener", Box::new(move || listener.run()));
    Ok(back)
}

/// Stops the listener and revokes everything the backend still holds.
pub fn shutdown_nnpback<P: Platform>(back: &NnpBack<P>) {
    back.shutdown();
}
