//! Frontend half of the parameter-sharing protocol.
//!
//! The frontend discovers the backend through the store, requests one model
//! by name, waits for the grant directory, and maps the weight pages
//! read-only into its own address space. Parameters are then walked as
//! pointers into that single contiguous mapping; nothing is copied.

use alloc::{sync::Arc, vec::Vec};
use core::ptr::NonNull;

use log::{error, info};

use crate::{
    error::{Error, Result},
    grant::{self, GrantRef},
    model::{FrontendModel, ModelTable},
    platform::{DomainId, GrantTable, MapFlags, PAGE_SIZE},
    store::{self, Store},
};

/// Frontend service: owns the read-only mapping of one model's weights.
pub struct NnpFront<P: Store + GrantTable> {
    platform: Arc<P>,
    model: FrontendModel,
    page: NonNull<f32>,
    total_pages: usize,
}

impl<P: Store + GrantTable> NnpFront<P> {
    /// Base of the mapped weight region.
    pub fn base(&self) -> NonNull<f32> {
        self.page
    }

    /// The walk layout of the mapped model.
    pub fn model(&self) -> &FrontendModel {
        &self.model
    }

    /// Walks the mapped tensors in descriptor order.
    pub fn params(&self) -> ParamWalk<'_, P> {
        ParamWalk {
            front: self,
            index: 0,
            offset: 0,
        }
    }

    /// Unmaps the weights and tells the backend to revoke its grants.
    pub fn shutdown(self) {
        self.platform.unmap(self.page.cast(), self.total_pages);

        let path = store::frontend_entry(self.platform.self_id());
        if let Err(err) = self.platform.write(&path, store::CLOSE) {
            error!("nnpfront: unable to write close to {}: {}", path, err);
        }
    }
}

/// Iterator over per-tensor base pointers into the shared mapping.
///
/// The n-th item points at the first element of the n-th tensor of the
/// model's layout; the walk yields exactly one pointer per tensor and is
/// not restartable.
pub struct ParamWalk<'a, P: Store + GrantTable> {
    front: &'a NnpFront<P>,
    index: usize,
    offset: usize,
}

impl<'a, P: Store + GrantTable> Iterator for ParamWalk<'a, P> {
    type Item = NonNull<f32>;

    fn next(&mut self) -> Option<Self::Item> {
        let tensor = self.front.model.tensors().get(self.index)?;
        let param = unsafe { self.front.page.add(self.offset) };
        self.index += 1;
        self.offset += tensor.count;
        Some(param)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.front.model.tensors().len() - self.index;
        (remaining, Some(remaining))
    }
}

impl<'a, P: Store + GrantTable> ExactSizeIterator for ParamWalk<'a, P> {}

/// Connects to the backend and maps `model` read-only.
pub fn init_nnpfront<P: Store + GrantTable>(
    platform: Arc<P>,
    models: &ModelTable<FrontendModel>,
    model: &str,
) -> Result<NnpFront<P>> {
    let self_id = platform.self_id();
    info!("nnpfront: starting as domain {}", self_id);

    let backend = match platform.read_integer(store::BACKEND_ROOT) {
        Ok(id) => match u32::try_from(id) {
            Ok(id) => DomainId(id),
            Err(_) => return Err(Error::Config),
        },
        Err(_) => {
            error!(
                "nnpfront: {} is missing or not an integer",
                store::BACKEND_ROOT
            );
            return Err(Error::Config);
        }
    };

    let descriptor = models.get(model).ok_or(Error::UnknownModel)?.clone();

    platform.write(&store::frontend_entry(self_id), model)?;

    let state_path = store::state_entry(self_id);
    let watch = platform.watch(&state_path)?;

    info!("nnpfront: waiting for backend to publish references");
    loop {
        if platform.read_integer(&state_path) == Ok(1) {
            break;
        }
        if platform.wait(&watch).is_none() {
            error!("nnpfront: state watch cancelled before backend published");
            return Err(Error::Store);
        }
    }
    platform.unwatch(&state_path);

    let total_pages = descriptor.total_bytes().div_ceil(PAGE_SIZE);
    let dir_pages = grant::dir_pages_for(total_pages);

    let refs_value = platform.read(&store::grant_dir_entry(self_id))?;
    let mut directory = Vec::with_capacity(dir_pages);
    for token in refs_value.split_ascii_whitespace() {
        let raw = token.parse::<u32>().map_err(|_| Error::Desync)?;
        directory.push(GrantRef(raw));
    }
    if directory.len() != dir_pages {
        error!(
            "nnpfront: expected {} directory refs, backend published {}",
            dir_pages,
            directory.len()
        );
        return Err(Error::Desync);
    }

    let grants = grant::decode(&*platform, backend, &directory, total_pages)?;

    let base = match platform.map_batch(backend, &grants, MapFlags::READ) {
        Some(base) => base,
        None => {
            error!(
                "nnpfront: failed to map {} weight pages from domain {}",
                total_pages, backend
            );
            return Err(Error::MapFailed);
        }
    };

    info!("nnpfront: initialization completed successfully");
    Ok(NnpFront {
        platform,
        model: descriptor,
        page: base.cast(),
        total_pages,
    })
}

/// Unmaps the weights and requests teardown.
pub fn shutdown_nnpfront<P: Store + GrantTable>(front: NnpFront<P>) {
    front.shutdown();
}
