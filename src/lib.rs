//! # Zero-copy neural-network parameter sharing
//!
//! Two cooperating guest domains on a type-1 hypervisor share pretrained
//! model weights without copying them: the backend domain owns the
//! canonical arrays, and each frontend maps them read-only through the
//! hypervisor's grant facility. The two sides rendezvous through a shared
//! configuration store with per-path watches.
//!
//! The backend concatenates a model's tensors into a page-aligned buffer
//! and grants every page to the requesting frontend. Because the store
//! bounds value sizes, the grant list is published indirectly through a
//! two-level directory of granted pages. The frontend maps the directory,
//! recovers the per-page grants, maps the weights as one contiguous
//! region, and walks tensors as pointers into it.
//!
//! Hypervisor services (page allocation, the grant table, the store, the
//! thread facility, the clock) are consumed through the traits in
//! [`platform`] and [`store`]; the embedding kernel provides them.

#![cfg_attr(not(test), no_std)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[macro_use]
extern crate alloc;

#[macro_use]
extern crate bitflags;

pub mod backend;
pub mod error;
pub mod frontend;
pub mod grant;
pub mod model;
pub mod platform;
pub mod store;

#[cfg(test)]
mod testing;


pub use backend::{NnpBack, init_nnpback, shutdown_nnpback};
pub use error::{Error, Result};
pub use frontend::{NnpFront, ParamWalk, init_nnpfront, shutdown_nnpfront};
pub use grant::GrantRef;
pub use model::{BackendModel, FrontendModel, FrontendTensor, ModelName, ModelTable};
pub use platform::{DomainId, PAGE_SIZE};
