//! Model parameter tables.
//!
//! Both domains carry a table of the models they know, keyed by name. The
//! backend's entries point at the canonical weight arrays; the frontend's
//! carry only tensor names and element counts. For any given model name the
//! two sides must list tensors in the same order with the same counts,
//! because the frontend walks the shared mapping purely by those counts.

use alloc::vec::Vec;
use core::mem;

use arrayvec::ArrayString;
use hashbrown::HashMap;

/// Longest model name the protocol carries.
pub const MODEL_NAME_MAX: usize = 15;

/// A model name as it appears in store values.
pub type ModelName = ArrayString<MODEL_NAME_MAX>;

/// Name-keyed registry of models known to one side.
///
/// The entry type differs per side (`BackendModel` or `FrontendModel`);
/// dispatch on a requested name is a single lookup.
pub struct ModelTable<M> {
    entries: HashMap<ModelName, M>,
}

impl<M> ModelTable<M> {
    pub fn new() -> Self {
        ModelTable {
            entries: HashMap::new(),
        }
    }

    /// Registers `model` under `name`, replacing any previous entry.
    pub fn insert(&mut self, name: ModelName, model: M) {
        self.entries.insert(name, model);
    }

    pub fn get(&self, name: &str) -> Option<&M> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<M> Default for ModelTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// A model as the backend sees it: ordered tensors of canonical weights.
pub struct BackendModel {
    tensors: Vec<&'static [f32]>,
}

impl BackendModel {
    pub fn new(tensors: Vec<&'static [f32]>) -> Self {
        BackendModel { tensors }
    }

    /// Tensors in descriptor order.
    pub fn tensors(&self) -> &[&'static [f32]] {
        &self.tensors
    }

    /// Total element count across all tensors.
    pub fn total_elems(&self) -> usize {
        self.tensors.iter().map(|tensor| tensor.len()).sum()
    }

    /// Size of the concatenated weights, in bytes.
    pub fn total_bytes(&self) -> usize {
        self.total_elems() * mem::size_of::<f32>()
    }
}

/// One tensor as the frontend sees it: a name and an element count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrontendTensor {
    pub name: &'static str,
    pub count: usize,
}

/// A model as the frontend sees it: the walk layout without the data.
#[derive(Clone)]
pub struct FrontendModel {
    tensors: Vec<FrontendTensor>,
}

impl FrontendModel {
    pub fn new(tensors: Vec<FrontendTensor>) -> Self {
        FrontendModel { tensors }
    }

    /// Tensors in descriptor order.
    pub fn tensors(&self) -> &[FrontendTensor] {
        &self.tensors
    }

    pub fn total_elems(&self) -> usize {
        self.tensors.iter().map(|tensor| tensor.count).sum()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_elems() * mem::size_of::<f32>()
    }
}
