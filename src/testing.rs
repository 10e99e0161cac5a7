//! In-memory hypervisor for exercising the protocol end to end.
//!
//! One [`Hypervisor`] stands in for the machine: the shared store with its
//! watches, the grant table, and the page-frame space. Each side of a test
//! holds a [`MockDomain`] carrying its own domain id, so both services run
//! against the same world the way two guests share one hypervisor. Watches
//! are mpsc channels and the thread facility is `std::thread`, which lets
//! the backend listener block exactly like the cooperative task it models.
//!
//! `map_batch` materializes mappings by copying the granted pages into a
//! fresh contiguous region. The protocol only ever maps pages that are
//! read-only after publication, so tests observe the same bytes a real
//! shared mapping would.

use std::{
    alloc::{Layout, alloc_zeroed, dealloc},
    collections::HashMap,
    ptr::NonNull,
    sync::{
        Arc, Mutex,
        mpsc::{Receiver, Sender, channel},
    },
    thread,
};

use crate::{
    error::{Error, Result},
    grant::GrantRef,
    model::{BackendModel, FrontendModel, FrontendTensor},
    platform::{Clock, DomainId, GrantTable, MapFlags, Mfn, PAGE_SIZE, PageFrames, Threads},
    store::Store,
};

struct WatchEntry {
    path: String,
    tx: Sender<String>,
}

#[derive(Default)]
struct StoreState {
    values: HashMap<String, String>,
    watches: Vec<WatchEntry>,
}

struct GrantEntry {
    mfn: Mfn,
    to: DomainId,
    revoked: bool,
}

#[derive(Default)]
struct GrantState {
    next: u32,
    entries: HashMap<u32, GrantEntry>,
}

#[derive(Default)]
struct FrameState {
    next_mfn: usize,
    by_mfn: HashMap<usize, usize>,
    by_addr: HashMap<usize, usize>,
    alloc_calls: usize,
}

/// The shared world of one test: store, grant table, page frames, clock,
/// and the threads spawned through the mock.
pub struct Hypervisor {
    store: Mutex<StoreState>,
    grants: Mutex<GrantState>,
    frames: Mutex<FrameState>,
    mappings: Mutex<HashMap<usize, Layout>>,
    clock: Mutex<u128>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Hypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Hypervisor {
            store: Mutex::new(StoreState::default()),
            grants: Mutex::new(GrantState::default()),
            frames: Mutex::new(FrameState::default()),
            mappings: Mutex::new(HashMap::new()),
            clock: Mutex::new(0),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// A handle on this world for the domain `id`.
    pub fn domain(self: &Arc<Self>, id: u32) -> Arc<MockDomain> {
        Arc::new(MockDomain {
            id: DomainId(id),
            hv: Arc::clone(self),
        })
    }

    /// Joins every thread spawned through the mock thread facility.
    pub fn join_threads(&self) {
        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    /// Grant references issued and not yet revoked, in ascending order.
    pub fn outstanding_grants(&self) -> Vec<GrantRef> {
        let grants = self.grants.lock().unwrap();
        let mut refs: Vec<GrantRef> = grants
            .entries
            .iter()
            .filter(|(_, entry)| !entry.revoked)
            .map(|(raw, _)| GrantRef(*raw))
            .collect();
        refs.sort_by_key(|gref| gref.0);
        refs
    }

    pub fn is_revoked(&self, gref: GrantRef) -> bool {
        self.grants.lock().unwrap().entries[&gref.0].revoked
    }

    /// Machine frame a grant reference points at.
    pub fn granted_mfn(&self, gref: GrantRef) -> Mfn {
        self.grants.lock().unwrap().entries[&gref.0].mfn
    }

    /// Number of `alloc_pages` calls made so far.
    pub fn alloc_calls(&self) -> usize {
        self.frames.lock().unwrap().alloc_calls
    }

    pub fn store_value(&self, path: &str) -> Option<String> {
        self.store.lock().unwrap().values.get(path).cloned()
    }
}

/// One domain's view of the [`Hypervisor`].
pub struct MockDomain {
    id: DomainId,
    hv: Arc<Hypervisor>,
}

pub struct MockWatch {
    rx: Mutex<Receiver<String>>,
}

impl Store for MockDomain {
    type Watch = MockWatch;

    fn self_id(&self) -> DomainId {
        self.id
    }

    fn read(&self, path: &str) -> Result<String> {
        self.hv
            .store
            .lock()
            .unwrap()
            .values
            .get(path)
            .cloned()
            .ok_or(Error::Store)
    }

    fn write(&self, path: &str, value: &str) -> Result<()> {
        let mut store = self.hv.store.lock().unwrap();
        store.values.insert(path.to_string(), value.to_string());
        store.watches.retain(|watch| {
            let fires = path == watch.path
                || (path.starts_with(&watch.path)
                    && path.as_bytes().get(watch.path.len()) == Some(&b'/'));
            // A send failure means the receiver is gone; drop the watch.
            !fires || watch.tx.send(path.to_string()).is_ok()
        });
        Ok(())
    }

    fn read_integer(&self, path: &str) -> Result<u64> {
        self.read(path)?.trim().parse().map_err(|_| Error::Store)
    }

    fn watch(&self, path: &str) -> Result<MockWatch> {
        let (tx, rx) = channel();
        self.hv.store.lock().unwrap().watches.push(WatchEntry {
            path: path.to_string(),
            tx,
        });
        Ok(MockWatch { rx: Mutex::new(rx) })
    }

    fn unwatch(&self, path: &str) {
        self.hv
            .store
            .lock()
            .unwrap()
            .watches
            .retain(|watch| watch.path != path);
    }

    fn wait(&self, watch: &MockWatch) -> Option<String> {
        watch.rx.lock().unwrap().recv().ok()
    }
}

impl PageFrames for MockDomain {
    fn alloc_pages(&self, order: u32) -> NonNull<u8> {
        let pages = 1usize << order;
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("mock page allocator oom");

        let mut frames = self.hv.frames.lock().unwrap();
        frames.alloc_calls += 1;
        for page in 0..pages {
            let addr = base.as_ptr() as usize + page * PAGE_SIZE;
            let mfn = frames.next_mfn;
            frames.next_mfn += 1;
            frames.by_mfn.insert(mfn, addr);
            frames.by_addr.insert(addr, mfn);
        }
        base
    }

    fn virt_to_mfn(&self, virt: NonNull<u8>) -> Mfn {
        let frames = self.hv.frames.lock().unwrap();
        Mfn(*frames
            .by_addr
            .get(&(virt.as_ptr() as usize))
            .expect("virt_to_mfn: address is not an allocated page"))
    }
}

impl GrantTable for MockDomain {
    fn grant_read(&self, to: DomainId, mfn: Mfn) -> GrantRef {
        let mut grants = self.hv.grants.lock().unwrap();
        grants.next += 1;
        let raw = grants.next;
        grants.entries.insert(
            raw,
            GrantEntry {
                mfn,
                to,
                revoked: false,
            },
        );
        GrantRef(raw)
    }

    fn revoke(&self, gref: GrantRef) {
        let mut grants = self.hv.grants.lock().unwrap();
        let entry = grants
            .entries
            .get_mut(&gref.0)
            .expect("revoke: unknown grant reference");
        assert!(!entry.revoked, "grant reference {} revoked twice", gref.0);
        entry.revoked = true;
    }

    fn map_batch(
        &self,
        _from: DomainId,
        refs: &[GrantRef],
        _flags: MapFlags,
    ) -> Option<NonNull<u8>> {
        if refs.is_empty() {
            return None;
        }

        let grants = self.hv.grants.lock().unwrap();
        let frames = self.hv.frames.lock().unwrap();

        let mut sources = Vec::with_capacity(refs.len());
        for gref in refs {
            let entry = grants.entries.get(&gref.0)?;
            if entry.revoked || entry.to != self.id {
                return None;
            }
            sources.push(*frames.by_mfn.get(&entry.mfn.0)?);
        }

        let layout = Layout::from_size_align(refs.len() * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        for (page, src) in sources.into_iter().enumerate() {
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src as *const u8,
                    base.as_ptr().add(page * PAGE_SIZE),
                    PAGE_SIZE,
                );
            }
        }

        self.hv
            .mappings
            .lock()
            .unwrap()
            .insert(base.as_ptr() as usize, layout);
        Some(base)
    }

    fn unmap(&self, base: NonNull<u8>, pages: usize) {
        let layout = self
            .hv
            .mappings
            .lock()
            .unwrap()
            .remove(&(base.as_ptr() as usize))
            .expect("unmap: base is not a live mapping");
        assert_eq!(layout.size(), pages * PAGE_SIZE);
        unsafe { dealloc(base.as_ptr(), layout) };
    }
}

impl Clock for MockDomain {
    fn monotonic(&self) -> u128 {
        let mut now = self.hv.clock.lock().unwrap();
        *now += 1_000;
        *now
    }
}

impl Threads for MockDomain {
    fn spawn(&self, name: &'static str, entry: Box<dyn FnOnce() + Send>) {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(entry)
            .unwrap();
        self.hv.threads.lock().unwrap().push(handle);
    }
}

/// Leaks `values` into a `'static` tensor, the shape generated weight
/// tables have.
pub fn tensor(values: Vec<f32>) -> &'static [f32] {
    Box::leak(values.into_boxed_slice())
}

/// Builds a matching backend/frontend descriptor pair. Element `k` of the
/// concatenated weights holds `seed + k`, so mapped bytes are recognizable.
pub fn model_fixture(
    layout: &[(&'static str, usize)],
    seed: f32,
) -> (BackendModel, FrontendModel) {
    let mut backend = Vec::new();
    let mut frontend = Vec::new();
    let mut position = seed;
    for &(name, count) in layout {
        backend.push(tensor((0..count).map(|i| position + i as f32).collect()));
        position += count as f32;
        frontend.push(FrontendTensor { name, count });
    }
    (BackendModel::new(backend), FrontendModel::new(frontend))
}
