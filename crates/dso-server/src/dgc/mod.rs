//! Distributed garbage collector
//!
//! Mark-and-sweep over the managed object graph that runs while mutations
//! continue. A pass goes through the collector states
//! `Sleep -> Running -> Pausing -> Paused -> Delete -> Sleep`:
//!
//! 1. Start recording newly added references, then snapshot the candidates
//! 2. Mark: breadth-first over forward references from the seed set
//!    (roots, checked-out ids, ids held by clients)
//! 3. Pause: block mutations; the store is now quiet
//! 4. Rescue: mark from everything referenced since step 1, plus the
//!    current checked-out and client-held ids
//! 5. Delete: remove unmarked candidates nobody has checked out, cascading
//!    to children left without parents
//!
//! A young-generation pass uses the objects created since the last young
//! pass as candidates and seeds from every candidate that something outside
//! the candidate set can still reach. It may leave dead objects for the next
//! full pass but never removes a live one.

pub mod change_collector;
pub mod events;
pub mod thread;

pub use change_collector::{NewReferenceCollector, YoungGenChangeCollector};
pub use events::{
    DgcResultContext, GarbageCollectionInfo, GarbageCollectorEventListener, GcKind, GcLogger,
};
pub use thread::GcThread;

use crate::client_state::ClientStateManager;
use crate::store::{ObjectStore, RemoveOutcome};
use dso_common::{DsoError, DsoResult, ObjectId, ObjectIdSet};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

/// Collector lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum GcState {
    /// Collection switched off
    Disabled = 0,
    /// Idle, a pass may start
    Sleep = 1,
    /// Marking
    Running = 2,
    /// Waiting for in-flight mutations to drain
    Pausing = 3,
    /// Mutations drained; rescue in progress
    Paused = 4,
    /// Removing garbage
    Delete = 5,
}

impl From<u8> for GcState {
    fn from(v: u8) -> Self {
        match v {
            0 => GcState::Disabled,
            1 => GcState::Sleep,
            2 => GcState::Running,
            3 => GcState::Pausing,
            4 => GcState::Paused,
            _ => GcState::Delete,
        }
    }
}

/// The distributed mark-and-sweep collector.
pub struct MarkAndSweepGarbageCollector {
    store: Arc<ObjectStore>,
    client_state: Arc<ClientStateManager>,
    state: AtomicU8,
    started: AtomicBool,
    iteration: AtomicU64,
    listeners: RwLock<Vec<Arc<dyn GarbageCollectorEventListener>>>,
    last_result: Mutex<Option<DgcResultContext>>,
    total_collected: AtomicU64,
}

impl std::fmt::Debug for MarkAndSweepGarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkAndSweepGarbageCollector")
            .field("state", &self.state())
            .field("started", &self.is_started())
            .field("iteration", &self.iteration())
            .finish_non_exhaustive()
    }
}

impl MarkAndSweepGarbageCollector {
    /// Create a collector. It stays unusable until [`start`](Self::start).
    pub fn new(store: Arc<ObjectStore>, client_state: Arc<ClientStateManager>, enabled: bool) -> Self {
        let state = if enabled {
            GcState::Sleep
        } else {
            GcState::Disabled
        };
        Self {
            store,
            client_state,
            state: AtomicU8::new(state as u8),
            started: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
            last_result: Mutex::new(None),
            total_collected: AtomicU64::new(0),
        }
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: Arc<dyn GarbageCollectorEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Allow passes to run.
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Refuse further passes. A running pass finishes.
    pub fn stop(&self) {
        self.started.store(false, Ordering::Release);
    }

    /// Whether [`start`](Self::start) was called and not undone.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Current state.
    pub fn state(&self) -> GcState {
        GcState::from(self.state.load(Ordering::Acquire))
    }

    /// Passes run so far.
    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Acquire)
    }

    /// Ids collected over the collector's lifetime.
    pub fn total_collected(&self) -> u64 {
        self.total_collected.load(Ordering::Relaxed)
    }

    /// Result of the most recent pass.
    pub fn last_result(&self) -> Option<DgcResultContext> {
        self.last_result.lock().clone()
    }

    fn transition(&self, from: GcState, to: GcState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Turn collection off. Only possible while idle.
    pub fn disable(&self) -> bool {
        self.transition(GcState::Sleep, GcState::Disabled)
    }

    /// Turn collection back on.
    pub fn enable(&self) -> bool {
        self.transition(GcState::Disabled, GcState::Sleep)
    }

    /// Claim the collector for a pass. Fails unless started and asleep.
    pub fn request_gc_start(&self) -> bool {
        self.is_started() && self.transition(GcState::Sleep, GcState::Running)
    }

    /// Ask mutations to drain.
    pub fn request_gc_pause(&self) -> bool {
        self.transition(GcState::Running, GcState::Pausing)
    }

    /// Called once no mutation is in flight.
    pub fn notify_ready_to_gc(&self) -> bool {
        self.transition(GcState::Pausing, GcState::Paused)
    }

    fn notify_delete_started(&self) -> bool {
        self.transition(GcState::Paused, GcState::Delete)
    }

    /// Return to `Sleep` after a pass, however it ended.
    pub fn notify_gc_complete(&self) {
        self.state.store(GcState::Sleep as u8, Ordering::Release);
    }

    /// Whether mutations are currently held off.
    pub fn is_paused(&self) -> bool {
        matches!(self.state(), GcState::Paused | GcState::Delete)
    }

    fn fire(&self, event: impl Fn(&dyn GarbageCollectorEventListener)) {
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            event(listener.as_ref());
        }
    }

    /// Run a full pass.
    pub fn gc(&self) -> DsoResult<DgcResultContext> {
        self.collect(GcKind::Full)
    }

    /// Run a young-generation pass.
    pub fn gc_young(&self) -> DsoResult<DgcResultContext> {
        self.collect(GcKind::YoungGen)
    }

    /// Run one pass of the given kind.
    pub fn collect(&self, kind: GcKind) -> DsoResult<DgcResultContext> {
        if kind == GcKind::YoungGen && !self.store.young_gen().is_enabled() {
            return Err(DsoError::GcBusy);
        }
        if !self.request_gc_start() {
            return Err(DsoError::GcBusy);
        }
        let _sleep = scopeguard::guard((), |_| self.notify_gc_complete());

        let timer = Instant::now();
        let pass_start = SystemTime::now();
        let iteration = self.iteration.fetch_add(1, Ordering::AcqRel) + 1;
        let store = &self.store;

        store.new_references().start_monitoring();
        let _monitor = scopeguard::guard((), |_| store.new_references().stop_monitoring());

        let candidates = match kind {
            GcKind::Full => store.all_object_ids(),
            GcKind::YoungGen => store
                .young_gen()
                .candidates()
                .iter()
                .filter(|id| store.contains(*id))
                .collect(),
        };
        let mut info = GarbageCollectionInfo {
            iteration,
            kind,
            start: pass_start,
            candidates: candidates.len(),
            marked: 0,
            rescued: 0,
        };

        tracing::debug!(
            target: "dso::gc",
            iteration,
            kind = ?kind,
            candidates = candidates.len(),
            "DGC cycle starting"
        );
        self.fire(|l| l.gc_started(&info));

        // Phase 1: mark from the seed set
        let mut marked = ObjectIdSet::new();
        let seeds = self.seed_set(kind, &candidates);
        self.mark_from(seeds.iter(), &candidates, &mut marked);
        info.marked = marked.len();
        self.fire(|l| l.mark_completed(&info));

        // Phase 2: pause mutations
        self.request_gc_pause();
        let paused = store.pause_mutations();
        self.notify_ready_to_gc();

        // Phase 3: rescue whatever was linked, pinned or handed out meanwhile
        let mut rescue = store.new_references().take();
        rescue.union_with(&store.checked_out_ids());
        self.client_state.add_all_referenced_ids_to(&mut rescue);
        let before = marked.len();
        self.mark_from(rescue.iter(), &candidates, &mut marked);
        info.rescued = marked.len() - before;
        info.marked = marked.len();
        self.fire(|l| l.rescue_completed(&info));

        // Phase 4: delete
        self.notify_delete_started();
        self.fire(|l| l.delete_started(&info));
        let (collected, skipped_checked_out) = {
            let _sweep = store.begin_sweep();
            self.sweep(&candidates, &marked, &rescue)
        };
        drop(paused);

        match kind {
            GcKind::Full => store.young_gen().remove_garbage(&collected),
            GcKind::YoungGen => store.young_gen().promote(&candidates),
        }
        self.client_state.remove_collected(&collected);

        if skipped_checked_out > 0 {
            tracing::warn!(
                target: "dso::gc",
                iteration,
                skipped = skipped_checked_out,
                outstanding_checkouts = store.outstanding_checkouts(),
                "unreachable objects kept alive by outstanding checkouts"
            );
        }

        let elapsed = timer.elapsed();
        let result = DgcResultContext {
            iteration,
            kind,
            collected,
            candidates: info.candidates,
            marked: info.marked,
            rescued: info.rescued,
            skipped_checked_out,
            pass_start,
            pass_end: SystemTime::now(),
            elapsed,
        };
        self.total_collected
            .fetch_add(result.collected.len() as u64, Ordering::Relaxed);

        tracing::info!(
            target: "dso::gc",
            iteration,
            kind = ?kind,
            candidates = result.candidates,
            marked = result.marked,
            rescued = result.rescued,
            collected = result.collected.len(),
            elapsed_us = elapsed.as_micros() as u64,
            "DGC cycle complete"
        );

        *self.last_result.lock() = Some(result.clone());
        self.fire(|l| l.gc_completed(&result));
        Ok(result)
    }

    /// Candidates that must be assumed live before any traversal.
    fn seed_set(&self, kind: GcKind, candidates: &ObjectIdSet) -> ObjectIdSet {
        let store = &self.store;
        let mut seeds = ObjectIdSet::new();
        seeds.extend(store.roots().root_ids());
        seeds.union_with(&store.checked_out_ids());
        self.client_state.add_all_referenced_ids_to(&mut seeds);

        if kind == GcKind::YoungGen {
            // Anything reachable from the old generation stays
            for id in candidates.iter() {
                let parents = store.back_refs().parents_of(id);
                if parents.iter().any(|parent| !candidates.contains(*parent)) {
                    seeds.insert(id);
                }
            }
        }
        seeds
    }

    /// Breadth-first marking restricted to `candidates`.
    fn mark_from(
        &self,
        seeds: impl Iterator<Item = ObjectId>,
        candidates: &ObjectIdSet,
        marked: &mut ObjectIdSet,
    ) {
        let mut queue: VecDeque<ObjectId> = seeds
            .filter(|id| candidates.contains(*id) && marked.insert(*id))
            .collect();

        while let Some(id) = queue.pop_front() {
            let Some(children) = self.store.references_of(id) else {
                continue;
            };
            for child in children {
                if candidates.contains(child) && marked.insert(child) {
                    queue.push_back(child);
                }
            }
        }
    }

    /// Remove unmarked candidates and cascade to orphaned children.
    fn sweep(
        &self,
        candidates: &ObjectIdSet,
        marked: &ObjectIdSet,
        rescue: &ObjectIdSet,
    ) -> (ObjectIdSet, usize) {
        let store = &self.store;
        let mut collected = ObjectIdSet::new();
        let mut skipped = 0;
        let mut worklist: Vec<ObjectId> = candidates
            .iter()
            .filter(|id| !marked.contains(*id))
            .collect();

        while let Some(id) = worklist.pop() {
            if collected.contains(id) {
                continue;
            }
            match store.remove_if_collectable(id) {
                RemoveOutcome::Removed(children) => {
                    collected.insert(id);
                    for child in children {
                        if child != id
                            && !collected.contains(child)
                            && !marked.contains(child)
                            && !candidates.contains(child)
                            && self.is_orphan(child, rescue)
                        {
                            worklist.push(child);
                        }
                    }
                }
                RemoveOutcome::CheckedOut => {
                    skipped += 1;
                    tracing::debug!(target: "dso::gc", id = id.to_u64(), "skipping checked-out object");
                }
                // Already removed through another path
                RemoveOutcome::Missing => {}
            }
        }
        (collected, skipped)
    }

    /// A non-candidate child whose last parent was just removed.
    fn is_orphan(&self, id: ObjectId, rescue: &ObjectIdSet) -> bool {
        let store = &self.store;
        store.contains(id)
            && !store.back_refs().has_parents(id)
            && !store.roots().is_root(id)
            && !rescue.contains(id)
    }
}
