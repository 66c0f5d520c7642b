//! DGC lifecycle events and results

use dso_common::ObjectIdSet;
use serde::Serialize;
use std::time::{Duration, SystemTime};

/// Which pass produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GcKind {
    /// Every record is a candidate
    Full,
    /// Only objects created since the last young pass are candidates
    YoungGen,
}

/// Running counters of an in-progress pass, handed to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GarbageCollectionInfo {
    /// Pass number, starting at 1
    pub iteration: u64,
    /// Pass kind
    pub kind: GcKind,
    /// Wall-clock start
    pub start: SystemTime,
    /// Records considered
    pub candidates: usize,
    /// Candidates proven reachable so far
    pub marked: usize,
    /// Candidates saved by the rescue phase
    pub rescued: usize,
}

/// Published at the end of every pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DgcResultContext {
    /// Pass number
    pub iteration: u64,
    /// Pass kind
    pub kind: GcKind,
    /// Removed ids, sorted
    pub collected: ObjectIdSet,
    /// Records considered
    pub candidates: usize,
    /// Candidates found reachable
    pub marked: usize,
    /// Candidates saved by the rescue phase
    pub rescued: usize,
    /// Unmarked candidates that stayed because they were checked out
    pub skipped_checked_out: usize,
    /// Wall-clock start
    pub pass_start: SystemTime,
    /// Wall-clock end
    pub pass_end: SystemTime,
    /// Monotonic duration
    pub elapsed: Duration,
}

impl DgcResultContext {
    /// Number of collected ids.
    pub fn collected_count(&self) -> usize {
        self.collected.len()
    }
}

/// Observer of DGC passes. Every hook defaults to a no-op.
pub trait GarbageCollectorEventListener: Send + Sync {
    /// A pass has taken the collector out of `Sleep`.
    fn gc_started(&self, _info: &GarbageCollectionInfo) {}

    /// Marking from the seed set finished.
    fn mark_completed(&self, _info: &GarbageCollectionInfo) {}

    /// Mutations are paused and references added mid-pass are marked.
    fn rescue_completed(&self, _info: &GarbageCollectionInfo) {}

    /// Records are about to be removed.
    fn delete_started(&self, _info: &GarbageCollectionInfo) {}

    /// The pass is over; `result.collected` is final.
    fn gc_completed(&self, _result: &DgcResultContext) {}
}

/// Republishes lifecycle events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcLogger {
    verbose: bool,
}

impl GcLogger {
    /// With `verbose`, intermediate phases log at info instead of debug.
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    fn phase(&self, phase: &str, info: &GarbageCollectionInfo) {
        if self.verbose {
            tracing::info!(
                target: "dso::gc",
                iteration = info.iteration,
                kind = ?info.kind,
                candidates = info.candidates,
                marked = info.marked,
                rescued = info.rescued,
                "DGC {phase}"
            );
        } else {
            tracing::debug!(
                target: "dso::gc",
                iteration = info.iteration,
                kind = ?info.kind,
                candidates = info.candidates,
                marked = info.marked,
                rescued = info.rescued,
                "DGC {phase}"
            );
        }
    }
}

impl GarbageCollectorEventListener for GcLogger {
    fn gc_started(&self, info: &GarbageCollectionInfo) {
        self.phase("started", info);
    }

    fn mark_completed(&self, info: &GarbageCollectionInfo) {
        self.phase("mark complete", info);
    }

    fn rescue_completed(&self, info: &GarbageCollectionInfo) {
        self.phase("rescue complete", info);
    }

    fn delete_started(&self, info: &GarbageCollectionInfo) {
        self.phase("delete started", info);
    }

    fn gc_completed(&self, result: &DgcResultContext) {
        tracing::info!(
            target: "dso::gc",
            iteration = result.iteration,
            kind = ?result.kind,
            candidates = result.candidates,
            marked = result.marked,
            rescued = result.rescued,
            collected = result.collected.len(),
            elapsed_us = result.elapsed.as_micros() as u64,
            "DGC cycle complete"
        );
    }
}
