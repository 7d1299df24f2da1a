//! Progress reporting for the long-running passes.
//!
//! Load, fixup, inrefs-building, and reachability all accept a progress
//! sink invoked inline at fixed work intervals. All hooks default to no-ops,
//! so [`NoProgress`] costs nothing after monomorphization; callers that want
//! feedback plug in [`StderrProgress`] or their own implementation. Hooks
//! are purely informational and must not mutate the engine.

/// Hook points reported during long passes.
///
/// Counts are cumulative within a pass; `total` is `0` when the pass cannot
/// know its extent up front (the heap record stream has no length prefix).
pub trait Progress {
    /// A recoverable oddity the load worked around, e.g. format-minor
    /// drift. Never used for errors.
    fn on_warning(&mut self, message: &str) {
        let _ = message;
    }

    /// Heap records decoded so far, with the current stream position.
    fn on_load(&mut self, svs: usize, position: u64) {
        let _ = (svs, position);
    }

    /// Fixup repairs applied so far.
    fn on_fixup(&mut self, done: usize, total: usize) {
        let _ = (done, total);
    }

    /// Objects whose outrefs have been folded into the inverse index.
    fn on_inrefs(&mut self, done: usize, total: usize) {
        let _ = (done, total);
    }

    /// Objects coloured so far by the reachability walks.
    fn on_reachability(&mut self, coloured: usize, total: usize) {
        let _ = (coloured, total);
    }
}

/// Zero-cost progress sink; every hook compiles away.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {}

/// Reports pass progress to stderr, one line per interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrProgress;

impl Progress for StderrProgress {
    fn on_warning(&mut self, message: &str) {
        eprintln!("warning: {message}");
    }

    fn on_load(&mut self, svs: usize, position: u64) {
        eprintln!("load: {svs} objects ({position} bytes)");
    }

    fn on_fixup(&mut self, done: usize, total: usize) {
        eprintln!("fixup: {done}/{total}");
    }

    fn on_inrefs(&mut self, done: usize, total: usize) {
        eprintln!("inrefs: {done}/{total}");
    }

    fn on_reachability(&mut self, coloured: usize, total: usize) {
        eprintln!("reachability: {coloured}/{total}");
    }
}

/// Work interval between progress callbacks.
pub(crate) const PROGRESS_INTERVAL: usize = 4096;
