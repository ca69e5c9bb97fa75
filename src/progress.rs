//! Progress reporting for long-running diff and apply calls.

/// Receives progress from the diff engine and the patch applier.
///
/// Passed explicitly into each call; the engine keeps no global progress state.
pub trait Progress {
    /// Called once before work starts, with a short label for the stage.
    fn start(&mut self, _label: &str) {}

    /// `done` out of `total` units (bytes) have been processed.
    fn progress(&mut self, done: u64, total: u64);

    fn end(&mut self) {}
}

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn progress(&mut self, _done: u64, _total: u64) {}
}
