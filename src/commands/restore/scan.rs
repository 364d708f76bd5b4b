use std::sync::Mutex;

use crate::utils::cancel::{Canceller, Ctx};

/// Drives the background archive scanner on slow remote mounts. Starting
/// a new scan cancels the previous one; finishing a stale scan leaves the
/// active one alone. The single mutex below is the only shared mutable
/// state in the restore core.
#[derive(Default)]
pub struct ScanController {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_generation: u64,
    active: Option<ActiveScan>,
}

struct ActiveScan {
    generation: u64,
    canceller: Canceller,
}

/// Identifies one started scan; hand it back to [`ScanController::finish`].
#[derive(Debug, Clone, Copy)]
pub struct ScanToken {
    generation: u64,
}

impl ScanController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel whatever scan is running and hand out a child context for a
    /// new one.
    pub fn start(&self, parent: &Ctx) -> (Ctx, ScanToken) {
        let mut state = self.state.lock().unwrap();
        if let Some(prev) = state.active.take() {
            prev.canceller.cancel();
        }
        let (ctx, canceller) = Ctx::cancelable(parent);
        state.next_generation += 1;
        let generation = state.next_generation;
        state.active = Some(ActiveScan {
            generation,
            canceller,
        });
        (ctx, ScanToken { generation })
    }

    /// Mark a scan as completed. A stale token (superseded scan) is a
    /// no-op for the active one.
    pub fn finish(&self, token: ScanToken) {
        let mut state = self.state.lock().unwrap();
        if state
            .active
            .as_ref()
            .is_some_and(|a| a.generation == token.generation)
        {
            state.active = None;
        }
    }

    /// Cancel the currently active scan, if any.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(active) = state.active.take() {
            active.canceller.cancel();
        }
    }
}
