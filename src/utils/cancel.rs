use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, never};

/// Cooperative cancellation value threaded through the restore pipeline.
///
/// Cancellation is level-triggered: once any linked [`Canceller`] fires (or
/// is dropped), every clone of the context observes it. A context may also
/// carry a deadline; children never extend the parent's deadline.
#[derive(Clone)]
pub struct Ctx {
    chans: Vec<Receiver<()>>,
    deadline: Option<Instant>,
}

impl Ctx {
    pub fn background() -> Self {
        Self {
            chans: vec![never()],
            deadline: None,
        }
    }

    /// Derive a child that can be cancelled independently of the parent.
    pub fn cancelable(parent: &Ctx) -> (Ctx, Canceller) {
        let (tx, rx) = bounded::<()>(0);
        let mut chans = parent.chans.clone();
        chans.push(rx);
        (
            Ctx {
                chans,
                deadline: parent.deadline,
            },
            Canceller {
                tx: Mutex::new(Some(tx)),
            },
        )
    }

    /// Derive a child whose deadline is at most `timeout` from now.
    pub fn with_timeout(parent: &Ctx, timeout: Duration) -> Ctx {
        let mine = Instant::now() + timeout;
        let deadline = match parent.deadline {
            Some(d) if d < mine => Some(d),
            _ => Some(mine),
        };
        Ctx {
            chans: parent.chans.clone(),
            deadline,
        }
    }

    /// True once a linked canceller fired. Deadline expiry is reported
    /// separately via [`Ctx::deadline_expired`].
    pub fn cancelled(&self) -> bool {
        self.chans.iter().any(|rx| match rx.try_recv() {
            Ok(()) => true,
            Err(crossbeam_channel::TryRecvError::Disconnected) => true,
            Err(crossbeam_channel::TryRecvError::Empty) => false,
        })
    }

    pub fn deadline_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Cancelled or past the deadline.
    pub fn done(&self) -> bool {
        self.cancelled() || self.deadline_expired()
    }

    /// Time left until the deadline; `None` when no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Fires the linked [`Ctx`]. Dropping an un-fired canceller also cancels.
pub struct Canceller {
    tx: Mutex<Option<Sender<()>>>,
}

impl Canceller {
    pub fn cancel(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_never_done() {
        let ctx = Ctx::background();
        assert!(!ctx.cancelled());
        assert!(!ctx.done());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn cancel_propagates_to_clones_and_children() {
        let root = Ctx::background();
        let (ctx, cancel) = Ctx::cancelable(&root);
        let clone = ctx.clone();
        let (child, _child_cancel) = Ctx::cancelable(&ctx);

        assert!(!ctx.cancelled());
        cancel.cancel();
        assert!(ctx.cancelled());
        assert!(clone.cancelled());
        assert!(child.cancelled());
        assert!(!root.cancelled());
    }

    #[test]
    fn child_cancel_leaves_parent_alone() {
        let root = Ctx::background();
        let (parent, _keep) = Ctx::cancelable(&root);
        let (child, cancel) = Ctx::cancelable(&parent);
        cancel.cancel();
        assert!(child.cancelled());
        assert!(!parent.cancelled());
    }

    #[test]
    fn drop_cancels() {
        let root = Ctx::background();
        let (ctx, cancel) = Ctx::cancelable(&root);
        drop(cancel);
        assert!(ctx.cancelled());
    }

    #[test]
    fn timeout_expires() {
        let root = Ctx::background();
        let ctx = Ctx::with_timeout(&root, Duration::from_millis(0));
        assert!(ctx.deadline_expired());
        assert!(ctx.done());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn child_never_extends_parent_deadline() {
        let root = Ctx::background();
        let short = Ctx::with_timeout(&root, Duration::from_millis(0));
        let long = Ctx::with_timeout(&short, Duration::from_secs(3600));
        assert!(long.deadline_expired());
    }
}
