//! A "wait until everyone is done" barrier, in the shape used elsewhere in
//! this codebase for gating a background task on initial-load completion:
//! a [`Completion`] handle is cloned out to every task that must finish
//! first; a [`Barrier`] resolves once every clone has been dropped.
//!
//! Built on an `mpsc` channel of capacity 1 whose only interesting property
//! is that `recv()` returns `None` once every `Sender` clone is gone -- we
//! never actually send a value.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// Held by a task that must complete before a [`Barrier`] releases its
/// waiters. Dropping the last clone releases the barrier.
#[derive(Clone)]
pub struct Completion {
    _tx: mpsc::Sender<std::convert::Infallible>,
}

/// Resolves once every [`Completion`] clone derived from the same
/// [`channel`] call has been dropped.
#[derive(Clone)]
pub struct Barrier {
    rx: Arc<Mutex<mpsc::Receiver<std::convert::Infallible>>>,
}

pub fn channel() -> (Completion, Barrier) {
    let (tx, rx) = mpsc::channel(1);
    (
        Completion { _tx: tx },
        Barrier {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl Barrier {
    pub async fn wait(&self) {
        // recv() only ever returns None here: nothing sends into this
        // channel, it exists purely to observe when every Sender is dropped.
        let mut rx = self.rx.lock().await;
        let _: Option<std::convert::Infallible> = rx.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use super::channel;
    use std::time::Duration;

    #[tokio::test]
    async fn barrier_waits_for_all_completions() {
        let (completion, barrier) = channel();
        let other = completion.clone();

        let waited = tokio::spawn({
            let barrier = barrier.clone();
            async move {
                barrier.wait().await;
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waited.is_finished());

        drop(completion);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waited.is_finished(), "barrier must wait for all clones");

        drop(other);
        tokio::time::timeout(Duration::from_millis(200), waited)
            .await
            .expect("barrier should release once all completions drop")
            .unwrap();
    }
}
