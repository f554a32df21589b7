//! Per-transport worker task handles and the control-signal channel.
//!
//! Each transport owns up to two of these (`thread_enc`, `thread_dec`),
//! one per IO direction.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{Result, TransportError, TransportInternalError};

const SIGNAL_QUEUE_DEPTH: usize = 16;

/// Control signals delivered over a worker's signal channel, in the
/// exact order named in the external-interfaces contract.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Signal {
    Ping,
    PcmOpen,
    PcmClose,
    PcmPause,
    PcmResume,
    PcmSync,
    PcmDrop,
    HfpSetCodecCvsd,
    HfpSetCodecMsbc,
}

/// Identity of one worker task plus its control channel and readiness
/// rendezvous. The `None` state of `join` is the "not running" sentinel
/// that replaces the main-thread-identity comparison the reference
/// implementation uses.
pub struct WorkerHandle {
    join: AsyncMutex<Option<JoinHandle<()>>>,
    tx: AsyncMutex<Option<mpsc::Sender<Signal>>>,
    ready: Arc<Notify>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle").finish_non_exhaustive()
    }
}

impl Default for WorkerHandle {
    fn default() -> Self {
        Self {
            join: AsyncMutex::new(None),
            tx: AsyncMutex::new(None),
            ready: Arc::new(Notify::new()),
        }
    }
}

impl WorkerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// `create(Th, routine, name)`: spawns `body` as a task fed by a
    /// fresh signal channel, waits for it to call `ready()`.
    ///
    /// `body` receives the signal receiver and a `Notify` handle it must
    /// call `notify_one()` on once initialization completes, mirroring
    /// `ready(Th)` setting `running=true` and signalling the condvar.
    pub async fn create<F, Fut>(&self, name: &'static str, body: F) -> Result<()>
    where
        F: FnOnce(mpsc::Receiver<Signal>, Arc<Notify>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut join_guard = self.join.lock().await;
        if join_guard.is_some() {
            return Err(TransportError::InvalidArg(format!(
                "worker `{name}` is already running"
            )));
        }
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_DEPTH);
        let ready = self.ready.clone();
        let notified = ready.notified();
        let handle = tokio::spawn(body(rx, ready.clone()).instrument(tracing::info_span!("worker", name)));
        notified.await;
        *join_guard = Some(handle);
        *self.tx.lock().await = Some(tx);
        Ok(())
    }

    /// `cancel(Th)`: synchronous stop-and-join. A no-op if the worker
    /// isn't running. Shutdown is cooperative, not `abort()`-based:
    /// dropping the signal sender makes the worker's next (or current)
    /// `rx.recv()` resolve to `None`, and the worker runs its cleanup
    /// sequence inline before returning. Because nothing here forces
    /// the task, the join below only resolves once that cleanup has
    /// actually completed, so the caller can rely on the transport
    /// being fully released by the time `cancel` returns.
    pub async fn cancel(&self) {
        let handle = self.join.lock().await.take();
        *self.tx.lock().await = None;
        if let Some(handle) = handle {
            match handle.await {
                Ok(()) => {}
                Err(err) => {
                    tracing::error!(target: "worker", "worker task panicked: {err}");
                }
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.join.lock().await.is_some()
    }

    /// Enqueues a control signal on this worker's pipe. FIFO-ordered,
    /// visible to the worker no later than its next poll iteration.
    pub async fn send(&self, signal: Signal) -> Result<()> {
        let guard = self.tx.lock().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(signal)
                .await
                .map_err(|_| TransportError::NoThread),
            None => Err(TransportError::NoThread),
        }
    }
}

/// Acknowledges the worker's control-plane creator: the task's first
/// action is always this call.
pub async fn ready(notify: &Notify) {
    notify.notify_one();
}

/// Guards the IO routine's cleanup contract. On the ordinary exit path
/// the worker body calls [`WorkerCleanupGuard::disarm`] and awaits the
/// release sequence itself, so it completes before the task returns and
/// therefore before [`WorkerHandle::cancel`]'s join resolves. The
/// `Drop` path below only fires if the worker body exits some other way
/// (a panic mid-loop); `Drop` cannot `.await`, so that fallback can
/// only detach the release work onto a new task rather than block on
/// it.
pub struct WorkerCleanupGuard<T> {
    guarded: Option<T>,
    on_drop: Option<Box<dyn FnOnce(T) + Send>>,
}

impl<T> WorkerCleanupGuard<T> {
    pub fn new(guarded: T, on_drop: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            guarded: Some(guarded),
            on_drop: Some(Box::new(on_drop)),
        }
    }

    pub fn disarm(mut self) -> T {
        self.on_drop = None;
        self.guarded.take().expect("guard used after disarm")
    }
}

impl<T> Drop for WorkerCleanupGuard<T> {
    fn drop(&mut self) {
        if let (Some(guarded), Some(on_drop)) = (self.guarded.take(), self.on_drop.take()) {
            on_drop(guarded);
        }
    }
}

impl From<TransportInternalError> for TransportError {
    fn from(err: TransportInternalError) -> Self {
        TransportError::Internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn create_twice_without_cancel_is_rejected() {
        let handle = WorkerHandle::new();
        handle
            .create("probe", |mut rx, ready| async move {
                ready.notify_one();
                while rx.recv().await.is_some() {}
            })
            .await
            .unwrap();
        assert!(handle.is_running().await);

        let err = handle
            .create("probe", |mut rx, ready| async move {
                ready.notify_one();
                while rx.recv().await.is_some() {}
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidArg(_)));

        handle.cancel().await;
        assert!(!handle.is_running().await);
    }

    #[tokio::test]
    async fn cancel_waits_for_cooperative_cleanup_to_finish() {
        let handle = WorkerHandle::new();
        let cleaned_up = Arc::new(AtomicBool::new(false));
        let cleaned_up_worker = cleaned_up.clone();
        handle
            .create("probe", move |mut rx, ready| async move {
                ready.notify_one();
                while rx.recv().await.is_some() {}
                // Simulate cleanup work taking a moment, to make sure
                // `cancel` actually waits for it rather than returning
                // as soon as the signal channel closes.
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                cleaned_up_worker.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap();

        handle.cancel().await;
        assert!(
            cleaned_up.load(Ordering::SeqCst),
            "cancel must not return before the worker's own cleanup has run"
        );
        assert!(!handle.is_running().await);
    }

    #[tokio::test]
    async fn send_without_a_running_worker_is_refused() {
        let handle = WorkerHandle::new();
        let err = handle.send(Signal::Ping).await.unwrap_err();
        assert!(matches!(err, TransportError::NoThread));
    }

    #[tokio::test]
    async fn cleanup_guard_disarm_skips_on_drop() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_closure = ran.clone();
        let guard = WorkerCleanupGuard::new(5, move |value| {
            ran_closure.store(true, Ordering::SeqCst);
            assert_eq!(value, 5);
        });
        let value = guard.disarm();
        assert_eq!(value, 5);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cleanup_guard_runs_on_drop_when_not_disarmed() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_closure = ran.clone();
        {
            let _guard = WorkerCleanupGuard::new((), move |()| {
                ran_closure.store(true, Ordering::SeqCst);
            });
        }
        assert!(ran.load(Ordering::SeqCst));
    }
}
