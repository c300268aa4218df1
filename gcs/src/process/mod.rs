//! Per-PID state machine: `Created -> Running -> Exited -> Reaped`.
//! The `writers_wg` discipline guarantees the `Process` object survives
//! until every `Wait` caller has acknowledged writing the exit
//! response to the host.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use gcs_shared::protocol::ExitType;
use gcs_shared::GcsResult;
use tokio::sync::{oneshot, Mutex, Notify};

use crate::relay::Relay;
use crate::runtime::ProcessHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Running,
    Exited,
    Reaped,
}

/// Serializes mutation of `writers_wg`/`writers_called`.
struct WritersLock {
    writers_wg: u32,
    writers_called: bool,
}

pub struct Process {
    pub pid: u32,
    pub is_init: bool,
    state: Mutex<ProcessState>,
    exit_code: AtomicI32,
    exited: Arc<Notify>,
    has_exited: AtomicBool,
    writers: Mutex<WritersLock>,
    handle: Box<dyn ProcessHandle>,
    /// The stdio relay dialed for this process, if any. Held here so
    /// its copy tasks live exactly as long as the process.
    relay: Mutex<Option<Relay>>,
}

impl Process {
    /// Construct a `Process` in `Running` state, seeding `writers_wg = 1`
    /// so the object survives until at least one observer has acked.
    pub fn new(pid: u32, is_init: bool, handle: Box<dyn ProcessHandle>) -> Arc<Self> {
        Arc::new(Process {
            pid,
            is_init,
            state: Mutex::new(ProcessState::Running),
            exit_code: AtomicI32::new(0),
            exited: Arc::new(Notify::new()),
            has_exited: AtomicBool::new(false),
            writers: Mutex::new(WritersLock {
                writers_wg: 1,
                writers_called: false,
            }),
            handle,
            relay: Mutex::new(None),
        })
    }

    /// Attaches the stdio relay dialed for this process, keeping it
    /// alive until the process is dropped.
    pub async fn attach_relay(&self, relay: Relay) {
        *self.relay.lock().await = Some(relay);
    }

    pub async fn state(&self) -> ProcessState {
        *self.state.lock().await
    }

    /// Spawns the background worker that observes the runtime's Wait,
    /// records the exit code, and fires the exit notification
    /// (`Running -> Exited`).
    pub fn spawn_exit_observer(self: &Arc<Self>, on_exit: impl FnOnce(i32) + Send + 'static) {
        let this = self.clone();
        tokio::spawn(async move {
            let exit_code = match this.handle.wait().await {
                Ok(code) => code,
                Err(e) => {
                    tracing::error!(pid = this.pid, error = %e, "runtime wait failed");
                    -1
                }
            };
            this.exit_code.store(exit_code, Ordering::SeqCst);
            {
                let mut state = this.state.lock().await;
                *state = ProcessState::Exited;
            }
            this.has_exited.store(true, Ordering::SeqCst);
            this.exited.notify_waiters();
            on_exit(exit_code);
        });
    }

    /// `Wait()` exposed to handlers.
    ///
    /// Returns a [`WaitHandle`]; the caller resolves it exactly once
    /// via [`WaitHandle::deliver`], which races the exit code against a
    /// `cancel` channel (early timeout) and hands back the outcome
    /// together with an [`AckToken`]. `writers_wg` is only decremented
    /// once that token is acked — callers must defer the ack until
    /// after a delivered exit code has actually been written to the
    /// wire, so the process can't be reaped out from under an
    /// in-flight response.
    pub async fn wait(self: &Arc<Self>) -> WaitHandle {
        {
            let mut w = self.writers.lock().await;
            w.writers_wg += 1;
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let this = self.clone();
        tokio::spawn(async move {
            let notified = this.exited.notified();
            if !this.has_exited.load(Ordering::SeqCst) {
                notified.await;
            }
            let code = this.exit_code.load(Ordering::SeqCst);
            let _ = exit_tx.send(code);
        });

        WaitHandle {
            process: self.clone(),
            exit_rx: Some(exit_rx),
            resolved: false,
        }
    }

    /// Decrement `writers_wg`; if this is the first caller to
    /// acknowledge, also release the initial seed of 1.
    async fn ack_delivered(&self) -> u32 {
        let mut w = self.writers.lock().await;
        w.writers_wg -= 1;
        if !w.writers_called {
            w.writers_called = true;
            w.writers_wg -= 1;
        }
        w.writers_wg
    }

    /// Decrement `writers_wg` only — no exit code was published
    /// (cancellation).
    async fn ack_cancelled(&self) -> u32 {
        let mut w = self.writers.lock().await;
        w.writers_wg -= 1;
        w.writers_wg
    }

    /// A separate worker waits for `writers_wg == 0`, then the caller
    /// removes the process from its container (`Exited -> Reaped`).
    /// Returns true once reclaimable.
    pub async fn writers_wg(&self) -> u32 {
        self.writers.lock().await.writers_wg
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.has_exited.load(Ordering::SeqCst)
    }

    pub async fn signal(&self, signal: i32) -> GcsResult<()> {
        self.handle.signal(signal).await
    }

    /// `ResizeConsole`: forwarded to the stdio relay's PTY master when
    /// one is attached, otherwise to the runtime handle.
    pub async fn resize_console(&self, rows: u16, cols: u16) -> GcsResult<()> {
        if let Some(relay) = self.relay.lock().await.as_ref() {
            return relay.resize(rows, cols);
        }
        self.handle.resize(rows, cols).await
    }

    /// Takes and closes the attached stdio relay, if any, waiting for its
    /// copy tasks to finish. Called once on the exit path, before the
    /// process is reaped, so the PTY master/pipes don't outlive it.
    pub async fn close_relay(&self) {
        let relay = self.relay.lock().await.take();
        match relay {
            Some(Relay::Tty(tty)) => tty.close().await,
            Some(Relay::Pipe(pipe)) => pipe.wait_closed().await,
            None => {}
        }
    }
}

/// A single waiter's view of [`Process::wait`]. The caller must resolve
/// this exactly once via [`WaitHandle::deliver`] — dropping it
/// unresolved leaks the writers_wg slot, which is a programming error
/// in a handler.
pub struct WaitHandle {
    process: Arc<Process>,
    exit_rx: Option<oneshot::Receiver<i32>>,
    resolved: bool,
}

/// What [`WaitHandle::deliver`] observed: an exit code, or an early
/// cancellation (the `cancel` channel fired, or the exit was never
/// published) with nothing to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Delivered(i32),
    Cancelled,
}

impl WaitHandle {
    /// Selects on (exit code arrived) vs (caller signals early
    /// cancellation via `cancel`), returning the outcome plus an
    /// [`AckToken`]. The token must be acked to release the writer's
    /// `writers_wg` slot; hold onto it until whatever needs to survive
    /// the exit code (writing it to the wire) is done.
    pub async fn deliver(mut self, cancel: oneshot::Receiver<()>) -> (WaitOutcome, AckToken) {
        let exit_rx = self.exit_rx.take().expect("deliver called twice");
        self.resolved = true;
        tokio::select! {
            code = exit_rx => {
                match code {
                    Ok(code) => (
                        WaitOutcome::Delivered(code),
                        AckToken { process: self.process.clone(), delivered: true, acked: false },
                    ),
                    Err(_) => (
                        WaitOutcome::Cancelled,
                        AckToken { process: self.process.clone(), delivered: false, acked: false },
                    ),
                }
            }
            _ = cancel => (
                WaitOutcome::Cancelled,
                AckToken { process: self.process.clone(), delivered: false, acked: false },
            ),
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::error!(pid = self.process.pid, "WaitHandle dropped without being resolved");
        }
    }
}

/// Releases one `writers_wg` slot when acked. Obtained from
/// [`WaitHandle::deliver`]; the caller must ack it exactly once, after
/// it has finished with the delivered exit code (or immediately, for a
/// cancellation, since nothing was delivered that needs to survive a
/// write).
pub struct AckToken {
    process: Arc<Process>,
    delivered: bool,
    acked: bool,
}

impl AckToken {
    pub async fn ack(mut self) {
        self.acked = true;
        if self.delivered {
            self.process.ack_delivered().await;
        } else {
            self.process.ack_cancelled().await;
        }
    }
}

impl Drop for AckToken {
    fn drop(&mut self) {
        if !self.acked {
            tracing::error!(pid = self.process.pid, "AckToken dropped without being acked");
        }
    }
}

/// Maps a signal number to the container `exit_type` it implies:
/// TERM -> GracefulExit, KILL -> ForcedExit, anything else leaves
/// `exit_type` unchanged.
pub fn exit_type_for_signal(signal: i32) -> Option<ExitType> {
    match signal {
        15 => Some(ExitType::GracefulExit),
        9 => Some(ExitType::ForcedExit),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tests::StubProcessHandle;

    fn make_process(pid: u32) -> Arc<Process> {
        Process::new(pid, false, Box::new(StubProcessHandle::new()))
    }

    #[tokio::test]
    async fn single_waiter_receives_exit_code_and_process_is_reaped_only_after_ack() {
        let proc = make_process(1);
        proc.spawn_exit_observer(|_| {});

        let wait = proc.wait().await;
        assert_eq!(proc.writers_wg().await, 2);

        proc.handle_stub().fire_exit(7);

        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let (outcome, ack) = wait.deliver(cancel_rx).await;
        assert_eq!(outcome, WaitOutcome::Delivered(7));
        assert_eq!(proc.writers_wg().await, 2, "slot held until the ack, not until delivery");
        ack.ack().await;
        assert_eq!(proc.writers_wg().await, 0);
    }

    #[tokio::test]
    async fn two_concurrent_waiters_both_receive_exit_code_reaped_only_after_both_ack() {
        let proc = make_process(2);
        proc.spawn_exit_observer(|_| {});

        let wait_a = proc.wait().await;
        let wait_b = proc.wait().await;
        assert_eq!(proc.writers_wg().await, 3);

        proc.handle_stub().fire_exit(0);

        let (_ca, ra) = oneshot::channel();
        let (_cb, rb) = oneshot::channel();
        let (outcome_a, ack_a) = wait_a.deliver(ra).await;
        let (outcome_b, ack_b) = wait_b.deliver(rb).await;
        assert_eq!(proc.writers_wg().await, 3, "delivery alone never decrements");

        ack_a.ack().await;
        assert_eq!(proc.writers_wg().await, 1, "not reaped until both ack");
        ack_b.ack().await;

        assert_eq!(outcome_a, WaitOutcome::Delivered(0));
        assert_eq!(outcome_b, WaitOutcome::Delivered(0));
        assert_eq!(proc.writers_wg().await, 0);
    }

    #[tokio::test]
    async fn cancellation_before_exit_releases_writer_slot_without_exit_code() {
        let proc = make_process(3);
        proc.spawn_exit_observer(|_| {});

        let wait = proc.wait().await;
        assert_eq!(proc.writers_wg().await, 2);

        let (cancel_tx, cancel_rx) = oneshot::channel();
        cancel_tx.send(()).unwrap();
        let (outcome, ack) = wait.deliver(cancel_rx).await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
        ack.ack().await;
        // The initial seed of 1 was not released by a cancellation.
        assert_eq!(proc.writers_wg().await, 1);
    }

    #[tokio::test]
    async fn first_acker_releases_initial_seed_subsequent_cancels_do_not() {
        let proc = make_process(4);
        proc.spawn_exit_observer(|_| {});

        let wait_a = proc.wait().await;
        let wait_b = proc.wait().await;

        // b cancels first, without having delivered anything.
        let (cancel_tx, cancel_rx) = oneshot::channel();
        cancel_tx.send(()).unwrap();
        let (outcome_b, ack_b) = wait_b.deliver(cancel_rx).await;
        assert_eq!(outcome_b, WaitOutcome::Cancelled);
        ack_b.ack().await;
        assert_eq!(proc.writers_wg().await, 2, "seed still held");

        proc.handle_stub().fire_exit(5);
        let (_ca, ra) = oneshot::channel();
        let (outcome_a, ack_a) = wait_a.deliver(ra).await;
        assert_eq!(outcome_a, WaitOutcome::Delivered(5));
        ack_a.ack().await;
        assert_eq!(proc.writers_wg().await, 0, "first acker releases the seed");
    }

    #[test]
    fn signal_mapping_covers_term_and_kill() {
        assert_eq!(exit_type_for_signal(15), Some(ExitType::GracefulExit));
        assert_eq!(exit_type_for_signal(9), Some(ExitType::ForcedExit));
        assert_eq!(exit_type_for_signal(1), None);
    }

    impl Process {
        fn handle_stub(&self) -> &StubProcessHandle {
            self.handle
                .as_any()
                .downcast_ref::<StubProcessHandle>()
                .expect("test process built with StubProcessHandle")
        }
    }
}
