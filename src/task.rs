use crate::device::{MoveHandle, PatchDevice, TestPulseSubscription};
use crate::error::PatchError;
use crate::stage::{Outcome, StageProgram};
use crate::types::{Completion, PatchStateId, StateEvent, TestPulse};
use crossbeam_channel::Sender;
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Poll timeout for test-pulse waits; bounds cancellation latency.
pub(crate) const SAMPLE_POLL: Duration = Duration::from_millis(200);

/// Poll timeout for move-completion waits.
const MOVE_POLL: Duration = Duration::from_millis(200);

/// Slice length for interruptible sleeps.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Decided result of a task: the completion plus the optional next-state
/// label for the sequencing manager.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub completion: Completion,
    pub next_state: Option<PatchStateId>,
}

/// State shared between a task, its worker, and stage contexts.
pub(crate) struct TaskShared {
    stop: AtomicBool,
    status: Mutex<String>,
    result: Mutex<Option<TaskResult>>,
    done: Condvar,
    events: Option<Sender<StateEvent>>,
}

impl TaskShared {
    pub(crate) fn new(events: Option<Sender<StateEvent>>) -> Arc<Self> {
        Arc::new(Self {
            stop: AtomicBool::new(false),
            status: Mutex::new(String::new()),
            result: Mutex::new(None),
            done: Condvar::new(),
            events,
        })
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn set_status(&self, state: PatchStateId, message: String) {
        debug!("[{state}] {message}");
        *self.status.lock() = message.clone();
        if let Some(events) = &self.events {
            let _ = events.try_send(StateEvent::Status { state, message });
        }
    }

    /// Record the completion. Single-shot: later calls are ignored.
    pub(crate) fn task_done(
        &self,
        state: PatchStateId,
        completion: Completion,
        next_state: Option<PatchStateId>,
    ) {
        {
            let mut slot = self.result.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(TaskResult {
                completion: completion.clone(),
                next_state,
            });
            self.done.notify_all();
        }
        if let Some(events) = &self.events {
            let _ = events.try_send(StateEvent::Finished {
                state,
                completion,
                next_state,
            });
        }
    }

    pub(crate) fn result(&self) -> Option<TaskResult> {
        self.result.lock().clone()
    }

    pub(crate) fn wait(&self, timeout: Duration) -> Option<TaskResult> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.result.lock();
        while slot.is_none() {
            if self.done.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.clone()
    }
}

/// Execution context handed to a stage's control loop.
///
/// Owns the test-pulse subscription for the worker's lifetime; dropping the
/// context unsubscribes, so teardown happens on every exit path.
pub struct StageContext {
    device: Arc<dyn PatchDevice>,
    samples: TestPulseSubscription,
    shared: Arc<TaskShared>,
    state: PatchStateId,
}

impl StageContext {
    pub(crate) fn new(
        device: Arc<dyn PatchDevice>,
        samples: TestPulseSubscription,
        shared: Arc<TaskShared>,
        state: PatchStateId,
    ) -> Self {
        Self {
            device,
            samples,
            shared,
            state,
        }
    }

    pub fn device(&self) -> &dyn PatchDevice {
        self.device.as_ref()
    }

    /// Publish a human-readable status update.
    pub fn set_status(&self, message: impl Into<String>) {
        self.shared.set_status(self.state, message.into());
    }

    /// Cooperative cancellation check; call at every loop iteration.
    pub fn check_stop(&self) -> Result<(), PatchError> {
        if self.shared.stop_requested() {
            Err(PatchError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Sleep for `delay` while remaining responsive to stop requests.
    pub fn check_stop_for(&self, delay: Duration) -> Result<(), PatchError> {
        let deadline = Instant::now() + delay;
        loop {
            self.check_stop()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(STOP_POLL));
        }
    }

    /// Wait up to `timeout` for at least one sample; when one arrives, also
    /// collect everything already queued without further waiting. Returns
    /// samples in arrival order, or an empty vec on timeout.
    pub fn drain_samples(&self, timeout: Duration) -> Vec<TestPulse> {
        let receiver = self.samples.receiver();
        let mut samples = Vec::new();
        if let Ok(sample) = receiver.recv_timeout(timeout) {
            samples.push(sample);
            samples.extend(receiver.try_iter());
        }
        samples
    }

    /// Block on a move in cancelable slices. A stop request cancels the
    /// move before propagating.
    pub fn wait_for_move(&self, handle: &dyn MoveHandle) -> Result<(), PatchError> {
        loop {
            if let Err(e) = self.check_stop() {
                handle.cancel();
                return Err(e);
            }
            if handle.wait_for(MOVE_POLL)? {
                return Ok(());
            }
        }
    }
}

/// Cancelable execution of one patch state.
///
/// `initialize` applies the stage's initial device settings and spawns at
/// most one background worker. The worker subscribes to test pulses, runs
/// the stage algorithm, always runs the stage's cleanup hook, tears the
/// subscription down, and reports exactly one completion.
pub struct StateTask {
    id: PatchStateId,
    device: Arc<dyn PatchDevice>,
    stage: Option<Box<dyn StageProgram>>,
    shared: Arc<TaskShared>,
    worker: Option<JoinHandle<()>>,
    started: bool,
}

impl StateTask {
    pub fn new(device: Arc<dyn PatchDevice>, stage: Box<dyn StageProgram>) -> Self {
        let id = stage.id();
        Self {
            id,
            device,
            stage: Some(stage),
            shared: TaskShared::new(None),
            worker: None,
            started: false,
        }
    }

    /// Attach an observer channel receiving status updates and the single
    /// completion event. Must be called before `initialize`.
    pub fn with_events(mut self, events: Sender<StateEvent>) -> Self {
        self.shared = TaskShared::new(Some(events));
        self
    }

    pub fn id(&self) -> PatchStateId {
        self.id
    }

    /// Apply initial device settings and start the stage.
    ///
    /// Idempotent: a second call is a no-op and never starts a second
    /// worker. Initialization failures surface as a failed completion
    /// rather than a panic or error return.
    pub fn initialize(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let Some(mut stage) = self.stage.take() else {
            return;
        };

        if let Err(e) = stage.initialize(self.device.as_ref()) {
            error!("failed to initialize state {}: {e}", self.id);
            self.shared
                .task_done(self.id, Completion::failed(e.to_string()), None);
            return;
        }

        if !stage.has_algorithm() {
            self.shared.task_done(self.id, Completion::success(), None);
            return;
        }

        let id = self.id;
        let device = self.device.clone();
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("patch-{}", id.as_str().replace(' ', "-")))
            .spawn(move || run_worker(id, &mut *stage, device, shared));
        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => {
                error!("failed to spawn worker for state {}: {e}", self.id);
                self.shared
                    .task_done(self.id, Completion::failed(e.to_string()), None);
            }
        }
    }

    /// Request cooperative cancellation. The worker honors it within one
    /// poll interval.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn status(&self) -> String {
        self.shared.status.lock().clone()
    }

    pub fn is_done(&self) -> bool {
        self.shared.result().is_some()
    }

    /// Block up to `timeout` for the completion.
    pub fn wait(&self, timeout: Duration) -> Option<Completion> {
        self.shared.wait(timeout).map(|r| r.completion)
    }

    pub fn result(&self) -> Option<TaskResult> {
        self.shared.result()
    }

    /// Next-state label decided by the stage, once complete.
    pub fn next_state(&self) -> Option<PatchStateId> {
        self.shared.result().and_then(|r| r.next_state)
    }
}

impl Drop for StateTask {
    fn drop(&mut self) {
        self.shared.request_stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Worker body: run the stage algorithm, map its result onto the three
/// termination paths, always run cleanup, then report completion once the
/// subscription is torn down.
fn run_worker(
    id: PatchStateId,
    stage: &mut dyn StageProgram,
    device: Arc<dyn PatchDevice>,
    shared: Arc<TaskShared>,
) {
    let samples = device.subscribe_test_pulses();
    let ctx = StageContext::new(device, samples, shared.clone(), id);

    let (interrupted, error, next_state) = match stage.run(&ctx) {
        Ok(Outcome::Transition(next)) => (false, None, next),
        Ok(Outcome::Failed { error, next }) => {
            warn!("state {id} failed: {error}");
            (true, Some(error), next)
        }
        Err(PatchError::Stopped) => (true, None, None),
        Err(e) => {
            error!("error during {id}: {e}");
            (true, Some(e.to_string()), None)
        }
    };

    if let Err(e) = stage.cleanup(&ctx, interrupted) {
        error!("error during {id} cleanup: {e}");
    }

    // Unsubscribe before the completion becomes observable.
    drop(ctx);

    shared.task_done(id, Completion { interrupted, error }, next_state);
}
