use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::AppError;
use crate::scheduler::task::{Continuation, Resume, Step, Task, TaskContext};
use crate::timer::{TimerHandle, TimerQueue};

/// Body of a task started with [`HubHandle::spawn`].
pub type DetachedFn = Box<dyn FnOnce(TaskContext<()>) -> Result<(), AppError> + Send>;

pub(crate) enum TimerAction {
    Call(Box<dyn FnOnce() + Send>),
    Resume(Continuation),
    Spawn(DetachedFn),
}

pub(crate) enum HubCommand {
    Schedule {
        deadline: Instant,
        action: TimerAction,
        handle: TimerHandle,
    },
    Stop(Option<Duration>),
}

/// Cloneable, thread-safe door into the reactor.
///
/// Everything submitted here runs on the reactor thread during a later
/// loop iteration.
#[derive(Clone, Debug)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    /// Runs `f` on the reactor after `delay`.
    pub fn schedule_call<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(delay, TimerAction::Call(Box::new(f)))
    }

    /// Resumes `continuation` after `delay`, if it is still suspended by then.
    pub fn resume_later(&self, delay: Duration, continuation: Continuation) -> TimerHandle {
        self.schedule(delay, TimerAction::Resume(continuation))
    }

    /// Starts `f` as a detached task on the next loop iteration.
    pub fn spawn<F>(&self, f: F) -> TimerHandle
    where
        F: FnOnce(TaskContext<()>) -> Result<(), AppError> + Send + 'static,
    {
        self.schedule(Duration::ZERO, TimerAction::Spawn(Box::new(f)))
    }

    /// Asks the server to stop accepting and shut down, waiting at most
    /// `grace` for open connections.
    pub fn stop(&self, grace: Option<Duration>) {
        if self.tx.send(HubCommand::Stop(grace)).is_err() {
            debug!("stop requested after the reactor exited");
        }
    }

    fn schedule(&self, delay: Duration, action: TimerAction) -> TimerHandle {
        let handle = TimerHandle::new();
        let command = HubCommand::Schedule {
            deadline: Instant::now() + delay,
            action,
            handle: handle.clone(),
        };
        if self.tx.send(command).is_err() {
            handle.cancel();
        }
        handle
    }
}

/// Reactor-side timer and task bookkeeping.
pub struct Hub {
    timers: TimerQueue<TimerAction>,
    rx: mpsc::UnboundedReceiver<HubCommand>,
    handle: HubHandle,
    stack_size: usize,
}

impl Hub {
    pub fn new(stack_size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            timers: TimerQueue::new(),
            rx,
            handle: HubHandle { tx },
            stack_size,
        }
    }

    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Waits for the next submission from a handle.
    pub(crate) async fn next_command(&mut self) -> Option<HubCommand> {
        self.rx.recv().await
    }

    /// Applies a submission. Returns the grace period when it asks to stop.
    pub(crate) fn apply(&mut self, command: HubCommand) -> Option<Option<Duration>> {
        match command {
            HubCommand::Schedule {
                deadline,
                action,
                handle,
            } => {
                if handle.is_active() {
                    self.timers.push_with_handle(deadline, action, handle);
                }
                None
            }
            HubCommand::Stop(grace) => Some(grace),
        }
    }

    /// Runs everything due at `now`. Must be called inside a `LocalSet`.
    pub fn fire_expired(&mut self, now: Instant) {
        for action in self.timers.pop_expired(now) {
            match action {
                TimerAction::Call(f) => {
                    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
                        error!("scheduled call panicked");
                    }
                }
                TimerAction::Resume(continuation) => {
                    if let Err(e) = continuation.resume() {
                        debug!(task = %continuation.id(), error = %e, "delayed resume skipped");
                    }
                }
                TimerAction::Spawn(body) => match Task::spawn(self.stack_size, body) {
                    Ok(task) => {
                        tokio::task::spawn_local(drive_detached(task));
                    }
                    Err(e) => warn!(error = %e, "failed to start detached task"),
                },
            }
        }
    }
}

async fn drive_detached(mut task: Task<()>) {
    let mut resume = Resume::Start;
    loop {
        match task.switch(resume) {
            Step::Suspended(wait) => resume = task.wait(&wait).await.resume,
            Step::Yielded(()) => resume = Resume::Value(None),
            Step::Completed => break,
            Step::Failed(err) => {
                error!(
                    task = %task.id(),
                    file = err.file(),
                    line = err.line(),
                    error = %err,
                    "detached task failed"
                );
                break;
            }
        }
    }
}
