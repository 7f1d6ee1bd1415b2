use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, mpsc as std_mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

use crate::error::{AppError, TaskError};

/// Value carried by a resume.
pub type Payload = Box<dyn Any + Send>;

const RUNNING: u8 = 0;
const SUSPENDED: u8 = 1;
const RESUMED: u8 = 2;
const WAITING: u8 = 3;
const FINISHED: u8 = 4;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Readiness a task can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
    /// No readiness; only the deadline (or a resume) ends the wait.
    TimeoutOnly,
}

impl Interest {
    pub fn from_flags(read: bool, write: bool) -> Self {
        match (read, write) {
            (true, true) => Interest::ReadWrite,
            (true, false) => Interest::Read,
            (false, true) => Interest::Write,
            (false, false) => Interest::TimeoutOnly,
        }
    }

    pub fn to_tokio(self) -> Option<tokio::io::Interest> {
        match self {
            Interest::Read => Some(tokio::io::Interest::READABLE),
            Interest::Write => Some(tokio::io::Interest::WRITABLE),
            Interest::ReadWrite => {
                Some(tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE)
            }
            Interest::TimeoutOnly => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// Parked until `Continuation::resume` or the deadline.
    Suspend,
    /// Parked until the descriptor is ready or the deadline.
    Io,
    /// Parked for a fixed time; reaching the deadline is success.
    Sleep,
}

/// What a task is waiting for when it switches back to the reactor.
#[derive(Debug, Clone)]
pub struct Wait {
    pub kind: WaitKind,
    /// `None` means the descriptor of the connection that owns the task.
    pub fd: Option<RawFd>,
    pub interest: Interest,
    pub timeout: Option<Duration>,
}

impl Wait {
    pub fn suspend(timeout: Option<Duration>) -> Self {
        Self {
            kind: WaitKind::Suspend,
            fd: None,
            interest: Interest::TimeoutOnly,
            timeout,
        }
    }

    pub fn io(fd: Option<RawFd>, interest: Interest, timeout: Option<Duration>) -> Self {
        Self {
            kind: WaitKind::Io,
            fd,
            interest,
            timeout,
        }
    }

    pub fn sleep(duration: Duration) -> Self {
        Self {
            kind: WaitKind::Sleep,
            fd: None,
            interest: Interest::TimeoutOnly,
            timeout: Some(duration),
        }
    }
}

/// Sent from the reactor into a task.
pub enum Resume {
    Start,
    Value(Option<Payload>),
    Error(TaskError),
    Cancel,
}

impl fmt::Debug for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resume::Start => f.write_str("Start"),
            Resume::Value(v) => write!(f, "Value(present: {})", v.is_some()),
            Resume::Error(e) => write!(f, "Error({e})"),
            Resume::Cancel => f.write_str("Cancel"),
        }
    }
}

/// Sent from a task back to the reactor each time it gives up control.
#[derive(Debug)]
pub enum Step<Y> {
    Suspended(Wait),
    Yielded(Y),
    Completed,
    Failed(AppError),
}

impl<Y> Step<Y> {
    fn is_final(&self) -> bool {
        matches!(self, Step::Completed | Step::Failed(_))
    }
}

/// How a wait ended, as seen by the reactor.
#[derive(Debug)]
pub struct WaitOutcome {
    pub resume: Resume,
    /// The deadline expired; the owning connection must not be reused.
    pub timed_out: bool,
}

impl WaitOutcome {
    fn resumed(resume: Resume) -> Self {
        Self {
            resume,
            timed_out: false,
        }
    }

    fn timeout() -> Self {
        Self {
            resume: Resume::Error(TaskError::Timeout),
            timed_out: true,
        }
    }
}

struct Shared {
    id: TaskId,
    state: AtomicU8,
    wake: mpsc::UnboundedSender<Resume>,
}

impl Shared {
    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }
}

/// Handle used to resume a suspended task from anywhere.
#[derive(Clone)]
pub struct Continuation {
    shared: Arc<Shared>,
}

impl Continuation {
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == SUSPENDED
    }

    /// Resumes the task; its `suspend` call returns `Ok(None)`.
    pub fn resume(&self) -> Result<(), TaskError> {
        self.deliver(Resume::Value(None))
    }

    /// Resumes the task; its `suspend` call returns the boxed value.
    pub fn resume_with<T: Any + Send>(&self, value: T) -> Result<(), TaskError> {
        self.deliver(Resume::Value(Some(Box::new(value))))
    }

    /// Resumes the task with an error raised from its `suspend` call.
    pub fn throw(&self, err: AppError) -> Result<(), TaskError> {
        self.deliver(Resume::Error(TaskError::Thrown(Box::new(err))))
    }

    fn deliver(&self, resume: Resume) -> Result<(), TaskError> {
        if !self.shared.transition(SUSPENDED, RESUMED) {
            return Err(TaskError::NotSuspended);
        }
        self.shared
            .wake
            .send(resume)
            .map_err(|_| TaskError::Cancelled)
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("id", &self.shared.id)
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

/// Task-side half of a task. Only the code running inside the task
/// holds one, so only that code can suspend it.
pub struct TaskContext<Y> {
    shared: Arc<Shared>,
    to_parent: std_mpsc::Sender<Step<Y>>,
    from_parent: std_mpsc::Receiver<Resume>,
    cancelled: Cell<bool>,
}

impl<Y> TaskContext<Y> {
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn continuation(&self) -> Continuation {
        Continuation {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Parks the task until a [`Continuation`] resumes it or `timeout`
    /// passes. A timeout surfaces as [`TaskError::Timeout`].
    pub fn suspend(&self, timeout: Option<Duration>) -> Result<Option<Payload>, TaskError> {
        if !self.shared.transition(RUNNING, SUSPENDED) {
            return Err(TaskError::AlreadySuspended);
        }
        self.switch_out(Step::Suspended(Wait::suspend(timeout)))
    }

    /// Parks the task until `fd` (default: the connection socket) is
    /// ready for the requested directions.
    pub fn trampoline(
        &self,
        fd: Option<RawFd>,
        read: bool,
        write: bool,
        timeout: Option<Duration>,
    ) -> Result<(), TaskError> {
        if !self.shared.transition(RUNNING, WAITING) {
            return Err(TaskError::AlreadySuspended);
        }
        let wait = Wait::io(fd, Interest::from_flags(read, write), timeout);
        self.switch_out(Step::Suspended(wait)).map(|_| ())
    }

    pub fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        if !self.shared.transition(RUNNING, WAITING) {
            return Err(TaskError::AlreadySuspended);
        }
        self.switch_out(Step::Suspended(Wait::sleep(duration)))
            .map(|_| ())
    }

    /// Hands an item to the reactor and waits to be switched back in.
    pub(crate) fn emit(&self, item: Y) -> Result<(), TaskError> {
        self.switch_out(Step::Yielded(item)).map(|_| ())
    }

    fn switch_out(&self, step: Step<Y>) -> Result<Option<Payload>, TaskError> {
        if self.cancelled.get() {
            self.shared.set(RUNNING);
            return Err(TaskError::Cancelled);
        }
        if self.to_parent.send(step).is_err() {
            self.cancelled.set(true);
            self.shared.set(RUNNING);
            return Err(TaskError::Cancelled);
        }

        let resume = self.from_parent.recv();
        self.shared.set(RUNNING);

        match resume {
            Ok(Resume::Value(value)) => Ok(value),
            Ok(Resume::Start) => Ok(None),
            Ok(Resume::Error(err)) => Err(err),
            Ok(Resume::Cancel) | Err(_) => {
                self.cancelled.set(true);
                Err(TaskError::Cancelled)
            }
        }
    }
}

/// Reactor-side half of a task.
///
/// The task body runs on its own thread but never concurrently with the
/// reactor: [`Task::switch`] blocks until the task gives control back.
pub struct Task<Y> {
    shared: Arc<Shared>,
    to_task: std_mpsc::Sender<Resume>,
    from_task: std_mpsc::Receiver<Step<Y>>,
    wake: mpsc::UnboundedReceiver<Resume>,
    thread: Option<JoinHandle<()>>,
    started: bool,
    finished: bool,
}

impl<Y: Send + 'static> Task<Y> {
    /// Creates a task. The body does not run until the first `switch`.
    pub fn spawn<F>(stack_size: usize, body: F) -> io::Result<Self>
    where
        F: FnOnce(TaskContext<Y>) -> Result<(), AppError> + Send + 'static,
    {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id: TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)),
            state: AtomicU8::new(RUNNING),
            wake: wake_tx,
        });
        let (to_task, from_parent) = std_mpsc::channel();
        let (to_parent, from_task) = std_mpsc::channel();

        let ctx = TaskContext {
            shared: Arc::clone(&shared),
            to_parent: to_parent.clone(),
            from_parent,
            cancelled: Cell::new(false),
        };
        let finished_state = Arc::clone(&shared);

        let thread = thread::Builder::new()
            .name(shared.id.to_string())
            .stack_size(stack_size)
            .spawn(move || {
                match ctx.from_parent.recv() {
                    Ok(Resume::Cancel) | Err(_) => return,
                    Ok(_) => {}
                }

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(ctx)));
                let last = match outcome {
                    Ok(Ok(())) => Step::Completed,
                    Ok(Err(err)) => Step::Failed(err),
                    Err(panic) => Step::Failed(AppError::new(panic_message(panic.as_ref()))),
                };
                finished_state.set(FINISHED);
                let _ = to_parent.send(last);
            })?;

        Ok(Self {
            shared,
            to_task,
            from_task,
            wake: wake_rx,
            thread: Some(thread),
            started: false,
            finished: false,
        })
    }
}

impl<Y> Task<Y> {
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn continuation(&self) -> Continuation {
        Continuation {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Runs the task until it next gives control back.
    pub fn switch(&mut self, resume: Resume) -> Step<Y> {
        if self.finished {
            return Step::Failed(AppError::new("switch into a finished task"));
        }
        self.started = true;

        if self.to_task.send(resume).is_err() {
            self.finished = true;
            return Step::Failed(AppError::new("task thread exited"));
        }

        match self.from_task.recv() {
            Ok(step) => {
                if step.is_final() {
                    self.finished = true;
                }
                step
            }
            Err(_) => {
                self.finished = true;
                Step::Failed(AppError::new("task thread exited"))
            }
        }
    }

    /// Waits for a suspension to end. `ready` resolves the readiness of an
    /// `Io` wait and is ignored for the other kinds.
    pub async fn wait_with<F>(&mut self, wait: &Wait, ready: F) -> WaitOutcome
    where
        F: Future<Output = io::Result<()>>,
    {
        match wait.kind {
            WaitKind::Suspend => self.wait_resume(wait.timeout).await,
            WaitKind::Sleep => {
                sleep_for(wait.timeout).await;
                WaitOutcome::resumed(Resume::Value(None))
            }
            WaitKind::Io => {
                tokio::select! {
                    res = ready => match res {
                        Ok(()) => WaitOutcome::resumed(Resume::Value(None)),
                        Err(e) => WaitOutcome::resumed(Resume::Error(TaskError::Io(e))),
                    },
                    _ = sleep_for(wait.timeout) => WaitOutcome::timeout(),
                }
            }
        }
    }

    /// Waits for a suspension that is not tied to a connection socket.
    pub async fn wait(&mut self, wait: &Wait) -> WaitOutcome {
        let fd = wait.fd;
        let interest = wait.interest;
        self.wait_with(wait, async move {
            match fd {
                Some(fd) => fd_ready(fd, interest).await,
                None if interest == Interest::TimeoutOnly => std::future::pending().await,
                None => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no descriptor to wait on outside a connection",
                )),
            }
        })
        .await
    }

    async fn wait_resume(&mut self, timeout: Option<Duration>) -> WaitOutcome {
        tokio::select! {
            Some(resume) = self.wake.recv() => return WaitOutcome::resumed(resume),
            _ = sleep_for(timeout) => {}
        }

        if self.shared.transition(SUSPENDED, RUNNING) {
            return WaitOutcome::timeout();
        }
        // a resume won the race against the deadline
        match self.wake.recv().await {
            Some(resume) => WaitOutcome::resumed(resume),
            None => WaitOutcome::timeout(),
        }
    }
}

impl<Y> Drop for Task<Y> {
    fn drop(&mut self) {
        if !self.finished && self.to_task.send(Resume::Cancel).is_ok() && self.started {
            while let Ok(step) = self.from_task.recv() {
                if step.is_final() {
                    break;
                }
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl<Y> fmt::Debug for Task<Y> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.shared.id)
            .field("finished", &self.finished)
            .finish()
    }
}

async fn sleep_for(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

struct ForeignFd(RawFd);

impl AsRawFd for ForeignFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Waits for readiness on a descriptor the reactor does not own.
///
/// The descriptor is registered only for the duration of the wait.
pub async fn fd_ready(fd: RawFd, interest: Interest) -> io::Result<()> {
    let Some(interest) = interest.to_tokio() else {
        return std::future::pending().await;
    };
    let registered = AsyncFd::with_interest(ForeignFd(fd), interest)?;
    let _guard = registered.ready(interest).await?;
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}
