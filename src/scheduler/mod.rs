//! Cooperative task scheduling.
//!
//! Application code runs inside a [`Task`]: a thread that only ever runs
//! while the reactor is blocked waiting for it. Control moves back and
//! forth through [`Task::switch`] on the reactor side and the suspension
//! points of [`TaskContext`] on the task side:
//!
//! ```text
//!   reactor                         task thread
//!   ───────                         ───────────
//!   switch(Start) ───────────────▶  app runs
//!                                   ctx.suspend(timeout)
//!   Step::Suspended(wait) ◀───────
//!   wait for resume / deadline
//!   switch(Value | Error) ───────▶  suspend returns
//!                                   app returns
//!   Step::Completed ◀─────────────
//! ```
//!
//! A suspended task is resumed through its [`Continuation`], which can be
//! cloned and sent to other tasks or threads. The [`Hub`] owns the timer
//! queue for delayed calls, delayed resumes and detached tasks.

pub mod hub;
pub mod task;

pub use hub::{Hub, HubHandle};
pub use task::{
    Continuation, Interest, Payload, Resume, Step, Task, TaskContext, TaskId, Wait, WaitKind,
    WaitOutcome, fd_ready,
};
