mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use common::{Client, config, start};
use hearth::error::TaskError;
use hearth::scheduler::{Resume, Step, Task, WaitKind};
use hearth::{AppError, Environ, ResponseBody, Server, StartResponse};
use tokio::sync::oneshot;
use tokio::task::LocalSet;

const STACK: usize = 64 * 1024;

#[tokio::test]
async fn test_task_suspend_and_resume_with_value() {
    let mut task = Task::<()>::spawn(STACK, |ctx| {
        let value = ctx.suspend(Some(Duration::from_secs(5)))?;
        let n = value
            .and_then(|v| v.downcast::<u32>().ok())
            .ok_or_else(|| AppError::new("no value"))?;
        if *n != 7 {
            return Err(AppError::new("wrong value"));
        }
        Ok(())
    })
    .unwrap();

    let Step::Suspended(wait) = task.switch(Resume::Start) else {
        panic!("task did not suspend");
    };
    assert_eq!(wait.kind, WaitKind::Suspend);

    let continuation = task.continuation();
    assert!(continuation.is_suspended());
    continuation.resume_with(7u32).unwrap();
    assert!(matches!(continuation.resume(), Err(TaskError::NotSuspended)));

    let outcome = task.wait(&wait).await;
    assert!(!outcome.timed_out);
    assert!(matches!(task.switch(outcome.resume), Step::Completed));
    assert!(task.is_finished());
}

#[tokio::test]
async fn test_task_suspend_times_out() {
    let mut task = Task::<()>::spawn(STACK, |ctx| match ctx.suspend(Some(Duration::from_millis(20))) {
        Err(TaskError::Timeout) => Ok(()),
        other => Err(AppError::new(format!("expected a timeout, got {:?}", other.map(|_| ())))),
    })
    .unwrap();

    let Step::Suspended(wait) = task.switch(Resume::Start) else {
        panic!("task did not suspend");
    };
    let outcome = task.wait(&wait).await;
    assert!(outcome.timed_out);
    assert!(!task.continuation().is_suspended());
    assert!(matches!(task.switch(outcome.resume), Step::Completed));
}

#[tokio::test]
async fn test_task_sleep_is_not_a_timeout() {
    let mut task = Task::<()>::spawn(STACK, |ctx| {
        ctx.sleep(Duration::from_millis(10))?;
        Ok(())
    })
    .unwrap();

    let Step::Suspended(wait) = task.switch(Resume::Start) else {
        panic!("task did not sleep");
    };
    assert_eq!(wait.kind, WaitKind::Sleep);
    let outcome = task.wait(&wait).await;
    assert!(!outcome.timed_out);
    assert!(matches!(task.switch(outcome.resume), Step::Completed));
}

#[test]
fn test_task_failure_carries_location() {
    let mut task = Task::<()>::spawn(STACK, |_ctx| Err(AppError::new("failed on purpose"))).unwrap();
    match task.switch(Resume::Start) {
        Step::Failed(err) => {
            assert_eq!(err.message(), "failed on purpose");
            assert!(err.file().ends_with("test_scheduler.rs"));
        }
        other => panic!("unexpected step {other:?}"),
    }
}

#[test]
fn test_task_panic_becomes_failure() {
    let mut task = Task::<()>::spawn(STACK, |_ctx| panic!("kaboom")).unwrap();
    match task.switch(Resume::Start) {
        Step::Failed(err) => assert!(err.message().contains("kaboom")),
        other => panic!("unexpected step {other:?}"),
    }
}

#[test]
fn test_dropping_a_suspended_task_cancels_it() {
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    let mut task = Task::<()>::spawn(STACK, move |ctx| {
        if let Err(TaskError::Cancelled) = ctx.suspend(None) {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(())
    })
    .unwrap();

    assert!(matches!(task.switch(Resume::Start), Step::Suspended(_)));
    drop(task);
    assert!(cancelled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_hub_schedule_call_and_cancel() {
    LocalSet::new()
        .run_until(async {
            let app = |_env: &mut Environ, start: &mut StartResponse| -> Result<ResponseBody, AppError> {
                start.start("200 OK", vec![])?;
                Ok(ResponseBody::Empty)
            };
            let server = start(config(), app).await;

            let (tx, rx) = oneshot::channel();
            let handle = server.hub.schedule_call(Duration::from_millis(20), move || {
                let _ = tx.send("fired");
            });
            assert_eq!(tokio::time::timeout(Duration::from_secs(2), rx).await, Ok(Ok("fired")));
            assert!(!handle.is_active());

            let fired = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&fired);
            let handle = server.hub.schedule_call(Duration::from_millis(50), move || {
                flag.store(true, Ordering::SeqCst);
            });
            assert!(handle.cancel());
            tokio::time::sleep(Duration::from_millis(150)).await;
            assert!(!fired.load(Ordering::SeqCst));
        })
        .await;
}

#[tokio::test]
async fn test_hub_spawn_runs_detached_task() {
    LocalSet::new()
        .run_until(async {
            let app = |_env: &mut Environ, start: &mut StartResponse| -> Result<ResponseBody, AppError> {
                start.start("200 OK", vec![])?;
                Ok(ResponseBody::Empty)
            };
            let server = start(config(), app).await;

            let (tx, rx) = oneshot::channel();
            server.hub.spawn(move |ctx| {
                ctx.sleep(Duration::from_millis(10))?;
                let _ = tx.send(ctx.id().to_string());
                Ok(())
            });
            let id = tokio::time::timeout(Duration::from_secs(2), rx)
                .await
                .unwrap()
                .unwrap();
            assert!(id.starts_with("task-"));
        })
        .await;
}

#[tokio::test]
async fn test_resume_later_from_application() {
    LocalSet::new()
        .run_until(async {
            let app = |env: &mut Environ, start: &mut StartResponse| -> Result<ResponseBody, AppError> {
                env.hub()
                    .resume_later(Duration::from_millis(20), env.continuation());
                env.suspend(Some(Duration::from_secs(5)))?;
                start.start("200 OK", vec![])?;
                Ok("resumed".into())
            };
            let server = start(config(), app).await;
            let mut client = Client::connect(server.addr).await;
            assert_eq!(client.get("/").await.text(), "resumed");
        })
        .await;
}

#[tokio::test]
async fn test_stop_ends_serve() {
    LocalSet::new()
        .run_until(async {
            let app = |_env: &mut Environ, start: &mut StartResponse| -> Result<ResponseBody, AppError> {
                start.start("200 OK", vec![])?;
                Ok(ResponseBody::Empty)
            };
            let server = start(config(), app).await;
            server.hub.stop(Some(Duration::from_millis(100)));
            let result = tokio::time::timeout(Duration::from_secs(2), server.handle)
                .await
                .expect("serve returned");
            assert!(result.unwrap().is_ok());
        })
        .await;
}

#[tokio::test]
async fn test_watchdog_runs_every_iteration() {
    LocalSet::new()
        .run_until(async {
            let app = |_env: &mut Environ, start: &mut StartResponse| -> Result<ResponseBody, AppError> {
                start.start("200 OK", vec![])?;
                Ok(ResponseBody::Empty)
            };
            let mut server = Server::bind(config()).await.unwrap();
            let addr = server.local_addr().unwrap();
            let hub = server.hub();
            let ticks = Arc::new(AtomicUsize::new(0));
            let seen = Arc::clone(&ticks);
            server.set_watchdog(move || {
                seen.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("watchdog errors are only logged")
            });
            let handle = tokio::task::spawn_local(server.serve(app));

            let mut client = Client::connect(addr).await;
            assert_eq!(client.get("/").await.status, 200);
            assert!(ticks.load(Ordering::SeqCst) > 0);

            hub.stop(Some(Duration::from_millis(100)));
            let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap();
            assert!(result.unwrap().is_ok());
        })
        .await;
}
