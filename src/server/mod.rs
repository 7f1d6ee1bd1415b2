//! Listening socket, reactor loop and process entry point.
//!
//! The whole server runs on one thread: a current-thread tokio runtime
//! drives a `LocalSet` holding the accept loop and one local task per
//! connection. Request tasks run on their own threads but only while the
//! reactor is blocked handing off to them.

pub mod listener;
pub mod socket;

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::app::Application;
use crate::config::Config;
use crate::http::connection::Connection;
use crate::http::request::Limits;
use crate::scheduler::{Hub, HubHandle};
use crate::server::listener::{Accepted, Listener};
use crate::server::socket::{Peer, Socket};

/// Longest the reactor sleeps without a timer due.
const IDLE_TICK: Duration = Duration::from_secs(10);

/// State every connection of a server shares.
pub(crate) struct ServerContext {
    pub config: Config,
    pub app: Arc<dyn Application>,
    pub hub: HubHandle,
    pub limits: Limits,
    pub server_port: u16,
}

type Watchdog = Box<dyn FnMut() -> anyhow::Result<()>>;

pub struct Server {
    config: Config,
    listener: Listener,
    hub: Hub,
    watchdog: Option<Watchdog>,
}

impl Server {
    pub async fn bind(config: Config) -> anyhow::Result<Self> {
        let listener = Listener::bind(&config.listen, config.backlog).await?;
        let hub = Hub::new(config.task_stack_size);
        Ok(Self {
            config,
            listener,
            hub,
            watchdog: None,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> HubHandle {
        self.hub.handle()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs `f` once per reactor iteration. Errors are logged and the loop
    /// goes on.
    pub fn set_watchdog<F>(&mut self, f: F)
    where
        F: FnMut() -> anyhow::Result<()> + 'static,
    {
        self.watchdog = Some(Box::new(f));
    }

    /// Serves until [`HubHandle::stop`] is called. Must run inside a
    /// `tokio::task::LocalSet`.
    pub async fn serve<A: Application>(mut self, app: A) -> anyhow::Result<()> {
        let cx = Rc::new(ServerContext {
            limits: Limits {
                max_content_length: self.config.max_content_length,
                spool_threshold: self.config.client_body_buffer_size,
                keepalive: self.config.keepalive.enabled,
            },
            app: Arc::new(app),
            hub: self.hub.handle(),
            server_port: self.local_addr().map_or(0, |a| a.port()),
            config: self.config.clone(),
        });
        let active = Rc::new(Cell::new(0usize));
        let closed = Rc::new(Notify::new());
        let mut stop_at: Option<Instant> = None;

        loop {
            let now = Instant::now();
            self.hub.fire_expired(now);
            if let Some(watchdog) = self.watchdog.as_mut() {
                if let Err(e) = watchdog() {
                    warn!(error = %e, "watchdog failed");
                }
            }

            if let Some(deadline) = stop_at {
                if active.get() == 0 {
                    break;
                }
                if now >= deadline {
                    warn!(open = active.get(), "grace period over, dropping open connections");
                    break;
                }
            }

            let accepting = stop_at.is_none() && active.get() < self.config.max_connections;
            let mut wake_at = now + IDLE_TICK;
            if let Some(next) = self.hub.next_deadline() {
                wake_at = wake_at.min(next);
            }
            if let Some(deadline) = stop_at {
                wake_at = wake_at.min(deadline);
            }

            tokio::select! {
                accepted = self.listener.accept(), if accepting => match accepted {
                    Ok(Accepted::Tcp(stream, peer)) => spawn_connection(stream, peer, &cx, &active, &closed),
                    Ok(Accepted::Unix(stream, peer)) => spawn_connection(stream, peer, &cx, &active, &closed),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                command = self.hub.next_command() => {
                    if let Some(grace) = command.and_then(|c| self.hub.apply(c)) {
                        let grace = grace.unwrap_or_else(|| self.config.shutdown_grace());
                        info!(open = active.get(), grace_secs = grace.as_secs(), "stopping");
                        stop_at = Some(Instant::now() + grace);
                    }
                }
                _ = tokio::time::sleep_until(wake_at.into()) => {}
                _ = closed.notified() => {}
            }
        }

        info!("server stopped");
        Ok(())
    }
}

fn spawn_connection<S: Socket>(
    stream: S,
    peer: Peer,
    cx: &Rc<ServerContext>,
    active: &Rc<Cell<usize>>,
    closed: &Rc<Notify>,
) {
    debug!(peer = %peer.addr, port = peer.port, "accepted connection");
    active.set(active.get() + 1);
    let conn = Connection::new(stream, peer.clone(), Rc::clone(cx));
    let active = Rc::clone(active);
    let closed = Rc::clone(closed);
    tokio::task::spawn_local(async move {
        if let Err(e) = conn.run().await {
            debug!(peer = %peer.addr, error = %e, "connection error");
        }
        active.set(active.get() - 1);
        closed.notify_one();
    });
}

/// Runs `app` on a single-threaded reactor until Ctrl-C, then drains
/// open connections for the configured grace period.
pub fn run<A: Application>(config: Config, app: A) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let server = Server::bind(config).await?;
        let hub = server.hub();
        tokio::task::spawn_local(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                hub.stop(None);
            }
        });
        server.serve(app).await
    })
}
