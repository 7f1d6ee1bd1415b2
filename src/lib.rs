//! Hearth - embedded HTTP/1.x server
//!
//! Runs a synchronous application callback per request on a single
//! reactor thread. Requests execute as cooperative tasks that can suspend
//! and be resumed from anywhere, so one slow request never blocks the
//! others.

pub mod app;
pub mod buffer;
pub mod config;
pub mod error;
pub mod http;
pub mod scheduler;
pub mod server;
pub mod timer;

pub use app::Application;
pub use config::Config;
pub use error::{AppError, TaskError};
pub use http::environ::Environ;
pub use http::response::{ResponseBody, StartResponse};
pub use server::Server;
