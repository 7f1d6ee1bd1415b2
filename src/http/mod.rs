//! HTTP/1.x protocol layer.
//!
//! - **`parser`**: incremental parser reporting through callbacks
//! - **`request`**: requests, request bodies and the per-connection queue
//! - **`environ`**: the view of a request handed to the application
//! - **`response`**: `start_response`, response bodies and error pages
//! - **`writer`**: header assembly and the output pipeline
//! - **`connection`**: the per-connection state machine
//! - **`date`**: cached `Date` header values
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!   ┌───►│   Reading   │ ← parse into the request queue; 100-continue
//!   │    └──────┬──────┘
//!   │           │ front request complete or failed
//!   │           ▼
//!   │    ┌──────────────┐   bad request   ┌─────────┐
//!   │    │ Dispatching  │────────────────►│  Error  │──► Closed
//!   │    └──────┬───────┘                 └─────────┘
//!   │           │ spawn task
//!   │           ▼
//!   │    ┌──────────────┐ ◄─ suspend / trampoline / sleep
//!   │    │  Responding  │ ◄─ head, chunks, sendfile
//!   │    └──────┬───────┘
//!   │           │ response flushed
//!   └── Keep-Alive ─┤
//!                   └─ Close → Closed
//! ```

pub mod connection;
pub mod date;
pub mod environ;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
