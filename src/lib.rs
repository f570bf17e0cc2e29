//! `git-gateway-core`: a smart-HTTP gateway core for the Git transfer
//! protocol.
//!
//! This crate is a library, not a server: it parses and classifies Git
//! smart-HTTP requests, inspects push/fetch command streams as they pass
//! through (without buffering them), dispatches to a filesystem or HTTP
//! backend, and runs a small middleware lifecycle around the whole
//! request — but it owns no listener and no router. Embedders wire
//! [`Context`], [`Controller`], and [`Backend`] into whatever HTTP server
//! they already run (the way the teacher embeds its own request handling
//! into `axum`).
//!
//! Module map:
//! - [`pktline`] — the pkt-line wire codec and the streaming inspector.
//! - [`service`] — the two Git smart-HTTP services.
//! - [`classify`] — URL/method/content-type classification into a service
//!   request shape.
//! - [`parser`] — push/fetch command-line grammars and the frame sinks
//!   that feed them.
//! - [`context`] — the per-request [`Context`], response materialisation.
//! - [`signals`] — `onUsable`/`onComplete` middleware dispatch.
//! - [`backend`] — filesystem + HTTP backend dispatch.
//! - [`controller`] — the lifecycle-driving logic controller.
//! - [`error`] — the tagged error model.
//! - [`config`] — ambient configuration shape for embedders.
//! - [`logging`] — optional default `tracing` subscriber setup.

pub mod backend;
pub mod classify;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod logging;
pub mod parser;
pub mod pktline;
pub mod service;
pub mod signals;

pub use backend::{Backend, BackendOptions, Origin};
pub use context::{Context, ContextRequest};
pub use controller::{Controller, ControllerOptions, Override};
pub use error::GatewayError;
pub use service::Service;
