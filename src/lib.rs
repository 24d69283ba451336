//! Local model-serving core: a controller/worker process pair that loads
//! quantized model files into a native inference backend and serves
//! chat-style generation requests (SPEC_FULL.md §OVERVIEW).
//!
//! The controller side (`controller`, `bridge`) is transport-agnostic — it
//! exposes a typed async API over a supervised child process. The worker
//! side (`worker`, `generation`, `loader`, `registry`, `planner`) owns the
//! native backend and every handle it produces; the two communicate only
//! through the JSON-lines envelopes in `envelope`.

pub mod abort;
pub mod backend;
pub mod bridge;
pub mod collaborators;
pub mod controller;
pub mod envelope;
pub mod error;
pub mod generation;
pub mod loader;
pub mod logging;
pub mod planner;
pub mod registry;
pub mod session;
pub mod settings;
pub mod types;
pub mod worker;

pub use controller::Controller;
pub use error::{CoreError, CoreResult};
