//! Process-wide logging init (SPEC_FULL.md §A.2).
//!
//! Grounded in the teacher's `src/web/logger.rs`: a `lazy_static` global,
//! `chrono` timestamps, one line per call. This version drops the
//! per-conversation log-file fan-out (that belonged to the excluded UI
//! layer) and routes everything through the standard `log` facade plus
//! `log4rs`, so every dependency in the graph (including `llama-cpp-2`)
//! logs through the same sink.

use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

/// Initialize the global logger. Safe to call more than once; subsequent
/// calls are no-ops (log4rs returns an error if a logger is already set,
/// which we swallow).
///
/// Targets stderr, not log4rs's default stdout: the worker writes its
/// JSON-lines protocol to stdout (spec §4.1), so anything sharing that
/// stream would corrupt it from the controller's point of view.
pub fn init(level: log::LevelFilter) {
    let encoder = PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}");
    let appender = ConsoleAppender::builder().target(Target::Stderr).encoder(Box::new(encoder)).build();

    let config = Config::builder()
        .appender(Appender::builder().build("console", Box::new(appender)))
        .build(Root::builder().appender("console").build(level));

    if let Ok(config) = config {
        let _ = log4rs::init_config(config);
    }
}

/// Tag prepended to a log line to identify which side of the bridge emitted
/// it, mirroring the teacher's per-conversation tag but fixed to the
/// process role rather than a conversation id.
pub const CONTROLLER_TAG: &str = "controller";
pub const WORKER_TAG: &str = "worker";
