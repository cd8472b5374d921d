//! Test-only entry point backing the `#[tpcio::loop_test]` attribute macro.
//! Mirrors the teacher's `macros::start` + `runtime::start`, generalized
//! from "run the only loop in the process" to "start a one-loop engine,
//! run the body on it, tear the engine down".

use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crate::config::Config;
use crate::engine::TpcEngine;

/// Runs `body` to completion on a freshly started single-loop engine, then
/// shuts the engine down. A panic inside `body` (on the loop's own thread)
/// is caught and re-raised here, on the test thread, so `#[test]` reports
/// it normally.
#[doc(hidden)]
pub fn run_single_loop(body: impl FnOnce() + Send + 'static) {
    let config = Config {
        loop_count: 1,
        ..Config::default()
    };
    let engine = TpcEngine::start_default(config).expect("failed to start test event loop");
    let handle = engine.eventloop(0).clone();

    let (tx, rx) = std::sync::mpsc::channel();
    handle
        .execute(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(body));
            let _ = tx.send(outcome);
        })
        .expect("test event loop rejected the test body");

    let outcome = rx
        .recv_timeout(Duration::from_secs(30))
        .expect("test body did not complete within 30s");

    engine.shutdown();
    engine.await_termination(Duration::from_secs(5));

    if let Err(payload) = outcome {
        panic::resume_unwind(payload);
    }
}
