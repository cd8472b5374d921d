//! The process-wide handle that constructs and coordinates event loops
//! (original §2 `TpcEngine`).

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::Config;
use crate::event_loop::{EventLoop, LoopHandle, LoopState, Scheduler};

/// Owns `E` event loops, one OS thread each, optionally pinned to specific
/// CPUs via [`Config::core_ids`].
pub struct TpcEngine {
    handles: Vec<LoopHandle>,
    threads: Vec<JoinHandle<()>>,
}

impl TpcEngine {
    /// Builds and starts `config.loop_count` event loops, each running
    /// `make_scheduler(index)` as its cooperative scheduler.
    pub fn start<S, F>(config: Config, make_scheduler: F) -> std::io::Result<Self>
    where
        S: Scheduler + 'static,
        F: Fn(usize) -> S + Send + Sync + 'static,
    {
        let make_scheduler = std::sync::Arc::new(make_scheduler);
        let mut handles = Vec::with_capacity(config.loop_count);
        let mut threads = Vec::with_capacity(config.loop_count);

        for index in 0..config.loop_count {
            let (event_loop, handle) = EventLoop::new(index, &config)?;
            handles.push(handle);

            let core_id = config
                .core_ids
                .as_ref()
                .and_then(|ids| ids.get(index))
                .copied();
            let make_scheduler = std::sync::Arc::clone(&make_scheduler);

            let thread = std::thread::Builder::new()
                .name(format!("tpcio-{index}"))
                .spawn(move || {
                    if let Some(core_id) = core_id {
                        core_affinity::set_for_current(core_id);
                    }
                    event_loop.set_scheduler(make_scheduler(index));
                    event_loop.run();
                })
                .expect("failed to spawn event loop thread");

            threads.push(thread);
        }

        info!(loop_count = threads.len(), "tpc engine started");

        Ok(TpcEngine { handles, threads })
    }

    /// Builds loops with the default (noop) scheduler — useful when the
    /// engine is only driving socket/file I/O and partition dispatch, with
    /// no external RPC application logic plugged in yet.
    pub fn start_default(config: Config) -> std::io::Result<Self> {
        Self::start(config, |_index| crate::event_loop::NoopScheduler)
    }

    pub fn eventloop_count(&self) -> usize {
        self.handles.len()
    }

    pub fn eventloop(&self, index: usize) -> &LoopHandle {
        &self.handles[index]
    }

    /// The loops in index order; used by [`crate::actor`] for partition-affine routing.
    pub fn eventloops(&self) -> &[LoopHandle] {
        &self.handles
    }

    /// Requests every loop to shut down.
    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.shutdown();
        }
    }

    /// Blocks until every loop thread has terminated or `timeout` elapses.
    /// Returns `true` on clean termination.
    pub fn await_termination(mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        // Not joinable incrementally with a deadline using std's JoinHandle
        // alone; poll loop state first, then join threads that report
        // TERMINATED, bounded by the same deadline.
        while Instant::now() < deadline {
            if self.handles.iter().all(|h| h.state() == LoopState::Terminated) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let all_terminated = self.handles.iter().all(|h| h.state() == LoopState::Terminated);

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }

        all_terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graceful_shutdown_terminates_every_loop() {
        let config = Config {
            loop_count: 2,
            ..Config::default()
        };
        let engine = TpcEngine::start_default(config).unwrap();

        engine.shutdown();
        assert!(engine.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn eventloop_accessor_returns_every_index() {
        let config = Config {
            loop_count: 3,
            ..Config::default()
        };
        let engine = TpcEngine::start_default(config).unwrap();
        assert_eq!(engine.eventloop_count(), 3);
        for i in 0..3 {
            assert_eq!(engine.eventloop(i).index(), i);
        }

        engine.shutdown();
        engine.await_termination(Duration::from_secs(5));
    }
}
