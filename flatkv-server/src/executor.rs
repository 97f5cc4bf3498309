// Copyright 2025 flatkv Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Elastic thread pool used by the blocking transport.
//!
//! The pool keeps at least `low_watermark` threads and grows up to `high_watermark` when every thread is busy.
//! Tasks beyond that wait in a queue of at most `max_queue_size` entries; anything more is refused. Threads above
//! the low watermark exit after `idle_timeout` without work.

use std::{
    collections::VecDeque,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use parking_lot::{Condvar, Mutex};

use crate::config::ExecutorConfig;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct State {
    tasks: VecDeque<Task>,
    threads: usize,
    idle: usize,
    spawned: usize,
    running: bool,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("tasks", &self.tasks.len())
            .field("threads", &self.threads)
            .field("idle", &self.idle)
            .field("running", &self.running)
            .finish()
    }
}

#[derive(Debug)]
struct Inner {
    config: ExecutorConfig,
    state: Mutex<State>,
    /// Signalled when a task is queued or the pool stops.
    task_cv: Condvar,
    /// Signalled when the last thread exits.
    exit_cv: Condvar,
}

/// Elastic thread pool.
#[derive(Debug, Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    /// Create a pool and spawn its low watermark threads.
    pub fn new(config: ExecutorConfig) -> std::io::Result<Self> {
        let low_watermark = config.low_watermark;
        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(State {
                running: true,
                ..Default::default()
            }),
            task_cv: Condvar::new(),
            exit_cv: Condvar::new(),
        });
        let executor = Self { inner };

        {
            let mut state = executor.inner.state.lock();
            for _ in 0..low_watermark {
                executor.spawn(&mut state)?;
            }
        }
        Ok(executor)
    }

    /// Schedule `f`. Returns `false` if the pool is stopped or saturated.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if !state.running {
            return false;
        }

        let waiting = state.tasks.len();
        if state.idle <= waiting {
            if state.threads < self.inner.config.high_watermark {
                if let Err(e) = self.spawn(&mut state) {
                    tracing::warn!("[executor]: spawn thread error: {e}");
                    if state.threads == 0 {
                        return false;
                    }
                }
            } else if waiting >= self.inner.config.max_queue_size {
                return false;
            }
        }

        state.tasks.push_back(Box::new(f));
        self.inner.task_cv.notify_one();
        true
    }

    /// Stop accepting tasks. Queued tasks still run. Idle threads exit.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.running = false;
        self.inner.task_cv.notify_all();
    }

    /// Wait until every thread has exited. Requires a prior [`Executor::stop`].
    pub fn join(&self) {
        let mut state = self.inner.state.lock();
        while state.threads > 0 {
            self.inner.exit_cv.wait(&mut state);
        }
    }

    /// Number of live threads.
    pub fn threads(&self) -> usize {
        self.inner.state.lock().threads
    }

    fn spawn(&self, state: &mut State) -> std::io::Result<()> {
        let name = format!("{}-{}", self.inner.config.name, state.spawned);
        let inner = self.inner.clone();
        std::thread::Builder::new().name(name).spawn(move || inner.work())?;
        state.threads += 1;
        state.spawned += 1;
        Ok(())
    }
}

impl Inner {
    fn work(&self) {
        tracing::trace!("[executor]: thread started");
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.tasks.pop_front() {
                drop(state);
                if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::error!("[executor]: task panicked");
                }
                state = self.state.lock();
                continue;
            }

            if !state.running {
                break;
            }

            state.idle += 1;
            let timeout = self.task_cv.wait_for(&mut state, self.config.idle_timeout);
            state.idle -= 1;

            if timeout.timed_out() && state.tasks.is_empty() && state.threads > self.config.low_watermark {
                break;
            }
        }

        state.threads -= 1;
        if state.threads == 0 {
            self.exit_cv.notify_all();
        }
        tracing::trace!("[executor]: thread exited, {} left", state.threads);
    }
}
