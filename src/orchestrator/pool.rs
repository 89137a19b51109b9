//! Fixed pool of execution workers.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

use crate::dispatch::Dispatcher;
use crate::error::{VidError, VidResult};
use crate::executor::{ExecutionRequest, ExecutionResult, ProgramExecutor};

/// Interpreted recursion runs on the worker's native stack.
const WORKER_STACK_SIZE: usize = 16 * 1024 * 1024;

struct Job {
    slot: usize,
    request: ExecutionRequest,
    reply: Sender<(usize, ExecutionResult)>,
}

/// Workers that execute one sample at a time, each with its own dispatch
/// client (and so its own reply channel).
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers (at least one).
    pub fn start(size: usize, executor: ProgramExecutor, dispatcher: &Dispatcher) -> Self {
        let size = size.max(1);
        let executor = Arc::new(executor);
        let (tx, rx) = unbounded::<Job>();

        let mut workers = Vec::with_capacity(size);
        for idx in 0..size {
            let rx: Receiver<Job> = rx.clone();
            let executor = Arc::clone(&executor);
            let client = Arc::new(dispatcher.client(idx));
            let handle = thread::Builder::new()
                .name(format!("vidreason-worker-{idx}"))
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let result = executor.execute(&job.request, Arc::clone(&client));
                        let _ = job.reply.send((job.slot, result));
                    }
                })
                .expect("failed to spawn vidreason worker");
            workers.push(handle);
        }
        debug!(workers = size, "worker pool started");

        Self { tx: Some(tx), workers }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true if the pool has no workers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Executes `requests` and returns their results in the same order.
    pub fn run_batch(&self, requests: Vec<ExecutionRequest>) -> VidResult<Vec<ExecutionResult>> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| VidError::internal("worker pool is shut down"))?;
        let expected = requests.len();
        let (reply_tx, reply_rx) = unbounded();
        for (slot, request) in requests.into_iter().enumerate() {
            let job = Job {
                slot,
                request,
                reply: reply_tx.clone(),
            };
            tx.send(job).map_err(|_| VidError::internal("worker pool is disconnected"))?;
        }
        drop(reply_tx);

        let mut slots: Vec<Option<ExecutionResult>> = vec![None; expected];
        for _ in 0..expected {
            let (slot, result) = reply_rx
                .recv()
                .map_err(|_| VidError::internal("worker exited before replying"))?;
            slots[slot] = Some(result);
        }
        slots
            .into_iter()
            .map(|r| r.ok_or_else(|| VidError::internal("missing worker reply")))
            .collect()
    }

    /// Closes the queue and joins every worker.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("open", &self.tx.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use image::RgbImage;

    use crate::config::DispatchConfig;
    use crate::dispatch::ModelRegistry;
    use crate::media::Video;

    fn request(id: usize, program: String) -> ExecutionRequest {
        ExecutionRequest {
            sample_id: id.to_string(),
            program,
            video: Arc::new(Video::unannotated(vec![RgbImage::new(2, 2)])),
            possible_answers: Vec::new(),
            query: String::new(),
        }
    }

    #[test]
    fn results_keep_request_order() {
        let dispatcher = Dispatcher::start(&DispatchConfig::default(), ModelRegistry::new());
        let pool = WorkerPool::start(3, ProgramExecutor::default(), &dispatcher);
        assert_eq!(pool.len(), 3);

        // Earlier samples do more work so they tend to finish last.
        let requests = (0..6)
            .map(|i| {
                let spins = (6 - i) * 2000;
                request(
                    i,
                    format!(
                        "def execute_command(video):\n    n = 0\n    for _ in range({spins}):\n        n += 1\n    return str({i}), '', {{}}\n"
                    ),
                )
            })
            .collect();
        let results = pool.run_batch(requests).unwrap();
        let answers: Vec<_> = results.iter().map(|r| r.answer.clone().unwrap()).collect();
        assert_eq!(answers, ["0", "1", "2", "3", "4", "5"]);
        pool.shutdown();
    }

    #[test]
    fn empty_batch() {
        let dispatcher = Dispatcher::start(&DispatchConfig::default(), ModelRegistry::new());
        let pool = WorkerPool::start(0, ProgramExecutor::default(), &dispatcher);
        assert_eq!(pool.len(), 1);
        assert!(pool.run_batch(Vec::new()).unwrap().is_empty());
    }
}
