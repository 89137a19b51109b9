//! Model servers: a pool of long-lived threads over one shared request channel.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::config::DispatchConfig;
use crate::error::DispatchError;

use super::message::{ModelCall, ModelId, ModelOutput, ModelReply, ModelRequest, ServerMsg};

/// Inference backend for one model.
///
/// Implementations wrap whatever actually runs the model (a local runtime, an
/// HTTP endpoint, a stub in tests). Errors are reported as text and surface
/// to the caller as [`DispatchError::ModelFailed`].
pub trait ModelBackend: Send + Sync {
    /// Runs one call.
    fn infer(&self, call: &ModelCall) -> Result<ModelOutput, String>;

    /// Runs several calls to the same model at once.
    ///
    /// The default runs them one by one; backends with a fixed per-call cost
    /// override this. Must return exactly one result per call, in order.
    fn infer_batch(&self, calls: &[&ModelCall]) -> Vec<Result<ModelOutput, String>> {
        calls.iter().map(|call| self.infer(call)).collect()
    }
}

/// Adapts a closure into a [`ModelBackend`].
pub struct FnBackend<F>(F);

impl<F> FnBackend<F>
where
    F: Fn(&ModelCall) -> Result<ModelOutput, String> + Send + Sync,
{
    /// Wraps `f`.
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ModelBackend for FnBackend<F>
where
    F: Fn(&ModelCall) -> Result<ModelOutput, String> + Send + Sync,
{
    fn infer(&self, call: &ModelCall) -> Result<ModelOutput, String> {
        (self.0)(call)
    }
}

/// Maps model identifiers to backends.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    backends: HashMap<ModelId, Arc<dyn ModelBackend>>,
}

impl ModelRegistry {
    /// Registry with no backends.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the backend for `model`.
    #[must_use]
    pub fn with(mut self, model: ModelId, backend: impl ModelBackend + 'static) -> Self {
        self.backends.insert(model, Arc::new(backend));
        self
    }

    /// Registers a shared backend for `model`.
    pub fn insert(&mut self, model: ModelId, backend: Arc<dyn ModelBackend>) {
        self.backends.insert(model, backend);
    }

    /// Backend registered for `model`.
    #[must_use]
    pub fn get(&self, model: ModelId) -> Option<&Arc<dyn ModelBackend>> {
        self.backends.get(&model)
    }

    /// Returns true if `model` has a backend.
    #[must_use]
    pub fn contains(&self, model: ModelId) -> bool {
        self.backends.contains_key(&model)
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut models: Vec<_> = self.backends.keys().map(ModelId::as_str).collect();
        models.sort_unstable();
        f.debug_struct("ModelRegistry").field("models", &models).finish()
    }
}

/// Pool of model server threads consuming one shared request channel.
#[derive(Debug)]
pub struct ModelServerPool {
    tx: Sender<ServerMsg>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl ModelServerPool {
    /// Starts `config.servers` server threads.
    pub fn start(config: &DispatchConfig, registry: ModelRegistry) -> Self {
        let servers = config.servers.max(1);
        let queue_capacity = config.queue_capacity.max(1);
        let max_batch = config.max_batch.max(1);
        let (tx, rx) = bounded::<ServerMsg>(queue_capacity);
        let registry = Arc::new(registry);

        let mut handles = Vec::with_capacity(servers);
        for idx in 0..servers {
            let rx: Receiver<ServerMsg> = rx.clone();
            let registry = Arc::clone(&registry);
            let handle = thread::Builder::new()
                .name(format!("vidreason-model-{idx}"))
                .spawn(move || server_loop(&rx, &registry, max_batch))
                .expect("failed to spawn vidreason model server");
            handles.push(handle);
        }

        Self {
            tx,
            workers: handles,
            queue_capacity,
        }
    }

    /// Sender side of the shared request channel.
    #[must_use]
    pub fn requests(&self) -> Sender<ServerMsg> {
        self.tx.clone()
    }

    /// Bound of the shared request queue.
    #[must_use]
    pub const fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Number of server threads.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ModelServerPool {
    fn drop(&mut self) {
        // Shutdown messages queue behind pending requests, so servers drain first.
        for _ in 0..self.workers.len() {
            if self.tx.send(ServerMsg::Shutdown).is_err() {
                break;
            }
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn server_loop(rx: &Receiver<ServerMsg>, registry: &ModelRegistry, max_batch: usize) {
    loop {
        let first = match rx.recv() {
            Ok(ServerMsg::Request(req)) => req,
            Ok(ServerMsg::Shutdown) | Err(_) => break,
        };

        let mut pending = vec![first];
        let mut shutdown = false;
        while pending.len() < max_batch {
            match rx.try_recv() {
                Ok(ServerMsg::Request(req)) => pending.push(req),
                Ok(ServerMsg::Shutdown) => {
                    shutdown = true;
                    break;
                }
                Err(_) => break,
            }
        }

        serve(registry, pending);
        if shutdown {
            break;
        }
    }
}

/// Groups drained requests by model (first-seen order) and serves each group
/// as one batch.
fn serve(registry: &ModelRegistry, pending: Vec<ModelRequest>) {
    let mut groups: Vec<(ModelId, Vec<ModelRequest>)> = Vec::new();
    for req in pending {
        match groups.iter_mut().find(|(model, _)| *model == req.call.model) {
            Some((_, group)) => group.push(req),
            None => groups.push((req.call.model, vec![req])),
        }
    }

    for (model, group) in groups {
        let Some(backend) = registry.get(model) else {
            warn!(%model, "no backend registered");
            for req in group {
                let _ = req.reply.send(ModelReply {
                    id: req.id,
                    result: Err(DispatchError::UnknownModel { model }),
                });
            }
            continue;
        };

        debug!(%model, batch = group.len(), "serving batch");
        let calls: Vec<&ModelCall> = group.iter().map(|req| &req.call).collect();
        let results = catch_unwind(AssertUnwindSafe(|| backend.infer_batch(&calls)))
            .unwrap_or_else(|_| {
                warn!(%model, "backend panicked");
                vec![Err("backend panicked".to_string()); calls.len()]
            });
        let mut results = results.into_iter();

        for req in group {
            let result = match results.next() {
                Some(Ok(output)) => Ok(output),
                Some(Err(message)) => Err(DispatchError::ModelFailed { model, message }),
                None => Err(DispatchError::ModelFailed {
                    model,
                    message: "backend returned fewer results than calls".to_string(),
                }),
            };
            let _ = req.reply.send(ModelReply { id: req.id, result });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crossbeam_channel::unbounded;

    struct CountingBackend {
        batches: Arc<AtomicUsize>,
    }

    impl ModelBackend for CountingBackend {
        fn infer(&self, call: &ModelCall) -> Result<ModelOutput, String> {
            Ok(ModelOutput::Text(call.text_arg(0).unwrap_or_default().to_uppercase()))
        }

        fn infer_batch(&self, calls: &[&ModelCall]) -> Vec<Result<ModelOutput, String>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            calls.iter().map(|call| self.infer(call)).collect()
        }
    }

    fn request(id: u64, model: ModelId, text: &str, reply: &Sender<ModelReply>) -> ServerMsg {
        ServerMsg::Request(ModelRequest {
            id,
            call: ModelCall::new(model).arg(text),
            reply: reply.clone(),
        })
    }

    #[test]
    fn serves_requests_and_replies_on_given_channel() {
        let batches = Arc::new(AtomicUsize::new(0));
        let registry = ModelRegistry::new().with(
            ModelId::Llm,
            CountingBackend {
                batches: Arc::clone(&batches),
            },
        );
        let pool = ModelServerPool::start(&DispatchConfig::default(), registry);
        let (reply_tx, reply_rx) = unbounded();

        pool.requests().send(request(7, ModelId::Llm, "hi", &reply_tx)).unwrap();
        let reply = reply_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reply.id, 7);
        assert_eq!(reply.result.unwrap(), ModelOutput::Text("HI".to_string()));
    }

    #[test]
    fn unknown_model_gets_error_reply() {
        let pool = ModelServerPool::start(&DispatchConfig::default(), ModelRegistry::new());
        let (reply_tx, reply_rx) = unbounded();

        pool.requests().send(request(1, ModelId::Vqa, "x", &reply_tx)).unwrap();
        let reply = reply_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(
            reply.result.unwrap_err(),
            DispatchError::UnknownModel { model: ModelId::Vqa }
        );
    }

    #[test]
    fn serve_batches_same_model_requests() {
        let batches = Arc::new(AtomicUsize::new(0));
        let registry = ModelRegistry::new().with(
            ModelId::Summarizer,
            CountingBackend {
                batches: Arc::clone(&batches),
            },
        );
        let (reply_tx, reply_rx) = unbounded();
        let pending = (0..4)
            .map(|id| ModelRequest {
                id,
                call: ModelCall::new(ModelId::Summarizer).arg("a"),
                reply: reply_tx.clone(),
            })
            .collect();

        serve(&registry, pending);

        assert_eq!(batches.load(Ordering::SeqCst), 1);
        let ids: Vec<u64> = reply_rx.try_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn panicking_backend_is_contained() {
        let registry = ModelRegistry::new().with(
            ModelId::Vqa,
            FnBackend::new(|_| panic!("boom")),
        );
        let (reply_tx, reply_rx) = unbounded();
        serve(
            &registry,
            vec![ModelRequest {
                id: 3,
                call: ModelCall::new(ModelId::Vqa),
                reply: reply_tx,
            }],
        );
        let reply = reply_rx.try_recv().unwrap();
        assert!(matches!(reply.result, Err(DispatchError::ModelFailed { .. })));
    }
}
