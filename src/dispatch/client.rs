//! Worker-side dispatch: reply channel assignment and blocking model calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::{debug, warn};

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::media::{BoundingBox, ImageCrop};

use super::breaker::CircuitBreakers;
use super::message::{ModelCall, ModelId, ModelOutput, ModelReply, ModelRequest, ServerMsg};
use super::server::{ModelRegistry, ModelServerPool};

/// One reply channel. Cloning shares the channel and its correlation id
/// sequence, so ids stay unique across every client ever bound to it.
#[derive(Debug, Clone)]
pub struct ReplyChannel {
    tx: Sender<ModelReply>,
    rx: Receiver<ModelReply>,
    next_id: Arc<AtomicU64>,
}

impl ReplyChannel {
    /// Fresh channel with its own id sequence.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ReplyChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed pool of per-worker reply channels.
#[derive(Debug)]
pub struct ReplyChannelPool {
    channels: Vec<ReplyChannel>,
}

impl ReplyChannelPool {
    /// Pool of `size` channels, at least one.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            channels: (0..size.max(1)).map(|_| ReplyChannel::new()).collect(),
        }
    }

    /// Number of channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Always false; a pool has at least one channel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Index of the channel assigned to `worker_index`.
    #[must_use]
    pub fn slot(&self, worker_index: usize) -> usize {
        worker_index % self.channels.len()
    }

    /// The channel assigned to `worker_index` (worker index modulo pool size).
    #[must_use]
    pub fn assign(&self, worker_index: usize) -> ReplyChannel {
        self.channels[self.slot(worker_index)].clone()
    }
}

/// Timeout and retry policy applied to every call.
#[derive(Debug, Clone, Copy)]
struct CallPolicy {
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

/// A worker's handle on the dispatch layer.
///
/// Calls block until the matching reply arrives on this client's reply
/// channel or the timeout elapses. Replies whose correlation id does not
/// match the outstanding request are late answers to abandoned attempts and
/// are discarded.
#[derive(Debug)]
pub struct DispatchClient {
    worker: usize,
    requests: Sender<ServerMsg>,
    queue_capacity: usize,
    reply: ReplyChannel,
    policy: CallPolicy,
    breakers: Arc<CircuitBreakers>,
}

impl DispatchClient {
    /// Index of the worker this client was created for.
    #[must_use]
    pub const fn worker(&self) -> usize {
        self.worker
    }

    /// Issues `call` and blocks for its reply, retrying retryable failures.
    pub fn call(&self, call: ModelCall) -> Result<ModelOutput, DispatchError> {
        let model = call.model;
        self.breakers.check(model)?;

        let mut attempt = 0u32;
        loop {
            match self.round_trip(call.clone()) {
                Ok(output) => {
                    self.breakers.record_success(model);
                    return Ok(output);
                }
                Err(err) => {
                    // A backend error or unknown model still means the servers answered.
                    if err.is_infrastructure() {
                        self.breakers.record_failure(model);
                    } else {
                        self.breakers.record_success(model);
                    }
                    if !err.is_retryable() || attempt >= self.policy.max_retries {
                        warn!(worker = self.worker, %model, attempt, error = %err, "model call failed");
                        return Err(err);
                    }
                    attempt += 1;
                    warn!(worker = self.worker, %model, attempt, error = %err, "retrying model call");
                    thread::sleep(self.policy.backoff * attempt);
                    self.breakers.check(model)?;
                }
            }
        }
    }

    fn round_trip(&self, call: ModelCall) -> Result<ModelOutput, DispatchError> {
        let model = call.model;
        let id = self.reply.next_id();
        let deadline = Instant::now() + self.policy.timeout;

        let request = ModelRequest {
            id,
            call,
            reply: self.reply.tx.clone(),
        };
        self.requests
            .send_deadline(ServerMsg::Request(request), deadline)
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => DispatchError::QueueFull {
                    capacity: self.queue_capacity,
                },
                SendTimeoutError::Disconnected(_) => DispatchError::Disconnected {
                    channel: "model_requests".to_string(),
                },
            })?;

        loop {
            match self.reply.rx.recv_deadline(deadline) {
                Ok(reply) if reply.id == id => return reply.result,
                Ok(stale) => {
                    debug!(worker = self.worker, stale = stale.id, expected = id, "discarding stale reply");
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(DispatchError::Timeout {
                        model,
                        duration_ms: u64::try_from(self.policy.timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DispatchError::Disconnected {
                        channel: format!("reply-{}", self.worker),
                    });
                }
            }
        }
    }

    /// Calls a text-producing model.
    pub fn call_text(&self, call: ModelCall) -> Result<String, DispatchError> {
        let model = call.model;
        self.call(call)?.into_text(model)
    }

    /// Runs the object detector on `crop`. Boxes are relative to the crop.
    pub fn detect(&self, crop: ImageCrop, object_name: &str) -> Result<Vec<BoundingBox>, DispatchError> {
        self.call(ModelCall::new(ModelId::ObjectDetector).arg(crop).arg(object_name))?
            .into_boxes(ModelId::ObjectDetector)
    }

    /// Identity embedding of the face in `crop`, if the model finds one.
    pub fn face_embedding(&self, crop: ImageCrop) -> Result<Option<Vec<f32>>, DispatchError> {
        self.call(ModelCall::new(ModelId::FaceEmbedding).arg(crop))?
            .into_embedding(ModelId::FaceEmbedding)
    }

    /// Index of the crop that best matches `content`.
    pub fn image_match(&self, crops: Vec<ImageCrop>, content: Vec<String>) -> Result<Option<usize>, DispatchError> {
        self.call(ModelCall::new(ModelId::ImageMatch).arg(crops).arg(content))?
            .into_index(ModelId::ImageMatch)
    }
}

/// Owns the model server pool, the reply channel pool and the breakers, and
/// hands out one [`DispatchClient`] per worker.
#[derive(Debug)]
pub struct Dispatcher {
    config: DispatchConfig,
    servers: ModelServerPool,
    replies: ReplyChannelPool,
    controller_reply: ReplyChannel,
    breakers: Arc<CircuitBreakers>,
}

impl Dispatcher {
    /// Starts the model servers.
    pub fn start(config: &DispatchConfig, registry: ModelRegistry) -> Self {
        Self {
            config: config.clone(),
            servers: ModelServerPool::start(config, registry),
            replies: ReplyChannelPool::new(config.reply_channels),
            controller_reply: ReplyChannel::new(),
            breakers: Arc::new(CircuitBreakers::new(
                config.breaker_threshold,
                config.breaker_cooldown(),
            )),
        }
    }

    /// Worker reply channels.
    #[must_use]
    pub const fn reply_pool(&self) -> &ReplyChannelPool {
        &self.replies
    }

    /// Circuit breakers shared by every client.
    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Client for worker `worker_index`, bound to its assigned reply channel.
    #[must_use]
    pub fn client(&self, worker_index: usize) -> DispatchClient {
        self.make_client(worker_index, self.replies.assign(worker_index))
    }

    /// Client for the controlling thread, on a reply channel no worker uses.
    #[must_use]
    pub fn controller_client(&self) -> DispatchClient {
        self.make_client(usize::MAX, self.controller_reply.clone())
    }

    fn make_client(&self, worker: usize, reply: ReplyChannel) -> DispatchClient {
        DispatchClient {
            worker,
            requests: self.servers.requests(),
            queue_capacity: self.servers.queue_capacity(),
            reply,
            policy: CallPolicy {
                timeout: self.config.request_timeout(),
                max_retries: self.config.max_retries,
                backoff: self.config.retry_backoff(),
            },
            breakers: Arc::clone(&self.breakers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use crate::dispatch::breaker::BreakerState;
    use crate::dispatch::server::FnBackend;

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            servers: 1,
            reply_channels: 4,
            request_timeout_ms: 50,
            max_retries: 2,
            retry_backoff_ms: 1,
            breaker_threshold: 10,
            breaker_cooldown_ms: 1_000,
            ..DispatchConfig::default()
        }
    }

    #[test]
    fn assignment_is_worker_index_modulo_pool_size() {
        let pool = ReplyChannelPool::new(3);
        assert_eq!(pool.slot(0), 0);
        assert_eq!(pool.slot(4), 1);
        assert_eq!(pool.slot(5), 2);
    }

    #[test]
    fn call_text_round_trips() {
        let registry = ModelRegistry::new().with(
            ModelId::Llm,
            FnBackend::new(|call| Ok(ModelOutput::Text(format!("echo {}", call.text_arg(0).unwrap_or(""))))),
        );
        let dispatcher = Dispatcher::start(&fast_config(), registry);
        let client = dispatcher.client(0);
        let reply = client.call_text(ModelCall::new(ModelId::Llm).arg("ping")).unwrap();
        assert_eq!(reply, "echo ping");
    }

    #[test]
    fn timeout_is_retried_then_reported() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let registry = ModelRegistry::new().with(
            ModelId::Vqa,
            FnBackend::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(80));
                Ok(ModelOutput::Text("late".to_string()))
            }),
        );
        let dispatcher = Dispatcher::start(&fast_config(), registry);
        let client = dispatcher.client(1);

        let err = client.call(ModelCall::new(ModelId::Vqa)).unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { model: ModelId::Vqa, .. }));
        // The server is still working through the abandoned attempts.
        thread::sleep(Duration::from_millis(200));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn stale_reply_is_not_mistaken_for_current() {
        // First call is slow and times out; its late reply must not answer the second call.
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let registry = ModelRegistry::new().with(
            ModelId::Llm,
            FnBackend::new(move |call| {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    thread::sleep(Duration::from_millis(70));
                }
                Ok(ModelOutput::Text(call.text_arg(0).unwrap_or("").to_string()))
            }),
        );
        let mut config = fast_config();
        config.max_retries = 0;
        config.servers = 2;
        let dispatcher = Dispatcher::start(&config, registry);
        let client = dispatcher.client(0);

        assert!(client.call_text(ModelCall::new(ModelId::Llm).arg("first")).is_err());
        thread::sleep(Duration::from_millis(40));
        let second = client.call_text(ModelCall::new(ModelId::Llm).arg("second")).unwrap();
        assert_eq!(second, "second");
    }

    #[test]
    fn backend_failure_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let registry = ModelRegistry::new().with(
            ModelId::Summarizer,
            FnBackend::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Err("out of memory".to_string())
            }),
        );
        let dispatcher = Dispatcher::start(&fast_config(), registry);
        let err = dispatcher
            .client(0)
            .call(ModelCall::new(ModelId::Summarizer))
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::ModelFailed {
                model: ModelId::Summarizer,
                message: "out of memory".to_string()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn open_circuit_rejects_without_dispatch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let registry = ModelRegistry::new().with(
            ModelId::Decision,
            FnBackend::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(80));
                Ok(ModelOutput::Text("late".to_string()))
            }),
        );
        let mut config = fast_config();
        config.breaker_threshold = 2;
        config.max_retries = 0;
        config.servers = 2;
        let dispatcher = Dispatcher::start(&config, registry);
        let client = dispatcher.client(0);

        assert!(client.call(ModelCall::new(ModelId::Decision)).is_err());
        assert!(client.call(ModelCall::new(ModelId::Decision)).is_err());
        let err = client.call(ModelCall::new(ModelId::Decision)).unwrap_err();
        assert_eq!(err, DispatchError::CircuitOpen { model: ModelId::Decision });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bad_requests_leave_the_circuit_closed() {
        let registry = ModelRegistry::new().with(
            ModelId::Vqa,
            FnBackend::new(|_| Err("image argument missing".to_string())),
        );
        let mut config = fast_config();
        config.breaker_threshold = 2;
        let dispatcher = Dispatcher::start(&config, registry);
        let client = dispatcher.client(0);

        for _ in 0..5 {
            let err = client.call(ModelCall::new(ModelId::Vqa)).unwrap_err();
            assert!(matches!(err, DispatchError::ModelFailed { .. }));
            let err = client.call(ModelCall::new(ModelId::Llm)).unwrap_err();
            assert!(matches!(err, DispatchError::UnknownModel { .. }));
        }
        assert_eq!(dispatcher.breakers().state(ModelId::Vqa), BreakerState::default());
        assert_eq!(dispatcher.breakers().state(ModelId::Llm), BreakerState::default());
    }

    #[test]
    fn correlation_ids_continue_across_clients_on_one_channel() {
        let registry = ModelRegistry::new().with(
            ModelId::Llm,
            FnBackend::new(|call| {
                let question = call.text_arg(0).unwrap_or("");
                if question == "first" {
                    thread::sleep(Duration::from_millis(80));
                }
                Ok(ModelOutput::Text(format!("answer to {question}")))
            }),
        );
        let config = DispatchConfig {
            servers: 2,
            request_timeout_ms: 30,
            max_retries: 0,
            ..fast_config()
        };
        let dispatcher = Dispatcher::start(&config, registry);

        let first = dispatcher.client(0);
        assert!(first.call_text(ModelCall::new(ModelId::Llm).arg("first")).is_err());
        drop(first);
        // The late reply to "first" is queued on worker 0's channel by now.
        thread::sleep(Duration::from_millis(100));
        let second = dispatcher.client(0);
        let reply = second.call_text(ModelCall::new(ModelId::Llm).arg("second")).unwrap();
        assert_eq!(reply, "answer to second");

        let controller = dispatcher.controller_client();
        assert!(controller.call_text(ModelCall::new(ModelId::Llm).arg("one")).is_ok());
        let again = dispatcher.controller_client();
        assert_eq!(again.call_text(ModelCall::new(ModelId::Llm).arg("two")).unwrap(), "answer to two");
    }
}
