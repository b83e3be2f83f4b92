//! `SharedBatchAdapter`: bridges the engine's sequential,
//! single-token-at-a-time driving of a batch-aware transform to the
//! plugin's own internal worker pool, which may complete results
//! out of order. One adapter per batch-aware transform instance, created
//! lazily on first use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use elspeth_core::error::{ElspethError, ErrorKind, ErrorReason};
use elspeth_core::traits::BatchAwareTransform;
use elspeth_core::{RowData, RunContext};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

type Waiters = Mutex<HashMap<Uuid, oneshot::Sender<Result<RowData, ElspethError>>>>;

/// Per-transform-instance waiter table plus the output-port drain task
/// that completes waiters as the plugin reports results.
pub struct SharedBatchAdapter {
    waiters: Waiters,
    wait_timeout: Duration,
}

impl SharedBatchAdapter {
    /// Build the adapter and wire it to `transform`'s output port. Must
    /// be called exactly once per transform instance, before any
    /// `submit_and_wait` call.
    pub fn connect(transform: &dyn BatchAwareTransform, max_pending: usize) -> Arc<Self> {
        Self::connect_with_timeout(transform, max_pending, DEFAULT_WAIT_TIMEOUT)
    }

    pub fn connect_with_timeout(
        transform: &dyn BatchAwareTransform,
        max_pending: usize,
        wait_timeout: Duration,
    ) -> Arc<Self> {
        let adapter = Arc::new(SharedBatchAdapter { waiters: Mutex::new(HashMap::new()), wait_timeout });
        let (tx, mut rx) = mpsc::unbounded_channel();
        transform.connect_output(tx, max_pending);

        let drain_target = adapter.clone();
        tokio::spawn(async move {
            while let Some((token_id, result)) = rx.recv().await {
                drain_target.complete(token_id, result);
            }
        });
        adapter
    }

    fn complete(&self, token_id: Uuid, result: Result<RowData, ElspethError>) {
        if let Some(sender) = self.waiters.lock().expect("poisoned").remove(&token_id) {
            // The waiter may have already timed out and dropped its
            // receiver; a failed send here is not an engine error.
            let _ = sender.send(result);
        }
    }

    /// Register a waiter for `token_id`, submit the row via `accept`, and
    /// block until the plugin's output port signals completion or the
    /// wait times out. Out-of-order completion across concurrently
    /// in-flight tokens is expected and handled transparently by the
    /// keyed waiter table.
    pub async fn submit_and_wait(
        &self,
        transform: &dyn BatchAwareTransform,
        token_id: Uuid,
        row: RowData,
        ctx: &RunContext,
    ) -> Result<RowData, ElspethError> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().expect("poisoned").insert(token_id, tx);

        if let Err(err) = transform.accept(token_id, row, ctx).await {
            self.waiters.lock().expect("poisoned").remove(&token_id);
            return Err(err);
        }

        match tokio::time::timeout(self.wait_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => Err(ElspethError::Transform(ErrorReason::new(
                ErrorKind::TransformExecution,
                "batch-aware transform output port closed without a result",
                false,
            ))),
            Err(_elapsed) => {
                self.waiters.lock().expect("poisoned").remove(&token_id);
                Err(ElspethError::Transform(ErrorReason::new(
                    ErrorKind::Timeout,
                    format!("waiter for token {token_id} timed out after {:?}", self.wait_timeout),
                    false,
                )))
            }
        }
    }
}

/// Per-run registry of batch-aware transform nodes: the row processor's
/// capability check for "is this node batch-aware" is simply membership
/// in this map, keyed by node id. Each entry owns both the transform
/// handle and its connected adapter.
#[derive(Default)]
pub struct BatchAwareRegistry {
    entries: HashMap<String, (Arc<dyn BatchAwareTransform>, Arc<SharedBatchAdapter>)>,
}

impl BatchAwareRegistry {
    pub fn new() -> Self {
        BatchAwareRegistry { entries: HashMap::new() }
    }

    /// Connect `transform`'s output port and register it under `node_id`.
    /// Call once per batch-aware node at graph build time ("created on
    /// first use" — here, "first use" is pipeline construction, since the
    /// engine has no other hook before the first row reaches the node).
    pub fn register(&mut self, node_id: impl Into<String>, transform: Arc<dyn BatchAwareTransform>, max_pending: usize) {
        let adapter = SharedBatchAdapter::connect(transform.as_ref(), max_pending);
        self.entries.insert(node_id.into(), (transform, adapter));
    }

    pub fn get(&self, node_id: &str) -> Option<(&Arc<dyn BatchAwareTransform>, &Arc<SharedBatchAdapter>)> {
        self.entries.get(node_id).map(|(t, a)| (t, a))
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.entries.contains_key(node_id)
    }
}

/// Adapts a registered batch-aware transform to the plain `Transform`
/// trait so it can also sit in the graph's `NodePlugin::Transform` slot
/// (used for schema validation, `on_error`, etc.) without a second
/// instance — both views share the same `Arc`.
pub struct BatchAwareAsTransform(pub Arc<dyn BatchAwareTransform>);

#[async_trait::async_trait]
impl elspeth_core::Operator for BatchAwareAsTransform {
    fn name(&self) -> &str {
        self.0.name()
    }
}

#[async_trait::async_trait]
impl elspeth_core::Transform for BatchAwareAsTransform {
    fn input_schema(&self) -> &elspeth_core::SchemaContract {
        self.0.input_schema()
    }
    fn output_schema(&self) -> &elspeth_core::SchemaContract {
        self.0.output_schema()
    }
    fn schema_config(&self) -> elspeth_core::SchemaConfig {
        self.0.schema_config()
    }
    fn on_error(&self) -> &elspeth_core::traits::OnError {
        self.0.on_error()
    }
    fn is_batch_aware(&self) -> bool {
        true
    }
    async fn process(&self, row: RowData, ctx: &RunContext) -> Result<elspeth_core::TransformOutput, ElspethError> {
        self.0.process(row, ctx).await
    }
    async fn process_batch(&self, rows: Vec<RowData>, ctx: &RunContext) -> Result<elspeth_core::TransformOutput, ElspethError> {
        self.0.process_batch(rows, ctx).await
    }
}
