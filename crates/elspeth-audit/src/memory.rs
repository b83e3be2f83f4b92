//! In-process `AuditRecorder` for unit and integration tests. Keeps every
//! record in memory behind a single mutex; no ordering guarantees beyond
//! insertion order are needed since nothing else reads concurrently in
//! test scenarios.

use std::sync::Mutex;

use async_trait::async_trait;
use elspeth_core::audit::{
    AuditExport, AuditRecorder, BatchRecord, BatchStatus, ExternalCallRecord, NodeRegistration, NodeStateRecord,
    RoutingEventRecord, RunRecord, RunStatus, SecretResolutionRecord, ValidationErrorRecord,
};
use elspeth_core::error::ElspethError;
use uuid::Uuid;

#[derive(Default)]
struct Store {
    runs: Vec<(RunRecord, RunStatus)>,
    nodes: Vec<NodeRegistration>,
    node_states: Vec<NodeStateRecord>,
    external_calls: Vec<ExternalCallRecord>,
    routing_events: Vec<RoutingEventRecord>,
    batches: Vec<BatchRecord>,
    secret_resolutions: Vec<SecretResolutionRecord>,
    validation_errors: Vec<ValidationErrorRecord>,
}

/// Append-only in-memory audit store. Cheap to construct, safe to share
/// via `Arc`, and fully inspectable after a test run via the `snapshot_*`
/// accessors.
pub struct InMemoryAuditRecorder {
    store: Mutex<Store>,
}

impl Default for InMemoryAuditRecorder {
    fn default() -> Self {
        InMemoryAuditRecorder { store: Mutex::new(Store::default()) }
    }
}

impl InMemoryAuditRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_node_states(&self) -> Vec<NodeStateRecord> {
        self.store.lock().expect("poisoned").node_states.clone()
    }

    pub fn snapshot_routing_events(&self) -> Vec<RoutingEventRecord> {
        self.store.lock().expect("poisoned").routing_events.clone()
    }

    pub fn snapshot_batches(&self) -> Vec<BatchRecord> {
        self.store.lock().expect("poisoned").batches.clone()
    }

    pub fn snapshot_validation_errors(&self) -> Vec<ValidationErrorRecord> {
        self.store.lock().expect("poisoned").validation_errors.clone()
    }

    pub fn run_status(&self, run_id: Uuid) -> Option<RunStatus> {
        self.store.lock().expect("poisoned").runs.iter().find(|(r, _)| r.run_id == run_id).map(|(_, s)| *s)
    }
}

#[async_trait]
impl AuditRecorder for InMemoryAuditRecorder {
    async fn begin_run(&self, record: RunRecord) -> Result<(), ElspethError> {
        self.store.lock().expect("poisoned").runs.push((record, RunStatus::Running));
        Ok(())
    }

    async fn register_node(&self, node: NodeRegistration) -> Result<(), ElspethError> {
        self.store.lock().expect("poisoned").nodes.push(node);
        Ok(())
    }

    async fn record_node_state(&self, record: NodeStateRecord) -> Result<i64, ElspethError> {
        let mut store = self.store.lock().expect("poisoned");
        store.node_states.push(record);
        Ok(store.node_states.len() as i64)
    }

    async fn record_external_call(&self, record: ExternalCallRecord) -> Result<(), ElspethError> {
        self.store.lock().expect("poisoned").external_calls.push(record);
        Ok(())
    }

    async fn record_routing(&self, record: RoutingEventRecord) -> Result<(), ElspethError> {
        self.store.lock().expect("poisoned").routing_events.push(record);
        Ok(())
    }

    async fn record_batch(&self, record: BatchRecord) -> Result<(), ElspethError> {
        self.store.lock().expect("poisoned").batches.push(record);
        Ok(())
    }

    async fn record_secret_resolution(&self, record: SecretResolutionRecord) -> Result<(), ElspethError> {
        self.store.lock().expect("poisoned").secret_resolutions.push(record);
        Ok(())
    }

    async fn record_validation_error(&self, record: ValidationErrorRecord) -> Result<(), ElspethError> {
        self.store.lock().expect("poisoned").validation_errors.push(record);
        Ok(())
    }

    async fn get_incomplete_batches(&self, _run_id: Uuid) -> Result<Vec<BatchRecord>, ElspethError> {
        Ok(self
            .store
            .lock()
            .expect("poisoned")
            .batches
            .iter()
            .filter(|b| matches!(b.status, BatchStatus::Draft | BatchStatus::Executing))
            .cloned()
            .collect())
    }

    async fn update_batch_status(&self, batch_id: &str, status: BatchStatus) -> Result<(), ElspethError> {
        let mut store = self.store.lock().expect("poisoned");
        if let Some(batch) = store.batches.iter_mut().find(|b| b.batch_id == batch_id) {
            batch.status = status;
            if matches!(status, BatchStatus::Completed | BatchStatus::Failed) {
                batch.completed_at = Some(chrono::Utc::now());
            }
        }
        Ok(())
    }

    async fn retry_batch(&self, batch_id: &str) -> Result<(), ElspethError> {
        let mut store = self.store.lock().expect("poisoned");
        if let Some(batch) = store.batches.iter_mut().find(|b| b.batch_id == batch_id) {
            batch.status = BatchStatus::Draft;
            batch.completed_at = None;
        }
        Ok(())
    }

    async fn max_call_index(&self, _run_id: Uuid, node_id: &str) -> Result<u64, ElspethError> {
        let store = self.store.lock().expect("poisoned");
        let node_state_ids: Vec<i64> = store
            .node_states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.node_id == node_id)
            .map(|(idx, _)| (idx + 1) as i64)
            .collect();
        Ok(store
            .external_calls
            .iter()
            .filter(|c| node_state_ids.contains(&c.state_id))
            .map(|c| c.call_index)
            .max()
            .unwrap_or(0))
    }

    async fn complete_run(&self, run_id: Uuid, status: RunStatus) -> Result<(), ElspethError> {
        let mut store = self.store.lock().expect("poisoned");
        if let Some(entry) = store.runs.iter_mut().find(|(r, _)| r.run_id == run_id) {
            entry.1 = status;
        }
        Ok(())
    }

    async fn export_records(&self, run_id: Uuid) -> Result<AuditExport, ElspethError> {
        let store = self.store.lock().expect("poisoned");
        Ok(AuditExport {
            run: store.runs.iter().find(|(r, _)| r.run_id == run_id).map(|(r, _)| r.clone()),
            nodes: store.nodes.clone(),
            node_states: store.node_states.iter().filter(|s| s.run_id == run_id).cloned().collect(),
            external_calls: store.external_calls.clone(),
            routing_events: store.routing_events.clone(),
            batches: store.batches.clone(),
            secret_resolutions: store.secret_resolutions.iter().filter(|s| s.run_id == run_id).cloned().collect(),
            validation_errors: store.validation_errors.iter().filter(|v| v.run_id == run_id).cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use elspeth_core::audit::NodeStateStatus;

    #[tokio::test]
    async fn run_status_transitions_to_completed() {
        let recorder = InMemoryAuditRecorder::new();
        let run_id = Uuid::new_v4();
        recorder
            .begin_run(RunRecord { run_id, started_at: chrono::Utc::now(), config_fingerprint: "fp".into() })
            .await
            .unwrap();
        assert_eq!(recorder.run_status(run_id), Some(RunStatus::Running));
        recorder.complete_run(run_id, RunStatus::Completed).await.unwrap();
        assert_eq!(recorder.run_status(run_id), Some(RunStatus::Completed));
    }

    #[tokio::test]
    async fn node_state_ids_increment() {
        let recorder = InMemoryAuditRecorder::new();
        let run_id = Uuid::new_v4();
        let mk = |node_id: &str| NodeStateRecord {
            run_id,
            token_id: Uuid::new_v4(),
            node_id: node_id.into(),
            status: NodeStateStatus::Completed,
            input_hash: None,
            output_hash: None,
            duration_ms: 0,
            started_at: chrono::Utc::now(),
        };
        let id1 = recorder.record_node_state(mk("a")).await.unwrap();
        let id2 = recorder.record_node_state(mk("b")).await.unwrap();
        assert!(id2 > id1);
    }

    #[tokio::test]
    async fn incomplete_batches_excludes_completed() {
        let recorder = InMemoryAuditRecorder::new();
        recorder
            .record_batch(BatchRecord {
                batch_id: "b1".into(),
                node_id: "agg".into(),
                status: BatchStatus::Executing,
                started_at: chrono::Utc::now(),
                completed_at: None,
                member_count: 3,
                trigger_kind: "count".into(),
                members_json: None,
            })
            .await
            .unwrap();
        recorder.update_batch_status("b1", BatchStatus::Completed).await.unwrap();
        let incomplete = recorder.get_incomplete_batches(Uuid::new_v4()).await.unwrap();
        assert!(incomplete.is_empty());
    }

    #[tokio::test]
    async fn retry_batch_reopens_a_forced_failure_as_draft() {
        let recorder = InMemoryAuditRecorder::new();
        recorder
            .record_batch(BatchRecord {
                batch_id: "b2".into(),
                node_id: "agg".into(),
                status: BatchStatus::Executing,
                started_at: chrono::Utc::now(),
                completed_at: None,
                member_count: 2,
                trigger_kind: "count".into(),
                members_json: Some("[]".into()),
            })
            .await
            .unwrap();
        recorder.update_batch_status("b2", BatchStatus::Failed).await.unwrap();
        recorder.retry_batch("b2").await.unwrap();
        let batch = recorder.snapshot_batches().into_iter().find(|b| b.batch_id == "b2").unwrap();
        assert_eq!(batch.status, BatchStatus::Draft);
        assert!(batch.completed_at.is_none());
    }
}
