use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::capabilities::api::{HttpMethod, RemoteApi};
use crate::error::CoreError;
use crate::model::UnixTimeMs;
use crate::offline::OfflineManager;

/// A mutation recorded while offline, replayed verbatim on reconnect.
/// Immutable once queued apart from the attempt counter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    /// Observability label, e.g. `project.create`. Replay is driven by
    /// method + endpoint + payload, not by the kind.
    pub kind: String,
    pub method: HttpMethod,
    pub endpoint: String,
    #[serde(default)]
    pub payload: Option<Value>,
    pub queued_at: UnixTimeMs,
    #[serde(default)]
    pub attempts: u32,
}

impl Operation {
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        method: HttpMethod,
        endpoint: impl Into<String>,
        payload: Option<Value>,
        queued_at: UnixTimeMs,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            method,
            endpoint: endpoint.into(),
            payload,
            queued_at,
            attempts: 0,
        }
    }
}

/// Outcome of one drain sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub requeued: usize,
}

impl DrainReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.requeued == 0
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.applied + self.requeued
    }
}

/// Replay the queue captured at drain start, sequentially and in enqueue
/// order. Each success is discarded permanently; each failure is re-queued
/// at the end of the queue so a persistently broken operation cannot block
/// the ones behind it. Exactly one sweep: operations queued while the
/// drain runs belong to the next sweep.
#[instrument(skip(offline, api))]
pub async fn drain(offline: &OfflineManager, api: &dyn RemoteApi) -> Result<DrainReport, CoreError> {
    let sweep = offline.take_sweep().await?;
    let mut report = DrainReport::default();
    if sweep.is_empty() {
        return Ok(report);
    }

    info!(count = sweep.len(), "replaying queued operations");

    for mut op in sweep {
        match api.execute(op.method, &op.endpoint, op.payload.as_ref()).await {
            Ok(_) => {
                debug!(op_id = %op.id, kind = %op.kind, "queued operation applied");
                report.applied += 1;
            }
            Err(err) => {
                op.attempts = op.attempts.saturating_add(1);
                warn!(
                    op_id = %op.id,
                    kind = %op.kind,
                    attempts = op.attempts,
                    error = %err,
                    "replay failed, re-queueing at end"
                );
                offline.requeue(op).await?;
                report.requeued += 1;
            }
        }
    }

    info!(
        applied = report.applied,
        requeued = report.requeued,
        "drain sweep finished"
    );
    Ok(report)
}
