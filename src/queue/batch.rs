use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ConductorError, Result};
use crate::queue::machine_queue::MachineQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOpKind {
    Reorder,
    Qty,
    Pause,
    Delete,
    Clear,
}

/// One queue mutation in the operator wire format `{type, jobId?, value?}`.
///
/// - `reorder` with `jobId`: move that job to position `value` (1-based)
/// - `reorder` without `jobId`: `value` is the complete new id order
/// - `qty`: set quantity to `value`
/// - `pause`: set paused to `value` (default `true`)
/// - `delete`: remove `jobId`
/// - `clear`: remove every waiting job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOp {
    #[serde(rename = "type")]
    pub kind: BatchOpKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl BatchOp {
    pub fn reorder(job_ids: &[Uuid]) -> Self {
        Self {
            kind: BatchOpKind::Reorder,
            job_id: None,
            value: Some(Value::from(
                job_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
            )),
        }
    }

    pub fn move_to(job_id: Uuid, position: u32) -> Self {
        Self {
            kind: BatchOpKind::Reorder,
            job_id: Some(job_id),
            value: Some(Value::from(position)),
        }
    }

    pub fn qty(job_id: Uuid, quantity: u32) -> Self {
        Self {
            kind: BatchOpKind::Qty,
            job_id: Some(job_id),
            value: Some(Value::from(quantity)),
        }
    }

    pub fn pause(job_id: Uuid, paused: bool) -> Self {
        Self {
            kind: BatchOpKind::Pause,
            job_id: Some(job_id),
            value: Some(Value::from(paused)),
        }
    }

    pub fn delete(job_id: Uuid) -> Self {
        Self {
            kind: BatchOpKind::Delete,
            job_id: Some(job_id),
            value: None,
        }
    }

    pub fn clear() -> Self {
        Self {
            kind: BatchOpKind::Clear,
            job_id: None,
            value: None,
        }
    }

    fn require_job(&self) -> Result<Uuid> {
        self.job_id.ok_or_else(|| {
            ConductorError::InvalidRequest(format!("{:?} operation requires jobId", self.kind))
        })
    }

    fn u32_value(&self) -> Result<u32> {
        self.value
            .as_ref()
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| {
                ConductorError::InvalidRequest(format!(
                    "{:?} operation requires a non-negative integer value",
                    self.kind
                ))
            })
    }

    fn id_list(&self) -> Result<Vec<Uuid>> {
        let invalid =
            || ConductorError::InvalidRequest("reorder value must be a list of job ids".into());
        let items = self.value.as_ref().and_then(Value::as_array).ok_or_else(invalid)?;
        items
            .iter()
            .map(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()).ok_or_else(invalid))
            .collect()
    }

    /// Apply this operation to `queue`.
    pub fn apply(&self, queue: &mut MachineQueue) -> Result<()> {
        match self.kind {
            BatchOpKind::Reorder => match self.job_id {
                Some(job_id) => queue.move_to(job_id, self.u32_value()?),
                None => queue.reorder(&self.id_list()?),
            },
            BatchOpKind::Qty => {
                let job_id = self.require_job()?;
                queue.set_quantity(job_id, self.u32_value()?).map(|_| ())
            }
            BatchOpKind::Pause => {
                let job_id = self.require_job()?;
                let paused = match &self.value {
                    None => true,
                    Some(v) => v.as_bool().ok_or_else(|| {
                        ConductorError::InvalidRequest("pause value must be a boolean".into())
                    })?,
                };
                queue.set_paused(job_id, paused).map(|_| ())
            }
            BatchOpKind::Delete => queue.remove(self.require_job()?).map(|_| ()),
            BatchOpKind::Clear => {
                queue.clear();
                Ok(())
            }
        }
    }
}

/// Apply `ops` in order, all or nothing.
///
/// Every referenced job must be waiting when the batch starts; otherwise the
/// client worked from an outdated list and the batch is refused. On any error
/// `queue` is left exactly as it was and a `StaleBatchApply` carries the
/// untouched job list.
pub fn apply_all(queue: &mut MachineQueue, ops: &[BatchOp]) -> Result<()> {
    for op in ops {
        if let Some(job_id) = op.job_id {
            if queue.position(job_id).is_none() {
                return Err(queue.stale(format!("job {} is not waiting on this machine", job_id)));
            }
        }
    }

    let mut working = queue.clone();
    for (idx, op) in ops.iter().enumerate() {
        if let Err(e) = op.apply(&mut working) {
            return Err(match e {
                ConductorError::StaleBatchApply { reason, .. } => {
                    queue.stale(format!("operation {}: {}", idx, reason))
                }
                other => other,
            });
        }
    }
    *queue = working;
    Ok(())
}
