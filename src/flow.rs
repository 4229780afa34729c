//! Digest flows: one `check-price` child per active product, gated behind a
//! `digest-flow` parent that reports the children's outcomes once all of them
//! have settled.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::database::Database;
use crate::queue::{DigestFlowPayload, FlowHandle, Job, JobQueue, JobRecord, JobState, TriggerType};

/// Terminal value of a `check-price` job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutcome {
    pub url: String,
    pub product_id: Option<i64>,
    pub success: bool,
    pub price_cents: Option<i64>,
    pub currency: Option<String>,
    pub error: Option<String>,
}

/// How one child of a flow ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildOutcome {
    pub job_id: i64,
    pub url: Option<String>,
    pub product_id: Option<i64>,
    pub success: bool,
    pub error: Option<String>,
}

impl ChildOutcome {
    fn from_record(record: &JobRecord) -> Self {
        let url = match record.job() {
            Ok(Job::CheckPrice(payload)) => payload.url,
            _ => None,
        };

        match (record.state, record.result_value()) {
            (JobState::Completed, Some(value)) => match serde_json::from_value::<CheckOutcome>(value) {
                Ok(outcome) => Self {
                    job_id: record.id,
                    url: Some(outcome.url),
                    product_id: outcome.product_id,
                    success: outcome.success,
                    error: outcome.error,
                },
                Err(e) => Self {
                    job_id: record.id,
                    url,
                    product_id: None,
                    success: false,
                    error: Some(format!("unreadable check result: {e}")),
                },
            },
            (state, _) => Self {
                job_id: record.id,
                url,
                product_id: None,
                success: false,
                error: record
                    .error
                    .clone()
                    .or_else(|| Some(format!("job ended in state {state:?}"))),
            },
        }
    }
}

/// Published once per flow, after every child reached a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowCompleted {
    pub flow_id: i64,
    pub trigger_type: TriggerType,
    pub outcomes: Vec<ChildOutcome>,
}

impl FlowCompleted {
    pub fn failed(&self) -> impl Iterator<Item = &ChildOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }
}

/// Submit a digest flow over the currently active products.
///
/// With no active product the parent is recorded as completed straight away
/// and nothing is published.
pub async fn create_digest_flow(db: &Database, queue: &JobQueue, trigger_type: TriggerType) -> Result<FlowHandle> {
    let products = db.list_active_products().await?;
    let children: Vec<Job> = products.iter().map(|p| Job::check_price(p.url.clone())).collect();

    let parent = Job::DigestFlow(DigestFlowPayload {
        trigger_type,
        expected_children: children.len(),
    });
    let flow = queue.enqueue_flow(&parent, &children).await?;

    if children.is_empty() {
        info!(flow.id = flow.parent_id, "No active products, digest skipped");
    } else {
        info!(flow.id = flow.parent_id, children = children.len(), ?trigger_type, "Digest flow started");
    }

    Ok(flow)
}

/// Read every child's terminal value for a released flow parent.
pub async fn collect_outcomes(queue: &JobQueue, flow_id: i64) -> Result<Vec<ChildOutcome>> {
    let children = queue.children(flow_id).await?;

    let outcomes = children
        .iter()
        .map(|child| {
            if !child.state.is_terminal() {
                warn!(flow.id = flow_id, job.id = child.id, state = ?child.state, "Flow child not settled");
            }
            ChildOutcome::from_record(child)
        })
        .collect();

    Ok(outcomes)
}
