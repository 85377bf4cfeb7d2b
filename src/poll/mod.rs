//! Job submission and the status poll loop.
//!
//! ```text
//!   Submitted ──query──▶ Processing ──query──▶ Succeeded
//!       │                    │  ▲               (assets ≥ 1)
//!       │ no record          └──┘ status 20,
//!       ▼                         or 10/50 with no items
//!   (wait, grow delay)       │
//!                            ├──▶ Failed    (status 30)
//!                            └──▶ TimedOut  (attempt budget spent)
//! ```
//!
//! Each attempt queries one of two status endpoints. Past a threshold the
//! engine alternates with the secondary endpoint, which some records only
//! appear on. Before the record is inspected, the raw response text is scanned
//! for a video CDN URL; a hit finishes the job at once.

pub mod extract;

use serde_json::{json, Value};

use crate::config::PollConfig;
use crate::draft::Draft;
use crate::error::{JimengError, Result};
use crate::job::{GenerationJob, GenerationResult, JobKind, JobStatus};
use crate::upstream::{ApiCall, ControlPlane, GENERATE_URI, HISTORY_BY_IDS_URI, HISTORY_RECORDS_URI};

pub use extract::{classify, locate_record, scan_raw, Observation};

/// Log progress every this many attempts.
const PROGRESS_EVERY: u32 = 30;

/// Submit a draft and return the history record id.
pub async fn submit(control: &dyn ControlPlane, draft: &Draft) -> Result<String> {
    let call = ApiCall::post(GENERATE_URI, draft.body.clone())
        .with_params(draft.params.clone())
        .with_common_info();
    let data = control.call(call).await?;

    let id = match data.pointer("/aigc_data/history_record_id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(JimengError::NoRecordId),
    };
    tracing::info!(correlation_id = %id, submit_id = %draft.submit_id, model = draft.model_key, "job submitted");
    Ok(id)
}

/// Thumbnail sizes requested alongside image results.
fn image_info() -> Value {
    let crop = |w: u32, h: u32| {
        json!({"scene": "smart_crop", "width": w, "height": h, "uniq_key": format!("smart_crop-w:{w}-h:{h}"), "format": "webp"})
    };
    let normal = |size: u32| {
        json!({"scene": "normal", "width": size, "height": size, "uniq_key": size.to_string(), "format": "webp"})
    };
    json!({
        "width": 2048,
        "height": 2048,
        "format": "webp",
        "image_scene_list": [
            crop(360, 360), crop(480, 480), crop(720, 720), crop(720, 480),
            normal(2400), normal(1080), normal(720), normal(480), normal(360),
        ],
    })
}

/// Status query for `job`.
pub fn status_call(job: &GenerationJob, secondary: bool) -> ApiCall {
    if secondary {
        return ApiCall::post(
            HISTORY_RECORDS_URI,
            json!({ "history_record_ids": [job.correlation_id] }),
        )
        .with_common_info();
    }
    let mut body = json!({ "history_ids": [job.correlation_id] });
    if job.kind != JobKind::Video {
        body["image_info"] = image_info();
    }
    ApiCall::post(HISTORY_BY_IDS_URI, body).with_common_info()
}

/// Drives one submitted job to a terminal status.
pub struct PollEngine<'a> {
    control: &'a dyn ControlPlane,
    config: PollConfig,
}

impl<'a> PollEngine<'a> {
    /// Engine querying through `control`.
    pub fn new(control: &'a dyn ControlPlane, config: PollConfig) -> Self {
        Self { control, config }
    }

    async fn observe(&self, job: &GenerationJob, secondary: bool) -> Result<Observation> {
        let data = self.control.call(status_call(job, secondary)).await?;

        if let Some(url) = scan_raw(&data.to_string()) {
            tracing::info!(correlation_id = %job.correlation_id, %url, "asset URL found in raw response");
            return Ok(Observation::Done(vec![url]));
        }

        match locate_record(&data, &job.correlation_id) {
            Some(record) => {
                if let Some(code) = extract::fail_code(record) {
                    tracing::debug!(correlation_id = %job.correlation_id, fail_code = %code, "record carries fail code");
                }
                classify(record, job.kind, job.expected_assets, &job.correlation_id)
            },
            None => Ok(Observation::Missing),
        }
    }

    /// Poll until the job finishes, fails or the attempt budget runs out.
    ///
    /// A transport failure on one attempt consumes that attempt. Business
    /// failures end the loop with the typed error.
    pub async fn run(&self, job: &mut GenerationJob) -> Result<GenerationResult> {
        let initial = self.config.initial_delay();
        if !initial.is_zero() {
            tokio::time::sleep(initial).await;
        }

        let max_attempts = self.config.max_attempts;
        let mut record_seen = false;

        for attempt in 0..max_attempts {
            let secondary = self.config.uses_secondary(attempt);
            tracing::debug!(correlation_id = %job.correlation_id, attempt, secondary, "querying job status");

            let delay = match self.observe(job, secondary).await {
                Ok(Observation::Done(assets)) => {
                    job.status = JobStatus::Succeeded;
                    job.assets = assets;
                    tracing::info!(
                        correlation_id = %job.correlation_id,
                        attempt,
                        assets = job.assets.len(),
                        "job succeeded"
                    );
                    return Ok(job.result());
                },
                Ok(Observation::Processing { status, items }) => {
                    record_seen = true;
                    job.status = JobStatus::Processing;
                    if attempt % PROGRESS_EVERY == 0 {
                        tracing::info!(correlation_id = %job.correlation_id, attempt, status, items, "job still processing");
                    }
                    self.config.processing_delay(attempt)
                },
                Ok(Observation::Missing) => {
                    tracing::debug!(correlation_id = %job.correlation_id, attempt, "record not visible yet");
                    self.config.missing_delay(attempt)
                },
                Err(JimengError::UpstreamCallFailed(msg)) => {
                    tracing::warn!(correlation_id = %job.correlation_id, attempt, error = %msg, "status query failed");
                    self.config.missing_delay(attempt)
                },
                Err(err) => {
                    job.status = JobStatus::Failed;
                    if let JimengError::GenerationFailed { fail_code, .. } = &err {
                        job.fail_code = Some(fail_code.clone());
                    }
                    tracing::warn!(correlation_id = %job.correlation_id, attempt, error = %err, "job failed");
                    return Err(err);
                },
            };

            if attempt + 1 < max_attempts {
                tokio::time::sleep(delay).await;
            }
        }

        let correlation_id = job.correlation_id.clone();
        if record_seen {
            job.status = JobStatus::TimedOut;
            tracing::warn!(%correlation_id, max_attempts, "poll budget exhausted");
            Err(JimengError::TimedOut { correlation_id })
        } else {
            job.status = JobStatus::Failed;
            tracing::warn!(%correlation_id, max_attempts, "record never appeared");
            Err(JimengError::RecordMissing { correlation_id })
        }
    }
}
