//! Generation entry points.
//!
//! A [`Generator`] is bound to one session (control plane plus uploader) and
//! runs the full flow for a [`JobRequest`]:
//!
//! ```text
//! credit check -> upload references -> build draft -> submit -> poll
//! ```
//!
//! [`Generator::generate`] wraps the flow in the whole-flow retry;
//! [`Generator::generate_stream`] runs the same retried flow under a stream
//! emitter.

pub mod request;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{Config, PollConfig, PollPresets, RetryPolicy, StreamConfig};
use crate::draft;
use crate::error::{JimengError, Result};
use crate::job::{GenerationJob, GenerationResult, JobKind, JobRequest};
use crate::poll::{submit, PollEngine};
use crate::retry::with_retry;
use crate::stream::{spawn_emitter, StreamChunk};
use crate::upload::{upload_references, AssetUploader};
use crate::upstream::{ensure_credit, ControlPlane};

pub use request::{expected_assets, is_multi_image_prompt, parse_model, prompt_from_messages, ModelSpec};

/// Most reference images a composition accepts.
pub const MAX_COMPOSITION_INPUTS: usize = 10;

/// Timing knobs shared by every job of a server.
#[derive(Debug, Clone, Default)]
pub struct GenerationSettings {
    /// Poll presets per kind
    pub poll: PollPresets,
    /// Whole-flow retry
    pub retry: RetryPolicy,
    /// Stream timers
    pub stream: StreamConfig,
}

impl From<&Config> for GenerationSettings {
    fn from(config: &Config) -> Self {
        Self {
            poll: config.poll.clone(),
            retry: config.retry.clone(),
            stream: config.stream.clone(),
        }
    }
}

impl GenerationSettings {
    /// Poll preset for `kind`.
    pub fn poll_for(&self, kind: JobKind) -> PollConfig {
        if kind.is_image() {
            self.poll.image.clone()
        } else {
            self.poll.video.clone()
        }
    }
}

/// Runs generation flows for one session.
#[derive(Clone)]
pub struct Generator {
    control: Arc<dyn ControlPlane>,
    uploader: Arc<dyn AssetUploader>,
    settings: Arc<GenerationSettings>,
}

impl Generator {
    /// Generator over a control plane and an uploader.
    pub fn new(
        control: Arc<dyn ControlPlane>,
        uploader: Arc<dyn AssetUploader>,
        settings: Arc<GenerationSettings>,
    ) -> Self {
        Self {
            control,
            uploader,
            settings,
        }
    }

    /// Reject requests no upstream call could satisfy.
    pub fn validate(request: &JobRequest) -> Result<()> {
        if request.kind.is_image() && request.prompt.trim().is_empty() {
            return Err(JimengError::Validation("prompt must not be empty".to_string()));
        }
        if request.kind == JobKind::Composition {
            match request.references.len() {
                0 => {
                    return Err(JimengError::Validation(
                        "at least one input image is required".to_string(),
                    ))
                },
                n if n > MAX_COMPOSITION_INPUTS => {
                    return Err(JimengError::Validation(format!(
                        "at most {MAX_COMPOSITION_INPUTS} input images are supported, got {n}"
                    )))
                },
                _ => {},
            }
        }
        if request.width == 0 || request.height == 0 {
            return Err(JimengError::Validation("width and height must be positive".to_string()));
        }
        Ok(())
    }

    /// One pass of the flow, without retry.
    pub async fn run_once(&self, request: &JobRequest) -> Result<GenerationResult> {
        Self::validate(request)?;
        ensure_credit(self.control.as_ref()).await?;

        let mut prepared = request.clone();
        prepared.references =
            upload_references(self.uploader.as_ref(), request.references.clone()).await?;

        let draft = draft::build(&prepared)?;
        let correlation_id = submit(self.control.as_ref(), &draft).await?;
        let mut job = GenerationJob::submitted(correlation_id, &prepared);

        PollEngine::new(self.control.as_ref(), self.settings.poll_for(request.kind))
            .run(&mut job)
            .await
    }

    /// Run the flow under the whole-flow retry.
    pub async fn generate(&self, request: JobRequest) -> Result<GenerationResult> {
        tracing::info!(
            kind = %request.kind,
            model = %request.model,
            width = request.width,
            height = request.height,
            references = request.references.len(),
            "generation requested"
        );
        with_retry(&self.settings.retry, request.kind.noun(), |run| {
            if run > 0 {
                tracing::info!(run, model = %request.model, "re-running generation");
            }
            self.run_once(&request)
        })
        .await
    }

    /// Run the retried flow in the background and stream its progress.
    pub fn generate_stream(&self, request: JobRequest) -> mpsc::Receiver<StreamChunk> {
        let kind = request.kind;
        let generator = self.clone();
        spawn_emitter(&self.settings.stream, kind, async move {
            generator.generate(request).await
        })
    }
}
