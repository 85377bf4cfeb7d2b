//! Generation job data model.
//!
//! A [`GenerationJob`] is created when the upstream accepts a submission and
//! is mutated only by the poll engine until it reaches a terminal status.
//! Nothing here is persisted: losing the process loses the job, which is why
//! the correlation id is carried into every error raised after submission.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What kind of generation a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Text to image
    Image,
    /// Image blend from uploaded references
    Composition,
    /// Text (and optional frames) to video
    Video,
}

impl JobKind {
    /// Whether results are images.
    pub fn is_image(self) -> bool {
        matches!(self, JobKind::Image | JobKind::Composition)
    }

    /// Noun used in user-facing text.
    pub fn noun(self) -> &'static str {
        if self.is_image() {
            "image"
        } else {
            "video"
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Image => write!(f, "image"),
            JobKind::Composition => write!(f, "composition"),
            JobKind::Video => write!(f, "video"),
        }
    }
}

/// Lifecycle of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Accepted upstream, not yet observed
    Submitted,
    /// Record seen and still running
    Processing,
    /// Finished with at least one asset
    Succeeded,
    /// Upstream reported failure
    Failed,
    /// Poll budget exhausted
    TimedOut,
}

impl JobStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut
        )
    }
}

/// Where a reference asset's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    /// Remote `http(s)` URL
    Remote(String),
    /// Inline `data:<mime>;base64,<payload>` URI
    Inline(String),
}

impl AssetSource {
    /// Classify a caller-supplied string.
    pub fn parse(value: &str) -> Self {
        if is_data_uri(value) {
            AssetSource::Inline(value.to_string())
        } else {
            AssetSource::Remote(value.to_string())
        }
    }

    /// Short description for logs (inline payloads are not echoed).
    pub fn describe(&self) -> String {
        match self {
            AssetSource::Remote(url) => url.clone(),
            AssetSource::Inline(data) => format!("<inline {} bytes>", data.len()),
        }
    }
}

/// Whether `value` is a base64 `data:` URI.
pub fn is_data_uri(value: &str) -> bool {
    value.starts_with("data:") && value.contains(";base64,")
}

/// Position of a reference in the generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetRole {
    /// First image / first frame. Its upload failure aborts the job.
    Primary,
    /// Additional image / last frame. Its upload failure is tolerated.
    Secondary,
}

impl AssetRole {
    /// Role for the reference at `index`.
    pub fn for_index(index: usize) -> Self {
        if index == 0 {
            AssetRole::Primary
        } else {
            AssetRole::Secondary
        }
    }
}

/// A caller-supplied reference image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceAsset {
    /// Byte source
    pub source: AssetSource,
    /// Logical storage URI, filled in after upload
    pub uri: Option<String>,
    /// Role in the generation
    pub role: AssetRole,
    /// Width hint (0 when unknown)
    pub width: u32,
    /// Height hint (0 when unknown)
    pub height: u32,
}

impl ReferenceAsset {
    /// New, not yet uploaded reference.
    pub fn new(source: AssetSource, role: AssetRole) -> Self {
        Self {
            source,
            uri: None,
            role,
            width: 0,
            height: 0,
        }
    }

    /// Build references from raw strings, assigning roles by position.
    pub fn from_inputs<S: AsRef<str>>(inputs: &[S]) -> Vec<Self> {
        inputs
            .iter()
            .map(|s| s.as_ref().trim())
            .filter(|s| !s.is_empty())
            .enumerate()
            .map(|(i, s)| Self::new(AssetSource::parse(s), AssetRole::for_index(i)))
            .collect()
    }
}

/// Everything the caller asks for, after validation.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Kind of generation
    pub kind: JobKind,
    /// Public model name, e.g. `jimeng-4.0`
    pub model: String,
    /// Prompt text
    pub prompt: String,
    /// Negative prompt (images only)
    pub negative_prompt: String,
    /// Target width
    pub width: u32,
    /// Target height
    pub height: u32,
    /// Sample strength (images only)
    pub sample_strength: f64,
    /// Video resolution label, e.g. `720p`
    pub resolution: String,
    /// Explicit seed
    pub seed: Option<u64>,
    /// Reference assets
    pub references: Vec<ReferenceAsset>,
    /// Minimum assets to wait for (multi-image prompts)
    pub expected_assets: Option<usize>,
}

impl JobRequest {
    /// Request with the defaults the upstream web client uses.
    pub fn new(kind: JobKind, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            prompt: prompt.into(),
            negative_prompt: String::new(),
            width: 1024,
            height: 1024,
            sample_strength: 0.5,
            resolution: "720p".to_string(),
            seed: None,
            references: Vec::new(),
            expected_assets: None,
        }
    }

    /// Set target size
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Attach references
    pub fn with_references(mut self, references: Vec<ReferenceAsset>) -> Self {
        self.references = references;
        self
    }
}

/// A submitted job. Mutated only by the poll engine.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    /// Upstream history record id
    pub correlation_id: String,
    /// Kind of generation
    pub kind: JobKind,
    /// Public model name
    pub model: String,
    /// Prompt text
    pub prompt: String,
    /// Target width
    pub width: u32,
    /// Target height
    pub height: u32,
    /// Uploaded references
    pub references: Vec<ReferenceAsset>,
    /// Minimum assets to wait for
    pub expected_assets: Option<usize>,
    /// Current status
    pub status: JobStatus,
    /// Result asset URLs
    pub assets: Vec<String>,
    /// Upstream failure code
    pub fail_code: Option<String>,
}

impl GenerationJob {
    /// Job for a freshly accepted submission.
    pub fn submitted(correlation_id: impl Into<String>, request: &JobRequest) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            kind: request.kind,
            model: request.model.clone(),
            prompt: request.prompt.clone(),
            width: request.width,
            height: request.height,
            references: request.references.clone(),
            expected_assets: request.expected_assets,
            status: JobStatus::Submitted,
            assets: Vec::new(),
            fail_code: None,
        }
    }

    /// Snapshot of a succeeded job.
    pub fn result(&self) -> GenerationResult {
        GenerationResult {
            correlation_id: self.correlation_id.clone(),
            kind: self.kind,
            assets: self.assets.clone(),
            fail_code: self.fail_code.clone(),
        }
    }
}

/// Outcome of a succeeded job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationResult {
    /// Upstream history record id
    pub correlation_id: String,
    /// Kind of generation
    pub kind: JobKind,
    /// Asset URLs, never empty
    pub assets: Vec<String>,
    /// Always `None` on success
    pub fail_code: Option<String>,
}

impl GenerationResult {
    /// Markdown rendering used in chat completions.
    pub fn markdown(&self) -> String {
        self.assets
            .iter()
            .enumerate()
            .map(|(i, url)| asset_markdown(self.kind, i, url))
            .collect()
    }
}

/// `![image_0](url)\n` / `![video](url)\n`
pub fn asset_markdown(kind: JobKind, index: usize, url: &str) -> String {
    if kind.is_image() {
        format!("![image_{index}]({url})\n")
    } else {
        format!("![video]({url})\n")
    }
}
