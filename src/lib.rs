//! # Jimeng Gateway - OpenAI-compatible image and video generation
//!
//! Exposes the Jimeng web generation service behind OpenAI-style chat, image
//! and video endpoints. The upstream has no callbacks: jobs are submitted,
//! polled until they settle, and streamed back to callers while they run.
//!
//! ## Features
//!
//! - **Job orchestration**: submit, poll with adaptive backoff, classify,
//!   extract results from a drifting response schema
//! - **Streaming**: SSE chat chunks with heartbeats while a job runs
//! - **Reference uploads**: SigV4-style signed uploads into object storage
//! - **Whole-flow retry**: transient failures re-run the job, business
//!   outcomes do not
//!
//! ## Architecture
//!
//! ```text
//! caller ──▶ server ──▶ generation ──▶ retry
//!                                       │
//!            ┌──────────────────────────┤
//!            ▼            ▼             ▼
//!         upload ──▶   draft   ──▶    poll ──▶ stream (SSE)
//!            │                          │
//!            └─ signing::sigv4          └─ upstream (signing::device)
//! ```
//!
//! ### Job States
//!
//! ```text
//!     [Submitted] ──▶ [Processing] ──▶ [Succeeded]
//!                          │
//!                          ├──────────▶ [Failed]
//!                          └──────────▶ [TimedOut]
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use jimeng::{Config, Generator, GenerationSettings, JobKind, JobRequest};
//! use jimeng::server::{Backend, UpstreamBackend};
//!
//! let config = Config::default();
//! let client = jimeng::UpstreamClient::new(config.upstream.clone(), Arc::new(jimeng::DeviceIdentity::generate()))?;
//! let backend = UpstreamBackend::new(client, config.clone());
//! let session = backend.session("refresh-token")?;
//! let generator = Generator::new(session.control, session.uploader, Arc::new(GenerationSettings::from(&config)));
//!
//! let request = JobRequest::new(JobKind::Image, "jimeng-4.0", "a cat").with_size(1024, 1024);
//! let result = generator.generate(request).await?;
//! println!("{}", result.markdown());
//! ```
//!
//! ## Modules
//!
//! - [`signing`]: canonical request signer and control-plane signature
//! - [`upload`]: reference asset upload pipeline
//! - [`draft`]: generation payload builder and model map
//! - [`poll`]: job submission and the status state machine
//! - [`stream`]: chunked progress for streaming callers
//! - [`retry`]: whole-flow retry envelope
//! - [`upstream`]: control-plane client and account helpers
//! - [`generation`]: orchestration entry points
//! - [`server`]: OpenAI-compatible HTTP surface

pub mod config;
pub mod draft;
pub mod error;
pub mod generation;
pub mod job;
pub mod poll;
pub mod retry;
pub mod server;
pub mod signing;
pub mod stream;
pub mod upload;
pub mod upstream;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use config::{Config, DeviceIdentity, PollConfig, RetryPolicy, StreamConfig};
pub use error::{JimengError, Result};
pub use generation::{GenerationSettings, Generator};
pub use job::{GenerationJob, GenerationResult, JobKind, JobRequest, JobStatus, ReferenceAsset};
pub use poll::PollEngine;
pub use signing::{sign, Credentials, SignedRequest, SigningScope};
pub use stream::StreamChunk;
pub use upload::{AssetUploader, UploadPipeline};
pub use upstream::{ApiCall, ControlPlane, UpstreamClient, UpstreamSession};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
