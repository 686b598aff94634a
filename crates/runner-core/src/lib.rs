#![forbid(unsafe_code)]

//! Core runner engine: control-plane client, task queue, state machine,
//! downloader, transcoder, and uploader behind a single lifecycle type.

pub mod backend;
pub mod carry;
pub mod downloader;
pub mod error;
pub mod http;
pub mod model;
pub mod queue;
pub mod runner;
pub mod state_machine;
pub mod system_probe;
pub mod transcoder;
pub mod uploader;
pub mod workspace;

pub use backend::Backend;
pub use carry::{CarryEntry, CarryStore};
pub use downloader::Downloader;
pub use error::{ErrorCode, RunnerError};
pub use http::ControlPlaneClient;
pub use queue::{QueueSnapshot, StageCounts, TaskQueue};
pub use runner::Runner;
pub use state_machine::{drive, StateContext, TaskState};
pub use system_probe::{Encoder, SystemInfo};
pub use transcoder::{TranscodeOutcome, Transcoder};
pub use uploader::{UploadMetadata, Uploader};
pub use workspace::TaskWorkspace;
