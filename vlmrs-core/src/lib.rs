//! Resolve, load and chat with local vision-language models.
//!
//! A model reference is resolved to a model/projector pair by
//! [`PathResolver`], either through the built-in [`ModelRegistry`] of hub keys
//! or from a local directory. [`ChatSession::load`] brings the pair up on an
//! [`InferenceEngine`] and [`ChatSession::converse`] streams replies back as
//! [`Fragment`]s.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod engine;
mod error;
pub mod hub;
pub mod llama_server;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod spinner;
pub mod suppress;

pub use config::{FileConfig, GenerationOverrides, InferenceConfig};
pub use engine::{
    ChatMessage, ContentPart, EngineHandle, Fragment, FragmentStream, InferenceEngine,
    LoadRequest, Role,
};
pub use error::{Error, Result};
pub use hub::{HfHub, ModelHub};
pub use llama_server::{LlamaServerEngine, LlamaServerHandle};
pub use registry::{Artifact, ChatHandler, HubEntry, ModelRegistry};
pub use resolver::{ModelSource, PathResolver, ResolvedModel};
pub use session::{ChatSession, LoadOptions, SYSTEM_PROMPT};
pub use spinner::{with_spinner, ProgressIndicator};
pub use suppress::{suppressed, OutputSuppressor};

/// Install the global `tracing` subscriber.
///
/// Logs go to stderr at `info`, or `debug` when `VLMRS_DEBUG=1`. `RUST_LOG`
/// directives take precedence. Calling this twice is harmless.
pub fn initialize_logging() {
    let is_debug = std::env::var("VLMRS_DEBUG")
        .unwrap_or_default()
        .contains('1');
    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
