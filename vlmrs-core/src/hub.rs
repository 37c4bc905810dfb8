use std::path::PathBuf;

use hf_hub::{
    api::sync::{Api, ApiBuilder},
    Repo, RepoType,
};
use tracing::{debug, info};

use crate::{registry::Artifact, Error, Result};

/// Source of model artifacts.
///
/// `pull` is synchronous and idempotent: pulling an artifact that is already
/// cached returns the cached path without touching the network.
pub trait ModelHub {
    fn pull(&self, artifact: &Artifact) -> Result<PathBuf>;
}

/// Hugging Face hub client backed by the shared `hf-hub` cache.
pub struct HfHub {
    api: Api,
}

impl HfHub {
    pub fn new(cache_dir: Option<PathBuf>, token: Option<String>) -> Result<Self> {
        let mut builder = ApiBuilder::new().with_progress(true);
        let cache_dir =
            cache_dir.or_else(|| std::env::var("HF_HUB_CACHE").ok().map(PathBuf::from));
        if let Some(cache_dir) = cache_dir {
            debug!("Using hub cache at {}", cache_dir.display());
            builder = builder.with_cache_dir(cache_dir);
        }
        if token.is_some() {
            builder = builder.with_token(token);
        }
        let api = builder.build().map_err(|e| Error::Hub {
            artifact: "<client>".to_string(),
            source: Box::new(e),
        })?;
        Ok(Self { api })
    }
}

impl ModelHub for HfHub {
    fn pull(&self, artifact: &Artifact) -> Result<PathBuf> {
        info!("Pulling `{artifact}`");
        let repo = self
            .api
            .repo(Repo::new(artifact.repo.to_string(), RepoType::Model));
        repo.get(artifact.file).map_err(|e| Error::Hub {
            artifact: artifact.to_string(),
            source: Box::new(e),
        })
    }
}
