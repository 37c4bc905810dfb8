//! Mapping model references to model and projector files on disk.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    hub::ModelHub,
    registry::{ChatHandler, ModelRegistry},
    Error, Result,
};

/// Where a resolved model came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A hub key, pulled through the [`ModelHub`].
    Hub(&'static str),
    /// A `model-<tag>` / `projector-<tag>` pair in this directory.
    Local(PathBuf),
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hub(key) => write!(f, "hub:{key}"),
            Self::Local(dir) => write!(f, "local:{}", dir.display()),
        }
    }
}

/// Concrete files for a model reference, plus how to prompt it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub reference: String,
    pub source: ModelSource,
    pub model_path: PathBuf,
    pub projector_path: PathBuf,
    pub handler: ChatHandler,
    pub chat_template: String,
}

pub struct PathResolver<'a> {
    registry: &'a ModelRegistry,
    hub: &'a dyn ModelHub,
}

impl<'a> PathResolver<'a> {
    pub fn new(registry: &'a ModelRegistry, hub: &'a dyn ModelHub) -> Self {
        Self { registry, hub }
    }

    /// Resolve `reference` to a model/projector pair.
    ///
    /// Hub keys take precedence: a reference that matches a key is never
    /// interpreted as a path, even if a file with that name exists.
    pub fn resolve(&self, reference: &str) -> Result<ResolvedModel> {
        if let Some(entry) = self.registry.get(reference) {
            debug!("Found model {reference} in public hub");
            let model_path = self.hub.pull(&entry.model)?;
            let projector_path = self.hub.pull(&entry.projector)?;
            return Ok(ResolvedModel {
                reference: reference.to_string(),
                source: ModelSource::Hub(entry.key),
                model_path,
                projector_path,
                handler: entry.handler,
                chat_template: entry.chat_template().to_string(),
            });
        }
        resolve_local(reference)
    }
}

fn resolve_local(reference: &str) -> Result<ResolvedModel> {
    let path = Path::new(reference);
    let dir = match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
        Some(parent) => parent,
        None => return Err(Error::unresolved(reference, "not a hub key or a file path")),
    };
    if !dir.is_dir() {
        return Err(Error::unresolved(
            reference,
            format!(
                "not a known hub key, and directory {} does not exist",
                dir.display()
            ),
        ));
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::unresolved(reference, "path has no file name"))?;
    let tag = name.rsplit_once(':').map_or(name, |(_, tag)| tag);
    if tag.is_empty() {
        return Err(Error::unresolved(reference, "empty tag after `:`"));
    }

    debug!("Using local model at {}", dir.display());
    let model_path = find_tagged(dir, "model", tag);
    let projector_path = find_tagged(dir, "projector", tag);
    match (model_path, projector_path) {
        (Some(model_path), Some(projector_path)) => Ok(ResolvedModel {
            reference: reference.to_string(),
            source: ModelSource::Local(dir.to_path_buf()),
            model_path,
            projector_path,
            handler: ChatHandler::default(),
            chat_template: ChatHandler::default().default_template().to_string(),
        }),
        _ => Err(Error::unresolved(
            reference,
            format!(
                "model or projector not found in {}, name them `model-{tag}.gguf` and `projector-{tag}.gguf`",
                dir.display()
            ),
        )),
    }
}

/// Find `<prefix>-<tag>` in `dir`, either verbatim (the tag carries the
/// extension) or as the stem of a file with any extension. `.gguf` wins when
/// several extensions are present.
fn find_tagged(dir: &Path, prefix: &str, tag: &str) -> Option<PathBuf> {
    let stem = format!("{prefix}-{tag}");
    let exact = dir.join(&stem);
    if exact.is_file() {
        return Some(exact);
    }
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.file_stem().and_then(|s| s.to_str()) == Some(stem.as_str()))
        .collect();
    candidates.sort();
    candidates
        .iter()
        .position(|p| p.extension().is_some_and(|ext| ext == "gguf"))
        .map(|i| candidates.swap_remove(i))
        .or_else(|| candidates.into_iter().next())
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, fs};

    use super::*;
    use crate::registry::Artifact;

    /// Hands out fake cache paths and records every pull.
    struct FakeHub {
        root: PathBuf,
        pulled: RefCell<Vec<String>>,
    }

    impl FakeHub {
        fn new(root: &Path) -> Self {
            Self {
                root: root.to_path_buf(),
                pulled: RefCell::new(Vec::new()),
            }
        }
    }

    impl ModelHub for FakeHub {
        fn pull(&self, artifact: &Artifact) -> Result<PathBuf> {
            self.pulled.borrow_mut().push(artifact.to_string());
            Ok(self.root.join(artifact.repo).join(artifact.file))
        }
    }

    #[test]
    fn every_hub_key_resolves_to_its_table_entry() {
        let registry = ModelRegistry::builtin().unwrap();
        let hub = FakeHub::new(Path::new("/cache"));
        let resolver = PathResolver::new(&registry, &hub);
        for entry in registry.entries() {
            let resolved = resolver.resolve(entry.key).unwrap();
            assert_eq!(resolved.source, ModelSource::Hub(entry.key));
            assert_eq!(
                resolved.model_path,
                Path::new("/cache").join(entry.model.repo).join(entry.model.file)
            );
            assert_eq!(
                resolved.projector_path,
                Path::new("/cache")
                    .join(entry.projector.repo)
                    .join(entry.projector.file)
            );
            assert_eq!(resolved.handler, entry.handler);
        }
        assert_eq!(hub.pulled.borrow().len(), registry.keys().count() * 2);
    }

    #[test]
    fn local_pair_resolves_by_tag() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("model-v1.gguf"), b"m").unwrap();
        fs::write(dir.path().join("projector-v1.gguf"), b"p").unwrap();
        let registry = ModelRegistry::builtin().unwrap();
        let hub = FakeHub::new(dir.path());

        let reference = format!("{}/anything:v1", dir.path().display());
        let resolved = PathResolver::new(&registry, &hub)
            .resolve(&reference)
            .unwrap();
        assert!(resolved.model_path.ends_with("model-v1.gguf"));
        assert!(resolved.projector_path.ends_with("projector-v1.gguf"));
        assert_eq!(resolved.handler, ChatHandler::Llava15);
        assert!(matches!(resolved.source, ModelSource::Local(_)));
        assert!(hub.pulled.borrow().is_empty());
    }

    #[test]
    fn tag_may_carry_the_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("model-q4.gguf"), b"m").unwrap();
        fs::write(dir.path().join("projector-q4.gguf"), b"p").unwrap();
        let registry = ModelRegistry::builtin().unwrap();
        let hub = FakeHub::new(dir.path());

        let reference = format!("{}/llava:q4.gguf", dir.path().display());
        let resolved = PathResolver::new(&registry, &hub)
            .resolve(&reference)
            .unwrap();
        assert!(resolved.model_path.ends_with("model-q4.gguf"));
    }

    #[test]
    fn missing_projector_is_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("model-v1.gguf"), b"m").unwrap();
        let registry = ModelRegistry::builtin().unwrap();
        let hub = FakeHub::new(dir.path());

        let reference = format!("{}/anything:v1", dir.path().display());
        let err = PathResolver::new(&registry, &hub)
            .resolve(&reference)
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvedModel { .. }));
    }

    #[test]
    fn missing_directory_is_unresolved() {
        let registry = ModelRegistry::builtin().unwrap();
        let hub = FakeHub::new(Path::new("/cache"));
        let err = PathResolver::new(&registry, &hub)
            .resolve("/definitely/not/here/model:v1")
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvedModel { .. }));
    }

    #[test]
    fn bare_hub_key_never_reads_the_filesystem() {
        let registry = ModelRegistry::builtin().unwrap();
        let hub = FakeHub::new(Path::new("/cache"));
        let resolved = PathResolver::new(&registry, &hub)
            .resolve("nanollava")
            .unwrap();
        assert_eq!(resolved.source, ModelSource::Hub("nanollava"));
        assert_eq!(resolved.handler, ChatHandler::NanoLlava);
    }

    #[test]
    fn gguf_preferred_among_extensions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("model-v2.bin"), b"m").unwrap();
        fs::write(dir.path().join("model-v2.gguf"), b"m").unwrap();
        assert_eq!(
            find_tagged(dir.path(), "model", "v2"),
            Some(dir.path().join("model-v2.gguf"))
        );
        assert_eq!(find_tagged(dir.path(), "projector", "v2"), None);
    }
}
