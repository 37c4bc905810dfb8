use std::fmt;

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

use crate::{Error, Result};

/// How multimodal messages are laid out in the prompt for a model family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum ChatHandler {
    #[default]
    #[serde(rename = "llava-1.5")]
    Llava15,
    #[serde(rename = "llava-1.6")]
    Llava16,
    #[serde(rename = "nanollava")]
    NanoLlava,
}

impl ChatHandler {
    /// Prompt template used by the engine when the hub entry does not name one.
    pub fn default_template(&self) -> &'static str {
        match self {
            Self::Llava15 | Self::Llava16 => "vicuna",
            Self::NanoLlava => "chatml",
        }
    }
}

impl fmt::Display for ChatHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Llava15 => write!(f, "llava-1.5"),
            Self::Llava16 => write!(f, "llava-1.6"),
            Self::NanoLlava => write!(f, "nanollava"),
        }
    }
}

/// A single file in a hub repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub repo: &'static str,
    pub file: &'static str,
}

impl Artifact {
    pub const fn new(repo: &'static str, file: &'static str) -> Self {
        Self { repo, file }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repo, self.file)
    }
}

/// Everything the registry knows about one hub key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubEntry {
    pub key: &'static str,
    pub model: Artifact,
    pub projector: Artifact,
    pub handler: ChatHandler,
    pub chat_template: Option<&'static str>,
}

impl HubEntry {
    pub fn chat_template(&self) -> &'static str {
        self.chat_template
            .unwrap_or_else(|| self.handler.default_template())
    }
}

/// Immutable lookup tables from hub keys to artifacts and chat handlers.
///
/// Built once at startup and passed explicitly to the resolver. The model,
/// projector and handler tables must have identical key sets.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<&'static str, Artifact>,
    projectors: IndexMap<&'static str, Artifact>,
    handlers: IndexMap<&'static str, ChatHandler>,
    templates: IndexMap<&'static str, &'static str>,
}

impl ModelRegistry {
    pub fn new(
        models: IndexMap<&'static str, Artifact>,
        projectors: IndexMap<&'static str, Artifact>,
        handlers: IndexMap<&'static str, ChatHandler>,
        templates: IndexMap<&'static str, &'static str>,
    ) -> Result<Self> {
        let model_keys: IndexSet<_> = models.keys().copied().collect();
        let projector_keys: IndexSet<_> = projectors.keys().copied().collect();
        let handler_keys: IndexSet<_> = handlers.keys().copied().collect();
        if model_keys != projector_keys || model_keys != handler_keys {
            let mismatched: Vec<_> = model_keys
                .symmetric_difference(&projector_keys)
                .chain(model_keys.symmetric_difference(&handler_keys))
                .copied()
                .collect::<IndexSet<_>>()
                .into_iter()
                .collect();
            return Err(Error::Registry(format!(
                "model, projector and handler tables must have the same keys, mismatched: {mismatched:?}"
            )));
        }
        if let Some(key) = templates.keys().find(|k| !models.contains_key(*k)) {
            return Err(Error::Registry(format!(
                "chat template given for unknown model `{key}`"
            )));
        }
        Ok(Self {
            models,
            projectors,
            handlers,
            templates,
        })
    }

    /// The models published on the public hub.
    pub fn builtin() -> Result<Self> {
        let models = IndexMap::from([
            (
                "nanollava",
                Artifact::new("abetlen/nanollava-gguf", "nanollava-text-model-f16.gguf"),
            ),
            (
                "llava-phi3",
                Artifact::new("xtuner/llava-phi-3-mini-gguf", "llava-phi-3-mini-int4.gguf"),
            ),
            (
                "llava-llama3",
                Artifact::new(
                    "xtuner/llava-llama-3-8b-v1_1-gguf",
                    "llava-llama-3-8b-v1_1-int4.gguf",
                ),
            ),
            (
                "llava1.6-mistral",
                Artifact::new(
                    "cjpais/llava-1.6-mistral-7b-gguf",
                    "llava-v1.6-mistral-7b.Q4_K_M.gguf",
                ),
            ),
            (
                "llava1.6-vicuna",
                Artifact::new(
                    "cjpais/llava-v1.6-vicuna-7b-gguf",
                    "llava-v1.6-vicuna-7b.Q4_K_M.gguf",
                ),
            ),
        ]);
        let projectors = IndexMap::from([
            (
                "nanollava",
                Artifact::new("abetlen/nanollava-gguf", "nanollava-mmproj-f16.gguf"),
            ),
            (
                "llava-phi3",
                Artifact::new(
                    "xtuner/llava-phi-3-mini-gguf",
                    "llava-phi-3-mini-mmproj-f16.gguf",
                ),
            ),
            (
                "llava-llama3",
                Artifact::new(
                    "xtuner/llava-llama-3-8b-v1_1-gguf",
                    "llava-llama-3-8b-v1_1-mmproj-f16.gguf",
                ),
            ),
            (
                "llava1.6-mistral",
                Artifact::new("cjpais/llava-1.6-mistral-7b-gguf", "mmproj-model-f16.gguf"),
            ),
            (
                "llava1.6-vicuna",
                Artifact::new("cjpais/llava-v1.6-vicuna-7b-gguf", "mmproj-model-f16.gguf"),
            ),
        ]);
        let handlers = IndexMap::from([
            ("nanollava", ChatHandler::NanoLlava),
            ("llava-phi3", ChatHandler::Llava15),
            ("llava-llama3", ChatHandler::Llava15),
            ("llava1.6-mistral", ChatHandler::Llava16),
            ("llava1.6-vicuna", ChatHandler::Llava16),
        ]);
        let templates = IndexMap::from([
            ("llava-phi3", "phi3"),
            ("llava-llama3", "llama3"),
            ("llava1.6-mistral", "mistral-v1"),
        ]);
        Self::new(models, projectors, handlers, templates)
    }

    pub fn get(&self, key: &str) -> Option<HubEntry> {
        let (&key, model) = self.models.get_key_value(key)?;
        Some(HubEntry {
            key,
            model: *model,
            projector: *self.projectors.get(key)?,
            handler: *self.handlers.get(key)?,
            chat_template: self.templates.get(key).copied(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.models.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.models.keys().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = HubEntry> + '_ {
        self.keys().filter_map(|key| self.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tables_agree() {
        let registry = ModelRegistry::builtin().unwrap();
        let keys: Vec<_> = registry.keys().collect();
        assert_eq!(
            keys,
            vec![
                "nanollava",
                "llava-phi3",
                "llava-llama3",
                "llava1.6-mistral",
                "llava1.6-vicuna"
            ]
        );
        assert_eq!(registry.entries().count(), keys.len());
    }

    #[test]
    fn missing_handler_is_rejected() {
        let models = IndexMap::from([("a", Artifact::new("r", "m.gguf"))]);
        let projectors = IndexMap::from([("a", Artifact::new("r", "p.gguf"))]);
        let handlers = IndexMap::new();
        let err = ModelRegistry::new(models, projectors, handlers, IndexMap::new()).unwrap_err();
        assert!(matches!(err, Error::Registry(msg) if msg.contains("\"a\"")));
    }

    #[test]
    fn extra_projector_is_rejected() {
        let models = IndexMap::from([("a", Artifact::new("r", "m.gguf"))]);
        let projectors = IndexMap::from([
            ("a", Artifact::new("r", "p.gguf")),
            ("b", Artifact::new("r", "p.gguf")),
        ]);
        let handlers = IndexMap::from([("a", ChatHandler::Llava15)]);
        assert!(ModelRegistry::new(models, projectors, handlers, IndexMap::new()).is_err());
    }

    #[test]
    fn handler_and_template_lookup() {
        let registry = ModelRegistry::builtin().unwrap();
        let nano = registry.get("nanollava").unwrap();
        assert_eq!(nano.handler, ChatHandler::NanoLlava);
        assert_eq!(nano.chat_template(), "chatml");

        let phi = registry.get("llava-phi3").unwrap();
        assert_eq!(phi.handler, ChatHandler::Llava15);
        assert_eq!(phi.chat_template(), "phi3");
        assert_eq!(
            phi.model.to_string(),
            "xtuner/llava-phi-3-mini-gguf/llava-phi-3-mini-int4.gguf"
        );

        assert!(registry.get("llava-unknown").is_none());
    }

    #[test]
    fn handler_json_matches_display() {
        for handler in [ChatHandler::Llava15, ChatHandler::Llava16, ChatHandler::NanoLlava] {
            assert_eq!(
                serde_json::to_value(handler).unwrap(),
                serde_json::Value::String(handler.to_string())
            );
        }
    }
}
