use std::{path::Path, time::Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{info, warn};

use crate::{
    config::{InferenceConfig, DEFAULT_GPU_LAYERS},
    engine::{ChatMessage, ContentPart, EngineHandle, FragmentStream, InferenceEngine, LoadRequest},
    resolver::ResolvedModel,
    spinner::ProgressIndicator,
    suppress::{self, suppressed},
    Error, Result,
};

/// Fixed system preamble sent at the start of every turn.
pub const SYSTEM_PROMPT: &str = "You are an assistant who perfectly describes images.";

/// How to bring the engine up, beyond the model files themselves.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub gpu_layers: i32,
    pub profiling: bool,
    /// Animate a spinner on the terminal while loading.
    pub spinner: bool,
    /// Silence stdout and stderr for the whole process while loading.
    pub suppress: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            gpu_layers: DEFAULT_GPU_LAYERS,
            profiling: false,
            spinner: true,
            suppress: true,
        }
    }
}

/// A loaded model plus the generation settings used for every turn.
///
/// Turns are independent: each call to [`converse`](Self::converse) sends the
/// system preamble and a single user message, with no history.
pub struct ChatSession<H> {
    handle: H,
    config: InferenceConfig,
}

impl<H: EngineHandle> ChatSession<H> {
    pub fn new(handle: H, config: InferenceConfig) -> Self {
        Self { handle, config }
    }

    /// Load `model` with `engine`, silencing the engine's own output and
    /// showing a spinner on the terminal while it works.
    pub fn load<E>(
        engine: &E,
        model: &ResolvedModel,
        config: InferenceConfig,
        options: &LoadOptions,
    ) -> Result<Self>
    where
        E: InferenceEngine<Handle = H>,
    {
        let request = LoadRequest {
            model_path: model.model_path.clone(),
            projector_path: Some(model.projector_path.clone()),
            context_size: config.context_length,
            gpu_layers: options.gpu_layers,
            chat_template: Some(model.chat_template.clone()),
        };
        let start = Instant::now();
        let load = || {
            if options.suppress {
                suppressed(|| engine.load(&request))
            } else {
                engine.load(&request)
            }
        };
        let terminal = if options.spinner {
            suppress::terminal_writer()
                .map_err(|e| warn!("No terminal for the progress indicator: {e}"))
                .ok()
        } else {
            None
        };
        let handle = match terminal {
            Some(out) => ProgressIndicator::default().wrap(out, load),
            None => load(),
        }?;
        if options.profiling {
            info!("Model loaded in {:.2}s", start.elapsed().as_secs_f64());
        }
        Ok(Self::new(handle, config))
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Send one turn and stream the reply.
    ///
    /// Blank text counts as absent. An image path that is not a file is
    /// logged and dropped, and the turn continues with text only.
    pub fn converse(&self, text: Option<&str>, image: Option<&Path>) -> Result<FragmentStream<'_>> {
        let messages = build_messages(text, image)?;
        self.handle.stream_chat(&messages, &self.config)
    }
}

/// The two-message conversation for a single turn.
pub fn build_messages(text: Option<&str>, image: Option<&Path>) -> Result<Vec<ChatMessage>> {
    let text = text.map(str::trim).filter(|t| !t.is_empty());
    let image = image.filter(|path| {
        let exists = path.is_file();
        if !exists {
            warn!("'{}' is not a path to an image, ignoring it", path.display());
        }
        exists
    });
    if text.is_none() && image.is_none() {
        return Err(Error::EmptyInput);
    }
    let mut parts = Vec::with_capacity(2);
    if let Some(path) = image {
        parts.push(ContentPart::image_url(image_data_uri(path)?));
    }
    parts.push(ContentPart::text(text.unwrap_or_default()));
    Ok(vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(parts)])
}

/// Inline an image file as a `data:` URI.
pub fn image_data_uri(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(format!(
        "data:{};base64,{}",
        image_mime(path),
        STANDARD.encode(bytes)
    ))
}

fn image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "image/png",
    }
}
