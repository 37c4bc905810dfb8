use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use vlmrs_core::{
    config::{DEFAULT_ENGINE_BIN, DEFAULT_GPU_LAYERS, DEFAULT_STARTUP_TIMEOUT_SECS},
    initialize_logging, ChatSession, FileConfig, GenerationOverrides, HfHub, LlamaServerEngine,
    LoadOptions, ModelRegistry, PathResolver,
};

mod interactive_mode;
mod ui;

use interactive_mode::{install_ctrlc_handler, interactive_mode};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Hub key such as `llava-phi3`, or `<dir>/<name>:<tag>` for a local
    /// `model-<tag>` / `projector-<tag>` pair.
    model_path: String,

    /// Sampling temperature. Defaults to 0.8.
    #[arg(short = 't', long)]
    temperature: Option<f64>,

    /// Maximum number of tokens to generate per turn. Defaults to 2048.
    #[arg(short = 'm', long = "max_new_tokens", alias = "max-new-tokens")]
    max_new_tokens: Option<usize>,

    /// Top-k sampling. Defaults to 50.
    #[arg(short = 'k', long = "top_k", alias = "top-k")]
    top_k: Option<usize>,

    /// Top-p sampling. Defaults to 1.0.
    #[arg(short = 'p', long = "top_p", alias = "top-p")]
    top_p: Option<f64>,

    /// Stop generating at any of these strings. `-sw` is accepted too.
    #[arg(long = "stop_words", alias = "stop-words", num_args = 0..)]
    stop_words: Option<Vec<String>>,

    /// Report load time, time to first fragment and throughput. `-pf` is accepted too.
    #[arg(long, default_value_t = false)]
    profiling: bool,

    /// Serve the browser UI instead of the terminal chat. `-st` is accepted too.
    #[arg(long, visible_alias = "ui", default_value_t = false)]
    streamlit: bool,

    /// Configuration file. Defaults to `config.toml` in the user config directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Context window in tokens. Defaults to the generation budget.
    #[arg(long = "ctx_size", alias = "ctx-size")]
    ctx_size: Option<usize>,

    /// Layers to offload to the GPU, -1 for all.
    #[arg(long = "gpu_layers", alias = "gpu-layers", allow_hyphen_values = true)]
    gpu_layers: Option<i32>,

    /// Path to the `llama-server` binary.
    #[arg(long = "engine_bin", alias = "engine-bin", env = "VLMRS_ENGINE_BIN")]
    engine_bin: Option<PathBuf>,

    /// Port for the browser UI.
    #[arg(long = "ui_port", alias = "ui-port", default_value_t = 8501)]
    ui_port: u16,

    /// Hub download cache. Defaults to `HF_HUB_CACHE` or the hf-hub default.
    #[arg(long = "hf_cache", alias = "hf-cache")]
    hf_cache: Option<PathBuf>,
}

/// Map the two-letter short flags, which clap cannot express, to their long forms.
fn normalize_legacy_flags(args: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut positional_only = false;
    args.into_iter()
        .map(|arg| {
            if positional_only {
                return arg;
            }
            match arg.as_str() {
                "--" => {
                    positional_only = true;
                    arg
                }
                "-sw" => "--stop_words".to_string(),
                "-pf" => "--profiling".to_string(),
                "-st" => "--streamlit".to_string(),
                _ => arg,
            }
        })
        .collect()
}

/// The UI server loads lazily while it is serving, so it must not silence the
/// whole process or draw a spinner. The engine's output is dropped at the
/// child instead.
fn load_options(gpu_layers: i32, profiling: bool, ui: bool) -> LoadOptions {
    LoadOptions {
        gpu_layers,
        profiling,
        spinner: !ui,
        suppress: !ui,
    }
}

fn main() {
    let args = Args::parse_from(normalize_legacy_flags(std::env::args()));
    initialize_logging();

    if let Err(e) = run(args) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let file = FileConfig::load_or_default(args.config.as_deref())?;
    let overrides = GenerationOverrides {
        temperature: args.temperature,
        max_new_tokens: args.max_new_tokens,
        top_k: args.top_k,
        top_p: args.top_p,
        stop_words: args.stop_words,
        context_length: args.ctx_size,
    };
    let config = file.inference_config(&overrides);

    let registry = ModelRegistry::builtin()?;
    let hub = HfHub::new(
        args.hf_cache.or_else(|| file.hub.cache_dir.clone()),
        file.hub.token.clone(),
    )?;
    let model = PathResolver::new(&registry, &hub)
        .resolve(&args.model_path)
        .with_context(|| format!("cannot use `{}`", args.model_path))?;
    info!(
        "Using `{}` ({}, {} handler)",
        model.reference, model.source, model.handler
    );

    let engine = LlamaServerEngine::new(
        args.engine_bin
            .or(file.engine.binary)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE_BIN)),
    )
    .with_startup_timeout(Duration::from_secs(
        file.engine
            .startup_timeout_secs
            .unwrap_or(DEFAULT_STARTUP_TIMEOUT_SECS),
    ))
    .with_quiet_output(args.streamlit);
    let options = load_options(
        args.gpu_layers
            .or(file.engine.gpu_layers)
            .unwrap_or(DEFAULT_GPU_LAYERS),
        args.profiling,
        args.streamlit,
    );

    if args.streamlit {
        let state = ui::AppState::new(engine, model, config, options)
            .context("could not create the upload directory")?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        return runtime.block_on(ui::run(state, args.ui_port));
    }

    install_ctrlc_handler()?;
    let session = ChatSession::load(&engine, &model, config, &options)
        .with_context(|| format!("could not load `{}`", model.reference))?;
    interactive_mode(&session, args.profiling)
}
