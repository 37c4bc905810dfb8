//! [`InferenceEngine`] backed by a `llama-server` child process.
//!
//! The server is started on a free loopback port with the model and its
//! projector, polled on `/health` until the weights are loaded, and then
//! driven through the OpenAI-compatible `/v1/chat/completions` endpoint with
//! streaming enabled. The child is killed when the handle is dropped.

use std::{
    collections::VecDeque,
    io::{BufRead, BufReader},
    net::{Ipv4Addr, TcpListener},
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::{Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    config::{InferenceConfig, DEFAULT_ENGINE_BIN, DEFAULT_STARTUP_TIMEOUT_SECS},
    engine::{ChatMessage, EngineHandle, Fragment, FragmentStream, InferenceEngine, LoadRequest},
    Error, Result,
};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// `llama-server` has no "all layers" sentinel, so any larger count means all.
const ALL_GPU_LAYERS: i32 = 999;

/// Engines started by this process that have not been dropped yet.
static RUNNING: Mutex<Vec<u32>> = Mutex::new(Vec::new());

/// Stop every engine process still running. For exit paths that skip destructors.
pub fn terminate_all() {
    let Ok(pids) = RUNNING.lock() else {
        return;
    };
    for &pid in pids.iter() {
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        let _ = pid;
    }
}

fn forget_pid(pid: u32) {
    if let Ok(mut pids) = RUNNING.lock() {
        pids.retain(|&p| p != pid);
    }
}

#[derive(Debug, Clone)]
pub struct LlamaServerEngine {
    binary: PathBuf,
    startup_timeout: Duration,
    quiet: bool,
}

impl Default for LlamaServerEngine {
    fn default() -> Self {
        Self::new(DEFAULT_ENGINE_BIN)
    }
}

impl LlamaServerEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            startup_timeout: Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS),
            quiet: false,
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Send the engine's own output to the null device instead of inheriting
    /// the process descriptors.
    pub fn with_quiet_output(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    fn command(&self, request: &LoadRequest, port: u16) -> Command {
        let gpu_layers = if request.gpu_layers < 0 {
            ALL_GPU_LAYERS
        } else {
            request.gpu_layers
        };
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--model")
            .arg(&request.model_path)
            .arg("--ctx-size")
            .arg(request.context_size.to_string())
            .arg("--n-gpu-layers")
            .arg(gpu_layers.to_string())
            .arg("--host")
            .arg(Ipv4Addr::LOCALHOST.to_string())
            .arg("--port")
            .arg(port.to_string());
        if let Some(projector) = &request.projector_path {
            cmd.arg("--mmproj").arg(projector);
        }
        if let Some(template) = &request.chat_template {
            cmd.arg("--chat-template").arg(template);
        }
        cmd.stdin(Stdio::null());
        // Otherwise inherited, so an active suppressor silences them too.
        if self.quiet {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        // Keep terminal Ctrl-C away from the engine; interrupting a turn must not kill it.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }
}

impl InferenceEngine for LlamaServerEngine {
    type Handle = LlamaServerHandle;

    fn load(&self, request: &LoadRequest) -> Result<LlamaServerHandle> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Option::<Duration>::None)
            .build()
            .map_err(|e| Error::EngineLoad(e.to_string()))?;
        let port = free_port()?;
        let child = self.command(request, port).spawn().map_err(|e| {
            Error::EngineLoad(format!(
                "could not start `{}`: {e}",
                self.binary.display()
            ))
        })?;
        debug!("Started engine (pid {}) on port {port}", child.id());
        if let Ok(mut pids) = RUNNING.lock() {
            pids.push(child.id());
        }
        let handle = LlamaServerHandle {
            child: Mutex::new(child),
            client,
            base_url: format!("http://{}:{port}", Ipv4Addr::LOCALHOST),
        };
        handle.wait_until_ready(self.startup_timeout)?;
        Ok(handle)
    }
}

fn free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// A running `llama-server` with a model loaded.
pub struct LlamaServerHandle {
    child: Mutex<Child>,
    client: reqwest::blocking::Client,
    base_url: String,
}

impl LlamaServerHandle {
    fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let url = format!("{}/health", self.base_url);
        loop {
            if let Some(status) = self.try_wait()? {
                return Err(Error::EngineLoad(format!(
                    "engine exited with {status} while loading the model"
                )));
            }
            match self
                .client
                .get(&url)
                .timeout(HEALTH_REQUEST_TIMEOUT)
                .send()
            {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => debug!("Engine not ready yet: {}", resp.status()),
                Err(e) => debug!("Engine not reachable yet: {e}"),
            }
            if start.elapsed() > timeout {
                return Err(Error::EngineLoad(format!(
                    "engine did not become ready within {}s",
                    timeout.as_secs()
                )));
            }
            thread::sleep(HEALTH_POLL_INTERVAL);
        }
    }

    fn try_wait(&self) -> Result<Option<std::process::ExitStatus>> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| Error::EngineLoad("engine process lock poisoned".to_string()))?;
        Ok(child.try_wait()?)
    }
}

impl EngineHandle for LlamaServerHandle {
    fn stream_chat(
        &self,
        messages: &[ChatMessage],
        config: &InferenceConfig,
    ) -> Result<FragmentStream<'_>> {
        let body = request_body(messages, config);
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body)
            .send()
            .map_err(|e| Error::Generation(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(Error::Generation(format!(
                "engine returned {status}: {text}"
            )));
        }
        Ok(Box::new(SseFragments::new(BufReader::new(resp))))
    }
}

impl Drop for LlamaServerHandle {
    fn drop(&mut self) {
        let child = self.child.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = child.kill() {
            warn!("Could not stop engine process: {e}");
        }
        let _ = child.wait();
        forget_pid(child.id());
    }
}

fn request_body(messages: &[ChatMessage], config: &InferenceConfig) -> Value {
    json!({
        "messages": messages,
        "temperature": config.temperature,
        "max_tokens": config.max_new_tokens,
        "top_k": config.top_k,
        "top_p": config.top_p,
        "stop": config.stop_words,
        "stream": true,
    })
}

#[derive(Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Default, Deserialize)]
struct Delta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// Turns an OpenAI-style server-sent event stream into [`Fragment`]s.
pub struct SseFragments<R> {
    reader: R,
    pending: VecDeque<Fragment>,
    seen_role: bool,
    done: bool,
}

impl<R: BufRead> SseFragments<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: VecDeque::new(),
            seen_role: false,
            done: false,
        }
    }

    fn push_chunk(&mut self, chunk: Chunk) -> Result<()> {
        if let Some(error) = chunk.error {
            return Err(Error::Generation(error.to_string()));
        }
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(());
        };
        if let Some(role) = choice.delta.role {
            self.seen_role = true;
            self.pending.push_back(Fragment::Role(role));
        }
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            // Some server builds skip the opening role delta.
            if !self.seen_role {
                self.seen_role = true;
                self.pending
                    .push_back(Fragment::Role("assistant".to_string()));
            }
            self.pending.push_back(Fragment::Content(content));
        }
        Ok(())
    }

    fn fail(&mut self, err: Error) -> Option<Result<Fragment>> {
        self.done = true;
        self.pending.clear();
        Some(Err(err))
    }
}

impl<R: BufRead> Iterator for SseFragments<R> {
    type Item = Result<Fragment>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(fragment) = self.pending.pop_front() {
                return Some(Ok(fragment));
            }
            if self.done {
                return None;
            }
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) => return self.fail(Error::Generation(e.to_string())),
            }
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                continue;
            }
            let parsed = serde_json::from_str::<Chunk>(data)
                .map_err(|e| Error::Generation(format!("malformed event `{data}`: {e}")))
                .and_then(|chunk| self.push_chunk(chunk));
            if let Err(e) = parsed {
                return self.fail(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::engine::ContentPart;

    fn fragments(raw: &str) -> Vec<Result<Fragment>> {
        SseFragments::new(Cursor::new(raw.to_string())).collect()
    }

    #[test]
    fn parses_role_then_content() {
        let raw = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":null}}]}\n\n",
            ": keep-alive\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"A red\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" apple.\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        );
        let out: Vec<Fragment> = fragments(raw).into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(
            out,
            vec![
                Fragment::Role("assistant".to_string()),
                Fragment::Content("A red".to_string()),
                Fragment::Content(" apple.".to_string()),
            ]
        );
    }

    #[test]
    fn missing_role_is_synthesized() {
        let raw = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n";
        let out: Vec<Fragment> = fragments(raw).into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(
            out,
            vec![
                Fragment::Role("assistant".to_string()),
                Fragment::Content("Hi".to_string()),
            ]
        );
    }

    #[test]
    fn server_error_ends_the_stream() {
        let raw = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"error\":{\"message\":\"context overflow\"}}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n",
        );
        let out = fragments(raw);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Ok(Fragment::Role(_))));
        assert!(matches!(&out[1], Err(Error::Generation(msg)) if msg.contains("context overflow")));
    }

    #[test]
    fn garbage_event_is_a_generation_error() {
        let out = fragments("data: {not json\n");
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(Error::Generation(_))));
    }

    #[test]
    fn request_body_carries_sampling_parameters() {
        let config = InferenceConfig {
            stop_words: vec!["</s>".to_string()],
            ..Default::default()
        };
        let body = request_body(
            &[ChatMessage::user(vec![ContentPart::text("hello")])],
            &config,
        );
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["max_tokens"], json!(2048));
        assert_eq!(body["top_k"], json!(50));
        assert_eq!(body["stop"], json!(["</s>"]));
        assert_eq!(body["messages"][0]["content"][0]["text"], json!("hello"));
    }

    #[test]
    fn command_line_includes_projector_and_template() {
        let engine = LlamaServerEngine::new("/opt/llama-server");
        let request = LoadRequest {
            model_path: PathBuf::from("/m/model.gguf"),
            projector_path: Some(PathBuf::from("/m/proj.gguf")),
            context_size: 4096,
            gpu_layers: -1,
            chat_template: Some("vicuna".to_string()),
        };
        let cmd = engine.command(&request, 8080);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let after = |flag: &str| {
            let i = args.iter().position(|a| a == flag).unwrap();
            args[i + 1].clone()
        };
        assert_eq!(after("--model"), "/m/model.gguf");
        assert_eq!(after("--mmproj"), "/m/proj.gguf");
        assert_eq!(after("--ctx-size"), "4096");
        assert_eq!(after("--n-gpu-layers"), "999");
        assert_eq!(after("--chat-template"), "vicuna");
        assert_eq!(after("--port"), "8080");
    }

    #[test]
    fn missing_binary_is_a_load_error() {
        let engine = LlamaServerEngine::new("/nonexistent/llama-server-binary");
        let request = LoadRequest {
            model_path: PathBuf::from("model.gguf"),
            projector_path: None,
            context_size: 512,
            gpu_layers: 0,
            chat_template: None,
        };
        let err = engine.load(&request).err().unwrap();
        assert!(matches!(err, Error::EngineLoad(_)));
    }

    #[cfg(unix)]
    #[test]
    fn early_exit_is_a_load_error() {
        let engine = LlamaServerEngine::new("false").with_startup_timeout(Duration::from_secs(10));
        let request = LoadRequest {
            model_path: PathBuf::from("model.gguf"),
            projector_path: None,
            context_size: 512,
            gpu_layers: 0,
            chat_template: None,
        };
        let err = engine.load(&request).err().unwrap();
        assert!(matches!(err, Error::EngineLoad(msg) if msg.contains("exited")));
    }

    #[cfg(unix)]
    #[test]
    fn poisoned_handle_still_stops_the_engine() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as libc::pid_t;
        let handle = LlamaServerHandle {
            child: Mutex::new(child),
            client: reqwest::blocking::Client::new(),
            base_url: String::new(),
        };
        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _child = handle.child.lock().unwrap();
            panic!("lock holder died");
        }));
        assert!(poisoned.is_err());
        assert!(handle.child.is_poisoned());

        drop(handle);
        assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
    }
}
