//! Browser front end: a single page plus a streaming chat endpoint.

use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        Html, IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, OnceCell};
use tracing::{error, info, warn};
use vlmrs_core::{
    session::LoadOptions, ChatSession, EngineHandle, Error, Fragment, InferenceConfig,
    InferenceEngine, ResolvedModel,
};

const INDEX_HTML: &str = include_str!("../static/index.html");
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;
const EVENT_BUFFER: usize = 64;

/// Shared by every request. The session is loaded on the first chat request.
pub struct AppState<E: InferenceEngine> {
    engine: E,
    model: ResolvedModel,
    config: InferenceConfig,
    options: LoadOptions,
    session: OnceCell<Arc<ChatSession<E::Handle>>>,
    uploads: tempfile::TempDir,
    next_upload: AtomicUsize,
}

impl<E: InferenceEngine> AppState<E> {
    pub fn new(
        engine: E,
        model: ResolvedModel,
        config: InferenceConfig,
        options: LoadOptions,
    ) -> std::io::Result<Self> {
        Ok(Self {
            engine,
            model,
            config,
            options,
            session: OnceCell::new(),
            uploads: tempfile::Builder::new().prefix("vlmrs-uploads").tempdir()?,
            next_upload: AtomicUsize::new(0),
        })
    }
}

/// One server-sent event of a chat reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UiEvent {
    Role { role: String },
    Content { content: String },
    Error { error: String },
}

impl From<Fragment> for UiEvent {
    fn from(fragment: Fragment) -> Self {
        match fragment {
            Fragment::Role(role) => Self::Role { role },
            Fragment::Content(content) => Self::Content { content },
        }
    }
}

/// Adapts the reply channel to an SSE body, closing with `[DONE]`.
pub struct Streamer {
    rx: mpsc::Receiver<UiEvent>,
    is_done: bool,
}

impl futures::Stream for Streamer {
    type Item = Result<Event, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.is_done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Event::default().json_data(event))),
            Poll::Ready(None) => {
                self.is_done = true;
                Poll::Ready(Some(Ok(Event::default().data("[DONE]"))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn sse(rx: mpsc::Receiver<UiEvent>) -> Response {
    Sse::new(Streamer { rx, is_done: false })
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn single_error(message: String) -> Response {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(UiEvent::Error { error: message });
    sse(rx)
}

/// Run one turn on a blocking thread, forwarding fragments as they arrive.
/// Generation stops when the client goes away and the channel closes.
pub fn stream_reply<H>(
    session: Arc<ChatSession<H>>,
    text: String,
    image: Option<PathBuf>,
) -> mpsc::Receiver<UiEvent>
where
    H: EngineHandle + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    tokio::task::spawn_blocking(move || {
        let stream = match session.converse(Some(text.as_str()), image.as_deref()) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = tx.blocking_send(UiEvent::Error {
                    error: e.to_string(),
                });
                return;
            }
        };
        for fragment in stream {
            let event = match fragment {
                Ok(fragment) => UiEvent::from(fragment),
                Err(e) => {
                    error!("Error during generation: {e:?}");
                    UiEvent::Error {
                        error: e.to_string(),
                    }
                }
            };
            let failed = matches!(event, UiEvent::Error { .. });
            if tx.blocking_send(event).is_err() || failed {
                break;
            }
        }
    });
    rx
}

async fn session<E>(state: &Arc<AppState<E>>) -> Result<Arc<ChatSession<E::Handle>>, String>
where
    E: InferenceEngine + Send + Sync + 'static,
    E::Handle: Send + Sync + 'static,
{
    state
        .session
        .get_or_try_init(|| {
            let state = state.clone();
            async move {
                info!("Loading `{}`", state.model.reference);
                let reference = state.model.reference.clone();
                let loaded = tokio::task::spawn_blocking(move || {
                    ChatSession::load(
                        &state.engine,
                        &state.model,
                        state.config.clone(),
                        &state.options,
                    )
                    .map(Arc::new)
                    .map_err(|e| e.to_string())
                })
                .await
                .unwrap_or_else(|e| Err(e.to_string()));
                if loaded.is_ok() {
                    info!("`{reference}` is ready");
                }
                loaded
            }
        })
        .await
        .cloned()
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn model_info<E>(State(state): State<Arc<AppState<E>>>) -> Json<Value>
where
    E: InferenceEngine + Send + Sync + 'static,
    E::Handle: Send + Sync + 'static,
{
    Json(json!({
        "reference": state.model.reference,
        "source": state.model.source.to_string(),
        "handler": state.model.handler,
        "chat_template": state.model.chat_template,
        "generation": state.config,
        "loaded": state.session.initialized(),
    }))
}

/// Keep only characters that are safe in a file name.
fn upload_name(index: usize, original: Option<&str>) -> String {
    let ext = original
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("png");
    format!("upload-{index}.{ext}")
}

async fn chat<E>(State(state): State<Arc<AppState<E>>>, mut multipart: Multipart) -> Response
where
    E: InferenceEngine + Send + Sync + 'static,
    E::Handle: Send + Sync + 'static,
{
    let mut text = String::new();
    let mut image = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        };
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("text") => match field.text().await {
                Ok(value) => text = value,
                Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
            },
            Some("image") => {
                let name = upload_name(
                    state.next_upload.fetch_add(1, Ordering::Relaxed),
                    field.file_name(),
                );
                let data = match field.bytes().await {
                    Ok(data) => data,
                    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
                };
                if data.is_empty() {
                    continue;
                }
                let path = state.uploads.path().join(name);
                if let Err(e) = tokio::fs::write(&path, &data).await {
                    error!("Could not store upload: {e}");
                    return (StatusCode::INTERNAL_SERVER_ERROR, "failed to store image")
                        .into_response();
                }
                image = Some(path);
            }
            _ => {}
        }
    }

    if text.trim().is_empty() && image.is_none() {
        return (StatusCode::BAD_REQUEST, Error::EmptyInput.to_string()).into_response();
    }

    match session(&state).await {
        Ok(session) => sse(stream_reply(session, text, image)),
        Err(e) => {
            error!("Model failed to load: {e}");
            single_error(e)
        }
    }
}

pub fn router<E>(state: Arc<AppState<E>>) -> Router
where
    E: InferenceEngine + Send + Sync + 'static,
    E::Handle: Send + Sync + 'static,
{
    Router::new()
        .route("/", get(index))
        .route("/api/model", get(model_info::<E>))
        .route("/api/chat", post(chat::<E>))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Serve the UI on `127.0.0.1:port` until Ctrl-C.
pub async fn run<E>(state: AppState<E>, port: u16) -> anyhow::Result<()>
where
    E: InferenceEngine + Send + Sync + 'static,
    E::Handle: Send + Sync + 'static,
{
    let state = Arc::new(state);
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
    info!("Chat UI available at http://{}", listener.local_addr()?);
    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    // The engine handle owns blocking resources that must not be dropped on a runtime thread.
    tokio::task::spawn_blocking(move || drop(state)).await?;
    Ok(())
}
