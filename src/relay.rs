// Relays one generation from the backend to a client, honouring cancellation

use crate::error::Result;
use crate::ollama_api::{GenerationStream, OllamaClient};
use crate::session::{CancellationHandle, SessionRegistry};
use crate::transcoder::NdjsonTranscoder;

use axum::body::Body;
use bytes::Bytes;
use futures_util::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

/// One generation request. Not persisted beyond the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRecord {
    pub session_id: String,
    pub prompt: String,
    pub model: String,
    pub system_prompt: Option<String>,
}

impl GenerationRecord {
    pub fn new(session_id: impl Into<String>, prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            prompt: prompt.into(),
            model: model.into(),
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt.filter(|s| !s.trim().is_empty());
        self
    }

    /// The backend takes a single prompt string, so a system prompt is
    /// folded in ahead of the user's text.
    pub fn backend_prompt(&self) -> String {
        match &self.system_prompt {
            Some(system) => format!("{}\n\nUser: {}", system, self.prompt),
            None => self.prompt.clone(),
        }
    }
}

/// How a generation ended.
#[derive(Debug)]
pub enum RelayOutcome {
    Finished { fragments: usize },
    Cancelled,
    ClientGone,
    TimedOut,
    Failed(reqwest::Error),
}

/// Holds a session's registry slot for the lifetime of one generation.
///
/// Dropping it is the single cleanup path: the handle enters `Completed` and
/// the registry entry is removed unless a newer generation took it over.
struct ActiveGeneration {
    registry: Arc<SessionRegistry>,
    session_id: String,
    handle: CancellationHandle,
}

impl ActiveGeneration {
    fn register(registry: Arc<SessionRegistry>, session_id: String) -> Self {
        let handle = CancellationHandle::new();
        if let Some(previous) = registry.put(&session_id, handle.clone()) {
            tracing::warn!(
                session_id = %session_id,
                previous_state = ?previous.state(),
                "session id reused; earlier generation can no longer be stopped by id"
            );
        }
        Self {
            registry,
            session_id,
            handle,
        }
    }
}

impl Drop for ActiveGeneration {
    fn drop(&mut self) {
        if self.handle.complete() {
            self.registry.remove_if_current(&self.session_id, &self.handle);
        }
    }
}

pub struct GenerationRelay {
    registry: Arc<SessionRegistry>,
    backend: OllamaClient,
    fragment_buffer: usize,
    generation_timeout: Option<Duration>,
}

impl GenerationRelay {
    pub fn new(
        registry: Arc<SessionRegistry>,
        backend: OllamaClient,
        fragment_buffer: usize,
        generation_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            backend,
            fragment_buffer: fragment_buffer.max(1),
            generation_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Starts a generation and returns the client body.
    ///
    /// Fails only if the backend can't be reached or answers with an error
    /// status; after that every outcome is a body that simply ends.
    pub async fn run(&self, record: GenerationRecord) -> Result<Body> {
        let span = tracing::info_span!(
            "generation",
            session_id = %record.session_id,
            model = %record.model
        );

        let deadline = self.generation_timeout.map(|timeout| Instant::now() + timeout);
        let generation = ActiveGeneration::register(self.registry.clone(), record.session_id.clone());
        let handle = generation.handle.clone();

        let prompt = record.backend_prompt();
        let backend = tokio::select! {
            biased;
            _ = handle.cancelled() => {
                span.in_scope(|| tracing::info!("cancelled before the backend answered"));
                return Ok(Body::empty());
            }
            _ = deadline_elapsed(deadline) => {
                handle.cancel();
                span.in_scope(|| tracing::warn!("timed out waiting for the backend"));
                return Ok(Body::empty());
            }
            opened = self.backend.generate_stream(&record.model, &prompt) => match opened {
                Ok(stream) => stream,
                Err(e) => {
                    span.in_scope(|| tracing::error!("backend call failed: {}", e));
                    return Err(e);
                }
            },
        };

        let (sink, fragments) = mpsc::channel(self.fragment_buffer);
        tokio::spawn(
            async move {
                let outcome = pump(&generation.handle, backend, sink, deadline).await;
                log_outcome(&outcome);
                drop(generation);
            }
            .instrument(span),
        );

        Ok(Body::from_stream(client_stream(fragments, &handle)))
    }
}

type Fragment = std::result::Result<Bytes, Infallible>;

// Fragments still queued when the stop arrives are never delivered.
fn client_stream(
    fragments: mpsc::Receiver<Fragment>,
    handle: &CancellationHandle,
) -> impl futures_util::Stream<Item = Fragment> + Send + 'static {
    ReceiverStream::new(fragments).take_until(handle.cancelled_owned())
}

// Backend bytes -> transcoder -> client, one fragment at a time
async fn pump(
    handle: &CancellationHandle,
    mut backend: GenerationStream,
    sink: mpsc::Sender<Fragment>,
    deadline: Option<Instant>,
) -> RelayOutcome {
    let mut transcoder = NdjsonTranscoder::new();
    let mut sent = 0usize;
    let expiry = deadline_elapsed(deadline);
    tokio::pin!(expiry);

    let outcome = 'relay: loop {
        let chunk = tokio::select! {
            biased;
            _ = handle.cancelled() => break 'relay RelayOutcome::Cancelled,
            _ = sink.closed() => {
                handle.cancel();
                break 'relay RelayOutcome::ClientGone;
            }
            _ = &mut expiry => {
                handle.cancel();
                break 'relay RelayOutcome::TimedOut;
            }
            chunk = backend.next() => chunk,
        };

        let bytes = match chunk {
            None => break RelayOutcome::Finished { fragments: sent },
            Some(Err(e)) => break RelayOutcome::Failed(e),
            Some(Ok(bytes)) => bytes,
        };

        for fragment in transcoder.feed(&bytes) {
            tokio::select! {
                biased;
                _ = handle.cancelled() => break 'relay RelayOutcome::Cancelled,
                _ = &mut expiry => {
                    handle.cancel();
                    break 'relay RelayOutcome::TimedOut;
                }
                delivered = sink.send(Ok(Bytes::from(fragment))) => {
                    if delivered.is_err() {
                        handle.cancel();
                        break 'relay RelayOutcome::ClientGone;
                    }
                    sent += 1;
                }
            }
        }
    };

    // Aborts the backend request if it is still open.
    drop(backend);
    let discarded = transcoder.close();
    if discarded > 0 {
        tracing::debug!(discarded, "dropped unterminated trailing line");
    }
    outcome
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn log_outcome(outcome: &RelayOutcome) {
    match outcome {
        RelayOutcome::Finished { fragments } => tracing::info!(fragments, "generation finished"),
        RelayOutcome::Cancelled => tracing::info!("generation stopped"),
        RelayOutcome::ClientGone => tracing::info!("client disconnected, generation aborted"),
        RelayOutcome::TimedOut => tracing::warn!("generation timed out"),
        RelayOutcome::Failed(e) => tracing::warn!("stream aborted: {}", e),
    }
}
