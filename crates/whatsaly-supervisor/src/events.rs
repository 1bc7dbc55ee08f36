//! Applies the worker event protocol to worker state and pumps the worker's
//! output streams.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use whatsaly_protocol::{decode_line, ConnectionUpdate, DecodedLine, SessionStatus, WorkerEvent};

use crate::supervisor::SupervisorContext;
use crate::worker::{Worker, WorkerState};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventEffect {
    /// New status, when the event changed it.
    pub status: Option<SessionStatus>,
    pub pairing_code_changed: bool,
}

impl EventEffect {
    pub fn is_noop(&self) -> bool {
        self.status.is_none() && !self.pairing_code_changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Applied(EventEffect),
    /// A well-formed event with an unknown tag or missing field.
    Ignored,
    /// Marker present but the envelope did not decode.
    Skipped,
    Logged,
    /// Emitted by a process that no longer owns the worker; dropped.
    Stale,
}

pub(crate) fn apply_event(state: &mut WorkerState, event: &WorkerEvent) -> EventEffect {
    let previous_status = state.status.clone();
    let previous_code = state.pairing_code.clone();

    match event {
        WorkerEvent::PairingCode(code) => {
            state.pairing_code = Some(code.clone());
        }
        WorkerEvent::Connection(ConnectionUpdate::Connected) => {
            state.status = SessionStatus::Active;
            state.pairing_code = None;
        }
        WorkerEvent::Connection(ConnectionUpdate::LoggedOut) => {
            state.status = SessionStatus::LoggedOut;
        }
        WorkerEvent::Connection(ConnectionUpdate::QrCode) => {}
        WorkerEvent::Connection(ConnectionUpdate::Other(raw)) => {
            state.status = SessionStatus::parse(raw);
        }
    }

    EventEffect {
        status: (state.status != previous_status).then(|| state.status.clone()),
        pairing_code_changed: state.pairing_code != previous_code,
    }
}

/// Decodes one stdout line. Anything that is not an applicable event comes
/// back as its final outcome.
fn decode_event(worker: &Worker, line: &str) -> Result<WorkerEvent, LineOutcome> {
    match decode_line(line) {
        DecodedLine::Raw(text) => {
            tracing::info!(target: "whatsaly::worker", "[{}] {}", worker.identity(), text);
            Err(LineOutcome::Logged)
        }
        DecodedLine::Skipped { reason } => {
            tracing::debug!(identity = %worker.identity(), reason = %reason, "dropping malformed worker event");
            Err(LineOutcome::Skipped)
        }
        DecodedLine::Event(envelope) => envelope.interpret().ok_or_else(|| {
            tracing::debug!(identity = %worker.identity(), tag = %envelope.tag, "ignoring worker event");
            LineOutcome::Ignored
        }),
    }
}

/// Decodes one stdout line and applies it under the worker's lock.
pub async fn ingest_line(worker: &Worker, line: &str) -> LineOutcome {
    let event = match decode_event(worker, line) {
        Ok(event) => event,
        Err(outcome) => return outcome,
    };
    let mut state = worker.state.write().await;
    LineOutcome::Applied(apply_event(&mut state, &event))
}

/// Like [`ingest_line`], but only while launch `generation` still owns the
/// worker. A status change is persisted before the lock is released.
pub(crate) async fn ingest_owned_line(
    context: &SupervisorContext,
    worker: &Worker,
    generation: u64,
    line: &str,
) -> LineOutcome {
    let event = match decode_event(worker, line) {
        Ok(event) => event,
        Err(outcome) => return outcome,
    };
    let mut state = worker.state.write().await;
    if state.removed || !state.owns(generation) {
        tracing::debug!(identity = %worker.identity(), generation, "dropping event from released worker process");
        return LineOutcome::Stale;
    }
    let effect = apply_event(&mut state, &event);
    if let Some(status) = &effect.status {
        tracing::info!(identity = %worker.identity(), status = %status, "worker status changed");
        context.persist_status(worker.identity(), status).await;
    }
    LineOutcome::Applied(effect)
}

pub(crate) async fn pump_stdout<R>(
    stdout: R,
    worker: Arc<Worker>,
    context: Arc<SupervisorContext>,
    generation: u64,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut buffer = Vec::new();
    loop {
        let line = match read_text_line(&mut reader, &mut buffer).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                tracing::debug!(identity = %worker.identity(), error = %error, "worker stdout closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match ingest_owned_line(&context, &worker, generation, line.as_str()).await {
            LineOutcome::Applied(effect) => {
                context.perf.record_event_applied();
                if !effect.is_noop() {
                    context.publish_worker(&worker).await;
                }
            }
            LineOutcome::Skipped => context.perf.record_decode_skip(),
            LineOutcome::Ignored | LineOutcome::Logged | LineOutcome::Stale => {}
        }
    }
}

pub(crate) async fn pump_stderr<R>(stderr: R, worker: Arc<Worker>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buffer = Vec::new();
    while let Ok(Some(line)) = read_text_line(&mut reader, &mut buffer).await {
        if line.trim().is_empty() {
            continue;
        }
        tracing::info!(target: "whatsaly::worker", "[{}] {}", worker.identity(), line);
    }
}

/// Reads one line, tolerating invalid UTF-8 so a bad byte never ends the
/// stream.
async fn read_text_line<R>(
    reader: &mut BufReader<R>,
    buffer: &mut Vec<u8>,
) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    buffer.clear();
    let read = reader.read_until(b'\n', buffer).await?;
    if read == 0 {
        return Ok(None);
    }
    while matches!(buffer.last(), Some(b'\n' | b'\r')) {
        buffer.pop();
    }
    Ok(Some(String::from_utf8_lossy(buffer).into_owned()))
}
