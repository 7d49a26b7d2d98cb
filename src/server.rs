//! NDJSON socket front end for the engine.
//!
//! One task per connection. Each line is either a request, answered with
//! one response line, or a host event, acknowledged with an empty result.
//! A `subscribe` request turns the connection into a broadcast stream
//! until the client hangs up. `attachHost` makes the connection the host's
//! command channel; the host keeps sending events and requests on it and
//! receives `host-command` lines in between the replies.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use spaces_engine::{
    EngineHandle, HostCommand, HostCommandMessage, HostEvent, Inbound, MirrorHost, Request,
    Response, SpaceError, Subscription,
};
use spaces_shared::transport::{self, LocalStream};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const MAX_NDJSON_LINE_BYTES: usize = 1_048_576;
const DEFAULT_IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind socket at {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("json serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct SpacesServer {
    path: PathBuf,
    engine: EngineHandle,
    host: Arc<MirrorHost>,
    idle_connection_timeout: Duration,
}

impl SpacesServer {
    pub fn new(path: impl Into<PathBuf>, engine: EngineHandle, host: Arc<MirrorHost>) -> Self {
        Self {
            path: path.into(),
            engine,
            host,
            idle_connection_timeout: DEFAULT_IDLE_CONNECTION_TIMEOUT,
        }
    }

    /// Accepts connections until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServerError> {
        let listener = transport::bind(&self.path).map_err(|source| ServerError::Bind {
            path: self.path.clone(),
            source,
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
            {
                warn!(path = %self.path.display(), error = %e, "socket_permissions_failed");
            }
        }

        info!(path = %self.path.display(), "spaces_socket_listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        debug!("spaces_connection_accepted");
                        let engine = self.engine.clone();
                        let host = self.host.clone();
                        let idle = self.idle_connection_timeout;
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, engine, host, idle).await {
                                warn!(error = %e, "spaces_connection_error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "spaces_accept_failed"),
                },
                _ = shutdown.recv() => break,
            }
        }

        Self::cleanup_socket(&self.path);
        info!("spaces_socket_stopped");
        Ok(())
    }

    fn cleanup_socket(path: &Path) {
        if !path.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "socket_cleanup_failed");
        }
    }
}

// === Connection Handler ===

async fn handle_connection(
    stream: LocalStream,
    engine: EngineHandle,
    host: Arc<MirrorHost>,
    idle_connection_timeout: Duration,
) -> Result<(), ServerError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let frame = match timeout(
            idle_connection_timeout,
            read_next_line_frame(&mut reader, MAX_NDJSON_LINE_BYTES),
        )
        .await
        {
            Ok(frame) => frame?,
            Err(_) => {
                debug!("spaces_connection_idle closing");
                break;
            }
        };

        let line = match frame {
            ReadLineFrame::Line(line) => line,
            ReadLineFrame::TooLong => {
                let response = Response::invalid(format!(
                    "line exceeds maximum length of {MAX_NDJSON_LINE_BYTES} bytes"
                ));
                write_line(&mut write_half, &response).await?;
                continue;
            }
            ReadLineFrame::Eof => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        match handle_line(&line, &engine, &host).await {
            LineOutcome::Respond(response) => write_line(&mut write_half, &response).await?,
            LineOutcome::Stream(subscription) => {
                let id = subscription.id;
                let result = stream_broadcasts(subscription, &mut reader, &mut write_half).await;
                if let Err(e) = engine.unsubscribe(id).await {
                    debug!(error = %e, "spaces_unsubscribe_skipped");
                }
                result?;
                break;
            }
            LineOutcome::Host(commands) => {
                serve_host(commands, reader, &mut write_half, &engine, &host).await?;
                break;
            }
        }
    }

    debug!("spaces_connection_closed");
    Ok(())
}

enum LineOutcome {
    Respond(Response),
    Stream(Subscription),
    Host(mpsc::UnboundedReceiver<HostCommand>),
}

async fn handle_line(line: &str, engine: &EngineHandle, host: &MirrorHost) -> LineOutcome {
    let inbound: Inbound = match serde_json::from_str(line) {
        Ok(inbound) => inbound,
        Err(e) => return LineOutcome::Respond(Response::invalid(format!("invalid request: {e}"))),
    };

    match inbound {
        Inbound::Request(Request::Subscribe) => match engine.subscribe().await {
            Ok(subscription) => LineOutcome::Stream(subscription),
            Err(e) => LineOutcome::Respond(Response::failure(&e)),
        },
        Inbound::Request(Request::AttachHost) => LineOutcome::Host(host.attach()),
        Inbound::Request(request) => {
            let response = match engine.request(request).await {
                Ok(reply) => to_response(&reply),
                Err(e) => Response::failure(&e),
            };
            LineOutcome::Respond(response)
        }
        Inbound::Event(event) => LineOutcome::Respond(forward_event(event, engine).await),
    }
}

async fn forward_event(event: HostEvent, engine: &EngineHandle) -> Response {
    match engine.host_event(event).await {
        Ok(()) => Response::success(serde_json::Value::Null),
        Err(e) => Response::failure(&e),
    }
}

fn to_response(value: &impl Serialize) -> Response {
    match serde_json::to_value(value) {
        Ok(result) => Response::success(result),
        Err(e) => Response::failure(&SpaceError::Validation(format!("serialization error: {e}"))),
    }
}

/// Writes broadcast lines until the client disconnects or the engine goes
/// away. Anything the client sends meanwhile is ignored.
async fn stream_broadcasts(
    mut subscription: Subscription,
    reader: &mut (impl AsyncBufRead + Unpin),
    writer: &mut (impl AsyncWrite + Unpin),
) -> Result<(), ServerError> {
    write_line(writer, &Response::success(serde_json::json!({ "subscribed": true }))).await?;
    loop {
        tokio::select! {
            message = subscription.messages.recv() => match message {
                Some(message) => write_line(writer, &message).await?,
                None => break,
            },
            frame = read_next_line_frame(reader, MAX_NDJSON_LINE_BYTES) => {
                if matches!(frame?, ReadLineFrame::Eof) {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Relays host commands to the attached host while still answering the
/// lines it sends. Ends when the host hangs up or another connection
/// attaches.
async fn serve_host(
    mut commands: mpsc::UnboundedReceiver<HostCommand>,
    mut reader: impl AsyncBufRead + Unpin + Send + 'static,
    writer: &mut (impl AsyncWrite + Unpin),
    engine: &EngineHandle,
    host: &MirrorHost,
) -> Result<(), ServerError> {
    write_line(writer, &Response::success(serde_json::json!({ "attached": true }))).await?;

    // Frames are read on their own task; a partly read line must survive a
    // command being written in between.
    let (frames_tx, mut frames) = mpsc::channel(16);
    let reading = tokio::spawn(async move {
        loop {
            let frame = read_next_line_frame(&mut reader, MAX_NDJSON_LINE_BYTES).await;
            let last = !matches!(frame, Ok(ReadLineFrame::Line(_) | ReadLineFrame::TooLong));
            if frames_tx.send(frame).await.is_err() || last {
                break;
            }
        }
    });

    let result = relay_host(&mut commands, &mut frames, writer, engine, host).await;
    reading.abort();
    result
}

async fn relay_host(
    commands: &mut mpsc::UnboundedReceiver<HostCommand>,
    frames: &mut mpsc::Receiver<std::io::Result<ReadLineFrame>>,
    writer: &mut (impl AsyncWrite + Unpin),
    engine: &EngineHandle,
    host: &MirrorHost,
) -> Result<(), ServerError> {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => write_line(writer, &HostCommandMessage::from(command)).await?,
                None => {
                    info!("spaces_host_detached");
                    break;
                }
            },
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let line = match frame? {
                    ReadLineFrame::Line(line) => line,
                    ReadLineFrame::TooLong => {
                        let response = Response::invalid(format!(
                            "line exceeds maximum length of {MAX_NDJSON_LINE_BYTES} bytes"
                        ));
                        write_line(writer, &response).await?;
                        continue;
                    }
                    ReadLineFrame::Eof => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = match handle_line(&line, engine, host).await {
                    LineOutcome::Respond(response) => response,
                    LineOutcome::Stream(subscription) => {
                        if let Err(e) = engine.unsubscribe(subscription.id).await {
                            debug!(error = %e, "spaces_unsubscribe_skipped");
                        }
                        Response::invalid("the host connection cannot also subscribe")
                    }
                    LineOutcome::Host(_) => Response::invalid("host is already attached"),
                };
                write_line(writer, &response).await?;
            }
        }
    }
    Ok(())
}

// === Framing ===

#[derive(Debug, PartialEq, Eq)]
enum ReadLineFrame {
    Line(String),
    TooLong,
    Eof,
}

async fn read_next_line_frame(
    reader: &mut (impl AsyncBufRead + Unpin),
    max_line_length: usize,
) -> Result<ReadLineFrame, std::io::Error> {
    let mut line = Vec::new();
    let mut dropping = false;

    loop {
        let buffer = reader.fill_buf().await?;
        if buffer.is_empty() {
            return Ok(ReadLineFrame::Eof);
        }

        match buffer.iter().position(|byte| *byte == b'\n') {
            Some(newline_index) => {
                let to_take = newline_index + 1;
                if dropping || line.len() + to_take > max_line_length + 1 {
                    reader.consume(to_take);
                    return Ok(ReadLineFrame::TooLong);
                }
                line.extend_from_slice(&buffer[..newline_index]);
                reader.consume(to_take);
                let text = String::from_utf8_lossy(&line);
                return Ok(ReadLineFrame::Line(text.trim_end_matches('\r').to_string()));
            }
            None => {
                let to_consume = buffer.len();
                if !dropping && line.len() + to_consume > max_line_length + 1 {
                    dropping = true;
                }
                if !dropping {
                    line.extend_from_slice(buffer);
                }
                reader.consume(to_consume);
            }
        }
    }
}

async fn write_line(
    writer: &mut (impl AsyncWrite + Unpin),
    value: &impl Serialize,
) -> Result<(), ServerError> {
    let mut json = serde_json::to_vec(value)?;
    json.push(b'\n');
    writer.write_all(&json).await?;
    Ok(())
}
