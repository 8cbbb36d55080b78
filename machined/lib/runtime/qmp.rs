//! A QMP (QEMU Machine Protocol) client session.
//!
//! QMP is a line-delimited JSON protocol over a UNIX socket: the server sends
//! a greeting, the client negotiates capabilities, and afterwards replies are
//! correlated to requests by order of issue while asynchronous events are
//! interleaved on the same stream.

use std::{collections::VecDeque, path::Path, time::Duration};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixStream,
    sync::{broadcast, mpsc, oneshot, watch},
    time,
};

use crate::{MachinedError, MachinedResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Default deadline for a single QMP request.
pub const QMP_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_CAPACITY: usize = 64;
const REQUEST_CHANNEL_CAPACITY: usize = 16;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An asynchronous event emitted by QEMU.
#[derive(Debug, Clone)]
pub struct QmpEvent {
    /// Event name, e.g. `SHUTDOWN` or `POWERDOWN`.
    pub event: String,

    /// Event payload.
    pub data: Value,
}

/// The result of `query-status`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusInfo {
    /// Whether vCPUs are actively running.
    pub running: bool,

    /// The run state name, e.g. `running`, `paused`, `shutdown`.
    pub status: String,
}

/// A connected QMP session.
///
/// One session exists per VM. The reader task demultiplexes replies (matched
/// to pending requests by order of issue) and events (fanned out on a
/// broadcast channel). Dropping the client closes the session.
#[derive(Debug)]
pub struct QmpClient {
    requests: mpsc::Sender<QmpRequest>,
    events: broadcast::Sender<QmpEvent>,
    closed_rx: watch::Receiver<bool>,
}

#[derive(Debug)]
struct QmpRequest {
    command: String,
    arguments: Option<Value>,
    reply: oneshot::Sender<MachinedResult<Value>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl QmpClient {
    /// Connects to a QMP socket, consumes the greeting, and negotiates
    /// capabilities.
    pub async fn connect(path: impl AsRef<Path>) -> MachinedResult<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half).lines();

        let greeting = reader
            .next_line()
            .await?
            .ok_or(MachinedError::QmpClosed)?;
        let greeting: Value = serde_json::from_str(&greeting)?;
        if greeting.get("QMP").is_none() {
            return Err(MachinedError::Qmp(format!(
                "unexpected greeting: {}",
                greeting
            )));
        }
        tracing::debug!(
            version = %greeting["QMP"]["version"]["qemu"],
            "qmp greeting received"
        );

        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(session_task(
            reader,
            write_half,
            requests_rx,
            events_tx.clone(),
            closed_tx,
        ));

        let client = Self {
            requests: requests_tx,
            events: events_tx,
            closed_rx,
        };

        // Capability negotiation must be the first command of a session.
        client
            .execute("qmp_capabilities", None, QMP_COMMAND_TIMEOUT)
            .await?;

        Ok(client)
    }

    /// Issues a QMP command and waits for its reply.
    pub async fn execute(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> MachinedResult<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(QmpRequest {
                command: command.to_string(),
                arguments,
                reply: reply_tx,
            })
            .await
            .map_err(|_| MachinedError::QmpClosed)?;

        match time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(MachinedError::QmpClosed),
            Err(_) => Err(MachinedError::Timeout(format!(
                "qmp command '{}' did not complete within {:?}",
                command, timeout
            ))),
        }
    }

    /// Queries the VM run state.
    pub async fn query_status(&self) -> MachinedResult<StatusInfo> {
        let value = self
            .execute("query-status", None, QMP_COMMAND_TIMEOUT)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Queries vCPU information.
    pub async fn query_cpus(&self) -> MachinedResult<Vec<Value>> {
        let value = self.execute("query-cpus", None, QMP_COMMAND_TIMEOUT).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Requests a graceful guest shutdown (ACPI power button).
    pub async fn system_powerdown(&self) -> MachinedResult<()> {
        self.execute("system_powerdown", None, QMP_COMMAND_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Tells QEMU to exit immediately.
    pub async fn quit(&self) -> MachinedResult<()> {
        self.execute("quit", None, QMP_COMMAND_TIMEOUT).await?;
        Ok(())
    }

    /// Subscribes to the asynchronous event stream.
    pub fn events(&self) -> broadcast::Receiver<QmpEvent> {
        self.events.subscribe()
    }

    /// Returns a watch that flips to true when the session closes.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The session IO task: writes requests, demultiplexes replies and events.
async fn session_task(
    mut reader: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    mut writer: tokio::net::unix::OwnedWriteHalf,
    mut requests: mpsc::Receiver<QmpRequest>,
    events: broadcast::Sender<QmpEvent>,
    closed: watch::Sender<bool>,
) {
    let mut pending: VecDeque<oneshot::Sender<MachinedResult<Value>>> = VecDeque::new();

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    // Client dropped; terminate the session.
                    break;
                };
                let mut message = json!({ "execute": request.command });
                if let Some(arguments) = request.arguments {
                    message["arguments"] = arguments;
                }
                let mut line = message.to_string();
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    let _ = request.reply.send(Err(MachinedError::Io(e)));
                    break;
                }
                pending.push_back(request.reply);
            }
            line = reader.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => break,
                };
                let message: Value = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(error = %e, "discarding unparseable qmp line");
                        continue;
                    }
                };

                if let Some(event) = message.get("event").and_then(Value::as_str) {
                    let _ = events.send(QmpEvent {
                        event: event.to_string(),
                        data: message.get("data").cloned().unwrap_or(Value::Null),
                    });
                } else if message.get("return").is_some() {
                    if let Some(reply) = pending.pop_front() {
                        let _ = reply.send(Ok(message["return"].clone()));
                    }
                } else if let Some(error) = message.get("error") {
                    if let Some(reply) = pending.pop_front() {
                        let _ = reply.send(Err(MachinedError::Qmp(error.to_string())));
                    }
                } else {
                    tracing::warn!(%message, "unrecognised qmp message");
                }
            }
        }
    }

    // Disconnects surface as QmpClosed on every in-flight request.
    for reply in pending {
        let _ = reply.send(Err(MachinedError::QmpClosed));
    }
    let _ = closed.send(true);
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
