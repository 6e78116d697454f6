//! Worker transport
//!
//! The coordinator only needs to push `execute` to workers; everything coming
//! back arrives as [`InboundEvent`]s on its mailbox. [`StdioTransport`] speaks
//! line-delimited JSON over a launched process's stdin and stdout.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::ClientOptions;
use crate::events::InboundEvent;
use crate::models::{TestOutcome, WorkerId};

/// Outbound side of the worker connection
pub trait Transport: Send + Sync {
    /// Tell the given workers to run the suite with `client` options.
    /// Delivery is asynchronous; failures surface as disconnects.
    fn execute(&self, ids: &[WorkerId], client: &ClientOptions);
}

/// Commands written to a worker
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    Execute { client: ClientOptions },
}

/// Messages read from a worker
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register {
        #[serde(default)]
        name: Option<String>,
    },
    Start {
        #[serde(default)]
        total: u32,
    },
    Result(TestOutcome),
    Error {
        #[serde(default)]
        message: String,
    },
    Complete,
}

impl WorkerMessage {
    fn into_event(self, id: &WorkerId, display_name: &str) -> InboundEvent {
        let id = id.clone();
        match self {
            WorkerMessage::Register { name } => InboundEvent::WorkerRegister {
                id,
                name: name.unwrap_or_else(|| display_name.to_string()),
            },
            WorkerMessage::Start { total } => InboundEvent::WorkerStart { id, total },
            WorkerMessage::Result(outcome) => InboundEvent::WorkerResult { id, outcome },
            WorkerMessage::Error { message } => InboundEvent::WorkerError { id, message },
            WorkerMessage::Complete => InboundEvent::WorkerComplete { id },
        }
    }
}

/// Parse one stdout line. Lines that are not protocol messages are ignored.
pub fn parse_line(line: &str, id: &WorkerId, display_name: &str) -> Option<InboundEvent> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<WorkerMessage>(line) {
        Ok(message) => Some(message.into_event(id, display_name)),
        Err(e) => {
            debug!("Ignoring malformed message from {}: {}", id, e);
            None
        }
    }
}

type Writers = HashMap<WorkerId, mpsc::UnboundedSender<WorkerCommand>>;

/// Line-delimited JSON over child process pipes
#[derive(Clone, Debug)]
pub struct StdioTransport {
    mailbox: mpsc::UnboundedSender<InboundEvent>,
    writers: Arc<Mutex<Writers>>,
    socket_timeout: Duration,
}

impl StdioTransport {
    pub fn new(mailbox: mpsc::UnboundedSender<InboundEvent>, socket_timeout: Duration) -> Self {
        Self {
            mailbox,
            writers: Arc::new(Mutex::new(HashMap::new())),
            socket_timeout,
        }
    }

    fn lock_writers(&self) -> MutexGuard<'_, Writers> {
        self.writers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_attached(&self, id: &WorkerId) -> bool {
        self.lock_writers().contains_key(id)
    }

    /// Start pumping a worker's pipes. A relaunched worker replaces its
    /// previous connection.
    pub fn attach<W, R>(&self, id: WorkerId, display_name: String, stdin: W, stdout: R)
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_writers().insert(id.clone(), tx.clone());

        tokio::spawn(write_loop(id.clone(), stdin, rx, self.socket_timeout));

        let transport = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        trace!("{} > {}", id, line);
                        if let Some(event) = parse_line(&line, &id, &display_name) {
                            if transport.mailbox.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Reading from {} failed: {}", id, e);
                        break;
                    }
                }
            }

            transport.detach(&id, &tx);
            let _ = transport
                .mailbox
                .send(InboundEvent::WorkerDisconnect { id });
        });
    }

    fn detach(&self, id: &WorkerId, writer: &mpsc::UnboundedSender<WorkerCommand>) {
        let mut writers = self.lock_writers();
        if writers.get(id).is_some_and(|w| w.same_channel(writer)) {
            writers.remove(id);
        }
    }
}

impl Transport for StdioTransport {
    fn execute(&self, ids: &[WorkerId], client: &ClientOptions) {
        let writers = self.lock_writers();
        for id in ids {
            match writers.get(id) {
                Some(writer) => {
                    let command = WorkerCommand::Execute {
                        client: client.clone(),
                    };
                    if writer.send(command).is_err() {
                        debug!("Connection to {} already closed", id);
                    }
                }
                None => debug!("No connection to {}, not executing", id),
            }
        }
    }
}

async fn write_loop<W>(
    id: WorkerId,
    mut stdin: W,
    mut rx: mpsc::UnboundedReceiver<WorkerCommand>,
    socket_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = rx.recv().await {
        let mut line = match serde_json::to_string(&command) {
            Ok(line) => line,
            Err(e) => {
                warn!("Cannot encode command for {}: {}", id, e);
                continue;
            }
        };
        line.push('\n');

        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        match timeout(socket_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Write to {} failed: {}", id, e);
                return;
            }
            Err(_) => {
                warn!(
                    "Write to {} timed out after {} ms",
                    id,
                    socket_timeout.as_millis()
                );
                return;
            }
        }
    }
}
