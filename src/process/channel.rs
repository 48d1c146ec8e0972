//! JSON-RPC channel to one backend process
//!
//! Every handle to a shared process talks through the same channel.
//! Request ids come from one counter and replies are routed back by id,
//! so concurrent callers from different sessions never see each other's
//! responses.

use crate::logging;
use crate::protocol::{InitializeResult, Message, Notification, Request, RequestId, Response};
use crate::transport::{LineReader, LineWriter};
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{Mutex, OnceCell, mpsc, oneshot};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

pub struct ProcessChannel {
    name: String,
    request_id: AtomicU64,
    pending: PendingMap,
    writer_tx: mpsc::Sender<Message>,
    handshake: OnceCell<InitializeResult>,
}

impl ProcessChannel {
    /// Start the reader and writer tasks over a process's stdout/stdin
    pub fn spawn<R, W>(name: &str, stdout: R, stdin: W) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(32);

        let mut writer = LineWriter::new(stdin);
        let writer_name = name.to_string();
        tokio::spawn(async move {
            logging::set_backend(&writer_name);
            while let Some(msg) = writer_rx.recv().await {
                if let Err(e) = writer.write(&msg).await {
                    logging::warn(&format!("Write to backend '{}' failed: {}", writer_name, e));
                    break;
                }
            }
            let _ = writer.close().await;
            logging::clear_context();
        });

        let pending_clone = Arc::clone(&pending);
        let mut reader = LineReader::new(stdout);
        let reader_name = name.to_string();
        tokio::spawn(async move {
            logging::set_backend(&reader_name);
            loop {
                match reader.next_frame().await {
                    Ok(Some(Ok(Message::Response(response)))) => {
                        let Some(RequestId::Number(id)) = response.id else {
                            logging::debug(&format!(
                                "Backend '{}' sent a response with a foreign id",
                                reader_name
                            ));
                            continue;
                        };
                        let mut pending = pending_clone.lock().await;
                        if let Some(tx) = pending.remove(&(id as u64)) {
                            let _ = tx.send(response);
                        }
                    }
                    Ok(Some(Ok(other))) => {
                        logging::debug(&format!(
                            "Backend '{}' sent {}",
                            reader_name,
                            other.method().unwrap_or("a message")
                        ));
                    }
                    Ok(Some(Err(invalid))) => {
                        logging::debug(&format!(
                            "Backend '{}' wrote an unreadable line: {}",
                            reader_name, invalid.error.message
                        ));
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            // Dropping the senders wakes every waiter with a closed-channel error
            pending_clone.lock().await.clear();
            logging::clear_context();
        });

        Self {
            name: name.to_string(),
            request_id: AtomicU64::new(1),
            pending,
            writer_tx,
            handshake: OnceCell::new(),
        }
    }

    /// Send a request and wait for its response, bounded by `timeout` when
    /// one is given. Error responses come back as an `RpcError` inside the
    /// `anyhow` chain.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = Message::Request(Request::new(id, method, params));
        if self.writer_tx.send(request).await.is_err() {
            self.pending.lock().await.remove(&id);
            anyhow::bail!("Backend '{}' is not accepting input", self.name);
        }

        let reply = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    anyhow::bail!("Request '{}' to backend '{}' timed out", method, self.name);
                }
            },
            None => rx.await,
        };
        let response = match reply {
            Ok(response) => response,
            Err(_) => anyhow::bail!("Backend '{}' closed its output", self.name),
        };

        response
            .into_result()
            .map_err(anyhow::Error::new)
            .with_context(|| format!("Backend '{}' rejected '{}'", self.name, method))
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.writer_tx
            .send(Message::Notification(Notification::new(method, params)))
            .await
            .map_err(|_| anyhow::anyhow!("Backend '{}' is not accepting input", self.name))
    }

    /// Initialize result cached for the lifetime of the process. The first
    /// client to attach performs the handshake; later ones reuse it.
    pub fn handshake(&self) -> &OnceCell<InitializeResult> {
        &self.handshake
    }

    #[cfg(test)]
    pub(crate) async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }
}
