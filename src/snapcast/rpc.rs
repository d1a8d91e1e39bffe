//! Line-delimited JSON-RPC transport for the Snapcast control protocol.
//!
//! Grounded on the teacher's `adapters::lms` split between a reader task
//! (demultiplexing unsolicited lines into a notification channel) and a
//! pending-calls table keyed by request id for the request/response path.

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// The request/response half: serializes outbound calls and completes them
/// when the reader task observes a response with a matching id.
pub struct RpcConnection {
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    pending: PendingCalls,
    next_id: AtomicU64,
}

impl RpcConnection {
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(&line).await {
                self.pending.lock().await.remove(&id);
                return Err(anyhow!("snapcast write failed: {e}"));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(anyhow!("snapcast connection closed before response")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(anyhow!("snapcast call {method} timed out after {timeout:?}"))
            }
        }
    }
}

/// Owns the live connection: the `RpcConnection` for outbound calls plus a
/// channel of `(method, params)` notifications from the reader task.
pub struct RpcHandle {
    pub connection: Arc<RpcConnection>,
    pub notifications: mpsc::Receiver<(String, Value)>,
}

impl std::ops::Deref for RpcHandle {
    type Target = RpcConnection;
    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl RpcConnection {
    pub fn spawn(stream: TcpStream) -> RpcHandle {
        let (read_half, write_half) = stream.into_split();
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let connection = Arc::new(RpcConnection {
            writer: Mutex::new(write_half),
            pending: pending.clone(),
            next_id: AtomicU64::new(1),
        });

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => return,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
                            tracing::warn!("snapcast: unparseable line: {trimmed}");
                            continue;
                        };
                        if let Some(id) = value.get("id").and_then(Value::as_u64) {
                            if let Some(sender) = pending.lock().await.remove(&id) {
                                let result = value.get("result").cloned().unwrap_or(value);
                                let _ = sender.send(result);
                            }
                            continue;
                        }
                        if let Some(method) = value.get("method").and_then(Value::as_str) {
                            let params = value.get("params").cloned().unwrap_or(Value::Null);
                            if tx.send((method.to_string(), params)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("snapcast: read error: {e}");
                        return;
                    }
                }
            }
        });

        RpcHandle {
            connection,
            notifications: rx,
        }
    }
}
