// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host side of a plugin session.
//!
//! A [`PluginConnection`] owns the pipes of one plugin process. Requests are
//! written under a mutex and tagged with a fresh id; a reader task routes each
//! response to the waiting caller. When the pipe closes every waiting call
//! fails with [`PluginError::ConnectionClosed`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use hostfleet_protocol::{
    Frame, FrameError, Handshake, MessageType, RpcRequest, RpcResponse, Service, read_frame,
    write_frame,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{PluginError, Result};
use crate::launcher::{KillSwitch, PluginProcess};

type Pending = Arc<DashMap<u64, oneshot::Sender<RpcResponse>>>;

/// How long the reader waits for the exit status after the pipe closes.
const EXIT_REASON_WAIT: Duration = Duration::from_secs(2);

pub struct PluginConnection {
    label: String,
    handshake: Handshake,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    next_id: AtomicU64,
    closed: watch::Receiver<bool>,
    default_timeout: Duration,
    kill: parking_lot::Mutex<Option<KillSwitch>>,
    reader_task: JoinHandle<()>,
    pid: Option<u32>,
}

impl std::fmt::Debug for PluginConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginConnection")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl PluginConnection {
    /// Read and check the handshake, then start routing responses. The
    /// process is killed if the handshake is missing or wrong.
    pub async fn establish(
        label: impl Into<String>,
        process: PluginProcess,
        handshake_timeout: Duration,
        default_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let label = label.into();
        let PluginProcess {
            mut reader,
            writer,
            exited,
            kill,
            pid,
        } = process;

        let frame = match timeout(handshake_timeout, read_frame(&mut reader)).await {
            Err(_) => {
                return Err(PluginError::Handshake(format!(
                    "no handshake within {handshake_timeout:?}"
                )));
            }
            Ok(Err(FrameError::ConnectionClosed)) => {
                return Err(PluginError::Handshake(
                    "plugin exited before the handshake".into(),
                ));
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(frame)) => frame,
        };
        let handshake: Handshake = frame
            .decode_as(MessageType::Handshake)
            .map_err(|e| PluginError::Handshake(e.to_string()))?;
        handshake.check()?;
        debug!(plugin = %label, services = ?handshake.services, "Plugin handshake accepted");

        let pending: Pending = Arc::new(DashMap::new());
        let (closed_tx, closed_rx) = watch::channel(false);
        let reader_task = tokio::spawn(read_loop(
            label.clone(),
            reader,
            pending.clone(),
            closed_tx,
            exited,
        ));

        Ok(Arc::new(Self {
            label,
            handshake,
            writer: Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            closed: closed_rx,
            default_timeout,
            kill: parking_lot::Mutex::new(Some(kill)),
            reader_task,
            pid,
        }))
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn serves(&self, service: Service) -> bool {
        self.handshake.serves(service)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the pipe has closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Kill the process. Waiting calls fail once the pipe closes.
    pub fn shutdown(&self) {
        if let Some(kill) = self.kill.lock().take() {
            kill.kill();
        }
    }

    pub async fn call<P, R>(&self, service: Service, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_with_timeout(service, method, params, self.default_timeout)
            .await
    }

    pub async fn call_with_timeout<P, R>(
        &self,
        service: Service,
        method: &str,
        params: &P,
        deadline: Duration,
    ) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            id,
            service,
            method: method.to_string(),
            params: serde_json::to_value(params)?,
        };
        let frame = Frame::request(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        // The reader flags closure before clearing `pending`, so a call that
        // sees the flag unset here is guaranteed to be woken by the clear.
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(PluginError::ConnectionClosed);
        }

        let exchange = async {
            {
                let mut writer = self.writer.lock().await;
                write_frame(&mut *writer, &frame).await?;
            }
            rx.await.map_err(|_| PluginError::ConnectionClosed)
        };

        let response = match timeout(deadline, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.pending.remove(&id);
                return Err(match e {
                    PluginError::Frame(FrameError::Io(_)) => PluginError::ConnectionClosed,
                    other => other,
                });
            }
            Err(_) => {
                self.pending.remove(&id);
                warn!(plugin = %self.label, method, timeout = ?deadline, "Plugin call timed out");
                return Err(PluginError::Timeout(deadline));
            }
        };

        if let Some(err) = response.error {
            return Err(PluginError::Rpc(err));
        }
        Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
    }
}

impl Drop for PluginConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(
    label: String,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    pending: Pending,
    closed_tx: watch::Sender<bool>,
    exited: oneshot::Receiver<String>,
) {
    let reason = loop {
        match read_frame(&mut reader).await {
            Ok(frame) => match frame.decode_as::<RpcResponse>(MessageType::Response) {
                Ok(resp) => match pending.remove(&resp.id) {
                    Some((_, tx)) => {
                        let _ = tx.send(resp);
                    }
                    None => debug!(plugin = %label, id = resp.id, "Response for unknown call"),
                },
                Err(e) => warn!(plugin = %label, error = %e, "Dropping malformed frame"),
            },
            Err(FrameError::ConnectionClosed) => break "stdout closed".to_string(),
            Err(e) => break format!("frame error: {e}"),
        }
    };

    let _ = closed_tx.send(true);
    pending.clear();

    let exit = match timeout(EXIT_REASON_WAIT, exited).await {
        Ok(Ok(exit)) => exit,
        _ => reason,
    };
    info!(plugin = %label, reason = %exit, "Plugin connection closed");
}
