// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plugin side of the protocol.
//!
//! A plugin implements [`PluginHandler`] and hands it to [`serve_stdio`]. The
//! loop writes the handshake frame, then dispatches every request frame on its
//! own task so slow calls do not block fast ones. Responses are funnelled
//! through a single writer task.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::frame::{Frame, FrameError, MessageType, read_frame, write_frame};
use crate::handshake::{self, Handshake};
use crate::rpc::{RpcError, RpcRequest, RpcResponse, Service};

/// Errors that end a serve loop.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("plugin was not started by a hostfleet host")]
    NotLaunchedByHost,
}

/// Implemented by plugin binaries (and by the fake plugins used in tests).
#[async_trait]
pub trait PluginHandler: Send + Sync + 'static {
    async fn handle(&self, service: Service, method: &str, params: Value)
    -> Result<Value, RpcError>;
}

/// Decode request params into a typed payload.
pub fn decode_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::invalid_argument(e.to_string()))
}

/// Encode a typed result.
pub fn encode_result<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal(e.to_string()))
}

/// Serve requests over an arbitrary reader/writer pair until the host closes it.
pub async fn serve<H, R, W>(
    handler: Arc<H>,
    mut reader: R,
    mut writer: W,
    handshake: &Handshake,
) -> Result<(), ServeError>
where
    H: PluginHandler,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    write_frame(&mut writer, &Frame::handshake(handshake)?).await?;

    let (tx, mut rx) = mpsc::channel::<RpcResponse>(64);
    let writer_task = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            let frame = match Frame::response(&resp) {
                Ok(f) => f,
                Err(e) => {
                    warn!(id = resp.id, error = %e, "Failed to encode response");
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!(error = %e, "Response writer closed");
                break;
            }
        }
    });

    let result = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(f) => f,
            Err(FrameError::ConnectionClosed) => break Ok(()),
            Err(e) => break Err(e.into()),
        };
        let request: RpcRequest = match frame.decode_as(MessageType::Request) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Dropping malformed request frame");
                continue;
            }
        };
        let handler = handler.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let id = request.id;
            let resp = match handler
                .handle(request.service, &request.method, request.params)
                .await
            {
                Ok(v) => RpcResponse::ok(id, v),
                Err(e) => RpcResponse::err(id, e),
            };
            let _ = tx.send(resp).await;
        });
    };

    drop(tx);
    let _ = writer_task.await;
    result
}

/// Serve over the process's stdin/stdout after checking the host's cookie.
pub async fn serve_stdio<H: PluginHandler>(
    handler: Arc<H>,
    services: Vec<Service>,
) -> Result<(), ServeError> {
    let cookie = std::env::var(handshake::MAGIC_COOKIE_KEY).unwrap_or_default();
    if cookie != handshake::MAGIC_COOKIE_VALUE {
        return Err(ServeError::NotLaunchedByHost);
    }
    let hs = Handshake::current(services);
    serve(handler, tokio::io::stdin(), tokio::io::stdout(), &hs).await
}
