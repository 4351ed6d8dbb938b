// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hostfleet Protocol - stdio framing + JSON RPC between host and plugins
//!
//! Every plugin is a child process of the host. The two talk over the child's
//! stdin (host to plugin) and stdout (plugin to host); stderr is free for logs.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    hostfleet-protocol                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Services: core | payment | kyc | sms | automation          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: RpcRequest/RpcResponse multiplexed by id        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: JSON (serde_json)                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: length-prefixed frames over stdio pipes         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Session
//!
//! 1. Host spawns the plugin with [`handshake::MAGIC_COOKIE_KEY`] and
//!    [`handshake::PROTOCOL_VERSION_KEY`] in its environment.
//! 2. Plugin writes a [`Handshake`] frame listing the services it serves.
//! 3. Host sends request frames; the plugin answers each with a response
//!    frame carrying the same `id`, in any order.
//!
//! # Plugin side
//!
//! ```ignore
//! use hostfleet_protocol::{PluginHandler, Service, serve_stdio};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handler = std::sync::Arc::new(MyPaymentPlugin::default());
//!     serve_stdio(handler, vec![Service::Core, Service::Payment]).await.ok();
//! }
//! ```

pub mod frame;
pub mod handshake;
pub mod manifest;
pub mod messages;
pub mod rpc;
pub mod server;

pub use frame::{Frame, FrameError, MessageType, read_frame, write_frame};
pub use handshake::{Handshake, HandshakeError};
pub use manifest::{Capabilities, ManifestError, ManifestParseError, PluginManifest};
pub use rpc::{ErrorCode, RpcError, RpcRequest, RpcResponse, Service, methods};
pub use server::{PluginHandler, ServeError, decode_params, encode_result, serve, serve_stdio};
