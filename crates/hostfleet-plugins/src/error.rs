// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the plugin host.
//!
//! Transport and packaging failures live in [`PluginError`]. Everything that
//! leaves the crate through a core capability trait is converted into
//! [`hostfleet_core::Error`] with the mapping in `From<PluginError>`.

use hostfleet_core::Error as CoreError;
use hostfleet_protocol::{ErrorCode, FrameError, HandshakeError, ManifestParseError, RpcError};
use thiserror::Error;

/// Errors from plugin host operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    /// The plugin executable could not be started.
    #[error("Failed to launch plugin: {0}")]
    LaunchFailed(String),

    /// The first frame was missing or did not match this host.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The connection to the child is gone (exit, crash or kill).
    #[error("Plugin connection closed")]
    ConnectionClosed,

    /// No response within the call deadline.
    #[error("Plugin call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The plugin answered with an RPC error.
    #[error("Plugin returned {0}")]
    Rpc(RpcError),

    /// The plugin answered `ok=false` with a reason.
    #[error("{0}")]
    Rejected(String),

    /// Framing failure on the stdio pipe.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// `manifest.json` is missing or invalid.
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    /// Signature file is malformed or untrusted where trust is required.
    #[error("Signature check failed: {0}")]
    Signature(String),

    /// Archive is not a valid plugin package.
    #[error("Invalid plugin archive: {0}")]
    Archive(String),

    /// The plugin directory already exists.
    #[error("Plugin {0} is already installed")]
    AlreadyInstalled(String),

    /// No executable for this platform.
    #[error("Unsupported platform {platform}, supported: {}", supported.join(", "))]
    UnsupportedPlatform {
        platform: String,
        supported: Vec<String>,
    },

    /// The filesystem watcher could not be set up.
    #[error("Watch error: {0}")]
    Watch(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for plugin host operations.
pub type Result<T> = std::result::Result<T, PluginError>;

impl From<HandshakeError> for PluginError {
    fn from(e: HandshakeError) -> Self {
        PluginError::Handshake(e.to_string())
    }
}

impl From<ManifestParseError> for PluginError {
    fn from(e: ManifestParseError) -> Self {
        PluginError::Manifest(e.to_string())
    }
}

impl From<zip::result::ZipError> for PluginError {
    fn from(e: zip::result::ZipError) -> Self {
        PluginError::Archive(e.to_string())
    }
}

impl PluginError {
    /// Convert into a core error, naming the plugin in transport failures.
    pub fn into_core(self, plugin: &str) -> CoreError {
        match self {
            PluginError::Rpc(rpc) => match rpc.code {
                ErrorCode::InvalidArgument => CoreError::InvalidInput(rpc.message),
                ErrorCode::NotFound => CoreError::NotFound(rpc.message),
                ErrorCode::FailedPrecondition => CoreError::FailedPrecondition(rpc.message),
                ErrorCode::Unimplemented => CoreError::NotSupported(rpc.message),
                ErrorCode::Unavailable | ErrorCode::DeadlineExceeded | ErrorCode::Internal => {
                    CoreError::Unavailable(format!("{plugin} unavailable: {}", rpc.message))
                }
            },
            PluginError::Rejected(reason) => CoreError::FailedPrecondition(reason),
            PluginError::ConnectionClosed
            | PluginError::Timeout(_)
            | PluginError::Frame(_)
            | PluginError::LaunchFailed(_)
            | PluginError::Handshake(_) => {
                CoreError::Unavailable(format!("{plugin} unavailable: {self}"))
            }
            PluginError::Manifest(_)
            | PluginError::Signature(_)
            | PluginError::Archive(_)
            | PluginError::UnsupportedPlatform { .. } => CoreError::InvalidInput(self.to_string()),
            PluginError::AlreadyInstalled(_) => CoreError::Conflict(self.to_string()),
            PluginError::Watch(_) => CoreError::Unavailable(self.to_string()),
            PluginError::Io(e) => CoreError::Io(e),
            PluginError::Json(e) => CoreError::Json(e),
        }
    }
}

impl From<PluginError> for CoreError {
    fn from(e: PluginError) -> Self {
        e.into_core("plugin")
    }
}
