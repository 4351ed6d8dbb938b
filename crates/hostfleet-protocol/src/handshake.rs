// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handshake between host and plugin process.
//!
//! The host passes the magic cookie and protocol version through the child's
//! environment. A plugin that does not see the cookie was not started by a
//! host and should exit. The plugin's first frame echoes both values together
//! with the services it serves.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rpc::Service;

pub const MAGIC_COOKIE_KEY: &str = "HOSTFLEET_PLUGIN_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str = "hostfleet-plugin-v1";
pub const PROTOCOL_VERSION_KEY: &str = "HOSTFLEET_PLUGIN_PROTOCOL_VERSION";
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub magic_cookie: String,
    pub protocol_version: u32,
    #[serde(default)]
    pub services: Vec<Service>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("magic cookie mismatch")]
    CookieMismatch,
    #[error("protocol version mismatch: host {host}, plugin {plugin}")]
    VersionMismatch { host: u32, plugin: u32 },
    #[error("plugin does not serve the core service")]
    MissingCore,
}

impl Handshake {
    /// Handshake for the current protocol version.
    pub fn current(services: Vec<Service>) -> Self {
        Self {
            magic_cookie: MAGIC_COOKIE_VALUE.to_string(),
            protocol_version: PROTOCOL_VERSION,
            services,
        }
    }

    /// Check a plugin's handshake against what this host speaks.
    pub fn check(&self) -> Result<(), HandshakeError> {
        if self.magic_cookie != MAGIC_COOKIE_VALUE {
            return Err(HandshakeError::CookieMismatch);
        }
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(HandshakeError::VersionMismatch {
                host: PROTOCOL_VERSION,
                plugin: self.protocol_version,
            });
        }
        if !self.services.contains(&Service::Core) {
            return Err(HandshakeError::MissingCore);
        }
        Ok(())
    }

    pub fn serves(&self, service: Service) -> bool {
        self.services.contains(&service)
    }
}

/// Environment a host sets on every plugin child.
pub fn child_env() -> [(&'static str, String); 2] {
    [
        (MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE.to_string()),
        (PROTOCOL_VERSION_KEY, PROTOCOL_VERSION.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_handshake_checks() {
        let hs = Handshake::current(vec![Service::Core, Service::Payment]);
        assert!(hs.check().is_ok());
        assert!(hs.serves(Service::Payment));
    }

    #[test]
    fn test_cookie_and_version_mismatch() {
        let mut hs = Handshake::current(vec![Service::Core]);
        hs.magic_cookie = "nope".into();
        assert_eq!(hs.check(), Err(HandshakeError::CookieMismatch));

        let mut hs = Handshake::current(vec![Service::Core]);
        hs.protocol_version = 2;
        assert_eq!(
            hs.check(),
            Err(HandshakeError::VersionMismatch { host: 1, plugin: 2 })
        );
    }

    #[test]
    fn test_core_service_required() {
        let hs = Handshake::current(vec![Service::Sms]);
        assert_eq!(hs.check(), Err(HandshakeError::MissingCore));
    }
}
