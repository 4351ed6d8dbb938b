// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pending verification markers stored in the record's `reason`.
//!
//! ```text
//! pending:<token>
//! pending_face:<channel>:<token>[:<base64url(url)>]
//! ```

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingReason {
    /// Result not known yet; query again with the token.
    Pending { token: String },
    /// Waiting for the user to finish a face check at `url`.
    PendingFace {
        channel: String,
        token: String,
        url: Option<String>,
    },
}

impl PendingReason {
    pub fn token(&self) -> &str {
        match self {
            PendingReason::Pending { token } | PendingReason::PendingFace { token, .. } => token,
        }
    }

    /// Channel for the provider query. Empty for plain pending tokens.
    pub fn channel(&self) -> &str {
        match self {
            PendingReason::Pending { .. } => "",
            PendingReason::PendingFace { channel, .. } => channel,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            PendingReason::PendingFace { url, .. } => url.as_deref(),
            PendingReason::Pending { .. } => None,
        }
    }

    /// `None` unless `reason` is a well-formed marker with a token.
    pub fn parse(reason: &str) -> Option<Self> {
        let reason = reason.trim();
        if let Some(token) = reason.strip_prefix("pending:") {
            let token = token.trim();
            if token.is_empty() {
                return None;
            }
            return Some(PendingReason::Pending {
                token: token.to_string(),
            });
        }
        let rest = reason.strip_prefix("pending_face:")?;
        let mut parts = rest.splitn(3, ':');
        let channel = parts.next()?.trim();
        let token = parts.next()?.trim();
        if token.is_empty() {
            return None;
        }
        let url = parts
            .next()
            .and_then(|enc| URL_SAFE_NO_PAD.decode(enc.trim()).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .filter(|u| !u.is_empty());
        Some(PendingReason::PendingFace {
            channel: channel.to_string(),
            token: token.to_string(),
            url,
        })
    }

    pub fn is_pending(reason: &str) -> bool {
        Self::parse(reason).is_some()
    }
}

impl fmt::Display for PendingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingReason::Pending { token } => write!(f, "pending:{token}"),
            PendingReason::PendingFace {
                channel,
                token,
                url,
            } => {
                write!(f, "pending_face:{channel}:{token}")?;
                if let Some(url) = url.as_deref().filter(|u| !u.is_empty()) {
                    write!(f, ":{}", URL_SAFE_NO_PAD.encode(url))?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pending() {
        assert_eq!(
            PendingReason::parse("pending:abc"),
            Some(PendingReason::Pending { token: "abc".into() })
        );
        assert_eq!(PendingReason::parse("pending:"), None);
        assert_eq!(PendingReason::parse("name mismatch"), None);
        assert_eq!(PendingReason::parse("pending_face:baidu"), None);
    }

    #[test]
    fn test_face_marker_carries_url() {
        let reason = PendingReason::PendingFace {
            channel: "plugin/kyc/default".into(),
            token: "t-1".into(),
            url: Some("https://face.example/check?id=1".into()),
        };
        let text = reason.to_string();
        assert!(text.starts_with("pending_face:"));
        // The channel holds slashes but no colons, so it survives the split.
        assert_eq!(PendingReason::parse(&text), Some(reason));

        let bare = PendingReason::parse("pending_face:wechat:tok").unwrap();
        assert_eq!(bare.channel(), "wechat");
        assert_eq!(bare.token(), "tok");
        assert_eq!(bare.url(), None);
    }
}
