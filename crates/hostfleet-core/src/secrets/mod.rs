// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Encryption envelopes, TOTP and one-shot tokens.

mod cipher;
mod tokens;
pub mod totp;

pub use cipher::{ConfigCipher, KEY_LEN, NONCE_LEN};
pub use tokens::{PasswordResetService, RESET_TOKEN_TTL_HOURS};
pub use totp::TotpVault;
