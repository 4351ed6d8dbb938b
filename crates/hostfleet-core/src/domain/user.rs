// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

text_enum! {
    pub enum UserRole {
        User => "user",
        Admin => "admin",
    }
}

text_enum! {
    pub enum UserStatus {
        Active => "active",
        Disabled => "disabled",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub phone: String,
    pub role: UserRole,
    pub status: UserStatus,
    pub tier_group_id: Option<i64>,
    pub tier_expires_at: Option<DateTime<Utc>>,
    /// AES-GCM sealed base32 TOTP secret.
    pub totp_secret_enc: String,
    pub totp_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>, role: UserRole) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            username: username.into(),
            email: String::new(),
            phone: String::new(),
            role,
            status: UserStatus::Active,
            tier_group_id: None,
            tier_expires_at: None,
            totp_secret_enc: String::new(),
            totp_enabled: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}
