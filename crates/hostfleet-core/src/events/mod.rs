// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Order event log, SSE streaming and outbound sinks.

mod bus;
mod push;
mod sse;
mod webhook;

pub use bus::{EventBus, EventSink, SUBSCRIBER_BUFFER, Subscription};
pub use push::{FCM_TIMEOUT, FcmEndpoints, FcmPushSink, LEGACY_BATCH_SIZE, PushPayload};
pub use sse::{HEARTBEAT, HEARTBEAT_INTERVAL, REPLAY_LIMIT, format_sse};
pub use webhook::{RobotWebhook, RobotWebhookSink, WEBHOOK_TIMEOUT, sign};
