// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server-sent events framing of an order's event log.

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::bus::EventBus;
use crate::domain::OrderEvent;
use crate::error::Result;

/// Most events replayed on connect.
pub const REPLAY_LIMIT: i64 = 200;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const HEARTBEAT: &str = ": heartbeat\n\n";

/// `id:` / `event:` / `data:` frame. Multi-line data is split across `data:` lines.
pub fn format_sse(event: &OrderEvent) -> String {
    let mut out = format!("id: {}\nevent: {}\n", event.seq, event.event_type);
    for line in event.data_json.split('\n') {
        out.push_str("data: ");
        out.push_str(line.trim_end_matches('\r'));
        out.push('\n');
    }
    out.push('\n');
    out
}

impl EventBus {
    /// Stream events of `order_id` after `last_seq` to `writer`.
    ///
    /// Subscribes first, then replays up to [`REPLAY_LIMIT`] persisted events,
    /// then forwards live ones. Events already written are skipped by `seq`.
    /// Returns when `cancel` fires, the bus goes away or a write fails.
    pub async fn stream<W>(
        &self,
        order_id: i64,
        last_seq: i64,
        writer: &mut W,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut sub = self.subscribe(order_id);
        let mut last = last_seq.max(0);

        for event in self
            .repo()
            .list_events_after(order_id, last, REPLAY_LIMIT)
            .await?
        {
            writer.write_all(format_sse(&event).as_bytes()).await?;
            last = last.max(event.seq);
        }
        writer.flush().await?;

        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(order_id, last_seq = last, "SSE stream cancelled");
                    return Ok(());
                }
                next = sub.recv() => {
                    let Some(event) = next else {
                        return Ok(());
                    };
                    if event.seq <= last {
                        continue;
                    }
                    writer.write_all(format_sse(&event).as_bytes()).await?;
                    writer.flush().await?;
                    last = event.seq;
                }
                _ = heartbeat.tick() => {
                    writer.write_all(HEARTBEAT.as_bytes()).await?;
                    writer.flush().await?;
                }
            }
        }
    }
}
