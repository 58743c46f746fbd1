//! Viewer side of the registry.
//!
//! The viewer renders each feed into a fixed grid slot. Slots are assigned
//! by ascending feed id, so a feed keeps its slot while earlier feeds stay
//! connected; feeds beyond the grid are not shown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::registry::{FeedId, FeedSnapshot, StreamRegistry};

/// Fixed-size grid of viewer slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLayout {
    pub rows: usize,
    pub cols: usize,
}

/// A feed placed in the grid.
#[derive(Debug, Clone)]
pub struct SlotAssignment {
    pub row: usize,
    pub col: usize,
    pub feed: FeedSnapshot,
}

impl GridLayout {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn slots(&self) -> usize {
        self.rows * self.cols
    }

    /// Places feeds into slots, row by row, in ascending feed id order.
    pub fn assign(&self, mut snapshot: Vec<FeedSnapshot>) -> Vec<SlotAssignment> {
        snapshot.sort_by_key(|feed| feed.feed_id);
        snapshot
            .into_iter()
            .take(self.slots())
            .enumerate()
            .map(|(index, feed)| SlotAssignment {
                row: index / self.cols,
                col: index % self.cols,
                feed,
            })
            .collect()
    }
}

/// Polls the registry and logs changes to the set of visible feeds.
pub async fn run_snapshot_reporter(
    registry: Arc<StreamRegistry>,
    layout: GridLayout,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut visible: Vec<FeedId> = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = registry.snapshot();
        let total = snapshot.len();
        let slots = layout.assign(snapshot);
        let now: Vec<FeedId> = slots.iter().map(|slot| slot.feed.feed_id).collect();
        if now == visible {
            continue;
        }

        for slot in &slots {
            let (size, placeholder) = match &slot.feed.latest_frame {
                Some(frame) => (
                    format!("{}x{}", frame.width(), frame.height()),
                    frame.is_placeholder(),
                ),
                None => ("none".to_string(), false),
            };
            tracing::debug!(
                row = slot.row,
                col = slot.col,
                feed_id = %slot.feed.feed_id,
                name = %slot.feed.display_name,
                frame = %size,
                placeholder,
                age_ms = slot.feed.age.as_millis() as u64,
                "Viewer slot"
            );
        }
        if total > slots.len() {
            tracing::debug!(hidden = total - slots.len(), "Feeds beyond the grid are hidden");
        }
        visible = now;
    }
}
