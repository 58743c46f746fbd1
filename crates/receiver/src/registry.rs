//! Stream registry: the latest frame of every live feed.
//!
//! The registry is the only state shared between sessions. Each feed holds
//! exactly one frame; producers replace it and the viewer reads snapshots.
//! Capacity is fixed: a full registry refuses new feeds instead of evicting
//! old ones.
//!
//! Every method holds the lock only long enough to swap a pointer or check
//! the capacity. No I/O or decoding happens under the lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;

use crate::decode::DecodedFrame;

/// Identifier of one feed. Allocated by [`StreamRegistry::next_feed_id`]
/// and never reused during the registry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeedId(u64);

impl FeedId {
    /// Wraps a raw id. Transports that allocate their own ids use this.
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "feed-{}", self.0)
    }
}

/// Errors returned by registry mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("registry full: {capacity} feeds already active")]
    CapacityExceeded { capacity: usize },

    #[error("feed {0} is already registered")]
    DuplicateFeed(FeedId),
}

/// A feed as seen by the viewer at one instant.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub feed_id: FeedId,
    pub display_name: String,
    /// `None` until the producer delivers its first frame.
    pub latest_frame: Option<Arc<DecodedFrame>>,
    /// Time since the last frame update, or since registration if no frame
    /// has arrived yet.
    pub age: Duration,
}

struct Feed {
    display_name: String,
    latest_frame: Option<Arc<DecodedFrame>>,
    updated_at: Instant,
}

/// Fixed-capacity map of live feeds.
pub struct StreamRegistry {
    capacity: usize,
    feeds: RwLock<BTreeMap<FeedId, Feed>>,
    next_id: AtomicU64,
}

impl StreamRegistry {
    /// Creates a registry holding at most `capacity` feeds.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            feeds: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocates a fresh feed id.
    pub fn next_feed_id(&self) -> FeedId {
        FeedId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a feed with no frame yet.
    ///
    /// Fails with [`RegistryError::CapacityExceeded`] when full; existing
    /// feeds are never evicted.
    pub fn register(&self, feed_id: FeedId, display_name: &str) -> Result<(), RegistryError> {
        let mut feeds = self.feeds.write();
        if feeds.contains_key(&feed_id) {
            return Err(RegistryError::DuplicateFeed(feed_id));
        }
        if feeds.len() >= self.capacity {
            return Err(RegistryError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        feeds.insert(
            feed_id,
            Feed {
                display_name: display_name.to_string(),
                latest_frame: None,
                updated_at: Instant::now(),
            },
        );
        drop(feeds);

        tracing::info!(feed_id = %feed_id, name = %display_name, "Feed registered");
        Ok(())
    }

    /// Replaces the frame of a feed.
    ///
    /// Returns false if the feed is not registered; a producer racing its
    /// own unregistration lands here and is ignored.
    pub fn update_frame(&self, feed_id: FeedId, frame: DecodedFrame) -> bool {
        let frame = Arc::new(frame.with_feed_id(feed_id));
        let mut feeds = self.feeds.write();
        match feeds.get_mut(&feed_id) {
            Some(feed) => {
                feed.latest_frame = Some(frame);
                feed.updated_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Removes a feed. Removing an absent feed is a no-op.
    ///
    /// Returns true if the feed was present.
    pub fn unregister(&self, feed_id: FeedId) -> bool {
        let removed = self.feeds.write().remove(&feed_id);
        match removed {
            Some(feed) => {
                tracing::info!(feed_id = %feed_id, name = %feed.display_name, "Feed unregistered");
                true
            }
            None => false,
        }
    }

    /// Returns every feed ordered by id.
    pub fn snapshot(&self) -> Vec<FeedSnapshot> {
        let now = Instant::now();
        self.feeds
            .read()
            .iter()
            .map(|(id, feed)| FeedSnapshot {
                feed_id: *id,
                display_name: feed.display_name.clone(),
                latest_frame: feed.latest_frame.clone(),
                age: now.saturating_duration_since(feed.updated_at),
            })
            .collect()
    }

    pub fn contains(&self, feed_id: FeedId) -> bool {
        self.feeds.read().contains_key(&feed_id)
    }

    pub fn len(&self) -> usize {
        self.feeds.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.read().is_empty()
    }
}

impl fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("capacity", &self.capacity)
            .field("feeds", &self.len())
            .finish()
    }
}
