//! frame-store: Ordered LRU storage for decoded video frames.
//!
//! This crate provides the building blocks for the frame cache:
//!
//! - **Keys**: `FrameKey` (totally ordered frame identifier) and
//!   `FrameRange` (inclusive key bounds with saturating neighbor math)
//! - **Buffers**: `FrameBuffer`, an immutable decoded frame plus a small
//!   header (dimensions, pixel layout, authoritative byte size)
//! - **Entries**: `CacheEntry` with access bookkeeping and a refcounted
//!   pin that gates eviction
//! - **Store**: `OrderedLruStore`, a hashmap coupled with an intrusive
//!   recency list held in an arena of nodes addressed by integer handles
//!
//! The store is a plain single-threaded data structure with O(1) insert,
//! lookup, and recency updates. Callers that need concurrent access wrap
//! it in a mutex; every critical section stays O(1) except the pathological
//! eviction walk when nearly all entries are pinned.
//!
//! # Example
//!
//! ```
//! use frame_store::{FrameBuffer, FrameKey, OrderedLruStore, PixelLayout};
//!
//! let mut store = OrderedLruStore::new();
//! let buffer = FrameBuffer::new(4, 2, PixelLayout::Bgr8, vec![0u8; 24].into());
//! store.insert(FrameKey::new(7), buffer);
//!
//! let entry = store.get(FrameKey::new(7)).unwrap();
//! assert_eq!(entry.access_count(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod buffer;
mod entry;
mod key;
mod store;

pub use buffer::{FrameBuffer, PixelLayout};
pub use entry::{CacheEntry, PinHandle};
pub use key::{FrameKey, FrameRange, InvalidFrameKey};
pub use store::{EvictOutcome, IterFromLru, OrderedLruStore};
