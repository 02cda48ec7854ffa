//! Cache entries with access bookkeeping and eviction pins.

use crate::buffer::FrameBuffer;
use crate::key::FrameKey;
use clocksource::coarse::UnixInstant;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Refcounted pin shared between an entry and its outstanding borrows.
///
/// A pinned entry is never evicted. The counter is incremented under the
/// store lock when a borrow is handed out; dropping a borrow decrements it
/// without the store lock. `doomed` marks an entry scheduled for deferred
/// eviction once the last borrow is released.
#[derive(Debug, Default)]
pub struct PinHandle {
    pins: AtomicU32,
    doomed: AtomicBool,
}

impl PinHandle {
    /// Take a pin. Called with the store lock held.
    #[inline]
    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a pin; returns the number of pins remaining.
    ///
    /// Releasing more pins than were taken is a caller bug: it panics in
    /// debug builds and saturates at zero in release builds so a stray
    /// double release cannot unpin somebody else's borrow.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "frame borrow released more than once");
        if prev == 0 {
            self.pins.store(0, Ordering::Release);
            return 0;
        }
        prev - 1
    }

    /// Current pin count.
    #[inline]
    pub fn count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    /// Mark the owning entry for eviction on final release.
    #[inline]
    pub fn doom(&self) {
        self.doomed.store(true, Ordering::Release);
    }

    /// Clear a pending doom mark (entry re-admitted before final release).
    #[inline]
    pub fn undoom(&self) {
        self.doomed.store(false, Ordering::Release);
    }

    /// Whether a deferred eviction is pending.
    #[inline]
    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::Acquire)
    }
}

/// A resident frame owned by the store.
///
/// The entry exclusively owns its buffer while resident; the buffer is
/// released exactly once, when the entry is evicted or the store is
/// dropped, never while pinned.
#[derive(Debug)]
pub struct CacheEntry {
    key: FrameKey,
    buffer: FrameBuffer,
    byte_size: usize,
    last_access_tick: u64,
    access_count: u64,
    pin: Arc<PinHandle>,
    inserted_at: UnixInstant,
}

impl CacheEntry {
    /// Create an entry for `key`. The accounted size is copied from the
    /// buffer and stays fixed for the entry's lifetime.
    pub fn new(key: FrameKey, buffer: FrameBuffer) -> Self {
        let byte_size = buffer.byte_size();
        Self {
            key,
            buffer,
            byte_size,
            last_access_tick: 0,
            access_count: 0,
            pin: Arc::new(PinHandle::default()),
            inserted_at: UnixInstant::now(),
        }
    }

    /// The frame key.
    #[inline]
    pub fn key(&self) -> FrameKey {
        self.key
    }

    /// The resident buffer.
    #[inline]
    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    /// Accounted size in bytes, immutable for the entry's lifetime.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Number of hits this entry has served.
    #[inline]
    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    /// Store tick of the most recent hit.
    #[inline]
    pub fn last_access_tick(&self) -> u64 {
        self.last_access_tick
    }

    /// Wall time the entry was inserted. Diagnostic only.
    #[inline]
    pub fn inserted_at(&self) -> UnixInstant {
        self.inserted_at
    }

    /// The entry's pin, shared with outstanding borrows.
    #[inline]
    pub fn pin_handle(&self) -> Arc<PinHandle> {
        Arc::clone(&self.pin)
    }

    /// Whether any borrow of this entry is outstanding.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin.count() > 0
    }

    /// Whether a deferred eviction is pending.
    #[inline]
    pub fn is_doomed(&self) -> bool {
        self.pin.is_doomed()
    }

    pub(crate) fn record_hit(&mut self, tick: u64) {
        self.last_access_tick = tick;
        self.access_count += 1;
    }

    /// Swap in a replacement buffer, returning the old one.
    /// The accounted size follows the new buffer.
    pub fn replace_buffer(&mut self, buffer: FrameBuffer) -> FrameBuffer {
        self.byte_size = buffer.byte_size();
        std::mem::replace(&mut self.buffer, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PixelLayout;

    fn entry(size: usize) -> CacheEntry {
        let buffer = FrameBuffer::new(1, 1, PixelLayout::Gray8, vec![0u8; size].into());
        CacheEntry::new(FrameKey::new(1), buffer)
    }

    #[test]
    fn test_byte_size_copied_from_buffer() {
        let e = entry(128);
        assert_eq!(e.byte_size(), 128);
    }

    #[test]
    fn test_pin_unpin_cycle() {
        let e = entry(8);
        let pin = e.pin_handle();
        assert!(!e.is_pinned());

        pin.pin();
        pin.pin();
        assert!(e.is_pinned());
        assert_eq!(pin.count(), 2);

        assert_eq!(pin.unpin(), 1);
        assert_eq!(pin.unpin(), 0);
        assert!(!e.is_pinned());
    }

    #[test]
    fn test_doom_visible_through_pin() {
        let e = entry(8);
        let pin = e.pin_handle();
        assert!(!e.is_doomed());
        pin.doom();
        assert!(e.is_doomed());
        pin.undoom();
        assert!(!e.is_doomed());
    }

    #[test]
    fn test_record_hit_updates_bookkeeping() {
        let mut e = entry(8);
        e.record_hit(5);
        e.record_hit(9);
        assert_eq!(e.access_count(), 2);
        assert_eq!(e.last_access_tick(), 9);
    }

    #[test]
    fn test_replace_buffer_moves_accounting() {
        let mut e = entry(8);
        let big = FrameBuffer::new(2, 2, PixelLayout::Gray8, vec![1u8; 4].into()).with_byte_size(64);
        let old = e.replace_buffer(big);
        assert_eq!(old.byte_size(), 8);
        assert_eq!(e.byte_size(), 64);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "released more than once")]
    fn test_unpin_underflow_panics_in_debug() {
        let e = entry(8);
        let pin = e.pin_handle();
        pin.pin();
        pin.unpin();
        pin.unpin();
    }
}
