//! Lock-free SPSC ring buffer over a shared-memory slab.
//!
//! A slab is split into two halves, each independently a length-prefixed
//! frame queue with a 64-byte header (`head`, `tail`, `capacity`, reserved).
//! Only the producer of a half ever mutates its `tail`; only the consumer
//! ever mutates its `head`. `capacity` is written once by whichever side
//! creates the slab and is read-only afterward.
//!
//! A `RingHalf` is a thin, `Copy`able handle around a raw pointer into the
//! slab rather than a borrow of it: the whole point of an SPSC ring shared
//! across a process boundary is that a producer view and a consumer view
//! alias the same bytes, which an exclusive `&mut` borrow cannot express.
//! Access to the header's cursor fields always goes through atomics, and
//! access to the data area is confined to the narrow, SAFETY-commented
//! `write_raw`/`read_raw` helpers below.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use log::warn;
use shared_memory::{Shmem, ShmemConf, ShmemError};

/// Size, in bytes, of the ring header that precedes each half's data area.
pub const HEADER_SIZE: usize = 64;

#[derive(Debug)]
pub enum RingError {
    /// The slab could not be attached under any of the name variants tried.
    AttachFailed,
    /// The slab is smaller than two headers, so it cannot hold even empty rings.
    TooSmall,
    /// Underlying OS shared-memory failure.
    Shmem(ShmemError),
}

impl std::error::Error for RingError {}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttachFailed => write!(f, "failed to attach shared memory under any name variant"),
            Self::TooSmall => write!(f, "shared memory slab too small to hold ring headers"),
            Self::Shmem(e) => write!(f, "shared memory error: {e}"),
        }
    }
}

impl From<ShmemError> for RingError {
    fn from(e: ShmemError) -> Self {
        Self::Shmem(e)
    }
}

/// A handle to one half of the shared-memory slab: a 64-byte header plus its
/// data area. Carries no lifetime: the caller is responsible for keeping the
/// backing [`Slab`] alive for as long as any `RingHalf` derived from it is in
/// use, exactly as the two real OS processes on either side of the slab must.
#[derive(Clone, Copy)]
pub struct RingHalf {
    base: *mut u8,
    len: usize,
}

// Concurrent access from two `RingHalf` handles (a producer's and a
// consumer's) is the documented usage of this type; all shared state is
// reached through atomics or the bounds-checked copy helpers below.
unsafe impl Send for RingHalf {}
unsafe impl Sync for RingHalf {}

impl RingHalf {
    /// Attach to an already-initialized half: used on the worker side, where
    /// the host has already written `capacity` and zeroed `head`/`tail`.
    ///
    /// # Safety
    /// `base` must be valid for reads and writes for `len` bytes, for as
    /// long as the returned handle (or any clone of it) is used.
    pub unsafe fn attach(base: *mut u8, len: usize) -> Result<Self, RingError> {
        if len < HEADER_SIZE {
            return Err(RingError::TooSmall);
        }
        Ok(Self { base, len })
    }

    /// Initialize a fresh half: zero the header and publish `capacity`. Used
    /// by whichever side owns slab creation (normally the host; tests use it
    /// directly to simulate that role).
    ///
    /// # Safety
    /// Same requirement as [`RingHalf::attach`].
    pub unsafe fn init(base: *mut u8, len: usize, capacity: u32) -> Result<Self, RingError> {
        if len < HEADER_SIZE + capacity as usize {
            return Err(RingError::TooSmall);
        }
        // SAFETY: base is valid for len >= HEADER_SIZE bytes per the caller's obligation.
        unsafe {
            std::ptr::write_bytes(base, 0, HEADER_SIZE);
        }
        let ring = Self { base, len };
        ring.capacity_atomic().store(capacity, Ordering::Relaxed);
        Ok(ring)
    }

    fn head_atomic(&self) -> &AtomicU32 {
        // SAFETY: base is valid for at least HEADER_SIZE bytes (checked at
        // construction); offset 0 is u32-aligned because base originates
        // from a page-aligned mapping.
        unsafe { AtomicU32::from_ptr(self.base as *mut u32) }
    }

    fn tail_atomic(&self) -> &AtomicU32 {
        // SAFETY: same as head_atomic, offset 4.
        unsafe { AtomicU32::from_ptr(self.base.add(4) as *mut u32) }
    }

    fn capacity_atomic(&self) -> &AtomicU32 {
        // SAFETY: same as head_atomic, offset 8.
        unsafe { AtomicU32::from_ptr(self.base.add(8) as *mut u32) }
    }

    /// `capacity` is logically owned by whichever side initialized the slab;
    /// it is read fresh on every call rather than cached.
    fn capacity(&self) -> usize {
        self.capacity_atomic().load(Ordering::Relaxed) as usize
    }

    fn data_ptr(&self) -> *mut u8 {
        // SAFETY: base is valid for at least HEADER_SIZE + capacity bytes
        // (checked at construction against self.len, which callers can only
        // shrink by reattaching).
        unsafe { self.base.add(HEADER_SIZE) }
    }

    fn write_raw(&self, bytes: &[u8], start: usize, cap: usize) -> usize {
        let data_ptr = self.data_ptr();
        let n = bytes.len();
        let first = n.min(cap - start);
        // SAFETY: start < cap and first <= cap - start, so both copies land
        // within the [0, cap) data area, which is within `self.len` bytes of
        // `base` by construction. The two spans never overlap because the
        // second only runs when the first wrapped at the boundary.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), data_ptr.add(start), first);
            if first < n {
                std::ptr::copy_nonoverlapping(bytes.as_ptr().add(first), data_ptr, n - first);
            }
        }
        (start + n) % cap.max(1)
    }

    fn read_raw(&self, length: usize, start: usize, cap: usize) -> Vec<u8> {
        let data_ptr = self.data_ptr() as *const u8;
        let first = length.min(cap - start);
        let mut out = Vec::with_capacity(length);
        // SAFETY: same span reasoning as write_raw, read-only here.
        unsafe {
            out.extend_from_slice(std::slice::from_raw_parts(data_ptr.add(start), first));
            if first < length {
                out.extend_from_slice(std::slice::from_raw_parts(data_ptr, length - first));
            }
        }
        out
    }

    /// Attempts to enqueue one frame. Returns 0 without mutating state if
    /// there is not enough free space for the length prefix and payload.
    /// Total and non-blocking: never allocates, never faults.
    pub fn write(&self, data: &[u8]) -> usize {
        let cap = self.capacity();
        if cap == 0 {
            return 0;
        }
        let len = data.len();

        let head = self.head_atomic().load(Ordering::Acquire) as usize;
        let tail = self.tail_atomic().load(Ordering::Relaxed) as usize;

        let used = (tail + cap - head) % cap;
        let free = cap - used - 1;

        if free < 4 + len {
            return 0;
        }

        let mut cursor = tail;
        cursor = self.write_raw(&(len as u32).to_le_bytes(), cursor, cap);
        cursor = self.write_raw(data, cursor, cap);

        self.tail_atomic().store(cursor as u32, Ordering::Release);
        len
    }

    /// Returns the next complete frame's payload, or `None` if the ring is
    /// empty or only a partial frame has arrived so far.
    pub fn read(&self) -> Option<Vec<u8>> {
        let cap = self.capacity();
        if cap == 0 {
            return None;
        }

        let head = self.head_atomic().load(Ordering::Relaxed) as usize;
        let tail = self.tail_atomic().load(Ordering::Acquire) as usize;

        if head == tail {
            return None;
        }

        let used = (tail + cap - head) % cap;
        if used < 4 {
            return None;
        }

        let len_bytes = self.read_raw(4, head, cap);
        let msg_len =
            u32::from_le_bytes(len_bytes.try_into().expect("read_raw(4, ..) yields 4 bytes")) as usize;

        if used < 4 + msg_len {
            return None;
        }

        let payload_start = (head + 4) % cap;
        let payload = self.read_raw(msg_len, payload_start, cap);
        let new_head = (payload_start + msg_len) % cap;

        self.head_atomic().store(new_head as u32, Ordering::Release);
        Some(payload)
    }

    #[cfg(test)]
    fn cursors(&self) -> (u32, u32) {
        (
            self.head_atomic().load(Ordering::Relaxed),
            self.tail_atomic().load(Ordering::Relaxed),
        )
    }
}

enum Backing {
    Shmem(Shmem),
    Heap(Box<[u8]>),
}

/// The shared-memory slab, split in half to form ring A (host→worker) and
/// ring B (worker→host).
pub struct Slab {
    backing: Backing,
}

/// Identifies which half of a [`Slab`] to address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalfId {
    /// Ring A: host to worker.
    A,
    /// Ring B: worker to host.
    B,
}

impl Slab {
    /// Host-side: create a new OS shared-memory object of `size` bytes under
    /// `name` and zero it.
    pub fn create(name: &str, size: usize) -> Result<Self, RingError> {
        let shmem = ShmemConf::new().size(size).os_id(name).create()?;
        Ok(Self {
            backing: Backing::Shmem(shmem),
        })
    }

    /// Worker-side: attach to an existing slab. Tries `name` as given, with
    /// a leading slash prepended, and with leading slashes stripped,
    /// stopping at the first that resolves.
    pub fn attach(name: &str, size: usize) -> Result<Self, RingError> {
        for candidate in attach_name_candidates(name) {
            match ShmemConf::new().size(size).os_id(&candidate).open() {
                Ok(shmem) => {
                    return Ok(Self {
                        backing: Backing::Shmem(shmem),
                    })
                }
                Err(e) => {
                    warn!("failed to attach shared memory as {candidate:?}: {e}");
                }
            }
        }
        Err(RingError::AttachFailed)
    }

    /// Build a slab backed by a plain heap allocation, for tests that don't
    /// need a real OS shared-memory object.
    pub fn new_heap(size: usize) -> Self {
        Self {
            backing: Backing::Heap(vec![0u8; size].into_boxed_slice()),
        }
    }

    fn base_ptr(&self) -> *mut u8 {
        match &self.backing {
            Backing::Shmem(shmem) => shmem.as_ptr(),
            Backing::Heap(bytes) => bytes.as_ptr() as *mut u8,
        }
    }

    fn total_len(&self) -> usize {
        match &self.backing {
            Backing::Shmem(shmem) => shmem.len(),
            Backing::Heap(bytes) => bytes.len(),
        }
    }

    /// Returns the `(base pointer, length)` of the requested half. The
    /// pointer is valid for as long as `self` is alive.
    pub fn half_ptr(&self, which: HalfId) -> (*mut u8, usize) {
        let total = self.total_len();
        let half_len = total / 2;
        let base = self.base_ptr();
        match which {
            HalfId::A => (base, half_len),
            // SAFETY: half_len * 2 <= total, so this stays within the slab.
            HalfId::B => (unsafe { base.add(half_len) }, half_len),
        }
    }
}

fn attach_name_candidates(name: &str) -> Vec<String> {
    let mut candidates = vec![name.to_string()];
    if !name.starts_with('/') {
        candidates.push(format!("/{name}"));
    }
    let stripped = name.trim_start_matches('/').to_string();
    if !candidates.iter().any(|c| c == &stripped) {
        candidates.push(stripped);
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_a(slab: &Slab, capacity: u32) -> RingHalf {
        let (base, len) = slab.half_ptr(HalfId::A);
        unsafe { RingHalf::init(base, len, capacity).unwrap() }
    }

    fn attach_a(slab: &Slab) -> RingHalf {
        let (base, len) = slab.half_ptr(HalfId::A);
        unsafe { RingHalf::attach(base, len).unwrap() }
    }

    #[test]
    fn empty_ring_reads_none() {
        let slab = Slab::new_heap((HEADER_SIZE + 128) * 2);
        let half = ring_a(&slab, 128);
        assert!(half.read().is_none());
    }

    #[test]
    fn write_then_read_round_trips() {
        let slab = Slab::new_heap((HEADER_SIZE + 128) * 2);
        let half = ring_a(&slab, 128);

        assert_eq!(half.write(b"hello"), 5);
        assert_eq!(half.read().unwrap(), b"hello");
        assert!(half.read().is_none());
    }

    #[test]
    fn fifo_order_is_preserved() {
        let slab = Slab::new_heap((HEADER_SIZE + 128) * 2);
        let half = ring_a(&slab, 128);

        assert_eq!(half.write(b"one"), 3);
        assert_eq!(half.write(b"two"), 3);
        assert_eq!(half.write(b"three"), 5);

        assert_eq!(half.read().unwrap(), b"one");
        assert_eq!(half.read().unwrap(), b"two");
        assert_eq!(half.read().unwrap(), b"three");
        assert!(half.read().is_none());
    }

    #[test]
    fn two_handles_to_the_same_half_observe_each_others_writes() {
        let slab = Slab::new_heap((HEADER_SIZE + 128) * 2);
        let producer = ring_a(&slab, 128);
        let consumer = attach_a(&slab);

        assert_eq!(producer.write(b"hello"), 5);
        assert_eq!(consumer.read().unwrap(), b"hello");
    }

    #[test]
    fn full_ring_write_returns_zero_and_leaves_cursors_unchanged() {
        let slab = Slab::new_heap((HEADER_SIZE + 16) * 2);
        let half = ring_a(&slab, 16);

        // capacity 16, one sentinel byte reserved: max payload is 11 bytes
        // (4 length prefix + 11 == 15 <= 16 - 1).
        assert_eq!(half.write(&[0u8; 11]), 11);
        let before = half.cursors();
        assert_eq!(half.write(&[0u8; 5]), 0);
        let after = half.cursors();
        assert_eq!(before, after);
    }

    #[test]
    fn writes_and_reads_wrap_across_capacity_boundary() {
        let slab = Slab::new_heap((HEADER_SIZE + 16) * 2);
        let half = ring_a(&slab, 16);

        // Prime tail near the end of the data area so the next write wraps.
        assert_eq!(half.write(&[1, 2, 3, 4, 5, 6, 7]), 7); // uses 11 bytes (4+7), tail at 11
        assert_eq!(half.read().unwrap(), vec![1, 2, 3, 4, 5, 6, 7]); // head catches up to 11

        // This write's 4-byte length prefix plus payload wraps past capacity 16.
        assert_eq!(half.write(&[9, 9, 9, 9, 9, 9]), 6);
        assert_eq!(half.read().unwrap(), vec![9, 9, 9, 9, 9, 9]);
    }

    #[test]
    fn used_plus_free_equals_capacity_minus_one() {
        let slab = Slab::new_heap((HEADER_SIZE + 64) * 2);
        let half = ring_a(&slab, 64);

        for payload in [vec![0u8; 10], vec![1u8; 20], vec![2u8; 5]] {
            half.write(&payload);
        }

        let (head, tail) = half.cursors();
        let (head, tail) = (head as usize, tail as usize);
        let cap = 64usize;
        let used = (tail + cap - head) % cap;
        let free = cap - used - 1;
        assert_eq!(used + free, cap - 1);
    }

    proptest::proptest! {
        #[test]
        fn round_trip_preserves_content_and_order(
            frames in proptest::collection::vec(proptest::collection::vec(proptest::prelude::any::<u8>(), 0..50), 0..30)
        ) {
            let slab = Slab::new_heap((HEADER_SIZE + 256) * 2);
            let half = ring_a(&slab, 256);

            let mut expected = std::collections::VecDeque::new();
            for frame in &frames {
                if half.write(frame) > 0 {
                    expected.push_back(frame.clone());
                }
                // Drain whenever a write may have filled the ring, so later
                // frames still fit -- mirrors the interleaved producer/consumer
                // discipline the ring is built for.
                while let Some(got) = half.read() {
                    assert_eq!(Some(got), expected.pop_front());
                }
            }
            assert!(expected.is_empty());
        }
    }
}
