// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lock-free multi-producer / multi-consumer circular frame channel.
//!
//! A single circular byte buffer carries variable-length frames between any
//! number of producer and consumer threads, possibly in different processes.
//! Three monotonically increasing `u32` counters in a shared
//! [`ChannelSync`] record drive the exchange:
//!
//! - `write_position`: end of the last reserved region,
//! - `read_position`: frontier for reader acquisition,
//! - `free_position`: how far reclamation has progressed.
//!
//! Counters only ever grow; unsigned wrapping differences give distances, so
//! the buffer size must be a power of two (then `2^32 mod size == 0` and the
//! arithmetic survives overflow). Frames are contiguous: a frame that would
//! cross the buffer end is preceded by a *link frame* (type index 0) padding
//! to the end of the buffer.
//!
//! # Frame states
//!
//! The `length` field at the head of each frame sign-encodes its state:
//! positive = published and readable, bit 0 set = writer still copying,
//! negative = consumed and waiting for reclamation. Publication stores
//! `length` with release ordering; a consumer's acquire load of `length`
//! therefore makes the producer's payload writes visible before dispatch.
//!
//! # Crash recovery
//!
//! [`SharedChannel::recover`] repairs a region after a producer or consumer
//! died mid-operation: consumed frames are reclaimed, partially written
//! frames are cancelled in place (payload zeroed, so they read as link
//! frames), and `read_position` is reset to `free_position`. Running it
//! twice is a no-op.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::frame::{FrameView, FRAME_HEADER_SIZE, LINK_FRAME_TYPE_INDEX};

/// Inter-process wakeup used by blocking readers. Implemented by the named
/// notification events of the platform layer; tests substitute an in-process
/// semaphore. Coalesced posts and spurious wakeups are both tolerated: every
/// waiter re-checks channel state after `wait` returns.
pub trait ChannelEvent: Send + Sync {
    fn signal(&self) -> io::Result<()>;
    fn wait(&self) -> io::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel's terminate flag was observed while acquiring. Producers
    /// drop the message; readers unwind their loop.
    #[error("channel terminated")]
    Aborted,
    #[error("frame of {requested} bytes does not fit a channel of {capacity} bytes")]
    FrameTooLarge { requested: u64, capacity: u32 },
    #[error("channel buffer size {0} is not a power of two of at least 64 bytes")]
    InvalidBufferSize(u32),
    #[error("channel notification event failed")]
    Event(#[from] io::Error),
}

/// Synchronization record of one channel, embedded in the global shared
/// region. One cache line; every field is a naturally aligned little-endian
/// `u32` mutated only through atomic operations. `terminate_channel` is a
/// boolean stored as 0/1.
#[derive(Debug)]
#[repr(C, align(64))]
pub struct ChannelSync {
    pub write_position: AtomicU32,
    pub read_position: AtomicU32,
    pub free_position: AtomicU32,
    pub active_reader_count: AtomicU32,
    pub reader_in_waiting_state_count: AtomicU32,
    pub terminate_channel: AtomicU32,
    _reserved: [u32; 10],
}

const _: () = assert!(std::mem::size_of::<ChannelSync>() == 64);
const _: () = assert!(std::mem::align_of::<ChannelSync>() == 64);

impl ChannelSync {
    pub const fn new() -> Self {
        Self {
            write_position: AtomicU32::new(0),
            read_position: AtomicU32::new(0),
            free_position: AtomicU32::new(0),
            active_reader_count: AtomicU32::new(0),
            reader_in_waiting_state_count: AtomicU32::new(0),
            terminate_channel: AtomicU32::new(0),
            _reserved: [0; 10],
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate_channel.load(Ordering::Acquire) != 0
    }
}

impl Default for ChannelSync {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-local channel counters, logged on detach. Not part of the shared
/// ABI.
#[derive(Debug, Default)]
pub struct ChannelStats {
    pub frames_written: AtomicU64,
    pub link_frames_written: AtomicU64,
    pub frames_read: AtomicU64,
    pub reader_parks: AtomicU64,
}

/// The exchange protocol over one circular buffer.
///
/// `SharedChannel` is a borrowed view: it does not own the sync record or
/// the buffer. The embedding context keeps both mappings alive for as long
/// as the channel (and any [`ReadFrame`] it produced) exists.
pub struct SharedChannel {
    sync: NonNull<ChannelSync>,
    buffer: NonNull<u8>,
    size: u32,
    stats: ChannelStats,
}

// SAFETY: all shared-memory accesses go through atomics on the sync record
// and the frame length fields; payload bytes are published with release and
// consumed after acquire.
unsafe impl Send for SharedChannel {}
unsafe impl Sync for SharedChannel {}

impl SharedChannel {
    /// Builds a channel view over a sync record and a buffer of `size`
    /// bytes.
    ///
    /// # Safety
    /// - `sync` must point to a valid, initialized `ChannelSync` in memory
    ///   shared by every participating process.
    /// - `buffer` must point to `size` bytes of shared memory, 4-byte
    ///   aligned, zero-initialized on first use.
    /// - Both must stay mapped for the lifetime of the returned value.
    pub unsafe fn from_raw(
        sync: NonNull<ChannelSync>,
        buffer: NonNull<u8>,
        size: u32,
    ) -> Result<Self, ChannelError> {
        if !size.is_power_of_two() || size < 64 {
            return Err(ChannelError::InvalidBufferSize(size));
        }
        Ok(Self {
            sync,
            buffer,
            size,
            stats: ChannelStats::default(),
        })
    }

    pub fn buffer_size(&self) -> u32 {
        self.size
    }

    pub fn sync(&self) -> &ChannelSync {
        unsafe { self.sync.as_ref() }
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Largest frame (header included) this channel accepts: the margin
    /// invariant keeps `write_position - free_position <= size - header`.
    pub fn max_frame_length(&self) -> u32 {
        self.size - FRAME_HEADER_SIZE
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.size - 1
    }

    #[inline]
    fn frame(&self, position: u32) -> RawFrame {
        let offset = position & self.mask();
        RawFrame {
            ptr: unsafe { NonNull::new_unchecked(self.buffer.as_ptr().add(offset as usize)) },
            gap_to_end: self.size - offset,
        }
    }

    /// Sets the terminate flag and pokes the notification event once so a
    /// sleeping reader observes it.
    pub fn terminate<E: ChannelEvent>(&self, event: &E) {
        self.sync().terminate_channel.store(1, Ordering::Release);
        let _ = event.signal();
    }

    // -- Producer side ------------------------------------------------------

    /// Publishes one frame. Blocks only by spinning: a full buffer is
    /// drained by advancing `free_position` over consumed frames and
    /// retrying. Returns [`ChannelError::Aborted`] once the terminate flag
    /// is observed.
    pub fn send_frame<E: ChannelEvent>(
        &self,
        type_index: u32,
        type_hash: u64,
        payload: &[u8],
        event: &E,
    ) -> Result<(), ChannelError> {
        let frame_len = crate::frame::frame_length_for_payload(payload.len())
            .filter(|&len| len <= self.max_frame_length())
            .ok_or(ChannelError::FrameTooLarge {
                requested: payload.len() as u64 + FRAME_HEADER_SIZE as u64,
                capacity: self.size,
            })?;

        let position = self.acquire_region(frame_len, event)?;
        let frame = self.frame(position);
        unsafe {
            // Stamp in-progress first so a racing reader that claims this
            // frame spins instead of reading a half-written payload.
            frame.length().store(frame_len as i32 | 1, Ordering::Release);
            frame.set_type_index(type_index);
            frame.set_type_hash(type_hash);
            frame.copy_in_payload(payload);
            frame.length().store(frame_len as i32, Ordering::Release);
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        self.wake_waiting_reader(event)?;
        Ok(())
    }

    /// Publish/park handshake, producer half. The SeqCst fence pairs with
    /// the one in [`ChannelReader::receive`]: either this producer observes
    /// the parked reader, or the reader's re-check observes the published
    /// length. Acquire/release alone would let both sides miss each other.
    fn wake_waiting_reader<E: ChannelEvent>(&self, event: &E) -> Result<(), ChannelError> {
        fence(Ordering::SeqCst);
        if self
            .sync()
            .reader_in_waiting_state_count
            .load(Ordering::Relaxed)
            > 0
        {
            event.signal()?;
        }
        Ok(())
    }

    /// Reserves `frame_len` contiguous bytes and returns their position.
    /// Inserts link frames as needed so the reservation never crosses the
    /// buffer end.
    fn acquire_region<E: ChannelEvent>(
        &self,
        frame_len: u32,
        event: &E,
    ) -> Result<u32, ChannelError> {
        let sync = self.sync();
        let margin = self.max_frame_length();
        loop {
            if sync.is_terminated() {
                return Err(ChannelError::Aborted);
            }

            // free_position is loaded before write_position; the reverse
            // order could observe a write frontier that already lapped the
            // stale free value and report a negative distance.
            let free = sync.free_position.load(Ordering::Acquire);
            let write = sync.write_position.load(Ordering::Acquire);

            let offset = write & self.mask();
            let (reserve, is_link) = if offset + frame_len > self.size {
                (self.size - offset, true)
            } else {
                (frame_len, false)
            };

            if write.wrapping_sub(free) > margin - reserve {
                self.advance_free_position();
                std::hint::spin_loop();
                continue;
            }

            if sync
                .write_position
                .compare_exchange(
                    write,
                    write.wrapping_add(reserve),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            if is_link {
                let frame = self.frame(write);
                unsafe {
                    if reserve >= 8 {
                        frame.set_type_index(LINK_FRAME_TYPE_INDEX);
                    }
                    if reserve >= FRAME_HEADER_SIZE {
                        frame.set_type_hash(0);
                    }
                    frame.length().store(reserve as i32, Ordering::Release);
                }
                self.stats
                    .link_frames_written
                    .fetch_add(1, Ordering::Relaxed);
                // A parked reader has to consume the link before the margin
                // opens up again; without a wakeup here both sides stall.
                self.wake_waiting_reader(event)?;
                continue;
            }

            return Ok(write);
        }
    }

    // -- Reclamation --------------------------------------------------------

    /// Walks consumed frames starting at `free_position` and reclaims them.
    /// Any thread of any process may call this; a lost CAS means another
    /// advancer took the slot and this caller stops. Payloads were already
    /// zeroed by the consumer.
    ///
    /// Reclaimed slots keep their negative length word until a writer
    /// restamps them, so after the buffer wraps a stale negative can sit at
    /// the frontier. Every step is therefore bounded by `write_position`:
    /// a length that would carry `free` past `write` is stale, not a frame.
    pub fn advance_free_position(&self) {
        let sync = self.sync();
        loop {
            let free = sync.free_position.load(Ordering::Acquire);
            let write = sync.write_position.load(Ordering::Acquire);
            if free == write {
                return;
            }
            let length = self.frame(free).length().load(Ordering::Acquire);
            if length >= 0 {
                // Reserved, published or never written; reclamation stops at
                // the first frame a reader has not released.
                return;
            }
            let reclaimed = length.unsigned_abs();
            if reclaimed > write.wrapping_sub(free) {
                return;
            }
            if sync
                .free_position
                .compare_exchange(
                    free,
                    free.wrapping_add(reclaimed),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                return;
            }
        }
    }

    // -- Consumer side ------------------------------------------------------

    /// Registers a reader with the channel. The count in the sync record
    /// lets the other endpoint see how many reader loops are live.
    pub fn reader(&self) -> ChannelReader<'_> {
        self.sync()
            .active_reader_count
            .fetch_add(1, Ordering::AcqRel);
        ChannelReader { channel: self }
    }

    /// Claims the next published frame, skipping link frames. `None` when
    /// the channel is empty.
    fn try_claim(&self) -> Result<Option<ReadFrame<'_>>, ChannelError> {
        let sync = self.sync();
        loop {
            if sync.is_terminated() {
                return Err(ChannelError::Aborted);
            }
            let read = sync.read_position.load(Ordering::Acquire);
            let frame = self.frame(read);
            let length = frame.length().load(Ordering::Acquire);

            if length <= 0 {
                // The length word alone cannot distinguish "no frame yet"
                // from a stale value of a previous lap that a writer has not
                // restamped; emptiness is read_position == write_position.
                if sync.write_position.load(Ordering::Acquire) == read {
                    return Ok(None);
                }
                // A frame is outstanding: either our read was stale, or the
                // writer is between reserving and stamping this slot.
                std::hint::spin_loop();
                continue;
            }

            let claim = (length & !1) as u32;
            if sync
                .read_position
                .compare_exchange(
                    read,
                    read.wrapping_add(claim),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            // This reader owns the frame. Wait out a publisher that is
            // still copying; it shares our kernel and makes progress.
            let mut current = length;
            while current & 1 == 1 {
                std::hint::spin_loop();
                current = frame.length().load(Ordering::Acquire);
            }

            let claimed = ReadFrame {
                channel: self,
                position: read,
                length: claim,
            };
            if claimed.is_link() {
                claimed.complete();
                continue;
            }
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(claimed));
        }
    }

    // -- Recovery -----------------------------------------------------------

    /// Repairs the channel after a process died mid-operation. Must run
    /// before the region is handed to producers or consumers of a fresh
    /// attach.
    ///
    /// Consumed frames ahead of `free_position` are reclaimed; frames left
    /// negative or in-progress between `free_position` and `write_position`
    /// are cancelled in place (payload and type zeroed, length republished
    /// positive) so readers skip and reclaim them; finally `read_position`
    /// rewinds to `free_position` so nothing is dispatched twice.
    pub fn recover(&self) {
        self.advance_free_position();

        let sync = self.sync();
        let write = sync.write_position.load(Ordering::Acquire);
        let mut position = sync.free_position.load(Ordering::Acquire);
        while position != write {
            let frame = self.frame(position);
            let length = frame.length().load(Ordering::Acquire);
            if length == 0 {
                // The crashed producer reserved past here without stamping a
                // length; nothing beyond this point is walkable.
                break;
            }
            let reclaimable = length.unsigned_abs() & !1;
            let remaining = write.wrapping_sub(position);
            if reclaimable == 0 || reclaimable % 4 != 0 || reclaimable > remaining {
                // A torn length field would walk the cursor off the frame
                // grid; stop and leave the tail to the margin spin.
                break;
            }
            if length < 0 || length & 1 == 1 {
                unsafe {
                    frame.zero_after_length(reclaimable);
                    frame.length().store(reclaimable as i32, Ordering::Release);
                }
            }
            position = position.wrapping_add(reclaimable);
        }

        let free = sync.free_position.load(Ordering::Acquire);
        sync.read_position.store(free, Ordering::Release);
    }
}

/// A registered reader loop. Dropping it deregisters from
/// `active_reader_count`.
pub struct ChannelReader<'a> {
    channel: &'a SharedChannel,
}

impl ChannelReader<'_> {
    /// Non-blocking receive. `Ok(None)` when no frame is published.
    pub fn try_receive(&self) -> Result<Option<ReadFrame<'_>>, ChannelError> {
        self.channel.try_claim()
    }

    /// Blocking receive: parks on the notification event while the channel
    /// is empty. Returns [`ChannelError::Aborted`] when the channel is
    /// terminated.
    pub fn receive<E: ChannelEvent>(&self, event: &E) -> Result<ReadFrame<'_>, ChannelError> {
        let sync = self.channel.sync();
        loop {
            if let Some(frame) = self.channel.try_claim()? {
                return Ok(frame);
            }

            sync.reader_in_waiting_state_count
                .fetch_add(1, Ordering::AcqRel);
            // Publish/park handshake, reader half: the fence pairs with the
            // producer's in `wake_waiting_reader`. A producer that published
            // between the empty check and the increment either sees the
            // incremented count and signals, or this re-check sees its frame.
            fence(Ordering::SeqCst);
            let published = {
                let read = sync.read_position.load(Ordering::Acquire);
                sync.write_position.load(Ordering::Acquire) != read
            };
            let wait_result = if published || sync.is_terminated() {
                Ok(())
            } else {
                self.channel
                    .stats
                    .reader_parks
                    .fetch_add(1, Ordering::Relaxed);
                event.wait()
            };
            sync.reader_in_waiting_state_count
                .fetch_sub(1, Ordering::AcqRel);
            wait_result?;
        }
    }
}

impl Drop for ChannelReader<'_> {
    fn drop(&mut self) {
        self.channel
            .sync()
            .active_reader_count
            .fetch_sub(1, Ordering::AcqRel);
    }
}

/// An owned, published frame. Dropping it completes it: the payload is
/// zeroed and the slot is released for reclamation, even if dispatch
/// panicked.
pub struct ReadFrame<'a> {
    channel: &'a SharedChannel,
    position: u32,
    length: u32,
}

impl ReadFrame<'_> {
    fn raw(&self) -> RawFrame {
        self.channel.frame(self.position)
    }

    pub fn frame_length(&self) -> u32 {
        self.length
    }

    pub fn type_index(&self) -> u32 {
        let raw = self.raw();
        if raw.gap_to_end < 8 {
            LINK_FRAME_TYPE_INDEX
        } else {
            unsafe { raw.type_index() }
        }
    }

    pub fn type_hash(&self) -> u64 {
        let raw = self.raw();
        if raw.gap_to_end < FRAME_HEADER_SIZE {
            0
        } else {
            unsafe { raw.type_hash() }
        }
    }

    fn is_link(&self) -> bool {
        self.type_index() == LINK_FRAME_TYPE_INDEX
    }

    /// Payload bytes. Contiguous: frames never wrap the buffer end.
    pub fn payload(&self) -> &[u8] {
        if self.length <= FRAME_HEADER_SIZE {
            return &[];
        }
        let raw = self.raw();
        unsafe {
            std::slice::from_raw_parts(
                raw.ptr.as_ptr().add(FRAME_HEADER_SIZE as usize),
                (self.length - FRAME_HEADER_SIZE) as usize,
            )
        }
    }

    pub fn as_view(&self) -> FrameView<'_> {
        FrameView::new(self.type_index(), self.type_hash(), self.payload())
    }

    /// Ends this frame's visibility: zeroes everything but the length field
    /// and stores the negative length, scheduling reclamation by the next
    /// `advance_free_position`.
    pub fn complete(self) {
        drop(self);
    }
}

impl Drop for ReadFrame<'_> {
    fn drop(&mut self) {
        let raw = self.raw();
        unsafe {
            raw.zero_after_length(self.length);
            raw.length().store(-(self.length as i32), Ordering::Release);
        }
    }
}

/// Unsafe accessors over one frame slot in the buffer. Positions are 4-byte
/// aligned but not 8-byte aligned, so the u64 hash uses unaligned accesses.
#[derive(Clone, Copy)]
struct RawFrame {
    ptr: NonNull<u8>,
    /// Bytes between this frame's start and the buffer end. A slot closer
    /// than a full header to the end can only hold a link frame, and only
    /// the fields that fit are materialized.
    gap_to_end: u32,
}

impl RawFrame {
    #[inline]
    fn length(&self) -> &AtomicI32 {
        // Frame positions are always 4-byte aligned.
        unsafe { &*(self.ptr.as_ptr() as *const AtomicI32) }
    }

    #[inline]
    unsafe fn type_index(&self) -> u32 {
        (self.ptr.as_ptr().add(4) as *const u32).read_unaligned()
    }

    #[inline]
    unsafe fn set_type_index(&self, value: u32) {
        (self.ptr.as_ptr().add(4) as *mut u32).write_unaligned(value);
    }

    #[inline]
    unsafe fn type_hash(&self) -> u64 {
        (self.ptr.as_ptr().add(8) as *const u64).read_unaligned()
    }

    #[inline]
    unsafe fn set_type_hash(&self, value: u64) {
        (self.ptr.as_ptr().add(8) as *mut u64).write_unaligned(value);
    }

    #[inline]
    unsafe fn copy_in_payload(&self, payload: &[u8]) {
        std::ptr::copy_nonoverlapping(
            payload.as_ptr(),
            self.ptr.as_ptr().add(FRAME_HEADER_SIZE as usize),
            payload.len(),
        );
    }

    /// Zeroes `[4, frame_length)`: type index, hash and payload, keeping the
    /// length field itself.
    #[inline]
    unsafe fn zero_after_length(&self, frame_length: u32) {
        std::ptr::write_bytes(self.ptr.as_ptr().add(4), 0, frame_length as usize - 4);
    }
}
