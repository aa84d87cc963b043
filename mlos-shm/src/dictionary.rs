// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared configuration dictionary.
//!
//! An open-addressed hash table with linear probing, stored directly inside
//! a caller-provided shared memory region together with the bump allocator
//! that backs its entries.
//!
//! # Layout
//!
//! ```text
//! +--------+-----------------+---------------------------------------+
//! | Header | Slots [u32; N]  |             Entry arena               |
//! +--------+-----------------+---------------------------------------+
//! ```
//!
//! - **Header**: slot count, arena offset and the allocator's bump cursor.
//! - **Slots**: each slot holds the arena-relative byte offset of an entry,
//!   or 0 when empty. Offset 0 is never allocated.
//! - **Arena**: append-only entry storage; the allocator never frees.
//!
//! # Thread / process safety
//!
//! Lookups are lock-free from any process: slot loads use acquire ordering
//! and pair with the inserter's release store, so a visible offset always
//! leads to a fully initialized entry. Inserts follow a single-writer
//! discipline (the target process); the bump cursor is still atomic, so
//! multiple writer *threads* inside that process are safe. Field updates
//! bump the entry's `config_id` generation counter with release ordering;
//! the other side polls it to detect changes.

use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::frame::{FrameError, ShmMessage, VarRegion};

/// Bytes of the per-entry header: `config_id` and the codegen type index.
pub const ENTRY_HEADER_SIZE: usize = 8;

/// Entry allocations are rounded to this; the first allocation starts here
/// so that offset 0 stays the empty-slot sentinel.
const ENTRY_ALIGNMENT: u32 = 8;

/// Bytes reserved for the dictionary header at the start of the region.
const HEADER_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DictionaryError {
    #[error("a configuration with this key is already present")]
    AlreadyPresent,
    #[error("no configuration with this key")]
    KeyNotFound,
    #[error("config arena exhausted ({requested} bytes requested, {remaining} free)")]
    OutOfMemory { requested: u32, remaining: u32 },
    #[error("all {0} dictionary slots are occupied")]
    CapacityExceeded(u32),
    #[error("variable-length fields of a config entry cannot change size")]
    VariableDataChanged,
    #[error("region of {actual} bytes cannot hold a dictionary of {needed} bytes")]
    RegionTooSmall { needed: usize, actual: usize },
    #[error("dictionary header is malformed")]
    Malformed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Lookup key over the dictionary. Implementations are emitted by the
/// settings code generator alongside the [`ShmMessage`] they key.
pub trait ConfigKey {
    /// Codegen type index of the keyed configuration struct.
    fn type_index(&self) -> u32;

    /// Hash of the key fields. Must be deterministic across processes;
    /// [`crate::fnv1a_hash`] over the key bytes is the default choice.
    fn hash_key(&self) -> u64;

    /// Compares the key fields against a candidate entry.
    fn matches(&self, entry: &ConfigEntryView<'_>) -> bool;
}

/// Header at offset 0 of the dictionary region.
#[repr(C)]
struct DictionaryHeader {
    slot_count: u32,
    /// Byte offset of the arena from the dictionary base; stored entry
    /// offsets are relative to the arena, so any process computes
    /// `base + offset_to_allocator + stored_offset` regardless of where its
    /// mapping landed.
    offset_to_allocator: u32,
    next_free_offset: AtomicU32,
    arena_size: u32,
}

const _: () = assert!(mem::size_of::<DictionaryHeader>() <= HEADER_SIZE);

/// The dictionary view over a shared region. Cheap to copy around; does not
/// own the region.
#[derive(Debug)]
pub struct SharedConfigDictionary {
    base: NonNull<u8>,
    region_len: usize,
}

// SAFETY: slot and cursor mutation go through atomics; entry publication
// uses release stores paired with acquire loads on the slot.
unsafe impl Send for SharedConfigDictionary {}
unsafe impl Sync for SharedConfigDictionary {}

impl SharedConfigDictionary {
    /// Formats a fresh dictionary with `slot_count` slots into `region` and
    /// hands the rest of the region to the entry allocator.
    ///
    /// # Safety
    /// - `region` must point to valid, writable, zero-initialized shared
    ///   memory of `region.len()` bytes, 8-byte aligned, that stays mapped
    ///   for the lifetime of the returned value and every view derived from
    ///   it.
    /// - No other process may touch the region until this returns.
    pub unsafe fn initialize(
        region: NonNull<[u8]>,
        slot_count: u32,
    ) -> Result<Self, DictionaryError> {
        if slot_count == 0 {
            return Err(DictionaryError::Malformed);
        }
        let slots_bytes = slot_count as usize * 4;
        let arena_offset = (HEADER_SIZE + slots_bytes + 7) & !7;
        // Demand room for at least one small entry.
        let needed = arena_offset + ENTRY_ALIGNMENT as usize + 64;
        if region.len() < needed {
            return Err(DictionaryError::RegionTooSmall {
                needed,
                actual: region.len(),
            });
        }

        let base = region.as_ptr() as *mut u8;
        let header = base as *mut DictionaryHeader;
        header.write(DictionaryHeader {
            slot_count,
            offset_to_allocator: arena_offset as u32,
            next_free_offset: AtomicU32::new(ENTRY_ALIGNMENT),
            arena_size: (region.len() - arena_offset) as u32,
        });

        Ok(Self {
            base: NonNull::new_unchecked(base),
            region_len: region.len(),
        })
    }

    /// Views a dictionary somebody else formatted.
    ///
    /// # Safety
    /// Same region contract as [`initialize`](Self::initialize); the region
    /// must hold an initialized dictionary.
    pub unsafe fn attach(region: NonNull<[u8]>) -> Result<Self, DictionaryError> {
        if region.len() < HEADER_SIZE {
            return Err(DictionaryError::RegionTooSmall {
                needed: HEADER_SIZE,
                actual: region.len(),
            });
        }
        let this = Self {
            base: NonNull::new_unchecked(region.as_ptr() as *mut u8),
            region_len: region.len(),
        };
        let header = this.header();
        let slots_end = HEADER_SIZE + header.slot_count as usize * 4;
        let arena_offset = header.offset_to_allocator as usize;
        if header.slot_count == 0
            || arena_offset < slots_end
            || arena_offset + header.arena_size as usize != region.len()
            || header.next_free_offset.load(Ordering::Acquire) > header.arena_size
        {
            return Err(DictionaryError::Malformed);
        }
        Ok(this)
    }

    fn header(&self) -> &DictionaryHeader {
        unsafe { &*(self.base.as_ptr() as *const DictionaryHeader) }
    }

    pub fn slot_count(&self) -> u32 {
        self.header().slot_count
    }

    fn slot(&self, index: u32) -> &AtomicU32 {
        debug_assert!(index < self.header().slot_count);
        unsafe {
            &*(self
                .base
                .as_ptr()
                .add(HEADER_SIZE + index as usize * 4) as *const AtomicU32)
        }
    }

    fn entry_at(&self, offset: u32) -> ConfigEntryView<'_> {
        let header = self.header();
        let arena_offset = header.offset_to_allocator as usize;
        let entry_start = arena_offset + offset as usize;
        ConfigEntryView {
            ptr: unsafe { NonNull::new_unchecked(self.base.as_ptr().add(entry_start)) },
            payload_limit: self.region_len - entry_start - ENTRY_HEADER_SIZE,
            _marker: PhantomData,
        }
    }

    /// Probes for `key`. A miss returns an invalid handle carrying the slot
    /// a subsequent insert would fill; at most `slot_count` slots are
    /// probed.
    pub fn lookup<K: ConfigKey>(&self, key: &K) -> ConfigHandle<'_> {
        let capacity = self.header().slot_count;
        let hash = key.hash_key();
        for probe in 0..capacity as u64 {
            let slot_index = ((hash.wrapping_add(probe)) % capacity as u64) as u32;
            let offset = self.slot(slot_index).load(Ordering::Acquire);
            if offset == 0 {
                return ConfigHandle {
                    entry: None,
                    slot: slot_index,
                };
            }
            let entry = self.entry_at(offset);
            if entry.type_index() == key.type_index() && key.matches(&entry) {
                return ConfigHandle {
                    entry: Some(entry),
                    slot: slot_index,
                };
            }
        }
        ConfigHandle {
            entry: None,
            slot: capacity,
        }
    }

    /// Inserts a new entry. Fails with [`DictionaryError::AlreadyPresent`]
    /// when the key already resolves; use [`update`](Self::update) to
    /// mutate an existing entry.
    ///
    /// Inserts follow the single-writer discipline: only the target process
    /// inserts, and its writer threads serialize through the atomic bump
    /// cursor and slot stores.
    pub fn insert<K: ConfigKey, M: ShmMessage>(
        &self,
        key: &K,
        value: &M,
    ) -> Result<ConfigEntryView<'_>, DictionaryError> {
        let handle = self.lookup(key);
        if handle.valid() {
            return Err(DictionaryError::AlreadyPresent);
        }
        if handle.slot >= self.header().slot_count {
            return Err(DictionaryError::CapacityExceeded(
                self.header().slot_count,
            ));
        }

        let payload = value.to_bytes();
        let total = (ENTRY_HEADER_SIZE + payload.len()) as u32;
        let offset = self.allocate((total + ENTRY_ALIGNMENT - 1) & !(ENTRY_ALIGNMENT - 1))?;

        let entry = self.entry_at(offset);
        unsafe {
            (entry.ptr.as_ptr().add(4) as *mut u32).write_unaligned(key.type_index());
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                entry.ptr.as_ptr().add(ENTRY_HEADER_SIZE),
                payload.len(),
            );
        }
        // Generation 1 marks the entry live; 0 is the tombstone/empty state.
        entry.config_id().store(1, Ordering::Release);
        self.slot(handle.slot).store(offset, Ordering::Release);
        Ok(entry)
    }

    /// Rewrites the fields of an existing entry and bumps its `config_id`
    /// so pollers observe the change. Variable-length fields must keep
    /// their size and placement; content may change.
    ///
    /// Readers polling `config_id` may observe a torn mix of old and new
    /// field values mid-update; per-field atomicity is the schema's
    /// responsibility.
    pub fn update<K: ConfigKey, M: ShmMessage>(
        &self,
        key: &K,
        value: &M,
    ) -> Result<u32, DictionaryError> {
        let handle = self.lookup(key);
        let entry = match handle.entry() {
            Some(entry) => entry,
            None => return Err(DictionaryError::KeyNotFound),
        };

        let payload = value.to_bytes();
        let current = entry.payload();
        if current.len() < payload.len() {
            return Err(DictionaryError::VariableDataChanged);
        }
        for field in M::var_fields() {
            let stored = VarRegion::read_at(current, field.field_offset as usize)?;
            let fresh = VarRegion::read_at(&payload, field.field_offset as usize)?;
            if stored != fresh {
                return Err(DictionaryError::VariableDataChanged);
            }
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                entry.ptr.as_ptr().add(ENTRY_HEADER_SIZE),
                payload.len(),
            );
        }
        Ok(entry.config_id().fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn allocate(&self, size: u32) -> Result<u32, DictionaryError> {
        let header = self.header();
        loop {
            let current = header.next_free_offset.load(Ordering::Relaxed);
            let next = match current.checked_add(size) {
                Some(next) if next <= header.arena_size => next,
                _ => {
                    return Err(DictionaryError::OutOfMemory {
                        requested: size,
                        remaining: header.arena_size.saturating_sub(current),
                    })
                }
            };
            if header
                .next_free_offset
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(current);
            }
        }
    }
}

/// Result of a [`SharedConfigDictionary::lookup`].
pub struct ConfigHandle<'a> {
    entry: Option<ConfigEntryView<'a>>,
    slot: u32,
}

impl<'a> ConfigHandle<'a> {
    pub fn valid(&self) -> bool {
        self.entry.is_some()
    }

    /// The slot the key resolved to, or would be inserted into on a miss.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn entry(&self) -> Option<&ConfigEntryView<'a>> {
        self.entry.as_ref()
    }

    pub fn into_entry(self) -> Option<ConfigEntryView<'a>> {
        self.entry
    }
}

/// Typed-free view over one entry in the arena.
///
/// The payload slice extends to the end of the arena; the schema's fixed
/// size and verified variable regions bound all actual reads.
#[derive(Debug)]
pub struct ConfigEntryView<'a> {
    ptr: NonNull<u8>,
    payload_limit: usize,
    _marker: PhantomData<&'a SharedConfigDictionary>,
}

impl ConfigEntryView<'_> {
    fn config_id(&self) -> &AtomicU32 {
        unsafe { &*(self.ptr.as_ptr() as *const AtomicU32) }
    }

    /// Current generation. 0 means the entry is not (yet) live.
    pub fn generation(&self) -> u32 {
        self.config_id().load(Ordering::Acquire)
    }

    pub fn type_index(&self) -> u32 {
        unsafe { (self.ptr.as_ptr().add(4) as *const u32).read_unaligned() }
    }

    pub fn payload(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.ptr.as_ptr().add(ENTRY_HEADER_SIZE),
                self.payload_limit,
            )
        }
    }

    /// Verifies and deserializes the entry as `M`.
    pub fn decode<M: ShmMessage>(&self) -> Result<M, FrameError> {
        M::verify(self.payload())?;
        M::deserialize(self.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fnv1a_hash;
    use crate::frame::{wire, VarFieldDesc, VAR_REGION_SIZE};
    use std::cell::Cell;

    #[derive(Debug, Clone, PartialEq)]
    struct SpinConfig {
        component_id: u32,
        spin_count: u32,
    }

    impl ShmMessage for SpinConfig {
        const TYPE_HASH: u64 = 0x10ad_5e77_0000_0011;
        const FIXED_SIZE: usize = 8;

        fn serialize_into(&self, payload: &mut [u8]) {
            wire::write_u32(payload, 0, self.component_id);
            wire::write_u32(payload, 4, self.spin_count);
        }

        fn deserialize(payload: &[u8]) -> Result<Self, FrameError> {
            Ok(SpinConfig {
                component_id: wire::read_u32(payload, 0)?,
                spin_count: wire::read_u32(payload, 4)?,
            })
        }
    }

    /// Keys on `component_id`; the hash can be pinned to force collisions.
    struct SpinKey {
        component_id: u32,
        type_index: u32,
        hash_override: Option<u64>,
        probed: Cell<u32>,
    }

    impl SpinKey {
        fn new(component_id: u32) -> Self {
            Self {
                component_id,
                type_index: 1,
                hash_override: None,
                probed: Cell::new(0),
            }
        }

        fn with_hash(component_id: u32, hash: u64) -> Self {
            Self {
                hash_override: Some(hash),
                ..Self::new(component_id)
            }
        }
    }

    impl ConfigKey for SpinKey {
        fn type_index(&self) -> u32 {
            self.type_index
        }

        fn hash_key(&self) -> u64 {
            self.hash_override
                .unwrap_or_else(|| fnv1a_hash(&self.component_id.to_le_bytes()))
        }

        fn matches(&self, entry: &ConfigEntryView<'_>) -> bool {
            self.probed.set(self.probed.get() + 1);
            wire::read_u32(entry.payload(), 0) == Ok(self.component_id)
        }
    }

    fn make_region(size: usize) -> (Vec<u64>, NonNull<[u8]>) {
        let mut buf = vec![0u64; size.div_ceil(8)];
        let ptr = NonNull::new(buf.as_mut_ptr() as *mut u8).unwrap();
        (buf, NonNull::slice_from_raw_parts(ptr, size))
    }

    #[test]
    fn insert_then_lookup_identity() {
        let (_buf, region) = make_region(4096);
        let dict = unsafe { SharedConfigDictionary::initialize(region, 16).unwrap() };

        let key = SpinKey::new(7);
        let value = SpinConfig {
            component_id: 7,
            spin_count: 1000,
        };
        let inserted = dict.insert(&key, &value).unwrap();
        assert_eq!(inserted.generation(), 1);

        let handle = dict.lookup(&SpinKey::new(7));
        assert!(handle.valid());
        let entry = handle.entry().unwrap();
        assert_eq!(entry.type_index(), 1);
        assert_eq!(entry.decode::<SpinConfig>().unwrap(), value);
    }

    #[test]
    fn lookup_miss_returns_insertion_slot() {
        let (_buf, region) = make_region(4096);
        let dict = unsafe { SharedConfigDictionary::initialize(region, 8).unwrap() };

        let key = SpinKey::new(3);
        let handle = dict.lookup(&key);
        assert!(!handle.valid());
        assert_eq!(handle.slot() as u64, key.hash_key() % 8);
    }

    #[test]
    fn duplicate_insert_fails_with_already_present() {
        let (_buf, region) = make_region(4096);
        let dict = unsafe { SharedConfigDictionary::initialize(region, 8).unwrap() };

        let value = SpinConfig {
            component_id: 1,
            spin_count: 1,
        };
        dict.insert(&SpinKey::new(1), &value).unwrap();
        let err = dict.insert(&SpinKey::new(1), &value).unwrap_err();
        assert!(matches!(err, DictionaryError::AlreadyPresent));
    }

    #[test]
    fn collision_probes_linearly() {
        // Capacity 8; k1 and k2 hash to the same slot, k2 lands one over.
        let (_buf, region) = make_region(4096);
        let dict = unsafe { SharedConfigDictionary::initialize(region, 8).unwrap() };

        let k1 = SpinKey::with_hash(1, 40); // slot 0
        let k2 = SpinKey::with_hash(2, 40); // collides, takes slot 1
        let k3 = SpinKey::with_hash(3, 42); // slot 2, no collision
        for key in [&k1, &k2, &k3] {
            let value = SpinConfig {
                component_id: key.component_id,
                spin_count: 0,
            };
            dict.insert(key, &value).unwrap();
        }

        let probe = SpinKey::with_hash(2, 40);
        let handle = dict.lookup(&probe);
        assert!(handle.valid());
        assert_eq!(handle.slot(), 1);
        // Exactly two slots were probed: the collision and the hit.
        assert_eq!(probe.probed.get(), 2);

        // Same identity as the original insert.
        assert_eq!(
            handle
                .entry()
                .unwrap()
                .decode::<SpinConfig>()
                .unwrap()
                .component_id,
            2
        );

        // A fourth key equal to k1 is a duplicate, not a new entry.
        let err = dict
            .insert(
                &SpinKey::with_hash(1, 40),
                &SpinConfig {
                    component_id: 1,
                    spin_count: 9,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DictionaryError::AlreadyPresent));
    }

    #[test]
    fn miss_probes_at_most_capacity_slots() {
        let (_buf, region) = make_region(8192);
        let capacity = 8u32;
        let dict =
            unsafe { SharedConfigDictionary::initialize(region, capacity).unwrap() };

        // Fill every slot with colliding keys.
        for i in 0..capacity {
            dict.insert(
                &SpinKey::with_hash(i, 5),
                &SpinConfig {
                    component_id: i,
                    spin_count: 0,
                },
            )
            .unwrap();
        }

        let absent = SpinKey::with_hash(999, 5);
        let handle = dict.lookup(&absent);
        assert!(!handle.valid());
        assert_eq!(absent.probed.get(), capacity);

        // And a further insert reports slot exhaustion.
        let err = dict
            .insert(
                &SpinKey::with_hash(1000, 5),
                &SpinConfig {
                    component_id: 1000,
                    spin_count: 0,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DictionaryError::CapacityExceeded(8)));
    }

    #[test]
    fn update_bumps_generation() {
        let (_buf, region) = make_region(4096);
        let dict = unsafe { SharedConfigDictionary::initialize(region, 8).unwrap() };

        let key = SpinKey::new(4);
        dict.insert(
            &key,
            &SpinConfig {
                component_id: 4,
                spin_count: 100,
            },
        )
        .unwrap();

        let updated = SpinConfig {
            component_id: 4,
            spin_count: 250,
        };
        assert_eq!(dict.update(&key, &updated).unwrap(), 2);
        assert_eq!(dict.update(&key, &updated).unwrap(), 3);

        let entry = dict.lookup(&key).into_entry().unwrap();
        assert_eq!(entry.generation(), 3);
        assert_eq!(entry.decode::<SpinConfig>().unwrap().spin_count, 250);
    }

    #[test]
    fn update_missing_key_fails() {
        let (_buf, region) = make_region(4096);
        let dict = unsafe { SharedConfigDictionary::initialize(region, 8).unwrap() };
        let err = dict
            .update(
                &SpinKey::new(11),
                &SpinConfig {
                    component_id: 11,
                    spin_count: 0,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DictionaryError::KeyNotFound));
    }

    #[test]
    fn arena_exhaustion_reports_out_of_memory() {
        // 96 bytes of header+slots plus a 72 byte arena: room for four
        // 16-byte entries and no fifth.
        let (_buf, region) = make_region(168);
        let dict = unsafe { SharedConfigDictionary::initialize(region, 8).unwrap() };
        let mut failed = false;
        for i in 0..8 {
            let result = dict.insert(
                &SpinKey::new(i),
                &SpinConfig {
                    component_id: i,
                    spin_count: 0,
                },
            );
            if let Err(err) = result {
                assert!(matches!(err, DictionaryError::OutOfMemory { .. }));
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    #[test]
    fn attach_sees_existing_entries() {
        let (_buf, region) = make_region(4096);
        let dict = unsafe { SharedConfigDictionary::initialize(region, 16).unwrap() };
        dict.insert(
            &SpinKey::new(21),
            &SpinConfig {
                component_id: 21,
                spin_count: 84,
            },
        )
        .unwrap();

        let second = unsafe { SharedConfigDictionary::attach(region).unwrap() };
        let entry = second.lookup(&SpinKey::new(21)).into_entry().unwrap();
        assert_eq!(entry.decode::<SpinConfig>().unwrap().spin_count, 84);
    }

    #[test]
    fn attach_rejects_garbage_header() {
        let (_buf, region) = make_region(4096);
        // Region never initialized: slot_count is 0.
        let err = unsafe { SharedConfigDictionary::attach(region).unwrap_err() };
        assert!(matches!(err, DictionaryError::Malformed));
    }

    // -- Variable-tail entries ------------------------------------------------

    #[derive(Debug, Clone, PartialEq)]
    struct NamedConfig {
        component_id: u32,
        target: String,
    }

    impl ShmMessage for NamedConfig {
        const TYPE_HASH: u64 = 0x10ad_5e77_0000_0012;
        const FIXED_SIZE: usize = 8 + VAR_REGION_SIZE;

        fn variable_size(&self) -> usize {
            self.target.len()
        }

        fn var_fields() -> &'static [VarFieldDesc] {
            &[VarFieldDesc { field_offset: 8 }]
        }

        fn serialize_into(&self, payload: &mut [u8]) {
            wire::write_u32(payload, 0, self.component_id);
            VarRegion {
                offset_from_field: (Self::FIXED_SIZE - 8) as u64,
                byte_length: self.target.len() as u64,
            }
            .write_at(payload, 8);
            payload[Self::FIXED_SIZE..Self::FIXED_SIZE + self.target.len()]
                .copy_from_slice(self.target.as_bytes());
        }

        fn deserialize(payload: &[u8]) -> Result<Self, FrameError> {
            let component_id = wire::read_u32(payload, 0)?;
            let region = VarRegion::read_at(payload, 8)?;
            let start = 8 + region.offset_from_field as usize;
            let end = start + region.byte_length as usize;
            let target = String::from_utf8_lossy(
                payload
                    .get(start..end)
                    .ok_or(FrameError::MalformedVariableData { field_offset: 8 })?,
            )
            .into_owned();
            Ok(NamedConfig {
                component_id,
                target,
            })
        }
    }

    struct NamedKey(u32);

    impl ConfigKey for NamedKey {
        fn type_index(&self) -> u32 {
            2
        }

        fn hash_key(&self) -> u64 {
            fnv1a_hash(&self.0.to_le_bytes())
        }

        fn matches(&self, entry: &ConfigEntryView<'_>) -> bool {
            wire::read_u32(entry.payload(), 0) == Ok(self.0)
        }
    }

    #[test]
    fn string_tail_roundtrips_through_the_arena() {
        let (_buf, region) = make_region(4096);
        let dict = unsafe { SharedConfigDictionary::initialize(region, 8).unwrap() };

        let value = NamedConfig {
            component_id: 9,
            target: "smart_cache".into(),
        };
        dict.insert(&NamedKey(9), &value).unwrap();
        let entry = dict.lookup(&NamedKey(9)).into_entry().unwrap();
        assert_eq!(entry.decode::<NamedConfig>().unwrap(), value);
    }

    #[test]
    fn update_may_not_resize_the_tail() {
        let (_buf, region) = make_region(4096);
        let dict = unsafe { SharedConfigDictionary::initialize(region, 8).unwrap() };

        dict.insert(
            &NamedKey(9),
            &NamedConfig {
                component_id: 9,
                target: "smart_cache".into(),
            },
        )
        .unwrap();

        // Same length: allowed, content changes.
        dict.update(
            &NamedKey(9),
            &NamedConfig {
                component_id: 9,
                target: "smart_cachf".into(),
            },
        )
        .unwrap();
        let entry = dict.lookup(&NamedKey(9)).into_entry().unwrap();
        assert_eq!(entry.decode::<NamedConfig>().unwrap().target, "smart_cachf");

        // Different length: rejected.
        let err = dict
            .update(
                &NamedKey(9),
                &NamedConfig {
                    component_id: 9,
                    target: "longer_than_before".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, DictionaryError::VariableDataChanged));
    }

    // Fuzz: the dictionary agrees with a model map under arbitrary
    // insert/update/lookup interleavings.
    #[test]
    fn fuzz_against_model_map() {
        use std::collections::HashMap;

        bolero::check!()
            .with_type::<Vec<(u8, u32)>>()
            .for_each(|operations| {
                let (_buf, region) = make_region(1 << 16);
                let dict =
                    unsafe { SharedConfigDictionary::initialize(region, 32).unwrap() };
                let mut model: HashMap<u32, u32> = HashMap::new();

                for &(op, id) in operations {
                    let id = id % 64;
                    let key = SpinKey::new(id);
                    match op % 3 {
                        0 => {
                            let value = SpinConfig {
                                component_id: id,
                                spin_count: op as u32,
                            };
                            match dict.insert(&key, &value) {
                                Ok(_) => {
                                    assert!(!model.contains_key(&id));
                                    model.insert(id, op as u32);
                                }
                                Err(DictionaryError::AlreadyPresent) => {
                                    assert!(model.contains_key(&id));
                                }
                                Err(
                                    DictionaryError::CapacityExceeded(_)
                                    | DictionaryError::OutOfMemory { .. },
                                ) => {}
                                Err(other) => panic!("unexpected: {other}"),
                            }
                        }
                        1 => {
                            let value = SpinConfig {
                                component_id: id,
                                spin_count: op as u32 + 1,
                            };
                            match dict.update(&key, &value) {
                                Ok(_) => {
                                    assert!(model.contains_key(&id));
                                    model.insert(id, op as u32 + 1);
                                }
                                Err(DictionaryError::KeyNotFound) => {
                                    assert!(!model.contains_key(&id));
                                }
                                Err(other) => panic!("unexpected: {other}"),
                            }
                        }
                        _ => {
                            let handle = dict.lookup(&key);
                            match model.get(&id) {
                                Some(&expected) => {
                                    let entry = handle.entry().expect("model has the key");
                                    assert_eq!(
                                        entry.decode::<SpinConfig>().unwrap().spin_count,
                                        expected
                                    );
                                }
                                None => assert!(!handle.valid()),
                            }
                        }
                    }
                }
            });
    }
}
