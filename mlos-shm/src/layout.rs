// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed headers at the start of the shared regions.
//!
//! The global region and the shared-config region begin with a
//! [`RegionHeader`] carrying a magic signature, the region's declared size
//! and variant code, and the cross-process attach counter. The global region
//! continues with the two [`ChannelSync`] records and a small bootstrap
//! table mapping `(region_type, index)` to a region name and size. Channel
//! buffer regions carry no header: the circular buffer needs the full
//! power-of-two region, and their identity travels in the bootstrap table or
//! the fd-exchange envelope instead.
//!
//! ABI: `#[repr(C)]`, little-endian, natural alignment, mutated fields are
//! atomics. Both endpoints share a kernel and an architecture, so no byte
//! swapping is performed.

use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;

use crate::channel::ChannelSync;

/// Magic sentinel at offset 0 of every headered region: `"MLOS"`.
pub const REGION_SIGNATURE: u32 = 0x534f_4c4d;

/// Discriminates the shared region variants. The numeric values travel in
/// region headers, the bootstrap table and the fd-exchange envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RegionType {
    Global = 1,
    ControlChannel = 2,
    FeedbackChannel = 3,
    SharedConfig = 4,
}

impl RegionType {
    pub fn from_raw(raw: u32) -> Option<RegionType> {
        match raw {
            1 => Some(RegionType::Global),
            2 => Some(RegionType::ControlChannel),
            3 => Some(RegionType::FeedbackChannel),
            4 => Some(RegionType::SharedConfig),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("region signature {found:#010x} is not the expected {REGION_SIGNATURE:#010x}")]
    BadSignature { found: u32 },
    #[error("region declares {declared} bytes but the mapping is {mapped} bytes")]
    SizeMismatch { declared: u64, mapped: u64 },
    #[error("region of {actual} bytes is smaller than the {needed} byte layout")]
    RegionTooSmall { needed: usize, actual: usize },
    #[error("region type code {found} does not match the expected {expected:?}")]
    RegionTypeMismatch { expected: RegionType, found: u32 },
}

/// Common header of the global and shared-config regions.
///
/// `signature`, `memory_region_code_type_index` and `memory_region_size`
/// are written once by the creating process before the region is announced
/// (via the target-ready event or the fd exchange) and read-only afterwards.
/// The two counters are mutated cross-process.
#[derive(Debug)]
#[repr(C)]
pub struct RegionHeader {
    pub signature: u32,
    pub memory_region_code_type_index: u32,
    pub memory_region_size: u64,
    /// Incremented on attach, decremented on detach; the detacher that
    /// reaches zero owns OS-level cleanup of the backing names.
    pub attached_processes_count: AtomicU32,
    /// How many settings registries have been announced in-band.
    pub registered_settings_assembly_count: AtomicU32,
    _reserved: [u32; 2],
}

const _: () = assert!(mem::size_of::<RegionHeader>() == 32);

impl RegionHeader {
    fn new(region_type: RegionType, region_size: u64) -> Self {
        Self {
            signature: REGION_SIGNATURE,
            memory_region_code_type_index: region_type as u32,
            memory_region_size: region_size,
            attached_processes_count: AtomicU32::new(0),
            registered_settings_assembly_count: AtomicU32::new(0),
            _reserved: [0; 2],
        }
    }

    fn validate(&self, expected: RegionType, mapped_size: u64) -> Result<(), LayoutError> {
        if self.signature != REGION_SIGNATURE {
            return Err(LayoutError::BadSignature {
                found: self.signature,
            });
        }
        if self.memory_region_code_type_index != expected as u32 {
            return Err(LayoutError::RegionTypeMismatch {
                expected,
                found: self.memory_region_code_type_index,
            });
        }
        if self.memory_region_size != mapped_size {
            return Err(LayoutError::SizeMismatch {
                declared: self.memory_region_size,
                mapped: mapped_size,
            });
        }
        Ok(())
    }
}

/// Capacity of the named-region bootstrap table.
pub const REGION_TABLE_CAPACITY: usize = 16;

/// Longest region name the bootstrap table can carry.
pub const REGION_NAME_MAX: usize = 64;

/// One bootstrap table row: `(region_type, index)` to name and size.
/// `region_type == 0` marks an empty row.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct RegionTableEntry {
    pub region_type: u32,
    pub region_index: u32,
    pub region_size: u64,
    name_len: u32,
    name: [u8; REGION_NAME_MAX],
    _pad: [u8; 4],
}

const _: () = assert!(mem::size_of::<RegionTableEntry>() == 88);

impl RegionTableEntry {
    const EMPTY: RegionTableEntry = RegionTableEntry {
        region_type: 0,
        region_index: 0,
        region_size: 0,
        name_len: 0,
        name: [0; REGION_NAME_MAX],
        _pad: [0; 4],
    };

    pub fn new(
        region_type: RegionType,
        region_index: u32,
        region_size: u64,
        name: &str,
    ) -> Result<Self, LayoutError> {
        let bytes = name.as_bytes();
        if bytes.len() > REGION_NAME_MAX {
            return Err(LayoutError::RegionTooSmall {
                needed: bytes.len(),
                actual: REGION_NAME_MAX,
            });
        }
        let mut entry = RegionTableEntry::EMPTY;
        entry.region_type = region_type as u32;
        entry.region_index = region_index;
        entry.region_size = region_size;
        entry.name_len = bytes.len() as u32;
        entry.name[..bytes.len()].copy_from_slice(bytes);
        Ok(entry)
    }

    pub fn is_empty(&self) -> bool {
        self.region_type == 0
    }

    pub fn name(&self) -> &str {
        std::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }
}

/// Layout of the global region: header, the two channel sync records, and
/// the bootstrap table. Written in full by the target before it signals the
/// target-ready event; the agent only ever reads the plain fields.
#[derive(Debug)]
#[repr(C)]
pub struct GlobalMemoryRegion {
    pub header: RegionHeader,
    pub control_channel_sync: ChannelSync,
    pub feedback_channel_sync: ChannelSync,
    pub region_table: [RegionTableEntry; REGION_TABLE_CAPACITY],
}

impl GlobalMemoryRegion {
    pub const LAYOUT_SIZE: usize = mem::size_of::<GlobalMemoryRegion>();

    /// Writes a fresh global region into `region` and returns a view of it.
    ///
    /// # Safety
    /// - `region` must point to at least `region_size` writable bytes of
    ///   shared memory, 64-byte aligned (any `mmap` result is), and stay
    ///   mapped for `'a`.
    /// - No other process may access the region until initialization
    ///   finished (the rendezvous provides that barrier).
    pub unsafe fn initialize<'a>(
        region: NonNull<u8>,
        region_size: u64,
        table: &[RegionTableEntry],
    ) -> Result<&'a Self, LayoutError> {
        if (region_size as usize) < Self::LAYOUT_SIZE {
            return Err(LayoutError::RegionTooSmall {
                needed: Self::LAYOUT_SIZE,
                actual: region_size as usize,
            });
        }
        if table.len() > REGION_TABLE_CAPACITY {
            return Err(LayoutError::RegionTooSmall {
                needed: table.len(),
                actual: REGION_TABLE_CAPACITY,
            });
        }
        let mut region_table = [RegionTableEntry::EMPTY; REGION_TABLE_CAPACITY];
        region_table[..table.len()].copy_from_slice(table);

        let ptr = region.as_ptr() as *mut GlobalMemoryRegion;
        ptr.write(GlobalMemoryRegion {
            header: RegionHeader::new(RegionType::Global, region_size),
            control_channel_sync: ChannelSync::new(),
            feedback_channel_sync: ChannelSync::new(),
            region_table,
        });
        Ok(&*ptr)
    }

    /// Views an existing global region, validating signature, variant code
    /// and declared size against the mapping.
    ///
    /// # Safety
    /// `region` must point to `mapped_size` bytes of an initialized global
    /// region that stays mapped for `'a`.
    pub unsafe fn attach<'a>(
        region: NonNull<u8>,
        mapped_size: u64,
    ) -> Result<&'a Self, LayoutError> {
        if (mapped_size as usize) < Self::LAYOUT_SIZE {
            return Err(LayoutError::RegionTooSmall {
                needed: Self::LAYOUT_SIZE,
                actual: mapped_size as usize,
            });
        }
        let this = &*(region.as_ptr() as *const GlobalMemoryRegion);
        this.header.validate(RegionType::Global, mapped_size)?;
        Ok(this)
    }

    /// Looks up a bootstrap table row.
    pub fn find_region(&self, region_type: RegionType, index: u32) -> Option<&RegionTableEntry> {
        self.region_table.iter().find(|entry| {
            entry.region_type == region_type as u32 && entry.region_index == index
        })
    }
}

/// Offset of the payload that follows a [`RegionHeader`] in the
/// shared-config region, padded out to a cache line.
pub const REGION_HEADER_RESERVED: usize = 64;

/// Writes a bare header for a non-global headered region (the shared-config
/// region) and returns the payload area after it.
///
/// # Safety
/// Same contract as [`GlobalMemoryRegion::initialize`].
pub unsafe fn initialize_region_header(
    region: NonNull<u8>,
    region_type: RegionType,
    region_size: u64,
) -> Result<NonNull<[u8]>, LayoutError> {
    if (region_size as usize) < REGION_HEADER_RESERVED {
        return Err(LayoutError::RegionTooSmall {
            needed: REGION_HEADER_RESERVED,
            actual: region_size as usize,
        });
    }
    let ptr = region.as_ptr() as *mut RegionHeader;
    ptr.write(RegionHeader::new(region_type, region_size));
    Ok(region_payload(region, region_size))
}

/// Validates the header of a non-global headered region and returns the
/// payload area after it.
///
/// # Safety
/// Same contract as [`GlobalMemoryRegion::attach`].
pub unsafe fn attach_region_header<'a>(
    region: NonNull<u8>,
    region_type: RegionType,
    mapped_size: u64,
) -> Result<(&'a RegionHeader, NonNull<[u8]>), LayoutError> {
    if (mapped_size as usize) < REGION_HEADER_RESERVED {
        return Err(LayoutError::RegionTooSmall {
            needed: REGION_HEADER_RESERVED,
            actual: mapped_size as usize,
        });
    }
    let header = &*(region.as_ptr() as *const RegionHeader);
    header.validate(region_type, mapped_size)?;
    Ok((header, region_payload(region, mapped_size)))
}

unsafe fn region_payload(region: NonNull<u8>, region_size: u64) -> NonNull<[u8]> {
    let payload = region.as_ptr().add(REGION_HEADER_RESERVED);
    NonNull::slice_from_raw_parts(
        NonNull::new_unchecked(payload),
        region_size as usize - REGION_HEADER_RESERVED,
    )
}
