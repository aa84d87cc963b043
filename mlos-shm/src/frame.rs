// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Message frame layout and the typed-message codec surface.
//!
//! Wire layout of a channel frame (little-endian, 4-byte aligned):
//!
//! ```text
//! offset  0: i32  length            sign-encoded state; bit 0 = in-progress
//! offset  4: u32  codegen_type_index  0 = link frame
//! offset  8: u64  codegen_type_hash
//! offset 16: payload                fixed part, then variable tail
//! ```
//!
//! Variable-length tail fields are referenced from the fixed part by a
//! `(offset_from_field, byte_length)` pair of `u64`s, where the offset is
//! relative to the position of the pair itself. Every referenced region must
//! lie inside the payload and past the fixed part; [`verify_variable_data`]
//! checks this before a receiver dereferences anything.

/// Bytes occupied by the frame header (`length`, type index, type hash).
pub const FRAME_HEADER_SIZE: u32 = 16;

/// Frame positions and lengths are multiples of this.
pub const FRAME_ALIGNMENT: u32 = 4;

/// Type index reserved for link frames (padding to the buffer end).
pub const LINK_FRAME_TYPE_INDEX: u32 = 0;

/// Errors surfaced by the frame codec and the dispatch path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame type index {0} is outside the dispatch table")]
    TypeIndexOutOfRange(u32),
    #[error("frame type hash {actual:#018x} does not match registered hash {expected:#018x}")]
    TypeHashMismatch { expected: u64, actual: u64 },
    #[error("variable data referenced from fixed offset {field_offset} escapes the frame")]
    MalformedVariableData { field_offset: u32 },
    #[error("payload of {actual} bytes is shorter than the {expected} byte fixed part")]
    Truncated { expected: usize, actual: usize },
}

/// Rounds a payload length up to a full frame length, or `None` when the
/// result does not fit the 31 bits a frame `length` field can carry.
#[inline]
pub fn frame_length_for_payload(payload_len: usize) -> Option<u32> {
    let len = (payload_len as u64)
        .checked_add(FRAME_HEADER_SIZE as u64)?
        .checked_add(FRAME_ALIGNMENT as u64 - 1)?
        & !(FRAME_ALIGNMENT as u64 - 1);
    if len > i32::MAX as u64 {
        return None;
    }
    Some(len as u32)
}

/// A `(offset_from_field, byte_length)` pair referencing a variable-length
/// region of the payload. The offset is relative to the byte position of the
/// pair itself within the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VarRegion {
    pub offset_from_field: u64,
    pub byte_length: u64,
}

/// Size of a serialized [`VarRegion`] reference.
pub const VAR_REGION_SIZE: usize = 16;

impl VarRegion {
    /// Reads the pair stored at `field_offset` within `payload`.
    pub fn read_at(payload: &[u8], field_offset: usize) -> Result<VarRegion, FrameError> {
        let offset_from_field = wire::read_u64(payload, field_offset)?;
        let byte_length = wire::read_u64(payload, field_offset + 8)?;
        Ok(VarRegion {
            offset_from_field,
            byte_length,
        })
    }

    /// Writes the pair at `field_offset`. Panics if the buffer is too small;
    /// serializers size their buffers exactly.
    pub fn write_at(&self, payload: &mut [u8], field_offset: usize) {
        wire::write_u64(payload, field_offset, self.offset_from_field);
        wire::write_u64(payload, field_offset + 8, self.byte_length);
    }
}

/// Position of one variable-length field reference inside the fixed part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarFieldDesc {
    /// Byte offset of the `(offset, length)` pair within the payload.
    pub field_offset: u32,
}

/// Walks a schema's variable-field table over a received payload and checks
/// that every referenced region stays inside the payload, starts at or after
/// the fixed part, and that regions appear in field order without overlap.
///
/// `fields` must be sorted by `field_offset` (schemas emit them in
/// declaration order).
pub fn verify_variable_data(
    payload: &[u8],
    fixed_size: usize,
    fields: &[VarFieldDesc],
) -> Result<(), FrameError> {
    if payload.len() < fixed_size {
        return Err(FrameError::Truncated {
            expected: fixed_size,
            actual: payload.len(),
        });
    }

    let mut previous_end = fixed_size as u64;
    for field in fields {
        let field_offset = field.field_offset as usize;
        let malformed = FrameError::MalformedVariableData {
            field_offset: field.field_offset,
        };
        if field_offset + VAR_REGION_SIZE > fixed_size {
            return Err(malformed);
        }
        let region = VarRegion::read_at(payload, field_offset).map_err(|_| malformed)?;
        if region.byte_length == 0 {
            continue;
        }
        let start = (field_offset as u64)
            .checked_add(region.offset_from_field)
            .ok_or(malformed)?;
        let end = start.checked_add(region.byte_length).ok_or(malformed)?;
        if start < previous_end || end > payload.len() as u64 {
            return Err(malformed);
        }
        previous_end = end;
    }
    Ok(())
}

/// A borrowed, already-claimed message frame as handed to dispatch.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    type_index: u32,
    type_hash: u64,
    payload: &'a [u8],
}

impl<'a> FrameView<'a> {
    pub fn new(type_index: u32, type_hash: u64, payload: &'a [u8]) -> Self {
        Self {
            type_index,
            type_hash,
            payload,
        }
    }

    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    pub fn type_hash(&self) -> u64 {
        self.type_hash
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

/// A typed message that can travel a channel or live in the shared config
/// dictionary. Implementations are normally emitted by the settings code
/// generator; this crate only relies on the shape.
///
/// `serialize_into` writes the fixed part at offset 0 followed by the
/// variable tail; the buffer is exactly `FIXED_SIZE + variable_size()` bytes.
pub trait ShmMessage: Sized {
    /// Content-addressed identity of the message schema, stable across
    /// processes and runs.
    const TYPE_HASH: u64;

    /// Size of the fixed part, including the `(offset, length)` pairs of
    /// variable fields.
    const FIXED_SIZE: usize;

    /// Bytes of variable tail data this value carries.
    fn variable_size(&self) -> usize {
        0
    }

    /// Positions of the variable-field references within the fixed part,
    /// in declaration order.
    fn var_fields() -> &'static [VarFieldDesc] {
        &[]
    }

    fn serialize_into(&self, payload: &mut [u8]);

    fn deserialize(payload: &[u8]) -> Result<Self, FrameError>;

    /// Serializes into a freshly sized buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::FIXED_SIZE + self.variable_size()];
        self.serialize_into(&mut buf);
        buf
    }

    /// Bounds-checks the variable tail before any deref. Receivers run this
    /// ahead of `deserialize`.
    fn verify(payload: &[u8]) -> Result<(), FrameError> {
        verify_variable_data(payload, Self::FIXED_SIZE, Self::var_fields())
    }
}

/// Little-endian primitive accessors shared by serializers.
pub mod wire {
    use super::FrameError;

    #[inline]
    pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32, FrameError> {
        let bytes = buf
            .get(offset..offset + 4)
            .ok_or(FrameError::Truncated {
                expected: offset + 4,
                actual: buf.len(),
            })?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    #[inline]
    pub fn read_u64(buf: &[u8], offset: usize) -> Result<u64, FrameError> {
        let bytes = buf
            .get(offset..offset + 8)
            .ok_or(FrameError::Truncated {
                expected: offset + 8,
                actual: buf.len(),
            })?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    #[inline]
    pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
        buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fixed part: a u32 counter, 4 bytes padding, then one variable string.
    struct Probe {
        counter: u32,
        label: String,
    }

    impl ShmMessage for Probe {
        const TYPE_HASH: u64 = 0x5a17_c0de_0000_0001;
        const FIXED_SIZE: usize = 8 + VAR_REGION_SIZE;

        fn variable_size(&self) -> usize {
            self.label.len()
        }

        fn var_fields() -> &'static [VarFieldDesc] {
            &[VarFieldDesc { field_offset: 8 }]
        }

        fn serialize_into(&self, payload: &mut [u8]) {
            wire::write_u32(payload, 0, self.counter);
            let region = VarRegion {
                // tail starts right after the fixed part, relative to the pair
                offset_from_field: (Self::FIXED_SIZE - 8) as u64,
                byte_length: self.label.len() as u64,
            };
            region.write_at(payload, 8);
            payload[Self::FIXED_SIZE..Self::FIXED_SIZE + self.label.len()]
                .copy_from_slice(self.label.as_bytes());
        }

        fn deserialize(payload: &[u8]) -> Result<Self, FrameError> {
            Self::verify(payload)?;
            let counter = wire::read_u32(payload, 0)?;
            let region = VarRegion::read_at(payload, 8)?;
            let start = 8 + region.offset_from_field as usize;
            let end = start + region.byte_length as usize;
            let label = String::from_utf8_lossy(&payload[start..end]).into_owned();
            Ok(Probe { counter, label })
        }
    }

    #[test]
    fn frame_length_rounding() {
        assert_eq!(frame_length_for_payload(0), Some(16));
        assert_eq!(frame_length_for_payload(1), Some(20));
        assert_eq!(frame_length_for_payload(4), Some(20));
        assert_eq!(frame_length_for_payload(5), Some(24));
        assert_eq!(frame_length_for_payload(i32::MAX as usize), None);
    }

    #[test]
    fn roundtrip_with_variable_tail() {
        let msg = Probe {
            counter: 42,
            label: "latency_bucket".into(),
        };
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), Probe::FIXED_SIZE + 14);
        let back = Probe::deserialize(&bytes).unwrap();
        assert_eq!(back.counter, 42);
        assert_eq!(back.label, "latency_bucket");
    }

    #[test]
    fn byte_stability_across_serializations() {
        let msg = Probe {
            counter: 7,
            label: "stable".into(),
        };
        assert_eq!(msg.to_bytes(), msg.to_bytes());
    }

    #[test]
    fn verify_rejects_region_past_payload() {
        let msg = Probe {
            counter: 1,
            label: "abcdef".into(),
        };
        let mut bytes = msg.to_bytes();
        // Inflate the declared tail length past the payload end.
        let region = VarRegion {
            offset_from_field: (Probe::FIXED_SIZE - 8) as u64,
            byte_length: 1024,
        };
        region.write_at(&mut bytes, 8);
        assert!(matches!(
            Probe::verify(&bytes),
            Err(FrameError::MalformedVariableData { field_offset: 8 })
        ));
    }

    #[test]
    fn verify_rejects_region_inside_fixed_part() {
        let msg = Probe {
            counter: 1,
            label: "abcdef".into(),
        };
        let mut bytes = msg.to_bytes();
        // Point the tail back into the fixed part.
        let region = VarRegion {
            offset_from_field: 0,
            byte_length: 4,
        };
        region.write_at(&mut bytes, 8);
        assert!(Probe::verify(&bytes).is_err());
    }

    #[test]
    fn verify_rejects_truncated_payload() {
        let err = Probe::verify(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { .. }));
    }

    #[test]
    fn verify_accepts_empty_tail() {
        let msg = Probe {
            counter: 9,
            label: String::new(),
        };
        let bytes = msg.to_bytes();
        assert!(Probe::verify(&bytes).is_ok());
        assert_eq!(Probe::deserialize(&bytes).unwrap().label, "");
    }

    #[test]
    fn verify_rejects_overlapping_regions() {
        // Two variable fields whose regions overlap.
        const FIELDS: &[VarFieldDesc] = &[
            VarFieldDesc { field_offset: 0 },
            VarFieldDesc { field_offset: 16 },
        ];
        let fixed = 32usize;
        let mut payload = vec![0u8; fixed + 8];
        VarRegion {
            offset_from_field: 32,
            byte_length: 8,
        }
        .write_at(&mut payload, 0);
        VarRegion {
            offset_from_field: 16,
            byte_length: 8,
        }
        .write_at(&mut payload, 16);
        assert!(verify_variable_data(&payload, fixed, FIELDS).is_err());
    }

    #[test]
    fn verify_offset_overflow_is_rejected() {
        let fixed = VAR_REGION_SIZE;
        let mut payload = vec![0u8; fixed + 8];
        VarRegion {
            offset_from_field: u64::MAX - 4,
            byte_length: 8,
        }
        .write_at(&mut payload, 0);
        let fields = [VarFieldDesc { field_offset: 0 }];
        assert!(verify_variable_data(&payload, fixed, &fields).is_err());
    }

    // Fuzz: arbitrary payload bytes must never panic the verifier, and any
    // mutation that breaks an offset invariant must be rejected before
    // deserialize dereferences the tail.
    #[test]
    fn fuzz_verify_never_panics() {
        bolero::check!().with_type::<Vec<u8>>().for_each(|bytes| {
            let _ = Probe::verify(bytes);
            if Probe::verify(bytes).is_ok() && bytes.len() >= Probe::FIXED_SIZE {
                // A verified payload must deserialize without panicking.
                let _ = Probe::deserialize(bytes);
            }
        });
    }
}
