// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Internal control messages and the intrinsic registry announcing them.
//!
//! These are hand-written stand-ins for what the settings code generator
//! emits for every schema: an [`ShmMessage`] impl per type plus a
//! [`SettingsRegistry`] covering a dense run of type indices. The intrinsic
//! registry always seeds the table, so its indices start at 1.

use crate::dispatch::{DispatchEntry, SettingsRegistry};
use mlos_shm::frame::{wire, FrameError, ShmMessage, VarFieldDesc, VarRegion, VAR_REGION_SIZE};
use std::sync::Arc;

pub const INTRINSIC_REGISTRY_NAME: &str = "Mlos.Core.Internal";

/// Type index of [`RegisterSettingsAssemblyRequest`].
pub const REGISTER_SETTINGS_ASSEMBLY_TYPE_INDEX: u32 = 1;

/// Type index of [`TerminateReaderThreadRequest`].
pub const TERMINATE_READER_THREAD_TYPE_INDEX: u32 = 2;

/// Entries the intrinsic registry contributes; dynamically announced
/// registries start after these.
pub const INTRINSIC_TYPE_COUNT: u32 = 2;

/// In-band announcement that the target registered another settings
/// registry; the agent loads the matching artifact and extends its dispatch
/// table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSettingsAssemblyRequest {
    /// Announcement ordinal, taken from the global region's assembly
    /// counter.
    pub assembly_index: u32,
    /// Identity of the announced registry.
    pub registry_name: String,
}

impl ShmMessage for RegisterSettingsAssemblyRequest {
    const TYPE_HASH: u64 = 0x92d1_6f35_a0c4_3b01;
    const FIXED_SIZE: usize = 8 + VAR_REGION_SIZE;

    fn variable_size(&self) -> usize {
        self.registry_name.len()
    }

    fn var_fields() -> &'static [VarFieldDesc] {
        &[VarFieldDesc { field_offset: 8 }]
    }

    fn serialize_into(&self, payload: &mut [u8]) {
        wire::write_u32(payload, 0, self.assembly_index);
        VarRegion {
            offset_from_field: (Self::FIXED_SIZE - 8) as u64,
            byte_length: self.registry_name.len() as u64,
        }
        .write_at(payload, 8);
        payload[Self::FIXED_SIZE..Self::FIXED_SIZE + self.registry_name.len()]
            .copy_from_slice(self.registry_name.as_bytes());
    }

    fn deserialize(payload: &[u8]) -> Result<Self, FrameError> {
        let assembly_index = wire::read_u32(payload, 0)?;
        let region = VarRegion::read_at(payload, 8)?;
        let start = 8 + region.offset_from_field as usize;
        let end = start
            .checked_add(region.byte_length as usize)
            .ok_or(FrameError::MalformedVariableData { field_offset: 8 })?;
        let bytes = payload
            .get(start..end)
            .ok_or(FrameError::MalformedVariableData { field_offset: 8 })?;
        Ok(RegisterSettingsAssemblyRequest {
            assembly_index,
            registry_name: String::from_utf8_lossy(bytes).into_owned(),
        })
    }
}

/// Asks the other endpoint's reader loop to unwind without terminating the
/// channel itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminateReaderThreadRequest;

impl ShmMessage for TerminateReaderThreadRequest {
    const TYPE_HASH: u64 = 0x92d1_6f35_a0c4_3b02;
    const FIXED_SIZE: usize = 0;

    fn serialize_into(&self, _payload: &mut [u8]) {}

    fn deserialize(_payload: &[u8]) -> Result<Self, FrameError> {
        Ok(TerminateReaderThreadRequest)
    }
}

type RegisterAssemblyHandler = Arc<dyn Fn(RegisterSettingsAssemblyRequest) + Send + Sync>;
type TerminateReaderHandler = Arc<dyn Fn() + Send + Sync>;

/// The registry of internal messages. Seeds every dispatch table; handlers
/// are optional and default to no-ops.
#[derive(Clone)]
pub struct IntrinsicRegistry {
    on_register_assembly: RegisterAssemblyHandler,
    on_terminate_reader: TerminateReaderHandler,
}

impl Default for IntrinsicRegistry {
    fn default() -> Self {
        Self {
            on_register_assembly: Arc::new(|_| {}),
            on_terminate_reader: Arc::new(|| {}),
        }
    }
}

impl IntrinsicRegistry {
    pub fn new() -> IntrinsicRegistry {
        IntrinsicRegistry::default()
    }

    pub fn on_register_assembly<F>(mut self, handler: F) -> IntrinsicRegistry
    where
        F: Fn(RegisterSettingsAssemblyRequest) + Send + Sync + 'static,
    {
        self.on_register_assembly = Arc::new(handler);
        self
    }

    pub fn on_terminate_reader<F>(mut self, handler: F) -> IntrinsicRegistry
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_terminate_reader = Arc::new(handler);
        self
    }
}

impl SettingsRegistry for IntrinsicRegistry {
    fn registry_name(&self) -> &str {
        INTRINSIC_REGISTRY_NAME
    }

    fn base_type_index(&self) -> u32 {
        0
    }

    fn entries(&self) -> Vec<DispatchEntry> {
        let on_register = self.on_register_assembly.clone();
        let on_terminate = self.on_terminate_reader.clone();
        vec![
            DispatchEntry::for_message::<RegisterSettingsAssemblyRequest, _>(move |request| {
                on_register(request);
                Ok(())
            }),
            DispatchEntry::for_message::<TerminateReaderThreadRequest, _>(move |_| {
                on_terminate();
                Ok(())
            }),
        ]
    }
}
