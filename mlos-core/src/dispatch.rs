// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The global dispatch table.
//!
//! Settings registries (the build-time outputs of the settings code
//! generator, or the hand-written [`crate::messages::IntrinsicRegistry`])
//! announce dense runs of dispatch entries. The global table is their
//! concatenation: the frame type index `i` routes to entry `i - 1` in O(1).
//!
//! Registries carry the base index they were generated against; announcing
//! one whose base does not line up with the current table length is
//! rejected, which keeps both endpoints' index assignments identical.

use mlos_shm::frame::{FrameError, FrameView, ShmMessage};
use tracing::warn;

pub type DispatchCallback = Box<dyn Fn(&FrameView<'_>) -> Result<(), FrameError> + Send + Sync>;

/// One type's routing row: content hash, payload verifier and callback.
pub struct DispatchEntry {
    pub type_hash: u64,
    pub verify: fn(&[u8]) -> Result<(), FrameError>,
    pub callback: DispatchCallback,
}

impl DispatchEntry {
    /// Builds the row for a typed message: hash and verifier come from the
    /// schema, the callback deserializes and hands the value to `handler`.
    pub fn for_message<M, F>(handler: F) -> DispatchEntry
    where
        M: ShmMessage + 'static,
        F: Fn(M) -> Result<(), FrameError> + Send + Sync + 'static,
    {
        DispatchEntry {
            type_hash: M::TYPE_HASH,
            verify: M::verify,
            callback: Box::new(move |frame| handler(M::deserialize(frame.payload())?)),
        }
    }
}

/// A versioned bundle of type schemas announcing its slice of the dispatch
/// table.
pub trait SettingsRegistry {
    /// Stable identity; announcing the same registry twice is a no-op.
    fn registry_name(&self) -> &str;

    /// Number of entries the table must already hold. The registry's first
    /// type index is `base_type_index() + 1`.
    fn base_type_index(&self) -> u32;

    fn entries(&self) -> Vec<DispatchEntry>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("registry announced base index {announced} but the table holds {expected} entries")]
    InvalidBaseIndex { announced: u32, expected: u32 },
}

/// What to do after the invalid-frame hook ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InvalidFramePolicy {
    /// Log, reclaim the frame, keep dispatching.
    #[default]
    LogAndContinue,
    /// Surface the error to the reader loop, which exits.
    Fail,
}

/// Result of pushing one frame through the table.
#[derive(Debug)]
pub enum DispatchOutcome {
    Dispatched,
    /// The frame failed validation and went to the invalid-frame hook.
    Invalid(FrameError),
}

type InvalidFrameHook = Box<dyn Fn(u32, &FrameError) + Send + Sync>;

#[derive(Default)]
pub struct GlobalDispatchTable {
    entries: Vec<DispatchEntry>,
    registered: Vec<String>,
    policy: InvalidFramePolicy,
    invalid_frame_hook: Option<InvalidFrameHook>,
}

impl GlobalDispatchTable {
    pub fn new() -> GlobalDispatchTable {
        GlobalDispatchTable::default()
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_invalid_frame_policy(&mut self, policy: InvalidFramePolicy) {
        self.policy = policy;
    }

    /// Installs the `received_invalid_frame` hook, called with the frame's
    /// type index and the rejection reason.
    pub fn set_invalid_frame_hook<F>(&mut self, hook: F)
    where
        F: Fn(u32, &FrameError) + Send + Sync + 'static,
    {
        self.invalid_frame_hook = Some(Box::new(hook));
    }

    /// Appends a registry's entries. Idempotent per registry identity.
    pub fn add_registry(&mut self, registry: &dyn SettingsRegistry) -> Result<(), RegistryError> {
        if self
            .registered
            .iter()
            .any(|name| name == registry.registry_name())
        {
            return Ok(());
        }
        let expected = self.entries.len() as u32;
        if registry.base_type_index() != expected {
            return Err(RegistryError::InvalidBaseIndex {
                announced: registry.base_type_index(),
                expected,
            });
        }
        self.entries.extend(registry.entries());
        self.registered.push(registry.registry_name().to_owned());
        Ok(())
    }

    /// Routes one frame: bounds-check the index, compare the type hash,
    /// verify the variable data, then invoke the callback. Failures go to
    /// the invalid-frame hook; under the default policy the frame is
    /// dropped and dispatch continues.
    pub fn dispatch(&self, frame: &FrameView<'_>) -> Result<DispatchOutcome, FrameError> {
        match self.try_dispatch(frame) {
            Ok(()) => Ok(DispatchOutcome::Dispatched),
            Err(reason) => {
                warn!(
                    type_index = frame.type_index(),
                    %reason,
                    "dropping invalid frame"
                );
                if let Some(hook) = &self.invalid_frame_hook {
                    hook(frame.type_index(), &reason);
                }
                match self.policy {
                    InvalidFramePolicy::LogAndContinue => Ok(DispatchOutcome::Invalid(reason)),
                    InvalidFramePolicy::Fail => Err(reason),
                }
            }
        }
    }

    fn try_dispatch(&self, frame: &FrameView<'_>) -> Result<(), FrameError> {
        let type_index = frame.type_index();
        if type_index == 0 || type_index > self.entries.len() as u32 {
            return Err(FrameError::TypeIndexOutOfRange(type_index));
        }
        let entry = &self.entries[(type_index - 1) as usize];
        if entry.type_hash != frame.type_hash() {
            return Err(FrameError::TypeHashMismatch {
                expected: entry.type_hash,
                actual: frame.type_hash(),
            });
        }
        (entry.verify)(frame.payload())?;
        (entry.callback)(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlos_shm::frame::wire;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Ping(u32);

    impl ShmMessage for Ping {
        const TYPE_HASH: u64 = 0x70_1177;
        const FIXED_SIZE: usize = 4;

        fn serialize_into(&self, payload: &mut [u8]) {
            wire::write_u32(payload, 0, self.0);
        }

        fn deserialize(payload: &[u8]) -> Result<Self, FrameError> {
            Ok(Ping(wire::read_u32(payload, 0)?))
        }
    }

    struct PingRegistry {
        base: u32,
        hits: Arc<AtomicU32>,
    }

    impl SettingsRegistry for PingRegistry {
        fn registry_name(&self) -> &str {
            "Mlos.UnitTest.Ping"
        }

        fn base_type_index(&self) -> u32 {
            self.base
        }

        fn entries(&self) -> Vec<DispatchEntry> {
            let hits = self.hits.clone();
            vec![DispatchEntry::for_message::<Ping, _>(move |ping| {
                hits.fetch_add(ping.0, Ordering::SeqCst);
                Ok(())
            })]
        }
    }

    fn ping_frame(value: u32) -> Vec<u8> {
        Ping(value).to_bytes()
    }

    #[test]
    fn routes_by_type_index() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut table = GlobalDispatchTable::new();
        table
            .add_registry(&PingRegistry {
                base: 0,
                hits: hits.clone(),
            })
            .unwrap();

        let payload = ping_frame(5);
        let frame = FrameView::new(1, Ping::TYPE_HASH, &payload);
        assert!(matches!(
            table.dispatch(&frame).unwrap(),
            DispatchOutcome::Dispatched
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn add_registry_is_idempotent() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut table = GlobalDispatchTable::new();
        let registry = PingRegistry {
            base: 0,
            hits: hits.clone(),
        };
        table.add_registry(&registry).unwrap();
        table.add_registry(&registry).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn misaligned_base_index_is_rejected() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut table = GlobalDispatchTable::new();
        let err = table
            .add_registry(&PingRegistry {
                base: 3,
                hits,
            })
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::InvalidBaseIndex {
                announced: 3,
                expected: 0,
            }
        );
    }

    #[test]
    fn invalid_frames_reach_the_hook_once() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut table = GlobalDispatchTable::new();
        table
            .add_registry(&PingRegistry {
                base: 0,
                hits: hits.clone(),
            })
            .unwrap();

        let hook_calls = Arc::new(AtomicU32::new(0));
        {
            let hook_calls = hook_calls.clone();
            table.set_invalid_frame_hook(move |_, _| {
                hook_calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Flip the hash: validation fails, the callback never runs.
        let payload = ping_frame(5);
        let frame = FrameView::new(1, Ping::TYPE_HASH ^ 1, &payload);
        assert!(matches!(
            table.dispatch(&frame).unwrap(),
            DispatchOutcome::Invalid(FrameError::TypeHashMismatch { .. })
        ));
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // Out-of-range index, same path.
        let frame = FrameView::new(9, Ping::TYPE_HASH, &payload);
        assert!(matches!(
            table.dispatch(&frame).unwrap(),
            DispatchOutcome::Invalid(FrameError::TypeIndexOutOfRange(9))
        ));
        assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn strict_policy_surfaces_the_error() {
        let hits = Arc::new(AtomicU32::new(0));
        let mut table = GlobalDispatchTable::new();
        table.add_registry(&PingRegistry { base: 0, hits }).unwrap();
        table.set_invalid_frame_policy(InvalidFramePolicy::Fail);

        let payload = ping_frame(1);
        let frame = FrameView::new(1, 0xbad, &payload);
        assert!(table.dispatch(&frame).is_err());
    }
}
