// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::dispatch::RegistryError;
use mlos_shm::channel::ChannelError;
use mlos_shm::dictionary::DictionaryError;
use mlos_shm::frame::FrameError;
use mlos_shm::layout::LayoutError;
use std::io;

/// Process exit code for a fatal protocol error (invalid frame, unsupported
/// OS, unknown registry base index).
pub const EXIT_PROTOCOL_ERROR: i32 = 1;

/// Process exit code for a resource error (not found, permission, mmap
/// failure).
pub const EXIT_RESOURCE_ERROR: i32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum MlosError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Dictionary(#[from] DictionaryError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("unsupported host platform: {0}")]
    Unsupported(&'static str),
}

impl MlosError {
    /// Exit code a harness reports when it terminates on this error:
    /// 0 for a cooperative shutdown, 1 for protocol errors, 2 for resource
    /// errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            MlosError::Channel(ChannelError::Aborted) => 0,
            MlosError::Io(_) | MlosError::Layout(_) | MlosError::Channel(_) => {
                EXIT_RESOURCE_ERROR
            }
            MlosError::Frame(_)
            | MlosError::Dictionary(_)
            | MlosError::Registry(_)
            | MlosError::Unsupported(_) => EXIT_PROTOCOL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(MlosError::Channel(ChannelError::Aborted).exit_code(), 0);
        assert_eq!(
            MlosError::Io(io::Error::from(io::ErrorKind::NotFound)).exit_code(),
            EXIT_RESOURCE_ERROR
        );
        assert_eq!(
            MlosError::Frame(FrameError::TypeIndexOutOfRange(99)).exit_code(),
            EXIT_PROTOCOL_ERROR
        );
        assert_eq!(
            MlosError::Registry(RegistryError::InvalidBaseIndex {
                announced: 4,
                expected: 2,
            })
            .exit_code(),
            EXIT_PROTOCOL_ERROR
        );
        assert_eq!(MlosError::Unsupported("plan9").exit_code(), EXIT_PROTOCOL_ERROR);
    }
}
