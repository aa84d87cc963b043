// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Owner-restricted ACL for the named kernel objects. Built from an SDDL
//! string so the descriptor plumbing stays opaque to the rest of the crate.

use std::io;
use std::ptr::null_mut;
use winapi::shared::minwindef::LPVOID;
use winapi::shared::sddl::{ConvertStringSecurityDescriptorToSecurityDescriptorA, SDDL_REVISION_1};
use winapi::um::minwinbase::SECURITY_ATTRIBUTES;
use winapi::um::winbase::LocalFree;

/// Protected DACL granting full access to SYSTEM, the built-in
/// administrators and the object owner only.
const OWNER_RESTRICTED_SDDL: &[u8] = b"D:P(A;;GA;;;SY)(A;;GA;;;BA)(A;;GA;;;OW)\0";

/// A `SECURITY_ATTRIBUTES` wrapper owning its security descriptor.
pub(crate) struct SecurityAttributes {
    attributes: SECURITY_ATTRIBUTES,
}

impl SecurityAttributes {
    pub(crate) fn owner_restricted() -> io::Result<SecurityAttributes> {
        let mut descriptor: LPVOID = null_mut();
        let converted = unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorA(
                OWNER_RESTRICTED_SDDL.as_ptr() as *const i8,
                SDDL_REVISION_1,
                &mut descriptor,
                null_mut(),
            )
        };
        if converted == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(SecurityAttributes {
            attributes: SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: descriptor,
                bInheritHandle: 0,
            },
        })
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut SECURITY_ATTRIBUTES {
        &mut self.attributes
    }
}

impl Drop for SecurityAttributes {
    fn drop(&mut self) {
        unsafe {
            LocalFree(self.attributes.lpSecurityDescriptor);
        }
    }
}
