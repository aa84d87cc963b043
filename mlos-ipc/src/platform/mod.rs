// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

mod mem_handle;
pub use mem_handle::*;

#[cfg(unix)]
pub use unix::*;
#[cfg(windows)]
pub use windows::*;
