// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod event;
mod mem_handle;
mod sockets;

pub use event::*;
pub use mem_handle::*;
pub use sockets::*;
