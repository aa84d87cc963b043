// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Platform layer of the mlos target/agent exchange: shared memory region
//! handles, named notification events, and (on Unix) the Unix-domain-socket
//! rendezvous that hands anonymous region descriptors between processes.

#[cfg(unix)]
pub mod exchange;
pub mod platform;
