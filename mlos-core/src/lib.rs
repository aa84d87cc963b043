// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Target/agent binding layer of the mlos shared-memory exchange.
//!
//! A [`context::Context`] maps the shared regions, wires up the two
//! channels and the configuration dictionary, and tracks attach/detach so
//! the last detacher cleans up the OS objects. Message routing goes through
//! a [`dispatch::GlobalDispatchTable`] assembled from one or more
//! [`dispatch::SettingsRegistry`] announcements, starting with the
//! intrinsic registry of internal control messages.

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod messages;

pub use error::MlosError;
