// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment-driven configuration of the agent.

use crate::error::MlosError;
use std::env;
use std::path::PathBuf;

/// Directories searched for dynamically announced settings registry
/// artifacts. `;`-separated on Windows, `:`-separated elsewhere.
pub const SETTINGS_REGISTRY_PATH_ENV: &str = "MLOS_SETTINGS_REGISTRY_PATH";

/// Parses [`SETTINGS_REGISTRY_PATH_ENV`] into its component directories.
/// An unset variable yields an empty list; an unsupported host OS is a
/// fatal error.
pub fn settings_registry_paths() -> Result<Vec<PathBuf>, MlosError> {
    let separator = if cfg!(windows) {
        ';'
    } else if cfg!(unix) {
        ':'
    } else {
        return Err(MlosError::Unsupported(
            "no settings registry path convention for this OS",
        ));
    };

    let raw = match env::var_os(SETTINGS_REGISTRY_PATH_ENV) {
        Some(raw) => raw,
        None => return Ok(Vec::new()),
    };
    let raw = raw.to_string_lossy().into_owned();
    Ok(raw
        .split(separator)
        .filter(|part| !part.is_empty())
        .map(PathBuf::from)
        .collect())
}
