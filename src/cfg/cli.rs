// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Small path helpers shared by the demo binary and the test rigs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};

/// Resolve a possibly-relative configuration path against the current
/// working directory and make sure it names a real file.
pub fn resolve_config_path(rel: impl AsRef<Path>) -> Result<PathBuf> {
    let p = rel.as_ref();

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;
    ensure!(canon.is_file(), "{canon:?} is not a file");

    Ok(canon)
}
