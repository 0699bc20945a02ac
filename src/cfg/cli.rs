// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

/// Resolves a possibly-relative config path against the current working
/// directory and canonicalizes it.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

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

    Ok(canon)
}

/// Flags recognised by the `gatemesh-host` binary.
#[derive(Parser, Debug)]
#[command(name = "gatemesh-host", about = "Run a gatemesh application host")]
pub struct HostArgs {
    /// Path to the process's TOML config file.
    #[arg(short, long, default_value = "gatemesh.toml")]
    pub config: String,

    /// Only start services whose `name` matches this filter (substring).
    #[arg(long)]
    pub only: Option<String>,
}
