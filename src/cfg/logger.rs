// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result};
use fastrace::collector::{Config as FastraceConfig, ConsoleReporter};
use serde::Deserialize;
use tracing_appender::{non_blocking::WorkerGuard, rolling::RollingFileAppender, rolling::Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Logging knobs read from the file named by `log_config` in the process
/// config (see [`crate::cfg::config::Config::log_config`]). The out-of-scope
/// log *sink* (§1) is still configured through the ambient `tracing` stack
/// used throughout this crate; only the destination/format/level are
/// exposed here.
#[derive(Deserialize, Debug, Clone)]
struct LoggerConfig {
    /// `RUST_LOG`-style filter, e.g. `"info"` or `"gatemesh=debug,warn"`.
    #[serde(default = "default_level")]
    level: String,
    /// Where to write log lines.
    #[serde(default)]
    output: Output,
    /// Directory + base file name when `output = "file"`.
    #[serde(default)]
    file: Option<String>,
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "lowercase")]
enum Output {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// Initializes the global `tracing` subscriber (JSON-formatted) and the
/// `fastrace` span collector used for structured latency traces. Returns a
/// guard that must be kept alive for the process's lifetime when logging to
/// a file (dropping it flushes the background writer thread).
///
/// `log_config_path` is the optional `log_config` key from
/// [`crate::cfg::config::Config`]; `None` falls back to `RUST_LOG`/`info`
/// on stdout.
pub fn init_logger(log_config_path: Option<&str>) -> Result<WorkerGuard> {
    let cfg = match log_config_path {
        Some(path) => {
            let s = fs::read_to_string(path)
                .with_context(|| format!("failed to read log config: {path}"))?;
            toml::from_str(&s).context("failed to parse log config TOML")?
        },
        None => LoggerConfig {
            level: default_level(),
            output: Output::default(),
            file: None,
        },
    };

    let (writer, guard) = match cfg.output {
        Output::Stdout => tracing_appender::non_blocking(std::io::stdout()),
        Output::Stderr => tracing_appender::non_blocking(std::io::stderr()),
        Output::File => {
            let path = cfg
                .file
                .as_deref()
                .context("log.file is required for output=\"file\"")?;
            let path = Path::new(path);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path.file_name().unwrap_or_default();
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, name);
            tracing_appender::non_blocking(appender)
        },
    };

    let env_filter = EnvFilter::try_new(&cfg.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fastrace::set_reporter(ConsoleReporter, FastraceConfig::default());
    let compat_layer = fastrace_tracing::FastraceCompatLayer::new();

    let json_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(matches!(cfg.output, Output::Stdout | Output::Stderr))
        .json();

    Registry::default()
        .with(env_filter)
        .with(compat_layer)
        .with(json_layer)
        .try_init()
        .context("failed to install global tracing subscriber")?;

    Ok(guard)
}
