// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Tracing initialization driven by a small YAML file, so the demo binary
//! and the test rigs agree on where the protocol trace goes.

use std::fs;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

#[derive(Debug, Deserialize, Clone)]
struct LoggerConfig {
    logger: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
enum Output {
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
enum RotationFreq {
    Minutely,
    Hourly,
    Daily,
    Never,
}

#[derive(Debug, Deserialize, Clone)]
struct LogFileConfig {
    path: String,
    #[serde(default)]
    rotation_frequency: Option<RotationFreq>,
}

#[derive(Debug, Deserialize, Clone)]
struct LogConfig {
    level: String,
    output: Output,
    #[serde(default)]
    is_show_line: bool,
    #[serde(default)]
    is_show_target: bool,
    file: Option<LogFileConfig>,
}

/// Install the global subscriber. The returned guard must be kept alive for
/// the lifetime of the program when logging to a file.
pub fn init_logger(path: &str) -> Result<Option<WorkerGuard>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read logger config {path}"))?;
    let cfg: LoggerConfig =
        serde_yaml::from_str(&raw).context("failed to parse logger config YAML")?;
    let log = cfg.logger;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .context("bad log level")?;

    let mut guard = None;
    let layer = match log.output {
        Output::Stdout => fmt::layer()
            .with_line_number(log.is_show_line)
            .with_target(log.is_show_target)
            .boxed(),
        Output::Stderr => fmt::layer()
            .with_writer(std::io::stderr)
            .with_line_number(log.is_show_line)
            .with_target(log.is_show_target)
            .boxed(),
        Output::File => {
            let file = log
                .file
                .as_ref()
                .context("output: file requires a file section")?;
            let rotation = match file.rotation_frequency {
                Some(RotationFreq::Minutely) => Rotation::MINUTELY,
                Some(RotationFreq::Hourly) => Rotation::HOURLY,
                Some(RotationFreq::Daily) => Rotation::DAILY,
                Some(RotationFreq::Never) | None => Rotation::NEVER,
            };
            let (dir, prefix) = match file.path.rsplit_once('/') {
                Some((d, p)) => (d.to_string(), p.to_string()),
                None => (".".to_string(), file.path.clone()),
            };
            let appender = RollingFileAppender::new(rotation, dir, prefix);
            let (writer, g) = tracing_appender::non_blocking(appender);
            guard = Some(g);
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_line_number(log.is_show_line)
                .with_target(log.is_show_target)
                .boxed()
        },
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(guard)
}
