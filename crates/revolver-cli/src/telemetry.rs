// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 Revolver Contributors

//! Log output for the `revolver` binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogLevel;

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level, e.g.
/// `RUST_LOG=revolver_ecdysis=debug revolver watch revolver.yaml`.
pub fn init(level: LogLevel) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

fn default_filter(level: LogLevel) -> EnvFilter {
    // Dependencies stay at warn unless asked for.
    EnvFilter::new(format!("warn,revolver={0},revolver_ecdysis={0}", level))
}
