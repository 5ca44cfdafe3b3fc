//! Tracing setup for the host binary: console output plus an optional
//! daily-rolling log file. Worker processes never share this subscriber;
//! their stdout is the packet stream and they log to their own files.

use std::path::Path;

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub fn init_tracing(level: &str, log_dir: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let console = fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file = tracing_appender::rolling::daily(dir, "deckhost.log");
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_ansi(false).with_writer(file))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
        }
    }
    Ok(())
}
