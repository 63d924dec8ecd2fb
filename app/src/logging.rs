//! Logging setup.
//!
//! Log level is read from `PHOTOZIP_LOG` (e.g. `PHOTOZIP_LOG=debug`), falling
//! back to `info`. Output goes to stderr so it never mixes with command output.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_env("PHOTOZIP_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()?;

    Ok(())
}
