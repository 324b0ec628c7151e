//! Open Screencast - screen recordings with a live camera bubble.
//!
//! This is the library crate behind the `open-screencast` binary. It
//! provides capture, audio mixing, video compositing, chunked recording and
//! trim re-encoding.

pub mod capture;
pub mod compositor;
pub mod config;
pub mod export;
pub mod mixer;
pub mod recorder;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging
pub fn init_logging(verbose: bool) {
    let fallback = if verbose {
        "open_screencast=debug"
    } else {
        "open_screencast=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
