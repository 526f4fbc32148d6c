//! Logging and tracing setup for the evidence toolkit
//!
//! Structured logging through `tracing`. Call [`init`] once at startup;
//! library code only emits events.
//!
//! # Log Levels
//!
//! - `error` - Errors that prevent operation completion
//! - `warn`  - Unexpected evidence content that was skipped or degraded
//! - `info`  - Image opened, layout discovered, digests computed
//! - `debug` - Per-entry skips, mount probes, cache behaviour
//! - `trace` - Chunk reads and header sniffs
//!
//! # Environment Variable Control
//!
//! ```bash
//! RUST_LOG=debug evidence-toolkit volumes disk.E01
//! RUST_LOG=evidence_toolkit::volume=trace evidence-toolkit ls disk.dd --offset 2048
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the compact global subscriber; a second call is a no-op
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("evidence_toolkit=debug")
        } else {
            EnvFilter::new("evidence_toolkit=info")
        }
    });

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact(),
    );

    // Ignore error if already set
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Trace everything, with file:line and thread IDs
pub fn init_verbose() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trace"));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .pretty(),
    );

    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info};

    #[test]
    fn test_init_twice() {
        init();
        init_verbose();
        info!("Test log message");
        debug!(key = "value", "Structured log");
    }
}
