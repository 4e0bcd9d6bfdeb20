//! Logging setup for the daemon.
//!
//! `boardlinkd` installs a subscriber once at startup through
//! [`init_journald_or_stdout`]. Everything else in the crate logs through
//! `use crate::tracing::prelude::*`, tagging events with the connection id
//! (`connection = %id`) so one node's lifecycle can be followed in a busy
//! log.
//!
//! Verbosity comes from `BOARDLINK_LOG`, then `RUST_LOG`, in the usual
//! `EnvFilter` syntax; the default is INFO.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

const LOG_ENV: &str = "BOARDLINK_LOG";
const SYSLOG_IDENTIFIER: &str = "boardlinkd";

/// Install the global subscriber.
///
/// Under systemd (`JOURNAL_STREAM` set) events go to journald; otherwise,
/// or if the journal socket cannot be opened, to stdout.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_err() {
        use_stdout();
        return;
    }
    match tracing_journald::layer() {
        Ok(layer) => tracing_subscriber::registry()
            .with(filter())
            .with(layer.with_syslog_identifier(SYSLOG_IDENTIFIER.to_string()))
            .init(),
        Err(e) => {
            use_stdout();
            error!(error = %e, "Failed to initialize journald logging, using stdout.");
        }
    }
}

fn filter() -> EnvFilter {
    let var = if env::var_os(LOG_ENV).is_some() {
        LOG_ENV
    } else {
        "RUST_LOG"
    };
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(var)
        .from_env_lossy()
}

fn use_stdout() {
    tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

// Local wall-clock time with milliseconds; handshake and close timings are
// sub-second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second].[subsecond digits:3]"
            ))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
