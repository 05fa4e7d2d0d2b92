//! Provide tracing, tailored to this program.
//!
//! At startup, the program should call one of the init_* functions at startup
//! to install a tracing subscriber (i.e., something that emits events to a
//! log).
//!
//! The rest of program the can include `use tracing::prelude::*` for convenient
//! access to the `trace!()`, `debug!()`, `info!()`, `warn!()`, and `error!()`
//! macros.

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

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to stdout.
/// `default_level` applies when RUST_LOG is unset.
pub fn init_journald_or_stdout(default_level: LevelFilter) {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry().with(layer).init();
        } else {
            use_stdout(default_level);
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        use_stdout(default_level);
    }
}

/// Parse a log level name from the config file, falling back to INFO.
pub fn parse_level(name: &str) -> LevelFilter {
    name.parse().unwrap_or(LevelFilter::INFO)
}

// Log to stdout, filtering according to environment variable RUST_LOG,
// overriding the default level (ERROR) with the configured one.
fn use_stdout(default_level: LevelFilter) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

// Provide our own timer that formats timestamps in local time and to the
// nearest millisecond. Share and job traffic is dense enough that whole
// seconds hide ordering.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second].[subsecond digits:3]"
            ))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
