// SPDX-FileCopyrightText: 2025 blinry
// SPDX-FileCopyrightText: 2025 zormit
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Log output setup for the server and the terminal client.

use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::EnvFilter;

/// Overrides the log filter when set; same directive syntax as `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "COWRITE_LOG";

/// Install the global subscriber. The filter comes from [`LOG_ENV_VAR`] when
/// present, otherwise `--debug` decides between our debug output and plain
/// info-level logs.
pub fn initialize(debug: bool) {
    let default_directives = if debug { "info,cowrite=debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let clock_format =
        time::format_description::parse("[hour]:[minute]:[second].[subsecond digits:3]")
            .expect("The clock format literal should parse");
    let offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(OffsetTime::new(offset, clock_format))
        .with_thread_ids(true)
        .init();
}
