// SPDX-License-Identifier: GPL-3.0-or-later

use tracing_subscriber::EnvFilter;

/// Variable holding the diagnostics filter, e.g. `NB_CLI_LOG=nb_cli=debug`.
pub const LOG_ENV: &str = "NB_CLI_LOG";

const DEFAULT_FILTER: &str = "warn";

/// Filter from `NB_CLI_LOG`, or `warn` when unset or unparseable. `verbose`
/// raises the default to `debug` for this crate.
pub fn filter(verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
        return filter;
    }
    if verbose {
        EnvFilter::new("warn,nb_cli=debug")
    } else {
        EnvFilter::new(DEFAULT_FILTER)
    }
}

/// Send diagnostics to stderr. Safe to call more than once.
pub fn init(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init(false);
        init(true);
    }
}
