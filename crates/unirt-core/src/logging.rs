//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "UNIRT_LOG";

/// Installs a `fmt` subscriber filtered by `UNIRT_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already installed.
pub fn init_tracing() {
    let _ = try_init_tracing("info");
}

/// Installs a `fmt` subscriber filtered by `UNIRT_LOG`, falling back to
/// `default_directives` when the variable is unset or invalid.
///
/// Returns false if a global subscriber was already installed.
pub fn try_init_tracing(default_directives: &str) -> bool {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directives));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_installed_once() {
        let _ = try_init_tracing("debug");
        assert!(!try_init_tracing("debug"));
        tracing::debug!(target: "unirt", "subscriber active");
    }
}
