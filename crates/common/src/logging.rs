//! Tracing setup and the per-invocation session span.
//!
//! Every CLI invocation runs inside a `session` span carrying the command
//! and the composition document it works on, so interleaved log lines from
//! the clock task, playback loop and exporter can be told apart.

use std::path::Path;

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Level used when the configured filter does not parse.
pub const FALLBACK_LEVEL: &str = "info";

/// Parse a filter string such as `"info"` or `"lockstep_clock=debug,warn"`.
pub fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|e| {
        eprintln!("invalid log filter {level:?} ({e}), using {FALLBACK_LEVEL}");
        EnvFilter::new(FALLBACK_LEVEL)
    })
}

/// Initialize the tracing subscriber with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more
/// than once is harmless; later calls leave the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(&config.level));

    let installed = if config.json {
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber).is_ok()
    } else {
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber).is_ok()
    };

    if installed {
        tracing::debug!(level = %config.level, json = config.json, "Logging initialized");
    }
}

/// Span wrapping one command run against a composition document.
pub fn session_span(command: &str, document: Option<&Path>) -> tracing::Span {
    match document {
        Some(path) => tracing::info_span!(
            "session",
            command,
            composition = %path.display()
        ),
        None => tracing::info_span!("session", command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_filter_is_kept() {
        let filter = level_filter("lockstep_clock=debug,warn");
        let rendered = filter.to_string();
        assert!(rendered.contains("lockstep_clock=debug"));
        assert!(rendered.contains("warn"));
    }

    #[test]
    fn test_invalid_filter_falls_back() {
        assert_eq!(level_filter("lockstep=loud").to_string(), FALLBACK_LEVEL);
    }

    #[test]
    fn test_session_span_names_command_and_document() {
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(EnvFilter::new("info"))
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let span = session_span("export", Some(Path::new("demo/composition.json")));
            let metadata = span.metadata().expect("span enabled at info");
            assert_eq!(metadata.name(), "session");
            assert!(metadata.fields().field("composition").is_some());
            assert!(metadata.fields().field("command").is_some());

            let bare = session_span("check", None);
            let metadata = bare.metadata().expect("span enabled at info");
            assert!(metadata.fields().field("composition").is_none());
        });
    }
}
