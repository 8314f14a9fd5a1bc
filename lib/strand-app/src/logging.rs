//! Logging.

use strand_error::{generic_error, GenericError};
use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{
    layer::SubscriberExt as _, registry::LookupSpan, util::SubscriberInitExt as _, EnvFilter, Layer,
};

const LOG_LEVEL_ENV_VAR: &str = "STRAND_LOG_LEVEL";
const LOG_FORMAT_JSON_ENV_VAR: &str = "STRAND_LOG_FORMAT_JSON";

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// This function reads the `STRAND_LOG_LEVEL` environment variable to determine the filtering directives to use. If
/// the environment variable is not set, `default_level` is used, or `INFO` if no default level is given. Additionally,
/// it reads the `STRAND_LOG_FORMAT_JSON` environment variable to determine which output format to use. If it is set to
/// `true` or `1`, the logs will be formatted as JSON. Otherwise, the logs will be written in a human-readable format.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(default_level: Option<LevelFilter>) -> Result<(), GenericError> {
    let is_json = std::env::var(LOG_FORMAT_JSON_ENV_VAR)
        .map(|value| is_enabled_flag(&value))
        .unwrap_or(false);

    let level_filter = EnvFilter::builder()
        .with_default_directive(default_level.unwrap_or(LevelFilter::INFO).into())
        .with_env_var(LOG_LEVEL_ENV_VAR)
        .from_env_lossy();

    let output_layer = if is_json {
        build_json_layer().boxed()
    } else {
        build_pretty_layer().boxed()
    };

    tracing_subscriber::registry()
        .with(output_layer.with_filter(level_filter))
        .try_init()
        .map_err(|e| generic_error!("Failed to initialize logging: {}", e))
}

fn is_enabled_flag(value: &str) -> bool {
    let value = value.trim().to_lowercase();
    value == "true" || value == "1"
}

fn build_json_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
}

fn build_pretty_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_flag_accepts_true_and_one() {
        assert!(is_enabled_flag("true"));
        assert!(is_enabled_flag(" TRUE "));
        assert!(is_enabled_flag("1"));
        assert!(!is_enabled_flag("false"));
        assert!(!is_enabled_flag("json"));
        assert!(!is_enabled_flag(""));
    }

    #[test]
    fn second_initialization_fails() {
        initialize_logging(Some(LevelFilter::WARN)).unwrap();
        assert!(initialize_logging(None).is_err());
    }
}
