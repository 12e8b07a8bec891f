use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// Errors surfaced by the registry and the exposition encoder.
///
/// Registration and update errors are programmer errors: they are returned
/// to the caller immediately and never retried.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("metric `{0}` is already registered with a different descriptor")]
    DuplicateName(String),

    #[error("label set does not match the declared labels of metric `{0}`")]
    LabelCardinality(String),

    #[error("`{op}` is not valid for {kind} metric `{name}`")]
    InvalidOperation {
        name: String,
        kind: &'static str,
        op: &'static str,
    },

    #[error("invalid metric or label name `{0}`")]
    InvalidName(String),

    #[error("failed to encode metrics snapshot")]
    Encoding,
}

/// Whether to log (verbose) error output.
/// Use the `DEBUG` env var (or `--debug`) to override (on, off)
static ERROR_LOGGER: AtomicBool = AtomicBool::new(false);

pub fn debug_error_enabled(enabled: bool) {
    ERROR_LOGGER.store(enabled, Ordering::Relaxed);
}

pub fn debug_error(err: anyhow::Error) {
    if ERROR_LOGGER.load(Ordering::Relaxed) {
        eprintln!("Warn: {}", err);
        for err in err.chain().skip(1) {
            eprintln!("Caused by: {}", err);
        }
    }
}
