//! Tracing subscriber setup shared by host, manager and worker processes.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the filter: `RUST_LOG` wins, otherwise `TASKPOOL_LOG` picks the level
/// for this crate's targets. The wire target stays off unless asked for explicitly.
fn build_filter(rust_log: Option<&str>, taskpool_log: Option<&str>) -> EnvFilter {
    if let Some(directives) = rust_log {
        return EnvFilter::new(directives);
    }

    let level = match taskpool_log {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };

    EnvFilter::new(format!(
        "taskpool={level},taskpool_demo={level},taskpool::wire=off"
    ))
}

/// Line format for stderr output, picked by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Install the global subscriber. Safe to call more than once; later calls are no-ops.
///
/// Always writes to stderr: a child's stdout is its protocol pipe.
pub fn init_tracing() {
    let rust_log = std::env::var("RUST_LOG").ok();
    let taskpool_log = std::env::var("TASKPOOL_LOG").ok();
    let filter = build_filter(rust_log.as_deref(), taskpool_log.as_deref());
    let format = LogFormat::parse(std::env::var("LOG_FORMAT").ok().as_deref());

    let json = (format == LogFormat::Json)
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text = (format == LogFormat::Text).then(|| fmt::layer().with_writer(std::io::stderr));

    if tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
        .is_err()
    {
        tracing::trace!("Global subscriber already installed");
    }
}
