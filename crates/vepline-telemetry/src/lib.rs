mod metrics;

pub use metrics::{MetricsSnapshot, PipelineMetrics};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use vepline_settings::{LogFormat, TelemetrySettings};

/// Handle returned by [`init_telemetry`]. Holds the effective filter so it
/// can be reported by the health endpoint.
pub struct TelemetryGuard {
    installed: bool,
    filter: String,
}

impl TelemetryGuard {
    /// False when another subscriber was already installed (tests, embedding).
    pub fn installed(&self) -> bool {
        self.installed
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }
}

/// Build the filter directive string: default level first, then per-module
/// overrides.
pub fn filter_directives(settings: &TelemetrySettings) -> String {
    let mut filter_str = settings.log_level.to_lowercase();
    for (module, level) in &settings.module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_lowercase()));
    }
    filter_str
}

/// Install the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init_telemetry(settings: &TelemetrySettings) -> TelemetryGuard {
    let filter_str = filter_directives(settings);
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&filter_str))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    let installed = tracing_subscriber::registry().with(fmt_layer).try_init().is_ok();

    TelemetryGuard {
        installed,
        filter: filter_str,
    }
}
