//! Settings types. Every struct deserializes with `default`, so a settings
//! file only needs the keys it wants to change.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server: ServerSettings,
    pub pipeline: PipelineSettings,
    pub heartbeat: HeartbeatSettings,
    pub annotator: AnnotatorSettings,
    pub reliability: ReliabilitySettings,
    pub telemetry: TelemetrySettings,
}

/// HTTP/WebSocket front door.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Per-connection outbound frame queue.
    pub max_send_queue: usize,
    /// Transport ping cadence.
    pub ping_interval_ms: u64,
    /// A connection with no pong for this long is considered dead.
    pub client_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_send_queue: 256,
            ping_interval_ms: 30_000,
            client_timeout_ms: 90_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl ServerSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Submission, bus, and worker pool sizing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    pub max_payload_bytes: usize,
    pub lane_capacity: usize,
    /// Upper bound on concurrently running annotation invocations.
    pub worker_concurrency: usize,
    /// Fixed seed for notation conversion; `None` draws fresh entropy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion_seed: Option<u64>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_payload_bytes: 10 * 1024 * 1024,
            lane_capacity: 1024,
            worker_concurrency: 16,
            conversion_seed: None,
        }
    }
}

/// Progress heartbeat cadence and ceiling.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    pub interval_ms: u64,
    /// Heartbeats stop (with a final notice) once a request has been in
    /// flight this long. The annotation itself keeps running.
    pub ceiling_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            ceiling_ms: 300_000,
        }
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_millis(self.ceiling_ms)
    }
}

/// External annotation endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnnotatorSettings {
    pub base_url: String,
    pub species: String,
    pub batch_limit: usize,
    pub connect_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for AnnotatorSettings {
    fn default() -> Self {
        Self {
            base_url: "https://rest.ensembl.org".to_string(),
            species: "human".to_string(),
            batch_limit: 1000,
            connect_timeout_ms: 5_000,
            user_agent: "vepline/0.1".to_string(),
        }
    }
}

impl AnnotatorSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Retry, circuit breaker, and per-call timeout around the external call.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReliabilitySettings {
    pub max_retries: u32,
    pub backoff_ms: u64,
    /// Rolling window size, in calls.
    pub breaker_window: u32,
    pub breaker_failure_ratio: f64,
    pub breaker_cooldown_ms: u64,
    pub call_timeout_ms: u64,
    /// Retry budget overrides keyed by processing mode name
    /// (`"cluster-scale"`, ...). The breaker is shared by every mode.
    pub per_mode: BTreeMap<String, ModeBudget>,
    /// Bound on the readiness check behind `/health`.
    pub ping_timeout_ms: u64,
}

impl Default for ReliabilitySettings {
    fn default() -> Self {
        let per_mode = BTreeMap::from([
            (
                "high-volume".to_string(),
                ModeBudget {
                    call_timeout_ms: Some(15_000),
                    ..Default::default()
                },
            ),
            (
                "cluster-scale".to_string(),
                ModeBudget {
                    max_retries: Some(2),
                    call_timeout_ms: Some(30_000),
                    ..Default::default()
                },
            ),
        ]);
        Self {
            max_retries: 3,
            backoff_ms: 1_000,
            breaker_window: 4,
            breaker_failure_ratio: 0.5,
            breaker_cooldown_ms: 5_000,
            call_timeout_ms: 10_000,
            per_mode,
            ping_timeout_ms: 5_000,
        }
    }
}

/// Unset fields inherit the top-level reliability values.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModeBudget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<u64>,
}

impl ReliabilitySettings {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    /// Default level; `RUST_LOG` takes precedence when set.
    pub log_level: String,
    pub format: LogFormat,
    /// Per-module overrides, e.g. `("vepline_annotator", "debug")`.
    pub module_levels: Vec<(String, String)>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            format: LogFormat::Json,
            module_levels: Vec::new(),
        }
    }
}
