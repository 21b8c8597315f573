use std::fmt;

use serde::{Deserialize, Serialize};

/// Processing mode selected by the submitter.
///
/// Closed set: adding a mode means adding a variant here plus a routing
/// entry in the engine's route table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingMode {
    #[default]
    Standard,
    HighVolume,
    ClusterScale,
    LagProbe,
}

impl ProcessingMode {
    pub const ALL: [ProcessingMode; 4] = [
        Self::Standard,
        Self::HighVolume,
        Self::ClusterScale,
        Self::LagProbe,
    ];

    /// Canonical wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::HighVolume => "high-volume",
            Self::ClusterScale => "cluster-scale",
            Self::LagProbe => "lag-probe",
        }
    }

    /// Parse a tag, accepting the legacy aliases. Returns `None` for anything
    /// unrecognized; callers decide how to fall back.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "standard" | "normal" => Some(Self::Standard),
            "high-volume" | "highvolume" | "big-data" | "bigdata" => Some(Self::HighVolume),
            "cluster-scale" | "node-scale" | "nodescale" => Some(Self::ClusterScale),
            "lag-probe" | "kafka-lag" | "kafkalag" => Some(Self::LagProbe),
            _ => None,
        }
    }

    /// Resolve an optional tag, falling back to `Standard`. The flag is true
    /// when a fallback happened for a tag that was present but unrecognized.
    pub fn resolve(tag: Option<&str>) -> (Self, bool) {
        match tag.map(str::trim).filter(|t| !t.is_empty()) {
            None => (Self::Standard, false),
            Some(t) => match Self::parse(t) {
                Some(mode) => (mode, false),
                None => (Self::Standard, true),
            },
        }
    }

    /// Resource profile implied by the mode when the submitter gives none.
    pub fn default_resource_profile(&self) -> &'static str {
        match self {
            Self::Standard => "normal",
            Self::HighVolume => "high-memory",
            Self::ClusterScale => "cluster-scale",
            Self::LagProbe => "lag-probe",
        }
    }

    pub fn inbound_lane(&self) -> Lane {
        match self {
            Self::Standard => Lane::Standard,
            Self::HighVolume => Lane::HighVolume,
            Self::ClusterScale => Lane::ClusterScale,
            Self::LagProbe => Lane::LagProbe,
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical bus topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lane {
    Standard,
    HighVolume,
    ClusterScale,
    LagProbe,
    Annotated,
}

impl Lane {
    pub const INBOUND: [Lane; 4] = [
        Self::Standard,
        Self::HighVolume,
        Self::ClusterScale,
        Self::LagProbe,
    ];

    pub const ALL: [Lane; 5] = [
        Self::Standard,
        Self::HighVolume,
        Self::ClusterScale,
        Self::LagProbe,
        Self::Annotated,
    ];

    pub fn topic(&self) -> &'static str {
        match self {
            Self::Standard => "genetic-data-raw",
            Self::HighVolume => "genetic-bigdata-raw",
            Self::ClusterScale => "genetic-nodescale-raw",
            Self::LagProbe => "genetic-lag-demo-raw",
            Self::Annotated => "genetic-data-annotated",
        }
    }

    pub fn is_inbound(&self) -> bool {
        !matches!(self, Self::Annotated)
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}
