use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ids::CorrelationId;
use crate::mode::ProcessingMode;

const PREVIEW_CHARS: usize = 60;

/// Normalized request carried in an inbound envelope's payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceRequest {
    pub correlation_id: CorrelationId,
    pub sequence: String,
    #[serde(default)]
    pub processing_mode: ProcessingMode,
    #[serde(default)]
    pub resource_profile: Option<String>,
    #[serde(default)]
    pub sequence_length: usize,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl SequenceRequest {
    pub fn new(correlation_id: CorrelationId, sequence: impl Into<String>, mode: ProcessingMode) -> Self {
        let sequence = sequence.into();
        Self {
            correlation_id,
            sequence_length: sequence.chars().count(),
            sequence,
            processing_mode: mode,
            resource_profile: None,
            submitted_at: Some(Utc::now()),
        }
    }
}

/// Per-transcript detail nested inside an annotation record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptConsequence {
    pub gene_id: Option<String>,
    pub gene_symbol: Option<String>,
    pub transcript_id: Option<String>,
    pub consequence_terms: Vec<String>,
    pub impact: Option<String>,
    pub variant_allele: Option<String>,
    pub biotype: Option<String>,
    pub sift_prediction: Option<String>,
    pub polyphen_prediction: Option<String>,
}

/// One record returned by the external annotation endpoint.
/// Field names follow the endpoint's JSON; unknown fields are ignored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationRecord {
    pub input: String,
    pub most_severe_consequence: Option<String>,
    pub transcript_consequences: Vec<TranscriptConsequence>,
    pub variant_class: Option<String>,
    pub assembly_name: Option<String>,
    pub seq_region_name: Option<String>,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub strand: Option<i8>,
    pub allele_string: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationStatus {
    Annotated,
    NoAnnotations,
    Degraded,
    Error,
}

impl AnnotationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Annotated => "annotated",
            Self::NoAnnotations => "no_annotations",
            Self::Degraded => "degraded",
            Self::Error => "error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationResult {
    pub correlation_id: CorrelationId,
    pub processing_mode: ProcessingMode,
    pub payload_digest: String,
    pub sequence_preview: String,
    pub sequence_length: usize,
    pub sequence_type: String,
    pub size_class: String,
    pub records: Vec<AnnotationRecord>,
    pub status: AnnotationStatus,
    pub most_severe_consequence: Option<String>,
    pub source_service: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnnotationResult {
    /// Result for a completed call. Status is `annotated` or
    /// `no-annotations` depending on whether any record came back.
    pub fn completed(
        request: &SequenceRequest,
        records: Vec<AnnotationRecord>,
        source_service: impl Into<String>,
    ) -> Self {
        let status = if records.is_empty() {
            AnnotationStatus::NoAnnotations
        } else {
            AnnotationStatus::Annotated
        };
        let mut result = Self::base(request, status, source_service.into());
        result.most_severe_consequence = most_severe(&records);
        result.records = records;
        result
    }

    /// Empty result returned instead of failing when the service is down.
    pub fn degraded(request: &SequenceRequest, source_service: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut result = Self::base(request, AnnotationStatus::Degraded, source_service.into());
        result.error = Some(reason.into());
        result
    }

    pub fn error(request: &SequenceRequest, source_service: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut result = Self::base(request, AnnotationStatus::Error, source_service.into());
        result.error = Some(reason.into());
        result
    }

    fn base(request: &SequenceRequest, status: AnnotationStatus, source_service: String) -> Self {
        let len = request.sequence.chars().count();
        Self {
            correlation_id: request.correlation_id.clone(),
            processing_mode: request.processing_mode,
            payload_digest: digest(request.sequence.as_bytes()),
            sequence_preview: preview(&request.sequence),
            sequence_length: len,
            sequence_type: sequence_type(&request.sequence).to_string(),
            size_class: size_class(len).to_string(),
            records: Vec::new(),
            status,
            most_severe_consequence: None,
            source_service,
            completed_at: Utc::now(),
            error: None,
        }
    }

    pub fn variant_count(&self) -> usize {
        self.records.len()
    }
}

/// Hex SHA-256 of the submitted payload.
pub fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn preview(sequence: &str) -> String {
    if sequence.chars().count() <= PREVIEW_CHARS {
        sequence.to_string()
    } else {
        let head: String = sequence.chars().take(PREVIEW_CHARS).collect();
        format!("{head}...")
    }
}

/// Rough nucleotide classification of a sequence.
pub fn sequence_type(sequence: &str) -> &'static str {
    if sequence.is_empty() {
        return "unknown";
    }
    let upper = sequence.to_ascii_uppercase();
    let dna = upper.chars().filter(|c| matches!(c, 'A' | 'T' | 'G' | 'C')).count();
    let ratio = dna as f64 / upper.chars().count() as f64;
    if ratio > 0.8 {
        "dna"
    } else if upper.contains('U') {
        "rna"
    } else {
        "mixed"
    }
}

pub fn size_class(len: usize) -> &'static str {
    match len {
        0..=1_000 => "small",
        1_001..=10_000 => "medium",
        10_001..=100_000 => "large",
        _ => "very_large",
    }
}

// Most to least severe; terms missing from the list rank last.
const SEVERITY_ORDER: &[&str] = &[
    "transcript_ablation",
    "splice_acceptor_variant",
    "splice_donor_variant",
    "stop_gained",
    "frameshift_variant",
    "stop_lost",
    "start_lost",
    "transcript_amplification",
    "inframe_insertion",
    "inframe_deletion",
    "missense_variant",
    "protein_altering_variant",
    "splice_region_variant",
    "incomplete_terminal_codon_variant",
    "start_retained_variant",
    "stop_retained_variant",
    "synonymous_variant",
    "coding_sequence_variant",
    "mature_miRNA_variant",
    "5_prime_UTR_variant",
    "3_prime_UTR_variant",
    "non_coding_transcript_exon_variant",
    "intron_variant",
    "NMD_transcript_variant",
    "non_coding_transcript_variant",
    "upstream_gene_variant",
    "downstream_gene_variant",
    "TFBS_ablation",
    "TFBS_amplification",
    "TF_binding_site_variant",
    "regulatory_region_ablation",
    "regulatory_region_amplification",
    "feature_elongation",
    "regulatory_region_variant",
    "feature_truncation",
    "intergenic_variant",
];

fn most_severe(records: &[AnnotationRecord]) -> Option<String> {
    records
        .iter()
        .filter_map(|r| r.most_severe_consequence.as_deref())
        .min_by_key(|term| {
            SEVERITY_ORDER
                .iter()
                .position(|t| t == term)
                .unwrap_or(SEVERITY_ORDER.len())
        })
        .map(str::to_string)
}
