//! Human-readable frames sent to clients: heartbeat status lines and the
//! final result message.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::Utc;

use vepline_core::{AnnotationResult, AnnotationStatus, ProcessingMode};

/// Variants listed individually in a result message.
const MAX_LISTED_VARIANTS: usize = 10;

pub const TIMEOUT_NOTICE: &str = "⚠️ Analysis is taking longer than expected. VEP service may be under heavy load. Results will be delivered when processing completes.";

fn stamp() -> String {
    Utc::now().format("[%H:%M:%S]").to_string()
}

/// First frame after a submission enters flight.
pub fn start_message(mode: ProcessingMode, payload_size: usize) -> String {
    let body = match mode {
        ProcessingMode::Standard => "🔬 Starting VEP annotation analysis",
        ProcessingMode::HighVolume => "🚀 Starting big data analysis",
        ProcessingMode::ClusterScale => "⚡ Starting cluster-scale analysis",
        ProcessingMode::LagProbe => "📊 Starting lag-probe analysis",
    };
    format!("{} {body} ({payload_size} chars)...", stamp())
}

/// Periodic status line, worded by elapsed-time bucket.
pub fn progress_message(mode: ProcessingMode, elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let body = match secs {
        0..=15 => format!("⏳ VEP service scaling up... ({secs}s)"),
        16..=30 => match mode {
            ProcessingMode::ClusterScale => "🧬 Cluster nodes processing genetic sequence...".to_string(),
            ProcessingMode::HighVolume => "🧬 VEP service processing large genetic sequence...".to_string(),
            _ => "🧬 VEP service processing genetic sequence...".to_string(),
        },
        31..=60 => "🔍 Analyzing variants and generating annotations...".to_string(),
        61..=120 => "📊 Finalizing ML predictions and results...".to_string(),
        _ => format!("⏱️ Complex analysis in progress, please wait... ({secs}s)"),
    };
    format!("{} {body}", stamp())
}

pub fn timeout_notice() -> String {
    format!("{} {TIMEOUT_NOTICE}", stamp())
}

fn banner(mode: ProcessingMode) -> &'static str {
    match mode {
        ProcessingMode::Standard => "Genetic Analysis Complete",
        ProcessingMode::HighVolume => "Genetic Analysis Complete (high-volume)",
        ProcessingMode::ClusterScale => "Genetic Analysis Complete (cluster-scale)",
        ProcessingMode::LagProbe => "Genetic Analysis Complete (lag-probe)",
    }
}

/// Final result frame. Starts with the banner and ends with the completion
/// timestamp.
pub fn result_message(result: &AnnotationResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} 🧬", banner(result.processing_mode));
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "**Sequence:** {} ({} chars, {}, {})",
        result.sequence_preview, result.sequence_length, result.sequence_type, result.size_class
    );
    let _ = writeln!(out, "**Processing Mode:** {}", result.processing_mode);
    let _ = writeln!(out, "**Analysis Source:** {}", result.source_service);
    let _ = writeln!(out);

    match result.status {
        AnnotationStatus::Annotated => write_annotations(&mut out, result),
        AnnotationStatus::NoAnnotations => {
            let _ = writeln!(out, "**ℹ️ No annotations found for this sequence**");
            let _ = writeln!(out, "The annotation service answered but reported no known variants.");
        }
        AnnotationStatus::Degraded => {
            let _ = writeln!(out, "**⚠️ No annotations available**");
            let _ = writeln!(out, "The annotation service could not be reached, so this result is degraded.");
            if let Some(reason) = &result.error {
                let _ = writeln!(out, "Reason: {reason}");
            }
            let _ = writeln!(out, "• Resubmit the sequence to try again");
        }
        AnnotationStatus::Error => {
            let _ = writeln!(out, "**❌ Analysis failed**");
            let _ = writeln!(
                out,
                "{}",
                result.error.as_deref().unwrap_or("the annotation response could not be read")
            );
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "**✅ Ready for next analysis**");
    let _ = write!(
        out,
        "**⏱️ Analysis completed at:** {}",
        result.completed_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    out
}

fn write_annotations(out: &mut String, result: &AnnotationResult) {
    let _ = writeln!(out, "**🔬 VEP Annotations Found:** {}", result.variant_count());
    if let Some(worst) = &result.most_severe_consequence {
        let _ = writeln!(out, "**Most Severe Consequence:** {worst}");
    }
    let _ = writeln!(out);

    for record in result.records.iter().take(MAX_LISTED_VARIANTS) {
        let _ = writeln!(out, "• **Variant:** {}", record.input);
        let _ = writeln!(
            out,
            "  - **Consequence:** {}",
            record.most_severe_consequence.as_deref().unwrap_or("Unknown")
        );
        if let Some(tc) = record.transcript_consequences.first() {
            let details = [
                ("Gene", &tc.gene_symbol),
                ("Impact", &tc.impact),
                ("SIFT", &tc.sift_prediction),
                ("PolyPhen", &tc.polyphen_prediction),
            ];
            for (label, value) in details {
                if let Some(v) = value {
                    let _ = writeln!(out, "  - **{label}:** {v}");
                }
            }
        }
    }
    if result.records.len() > MAX_LISTED_VARIANTS {
        let _ = writeln!(out, "… and {} more", result.records.len() - MAX_LISTED_VARIANTS);
    }
}

/// Sent when an annotated envelope arrives whose payload cannot be read.
pub fn unreadable_result_message() -> String {
    format!(
        "Genetic Analysis Complete 🧬\n\n**❌ Analysis failed**\nThe result could not be read.\n\n**⏱️ Analysis completed at:** {}",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    )
}
