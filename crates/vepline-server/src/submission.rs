use bytes::Bytes;
use serde::Deserialize;

use vepline_core::{CorrelationId, ValidationError};
use vepline_engine::Submission;

/// Structured form of a client frame or request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionBody {
    sequence: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    resource_profile: Option<String>,
}

/// Parse a client frame. Text that looks like a JSON object must be a valid
/// submission object; anything else is the sequence itself.
pub fn parse_submission(text: &str) -> Result<Submission, ValidationError> {
    if !text.trim_start().starts_with('{') {
        return Ok(Submission::text(text));
    }
    let body: SubmissionBody = serde_json::from_str(text)
        .map_err(|e| ValidationError::InvalidSubmission(e.to_string()))?;
    Ok(Submission {
        payload: Bytes::from(body.sequence),
        mode: body.mode,
        correlation_id: body
            .correlation_id
            .filter(|id| !id.trim().is_empty())
            .map(CorrelationId::from_raw),
        resource_profile: body.resource_profile,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_the_sequence() {
        let s = parse_submission("ATCGATCGATCG").unwrap();
        assert_eq!(&s.payload[..], b"ATCGATCGATCG");
        assert!(s.mode.is_none());
        assert!(s.correlation_id.is_none());
    }

    #[test]
    fn json_object_carries_metadata() {
        let s = parse_submission(
            r#"{"sequence":"ACGT","mode":"big-data","correlationId":"corr_x","resourceProfile":"gpu"}"#,
        )
        .unwrap();
        assert_eq!(&s.payload[..], b"ACGT");
        assert_eq!(s.mode.as_deref(), Some("big-data"));
        assert_eq!(s.correlation_id, Some(CorrelationId::from_raw("corr_x")));
        assert_eq!(s.resource_profile.as_deref(), Some("gpu"));
    }

    #[test]
    fn blank_correlation_id_is_ignored() {
        let s = parse_submission(r#"{"sequence":"ACGT","correlationId":"  "}"#).unwrap();
        assert!(s.correlation_id.is_none());
    }

    #[test]
    fn broken_json_is_rejected() {
        assert!(matches!(
            parse_submission(r#"{"mode":"standard"}"#),
            Err(ValidationError::InvalidSubmission(_))
        ));
        assert!(matches!(
            parse_submission("{not json"),
            Err(ValidationError::InvalidSubmission(_))
        ));
    }
}
