use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use vepline_core::{AnnotationError, AnnotationRecord, AnnotationService, TranscriptConsequence};

/// Pre-programmed responses for deterministic testing without network calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Return these records verbatim.
    Records(Vec<AnnotationRecord>),
    /// One synthetic record per requested notation.
    Echo,
    Error(AnnotationError),
    /// Wait a duration, then produce the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn echo() -> Self {
        Self::Echo
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Annotation service that replays scripted responses in order.
///
/// With [`MockAnnotator::always`] the single response is reused for every
/// call; otherwise calls past the end of the script fail with a mapping
/// error.
pub struct MockAnnotator {
    responses: Vec<MockResponse>,
    repeat_last: bool,
    call_count: AtomicUsize,
    requests: Mutex<Vec<Vec<String>>>,
}

impl MockAnnotator {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            repeat_last: false,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always(response: MockResponse) -> Self {
        Self {
            repeat_last: true,
            ..Self::new(vec![response])
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Notation batches received so far, in call order.
    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().clone()
    }

    fn response_for(&self, idx: usize) -> Option<&MockResponse> {
        match self.responses.get(idx) {
            Some(r) => Some(r),
            None if self.repeat_last => self.responses.last(),
            None => None,
        }
    }
}

/// Synthetic record shaped like a real endpoint response.
pub fn echo_record(notation: &str) -> AnnotationRecord {
    AnnotationRecord {
        input: notation.to_string(),
        most_severe_consequence: Some("missense_variant".into()),
        transcript_consequences: vec![TranscriptConsequence {
            gene_symbol: Some("BRCA1".into()),
            impact: Some("MODERATE".into()),
            consequence_terms: vec!["missense_variant".into()],
            sift_prediction: Some("deleterious".into()),
            polyphen_prediction: Some("probably_damaging".into()),
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[async_trait]
impl AnnotationService for MockAnnotator {
    fn name(&self) -> &str {
        "mock-vep"
    }

    async fn annotate(&self, notations: &[String]) -> Result<Vec<AnnotationRecord>, AnnotationError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(notations.to_vec());

        let Some(mut response) = self.response_for(idx).cloned() else {
            return Err(AnnotationError::Mapping(format!(
                "MockAnnotator: no response configured for call {idx}"
            )));
        };

        loop {
            match response {
                MockResponse::Records(records) => return Ok(records),
                MockResponse::Echo => return Ok(notations.iter().map(String::as_str).map(echo_record).collect()),
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    response = *inner;
                }
            }
        }
    }
}
