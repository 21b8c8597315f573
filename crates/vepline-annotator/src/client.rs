use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, instrument};

use vepline_core::{AnnotationError, AnnotationRecord, AnnotationService};
use vepline_settings::AnnotatorSettings;

/// HTTP client for an Ensembl-compatible VEP REST endpoint.
///
/// One `annotate` call is one `POST {base}/vep/{species}/hgvs`. Status codes
/// are classified with [`AnnotationError::from_status`]; retrying is left to
/// [`crate::ReliableAnnotator`].
pub struct VepClient {
    client: Client,
    base_url: String,
    species: String,
    batch_limit: usize,
    connect_timeout: Duration,
}

impl VepClient {
    pub fn new(settings: &AnnotatorSettings) -> Result<Self, AnnotationError> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout())
            .user_agent(settings.user_agent.as_str())
            .build()
            .map_err(|e| AnnotationError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            species: settings.species.clone(),
            batch_limit: settings.batch_limit.max(1),
            connect_timeout: settings.connect_timeout(),
        })
    }

    fn annotate_url(&self) -> String {
        format!("{}/vep/{}/hgvs", self.base_url, self.species)
    }

    fn map_send_error(&self, e: reqwest::Error) -> AnnotationError {
        if e.is_timeout() {
            AnnotationError::Timeout(self.connect_timeout)
        } else {
            AnnotationError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl AnnotationService for VepClient {
    fn name(&self) -> &str {
        "ensembl-vep"
    }

    fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    #[instrument(skip(self, notations), fields(count = notations.len()))]
    async fn annotate(&self, notations: &[String]) -> Result<Vec<AnnotationRecord>, AnnotationError> {
        if notations.is_empty() {
            return Err(AnnotationError::MalformedRequest("no notations to annotate".into()));
        }
        if notations.len() > self.batch_limit {
            return Err(AnnotationError::MalformedRequest(format!(
                "batch of {} exceeds limit {}",
                notations.len(),
                self.batch_limit
            )));
        }

        let resp = self
            .client
            .post(self.annotate_url())
            .header("accept", "application/json")
            .json(&json!({ "hgvs_notations": notations }))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(AnnotationError::from_status(status, body));
        }

        let body = resp.bytes().await.map_err(|e| self.map_send_error(e))?;
        let records: Vec<AnnotationRecord> = serde_json::from_slice(&body)
            .map_err(|e| AnnotationError::Mapping(format!("unexpected response body: {e}")))?;
        debug!(records = records.len(), "annotation response decoded");
        Ok(records)
    }

    async fn ping(&self) -> Result<(), AnnotationError> {
        let resp = self
            .client
            .get(format!("{}/info/ping", self.base_url))
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status().as_u16();
            Err(AnnotationError::from_status(status, String::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> VepClient {
        let settings = AnnotatorSettings {
            base_url: format!("{}/", server.uri()),
            batch_limit: 3,
            ..Default::default()
        };
        VepClient::new(&settings).unwrap()
    }

    fn notations(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn annotate_posts_notations_and_decodes_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/vep/human/hgvs"))
            .and(header("accept", "application/json"))
            .and(body_json(json!({"hgvs_notations": ["17:g.43094692G>A"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "input": "17:g.43094692G>A",
                "most_severe_consequence": "missense_variant",
                "transcript_consequences": [{
                    "gene_symbol": "BRCA1",
                    "impact": "MODERATE",
                    "consequence_terms": ["missense_variant"],
                    "sift_prediction": "deleterious"
                }]
            }])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let records = client.annotate(&notations(&["17:g.43094692G>A"])).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].most_severe_consequence.as_deref(), Some("missense_variant"));
        assert_eq!(
            records[0].transcript_consequences[0].gene_symbol.as_deref(),
            Some("BRCA1")
        );
    }

    #[tokio::test]
    async fn empty_array_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/vep/human/hgvs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let records = client_for(&server)
            .annotate(&notations(&["1:g.100A>T"]))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .annotate(&notations(&["1:g.100A>T"]))
            .await
            .unwrap_err();
        assert_eq!(err, AnnotationError::Transient { status: 503, body: "busy".into() });
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn bad_request_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad hgvs"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .annotate(&notations(&["nonsense"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AnnotationError::MalformedRequest(_)));
        assert!(!err.counts_toward_breaker());
    }

    #[tokio::test]
    async fn undecodable_body_is_mapping_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "not a list"})))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .annotate(&notations(&["1:g.100A>T"]))
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "mapping");
    }

    #[tokio::test]
    async fn oversized_or_empty_batches_are_rejected_locally() {
        let server = MockServer::start().await;
        let client = client_for(&server);

        let err = client.annotate(&[]).await.unwrap_err();
        assert!(matches!(err, AnnotationError::MalformedRequest(_)));

        let err = client
            .annotate(&notations(&["a", "b", "c", "d"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AnnotationError::MalformedRequest(_)));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn unreachable_host_is_network_error() {
        let settings = AnnotatorSettings {
            base_url: "http://127.0.0.1:1".into(),
            ..Default::default()
        };
        let client = VepClient::new(&settings).unwrap();
        let err = client.annotate(&notations(&["1:g.100A>T"])).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn ping_hits_info_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/info/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ping": 1})))
            .mount(&server)
            .await;

        assert!(client_for(&server).ping().await.is_ok());
    }
}
