//! Typed calls against the ARM REST surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use azclone_config::EngineConfig;
use azclone_core::cloud::{
    CloudClient, CloudError, CloudErrorBody, CloudErrorKind, DeploymentHandle, DeploymentRequest,
    DeploymentSnapshot, ProvisioningState, QueryFilters, ResourcePage, TokenCredential,
    ValidationOutcome,
};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::limits::{CircuitBreaker, RateLimiter, Service};

const MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";
const RESOURCE_GRAPH_API_VERSION: &str = "2021-03-01";
const ARM_API_VERSION: &str = "2021-04-01";
const GRAPH_PAGE_SIZE: usize = 1000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Provider metadata as returned by `GET /subscriptions/{sub}/providers/{ns}`.
#[derive(Debug, Clone, Deserialize)]
struct ProviderMetadata {
    #[serde(rename = "resourceTypes", default)]
    resource_types: Vec<ProviderResourceType>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProviderResourceType {
    #[serde(rename = "resourceType")]
    resource_type: String,
    #[serde(rename = "apiVersions", default)]
    api_versions: Vec<String>,
    #[serde(default)]
    locations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GraphResponse {
    #[serde(default)]
    data: Vec<azclone_core::cloud::ResourceRecord>,
    #[serde(rename = "$skipToken", default)]
    skip_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: CloudErrorBody,
}

/// ARM REST client. All state that used to be ambient (credential, rate
/// limits, provider cache) is owned here and injected at construction.
pub struct ArmClient {
    http: reqwest::Client,
    credential: Arc<dyn TokenCredential>,
    endpoint: Url,
    limits: RateLimiter,
    breaker: CircuitBreaker,
    retry_attempts: u32,
    retry_delay: Duration,
    /// Provider metadata keyed by lowercased namespace; read-mostly.
    provider_cache: RwLock<HashMap<String, ProviderMetadata>>,
}

impl ArmClient {
    pub fn new(credential: Arc<dyn TokenCredential>, config: &EngineConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            credential,
            endpoint: Url::parse(MANAGEMENT_ENDPOINT).expect("default endpoint parses"),
            limits: RateLimiter::new(&config.rate_limits),
            breaker: CircuitBreaker::new(),
            retry_attempts: config.retry_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            provider_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Point the client at a different management endpoint (sovereign
    /// clouds, test servers).
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Send one request through the rate limiter, breaker, and retry loop.
    /// Transient failures (429, 5xx, timeouts) back off exponentially with
    /// jitter up to the configured attempt budget; everything else maps to a
    /// `CloudError` immediately.
    async fn send(
        &self,
        service: Service,
        method: Method,
        path_and_query: &str,
        subscription_id: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, CloudError> {
        let url = self
            .endpoint
            .join(path_and_query)
            .map_err(|e| CloudError::new(CloudErrorKind::Unknown, "BadUrl", e.to_string()))?;
        let mut attempt = 0u32;
        loop {
            if !self.breaker.check().await {
                return Err(CloudError::transient("circuit breaker is open"));
            }
            self.limits.acquire(service).await;
            let token = self.credential.bearer_token(subscription_id).await?;

            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .timeout(REQUEST_TIMEOUT)
                .header("Authorization", format!("Bearer {}", token));
            if let Some(body) = body {
                request = request.json(body);
            }

            let error = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    self.breaker.record_success().await;
                    return Ok(response);
                }
                Ok(response) => error_from_response(response).await,
                Err(err) => transport_error(err),
            };

            if error.is_transient() {
                self.breaker.record_failure().await;
                if attempt < self.retry_attempts {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        code = %error.code,
                        "Transient cloud error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
            }
            return Err(error);
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.retry_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(6));
        let jitter = (rand::random::<f64>() * base as f64 / 2.0) as u64;
        Duration::from_millis(exp + jitter)
    }

    async fn provider_metadata(
        &self,
        subscription_id: &str,
        provider: &str,
    ) -> Result<ProviderMetadata, CloudError> {
        let key = provider.to_ascii_lowercase();
        {
            let cache = self.provider_cache.read().await;
            if let Some(metadata) = cache.get(&key) {
                return Ok(metadata.clone());
            }
        }

        let path = format!(
            "/subscriptions/{}/providers/{}?api-version={}",
            subscription_id, provider, ARM_API_VERSION
        );
        let response = self
            .send(Service::Arm, Method::GET, &path, subscription_id, None)
            .await?;
        let metadata: ProviderMetadata = response
            .json()
            .await
            .map_err(|e| CloudError::new(CloudErrorKind::Unknown, "BadResponse", e.to_string()))?;

        let mut cache = self.provider_cache.write().await;
        Ok(cache.entry(key).or_insert(metadata).clone())
    }

    fn deployment_path(subscription_id: &str, resource_group: &str, name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Resources/deployments/{}",
            subscription_id, resource_group, name
        )
    }

    fn deployment_body(request: &DeploymentRequest) -> serde_json::Value {
        serde_json::json!({
            "properties": {
                "template": request.template,
                "parameters": request.parameters,
                "mode": request.mode.to_string(),
            }
        })
    }
}

#[async_trait]
impl CloudClient for ArmClient {
    async fn query_resources(
        &self,
        subscription_id: &str,
        filters: &QueryFilters,
        continuation: Option<&str>,
    ) -> Result<ResourcePage, CloudError> {
        let query = build_query(filters);
        let mut body = serde_json::json!({
            "subscriptions": [subscription_id],
            "query": query,
            "options": {"resultFormat": "objectArray"}
        });
        if let Some(token) = continuation {
            body["options"]["$skipToken"] = serde_json::json!(token);
        }

        let path = format!(
            "/providers/Microsoft.ResourceGraph/resources?api-version={}",
            RESOURCE_GRAPH_API_VERSION
        );
        let response = self
            .send(
                Service::ResourceGraph,
                Method::POST,
                &path,
                subscription_id,
                Some(&body),
            )
            .await?;
        let graph: GraphResponse = response
            .json()
            .await
            .map_err(|e| CloudError::new(CloudErrorKind::Unknown, "BadResponse", e.to_string()))?;
        debug!(
            count = graph.data.len(),
            has_more = graph.skip_token.is_some(),
            "Resource graph page"
        );
        Ok(ResourcePage {
            resources: graph.data,
            continuation: graph.skip_token,
        })
    }

    async fn get_api_version(
        &self,
        subscription_id: &str,
        provider: &str,
        resource_type: &str,
        location: &str,
    ) -> Result<Option<String>, CloudError> {
        let metadata = self.provider_metadata(subscription_id, provider).await?;
        Ok(choose_api_version(&metadata, resource_type, location))
    }

    async fn ensure_resource_group(
        &self,
        subscription_id: &str,
        name: &str,
        location: &str,
    ) -> Result<(), CloudError> {
        let path = format!(
            "/subscriptions/{}/resourceGroups/{}?api-version={}",
            subscription_id, name, ARM_API_VERSION
        );
        let body = serde_json::json!({"location": location});
        self.send(Service::Arm, Method::PUT, &path, subscription_id, Some(&body))
            .await?;
        Ok(())
    }

    async fn validate_deployment(
        &self,
        subscription_id: &str,
        resource_group: &str,
        name: &str,
        request: &DeploymentRequest,
    ) -> Result<ValidationOutcome, CloudError> {
        let path = format!(
            "{}/validate?api-version={}",
            Self::deployment_path(subscription_id, resource_group, name),
            ARM_API_VERSION
        );
        let body = Self::deployment_body(request);
        match self
            .send(Service::Arm, Method::POST, &path, subscription_id, Some(&body))
            .await
        {
            Ok(response) => {
                let raw: serde_json::Value = response.json().await.map_err(|e| {
                    CloudError::new(CloudErrorKind::Unknown, "BadResponse", e.to_string())
                })?;
                Ok(ValidationOutcome {
                    is_valid: true,
                    errors: Vec::new(),
                    raw,
                })
            }
            // A rejected template is a validation outcome, not a client
            // failure.
            Err(error) if error.kind == CloudErrorKind::Validation => {
                let raw = serde_json::to_value(&error).unwrap_or_default();
                Ok(ValidationOutcome {
                    is_valid: false,
                    errors: error.details,
                    raw,
                })
            }
            Err(error) => Err(error),
        }
    }

    async fn submit_deployment(
        &self,
        subscription_id: &str,
        resource_group: &str,
        name: &str,
        request: &DeploymentRequest,
    ) -> Result<DeploymentHandle, CloudError> {
        let path = format!(
            "{}?api-version={}",
            Self::deployment_path(subscription_id, resource_group, name),
            ARM_API_VERSION
        );
        let body = Self::deployment_body(request);
        let response = self
            .send(Service::Arm, Method::PUT, &path, subscription_id, Some(&body))
            .await?;
        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CloudError::new(CloudErrorKind::Unknown, "BadResponse", e.to_string()))?;
        let deployment_id = raw
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or(name)
            .to_string();
        let correlation_id = raw
            .pointer("/properties/correlationId")
            .and_then(|v| v.as_str())
            .map(String::from);
        Ok(DeploymentHandle {
            deployment_id,
            correlation_id,
        })
    }

    async fn get_deployment(
        &self,
        subscription_id: &str,
        resource_group: &str,
        name: &str,
    ) -> Result<DeploymentSnapshot, CloudError> {
        let path = format!(
            "{}?api-version={}",
            Self::deployment_path(subscription_id, resource_group, name),
            ARM_API_VERSION
        );
        let response = self
            .send(Service::Arm, Method::GET, &path, subscription_id, None)
            .await?;
        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CloudError::new(CloudErrorKind::Unknown, "BadResponse", e.to_string()))?;

        let state = raw
            .pointer("/properties/provisioningState")
            .and_then(|v| v.as_str())
            .map(ProvisioningState::from_arm)
            .unwrap_or(ProvisioningState::NotStarted);
        let outputs = raw
            .pointer("/properties/outputs")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let errors = raw
            .pointer("/properties/error")
            .and_then(|v| serde_json::from_value::<CloudErrorBody>(v.clone()).ok())
            .map(|body| body.leaves().into_iter().cloned().collect())
            .unwrap_or_default();

        Ok(DeploymentSnapshot {
            state,
            outputs,
            errors,
            raw,
        })
    }

    async fn cancel_deployment(
        &self,
        subscription_id: &str,
        resource_group: &str,
        name: &str,
    ) -> Result<bool, CloudError> {
        let path = format!(
            "{}/cancel?api-version={}",
            Self::deployment_path(subscription_id, resource_group, name),
            ARM_API_VERSION
        );
        match self
            .send(Service::Arm, Method::POST, &path, subscription_id, None)
            .await
        {
            Ok(_) => Ok(true),
            // Cancel is best-effort: a deployment already terminal (or gone)
            // just reports false.
            Err(error)
                if matches!(
                    error.kind,
                    CloudErrorKind::NotFound | CloudErrorKind::Validation | CloudErrorKind::Unknown
                ) =>
            {
                warn!(deployment = name, code = %error.code, "Cloud-side cancel rejected");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }
}

/// Build the resource-graph query for a filter set. Group filters ending in
/// `*` match by prefix; type filters are exact.
fn build_query(filters: &QueryFilters) -> String {
    let mut predicates = Vec::new();

    if !filters.resource_groups.is_empty() {
        let clauses: Vec<String> = filters
            .resource_groups
            .iter()
            .map(|rg| {
                if let Some(prefix) = rg.strip_suffix('*') {
                    format!("resourceGroup startswith '{}'", escape_kql(prefix))
                } else {
                    format!("resourceGroup =~ '{}'", escape_kql(rg))
                }
            })
            .collect();
        predicates.push(format!("({})", clauses.join(" or ")));
    }

    if !filters.resource_types.is_empty() {
        let clauses: Vec<String> = filters
            .resource_types
            .iter()
            .map(|t| format!("type =~ '{}'", escape_kql(t)))
            .collect();
        predicates.push(format!("({})", clauses.join(" or ")));
    }

    let mut query = String::from("Resources");
    if !predicates.is_empty() {
        query.push_str(" | where ");
        query.push_str(&predicates.join(" and "));
    }
    query.push_str(
        " | project id, name, type, resourceGroup, subscriptionId, location, kind, sku, identity, plan, properties, tags",
    );
    query.push_str(&format!(" | limit {}", GRAPH_PAGE_SIZE));
    query
}

fn escape_kql(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Pick the API version for a resource type in a region. `None` when the
/// provider does not offer the type there.
fn choose_api_version(
    metadata: &ProviderMetadata,
    resource_type: &str,
    location: &str,
) -> Option<String> {
    let entry = metadata
        .resource_types
        .iter()
        .find(|t| t.resource_type.eq_ignore_ascii_case(resource_type))?;

    // An empty location list means the type is region-less (global).
    if !entry.locations.is_empty() {
        let wanted = normalize_location(location);
        if !entry
            .locations
            .iter()
            .any(|l| normalize_location(l) == wanted)
        {
            return None;
        }
    }

    entry
        .api_versions
        .iter()
        .find(|v| !v.to_ascii_lowercase().contains("preview"))
        .or_else(|| entry.api_versions.first())
        .cloned()
}

fn normalize_location(location: &str) -> String {
    location.to_ascii_lowercase().replace(' ', "")
}

async fn error_from_response(response: reqwest::Response) -> CloudError {
    let status = response.status();
    let kind = classify_status(status);
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorEnvelope>(&text) {
        Ok(envelope) => CloudError::from_body(kind, &envelope.error),
        Err(_) => CloudError::new(
            kind,
            status.canonical_reason().unwrap_or("HttpError"),
            if text.is_empty() {
                status.to_string()
            } else {
                text
            },
        ),
    }
}

fn classify_status(status: StatusCode) -> CloudErrorKind {
    match status {
        StatusCode::TOO_MANY_REQUESTS => CloudErrorKind::Transient,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudErrorKind::Auth,
        StatusCode::NOT_FOUND => CloudErrorKind::NotFound,
        StatusCode::BAD_REQUEST => CloudErrorKind::Validation,
        s if s.is_server_error() => CloudErrorKind::Transient,
        _ => CloudErrorKind::Unknown,
    }
}

fn transport_error(err: reqwest::Error) -> CloudError {
    if err.is_timeout() || err.is_connect() {
        CloudError::transient(err.to_string())
    } else {
        CloudError::new(CloudErrorKind::Unknown, "Transport", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_without_filters_scans_everything() {
        let query = build_query(&QueryFilters::default());
        assert!(query.starts_with("Resources | project id, name, type"));
        assert!(query.ends_with("| limit 1000"));
        assert!(!query.contains("where"));
    }

    #[test]
    fn query_with_filters_builds_predicates() {
        let filters = QueryFilters {
            resource_groups: vec!["rg-prod".into(), "rg-shared*".into()],
            resource_types: vec!["Microsoft.Compute/virtualMachines".into()],
        };
        let query = build_query(&filters);
        assert!(query.contains("resourceGroup =~ 'rg-prod'"));
        assert!(query.contains("resourceGroup startswith 'rg-shared'"));
        assert!(query.contains("type =~ 'Microsoft.Compute/virtualMachines'"));
        assert!(query.contains(") and ("));
    }

    #[test]
    fn kql_values_are_escaped() {
        let filters = QueryFilters {
            resource_groups: vec!["it's".into()],
            resource_types: vec![],
        };
        assert!(build_query(&filters).contains(r"resourceGroup =~ 'it\'s'"));
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            CloudErrorKind::Transient
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            CloudErrorKind::Transient
        );
        assert_eq!(classify_status(StatusCode::FORBIDDEN), CloudErrorKind::Auth);
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            CloudErrorKind::NotFound
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            CloudErrorKind::Validation
        );
        assert_eq!(
            classify_status(StatusCode::CONFLICT),
            CloudErrorKind::Unknown
        );
    }

    fn metadata(locations: Vec<&str>, versions: Vec<&str>) -> ProviderMetadata {
        ProviderMetadata {
            resource_types: vec![ProviderResourceType {
                resource_type: "virtualMachines".into(),
                api_versions: versions.into_iter().map(String::from).collect(),
                locations: locations.into_iter().map(String::from).collect(),
            }],
        }
    }

    #[test]
    fn api_version_skips_previews() {
        let metadata = metadata(
            vec!["East US", "West Europe"],
            vec!["2024-01-01-preview", "2023-09-01", "2023-03-01"],
        );
        assert_eq!(
            choose_api_version(&metadata, "virtualMachines", "eastus"),
            Some("2023-09-01".to_string())
        );
    }

    #[test]
    fn api_version_none_for_unsupported_region() {
        let metadata = metadata(vec!["East US"], vec!["2023-09-01"]);
        assert_eq!(
            choose_api_version(&metadata, "virtualMachines", "japaneast"),
            None
        );
        // Unknown type is also unsupported.
        assert_eq!(choose_api_version(&metadata, "disks", "eastus"), None);
    }

    #[test]
    fn api_version_falls_back_to_preview_when_nothing_else() {
        let metadata = metadata(vec![], vec!["2024-01-01-preview"]);
        assert_eq!(
            choose_api_version(&metadata, "virtualMachines", "anywhere"),
            Some("2024-01-01-preview".to_string())
        );
    }

    #[test]
    fn error_envelope_parses_nested_details() {
        let body = r#"{
            "error": {
                "code": "InvalidTemplateDeployment",
                "message": "Validation failed.",
                "details": [
                    {"code": "InvalidParameter", "message": "bad sku", "target": "sku.name"}
                ]
            }
        }"#;
        let envelope: ErrorEnvelope = serde_json::from_str(body).unwrap();
        let error = CloudError::from_body(CloudErrorKind::Validation, &envelope.error);
        assert_eq!(error.code, "InvalidTemplateDeployment");
        assert_eq!(error.details.len(), 1);
        assert_eq!(error.details[0].target.as_deref(), Some("sku.name"));
    }
}
