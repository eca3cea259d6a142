//! Source adapter contract + provider adapters (Remotive, RemoteOK, Google Jobs via SerpApi).

use std::sync::Arc;

use async_trait::async_trait;
use jobscout_core::{
    truncate_chars, Category, Credential, Modality, NormalizedListing, SourceId,
    MAX_DESCRIPTION_CHARS,
};
use jobscout_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const REMOTIVE_BASE_URL: &str = "https://remotive.com";
pub const REMOTEOK_BASE_URL: &str = "https://remoteok.com";
pub const SERPAPI_BASE_URL: &str = "https://serpapi.com";

/// Tags that mark a RemoteOK posting as software/engineering work.
pub const REMOTEOK_DEV_TAGS: &[&str] = &[
    "developer",
    "software",
    "engineer",
    "engineering",
    "frontend",
    "backend",
    "fullstack",
    "full-stack",
    "devops",
    "sre",
    "mobile",
    "ios",
    "android",
    "react",
    "node",
    "python",
    "java",
    "typescript",
    "javascript",
    "data",
    "dev",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceAccess {
    Open,
    CredentialGated,
}

/// Parameters for one adapter call.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub run_id: Uuid,
    pub category: Option<&'static Category>,
    /// Caller-supplied credential; adapters fall back to their process default.
    pub credential: Option<Credential>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedRequest {
    Get {
        url: String,
        query: Vec<(String, String)>,
    },
    Skip(&'static str),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("provider reported error: {0}")]
    Provider(String),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> SourceId;
    fn access(&self) -> SourceAccess;

    /// Whether the provider is queried once per category.
    fn accepts_category(&self) -> bool {
        true
    }

    /// Builds the provider request, or explains why none should be made.
    fn prepare(&self, req: &FetchRequest) -> PreparedRequest;

    fn parse(&self, body: &[u8], req: &FetchRequest) -> Result<Vec<NormalizedListing>, AdapterError>;

    async fn try_fetch(
        &self,
        http: &HttpFetcher,
        req: &FetchRequest,
    ) -> Result<Vec<NormalizedListing>, AdapterError> {
        let (url, query) = match self.prepare(req) {
            PreparedRequest::Get { url, query } => (url, query),
            PreparedRequest::Skip(reason) => {
                debug!(source = %self.source_id(), reason, "skipping source call");
                return Ok(Vec::new());
            }
        };
        let pairs = query
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect::<Vec<_>>();
        let resp = http
            .fetch_bytes(req.run_id, self.source_id().as_str(), &url, &pairs)
            .await?;
        self.parse(&resp.body, req)
    }

    /// Never fails: any error is logged and yields zero listings.
    async fn fetch(&self, http: &HttpFetcher, req: &FetchRequest) -> Vec<NormalizedListing> {
        match self.try_fetch(http, req).await {
            Ok(listings) => listings,
            Err(err) => {
                let category = req.category.map(|c| c.slug).unwrap_or("-");
                let credential = req
                    .credential
                    .as_ref()
                    .map(Credential::fingerprint)
                    .unwrap_or_else(|| "-".to_string());
                warn!(
                    run_id = %req.run_id,
                    source = %self.source_id(),
                    category,
                    credential = %credential,
                    error = %err,
                    "source fetch failed; contributing zero listings"
                );
                Vec::new()
            }
        }
    }
}

fn text_or_none(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn description_or_none(value: Option<&str>) -> Option<String> {
    value
        .filter(|s| !s.trim().is_empty())
        .map(|s| truncate_chars(s, MAX_DESCRIPTION_CHARS).to_string())
}

/// Renders a provider id that may arrive as a JSON string or number.
fn json_id(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => text_or_none(Some(s.as_str())),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn base(url: &str) -> &str {
    url.trim_end_matches('/')
}

// Remotive

#[derive(Debug, Clone)]
pub struct RemotiveAdapter {
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct RemotiveResponse {
    #[serde(default)]
    jobs: Vec<RemotiveJob>,
}

#[derive(Debug, Deserialize)]
struct RemotiveJob {
    id: Option<JsonValue>,
    url: Option<String>,
    title: Option<String>,
    company_name: Option<String>,
    description: Option<String>,
}

impl RemotiveAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for RemotiveAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::Remotive
    }

    fn access(&self) -> SourceAccess {
        SourceAccess::Open
    }

    fn prepare(&self, req: &FetchRequest) -> PreparedRequest {
        let category = req.category.unwrap_or_else(jobscout_core::default_category);
        PreparedRequest::Get {
            url: format!("{}/api/remote-jobs", base(&self.base_url)),
            query: vec![
                ("category".to_string(), category.slug.to_string()),
                ("limit".to_string(), req.limit.to_string()),
            ],
        }
    }

    fn parse(&self, body: &[u8], req: &FetchRequest) -> Result<Vec<NormalizedListing>, AdapterError> {
        let payload: RemotiveResponse = serde_json::from_slice(body)?;
        let category = req.category.unwrap_or_else(jobscout_core::default_category);
        Ok(payload
            .jobs
            .into_iter()
            .filter_map(|job| {
                let company = text_or_none(job.company_name.as_deref())?;
                let role = text_or_none(job.title.as_deref())?;
                let mut listing = NormalizedListing::new(SourceId::Remotive.label(), company, role);
                listing.offer_link = text_or_none(job.url.as_deref());
                listing.category = Some(category.slug.to_string());
                listing.modality = Some(Modality::Remote.as_str().to_string());
                listing.description = description_or_none(job.description.as_deref());
                listing.external_id = json_id(job.id.as_ref());
                Some(listing)
            })
            .take(req.limit)
            .collect())
    }
}

// RemoteOK

#[derive(Debug, Clone)]
pub struct RemoteOkAdapter {
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct RemoteOkJob {
    id: Option<JsonValue>,
    slug: Option<String>,
    company: Option<String>,
    position: Option<String>,
    #[serde(default)]
    tags: Vec<JsonValue>,
    description: Option<String>,
    apply_url: Option<String>,
    url: Option<String>,
}

impl RemoteOkAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn is_dev_posting(job: &RemoteOkJob) -> bool {
        job.tags
            .iter()
            .filter_map(JsonValue::as_str)
            .any(|tag| REMOTEOK_DEV_TAGS.contains(&tag.to_lowercase().as_str()))
    }
}

#[async_trait]
impl SourceAdapter for RemoteOkAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::RemoteOk
    }

    fn access(&self) -> SourceAccess {
        SourceAccess::Open
    }

    fn accepts_category(&self) -> bool {
        false
    }

    fn prepare(&self, _req: &FetchRequest) -> PreparedRequest {
        PreparedRequest::Get {
            url: format!("{}/api", base(&self.base_url)),
            query: Vec::new(),
        }
    }

    fn parse(&self, body: &[u8], req: &FetchRequest) -> Result<Vec<NormalizedListing>, AdapterError> {
        let items: Vec<JsonValue> = serde_json::from_slice(body)?;
        Ok(items
            .into_iter()
            // The feed opens with a legal notice and may carry other non-posting entries.
            .filter_map(|item| serde_json::from_value::<RemoteOkJob>(item).ok())
            .filter(|job| job.position.is_some() && Self::is_dev_posting(job))
            .filter_map(|job| {
                let company = text_or_none(job.company.as_deref())?;
                let role = text_or_none(job.position.as_deref())?;
                let mut listing = NormalizedListing::new(SourceId::RemoteOk.label(), company, role);
                listing.offer_link =
                    text_or_none(job.apply_url.as_deref()).or_else(|| text_or_none(job.url.as_deref()));
                listing.category = Some(jobscout_core::DEFAULT_CATEGORY_SLUG.to_string());
                listing.modality = Some(Modality::Remote.as_str().to_string());
                listing.description = description_or_none(job.description.as_deref());
                listing.external_id =
                    json_id(job.id.as_ref()).or_else(|| text_or_none(job.slug.as_deref()));
                Some(listing)
            })
            .take(req.limit)
            .collect())
    }
}

// Google Jobs (SerpApi)

#[derive(Debug, Clone)]
pub struct GoogleJobsAdapter {
    base_url: String,
    default_credential: Option<Credential>,
}

#[derive(Debug, Deserialize)]
struct SerpApiResponse {
    error: Option<String>,
    jobs_results: Option<SerpApiJobsResults>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SerpApiJobsResults {
    List(Vec<SerpApiJob>),
    Nested {
        #[serde(default)]
        jobs: Vec<SerpApiJob>,
    },
}

#[derive(Debug, Deserialize)]
struct SerpApiJob {
    title: Option<String>,
    company_name: Option<String>,
    via: Option<String>,
    link: Option<String>,
    job_id: Option<String>,
    description: Option<String>,
    detected_extensions: Option<SerpApiExtensions>,
    #[serde(default)]
    apply_options: Vec<SerpApiApplyOption>,
}

#[derive(Debug, Deserialize)]
struct SerpApiExtensions {
    schedule_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SerpApiApplyOption {
    link: Option<String>,
}

impl GoogleJobsAdapter {
    pub fn new(base_url: impl Into<String>, default_credential: Option<Credential>) -> Self {
        Self {
            base_url: base_url.into(),
            default_credential,
        }
    }
}

#[async_trait]
impl SourceAdapter for GoogleJobsAdapter {
    fn source_id(&self) -> SourceId {
        SourceId::GoogleJobs
    }

    fn access(&self) -> SourceAccess {
        SourceAccess::CredentialGated
    }

    fn prepare(&self, req: &FetchRequest) -> PreparedRequest {
        let Some(credential) = req.credential.as_ref().or(self.default_credential.as_ref()) else {
            return PreparedRequest::Skip("no credential configured");
        };
        let category = req.category.unwrap_or_else(jobscout_core::default_category);
        PreparedRequest::Get {
            url: format!("{}/search", base(&self.base_url)),
            query: vec![
                ("engine".to_string(), "google_jobs".to_string()),
                ("q".to_string(), category.search_query.to_string()),
                ("location".to_string(), "United States".to_string()),
                ("api_key".to_string(), credential.expose().to_string()),
                ("gl".to_string(), "us".to_string()),
                ("hl".to_string(), "en".to_string()),
            ],
        }
    }

    fn parse(&self, body: &[u8], req: &FetchRequest) -> Result<Vec<NormalizedListing>, AdapterError> {
        let payload: SerpApiResponse = serde_json::from_slice(body)?;
        if let Some(error) = payload.error {
            return Err(AdapterError::Provider(error));
        }
        let jobs = match payload.jobs_results {
            Some(SerpApiJobsResults::List(jobs)) => jobs,
            Some(SerpApiJobsResults::Nested { jobs }) => jobs,
            None => Vec::new(),
        };
        let category = req.category.map(|c| c.slug.to_string());

        Ok(jobs
            .into_iter()
            .filter_map(|job| {
                let company = text_or_none(job.company_name.as_deref())?;
                let role = text_or_none(job.title.as_deref())?;
                let source = text_or_none(job.via.as_deref())
                    .unwrap_or_else(|| SourceId::GoogleJobs.label().to_string());
                let mut listing = NormalizedListing::new(source, company, role);
                listing.offer_link = text_or_none(job.link.as_deref()).or_else(|| {
                    job.apply_options
                        .iter()
                        .find_map(|o| text_or_none(o.link.as_deref()))
                });
                listing.category = category.clone();
                listing.modality = job
                    .detected_extensions
                    .as_ref()
                    .and_then(|e| e.schedule_type.as_deref())
                    .and_then(Modality::from_schedule_type)
                    .map(|m| m.as_str().to_string());
                listing.description = description_or_none(job.description.as_deref());
                listing.external_id = text_or_none(job.job_id.as_deref());
                Some(listing)
            })
            .take(req.limit)
            .collect())
    }
}

/// Builds the adapter for `source_id`, optionally against a non-default base URL.
pub fn adapter_for_source(
    source_id: SourceId,
    base_url: Option<&str>,
    default_credential: Option<Credential>,
) -> Arc<dyn SourceAdapter> {
    match source_id {
        SourceId::Remotive => Arc::new(RemotiveAdapter::new(base_url.unwrap_or(REMOTIVE_BASE_URL))),
        SourceId::RemoteOk => Arc::new(RemoteOkAdapter::new(base_url.unwrap_or(REMOTEOK_BASE_URL))),
        SourceId::GoogleJobs => Arc::new(GoogleJobsAdapter::new(
            base_url.unwrap_or(SERPAPI_BASE_URL),
            default_credential,
        )),
    }
}
