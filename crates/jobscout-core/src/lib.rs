//! Core listing model, identity keys and category taxonomy for the aggregation pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const MAX_COMPANY_CHARS: usize = 200;
pub const MAX_ROLE_CHARS: usize = 200;
pub const MAX_SOURCE_CHARS: usize = 50;
pub const MAX_CATEGORY_CHARS: usize = 50;
pub const MAX_LINK_CHARS: usize = 2048;
pub const MAX_SENIORITY_CHARS: usize = 100;
pub const MAX_MODALITY_CHARS: usize = 50;
pub const MAX_DESCRIPTION_CHARS: usize = 5000;

/// External job-listing providers known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceId {
    Remotive,
    #[serde(rename = "remoteok")]
    RemoteOk,
    GoogleJobs,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [SourceId::Remotive, SourceId::RemoteOk, SourceId::GoogleJobs];

    /// Registry / config key.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Remotive => "remotive",
            SourceId::RemoteOk => "remoteok",
            SourceId::GoogleJobs => "google-jobs",
        }
    }

    /// Tag written into `NormalizedListing::source` when the provider has no upstream attribution.
    pub fn label(&self) -> &'static str {
        match self {
            SourceId::Remotive => "Remotive",
            SourceId::RemoteOk => "RemoteOK",
            SourceId::GoogleJobs => "Google Jobs",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(input.trim()))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Remote,
    Onsite,
    Hybrid,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Remote => "remote",
            Modality::Onsite => "onsite",
            Modality::Hybrid => "hybrid",
        }
    }

    /// Maps a free-form schedule-type string onto the modality vocabulary by substring.
    ///
    /// Checked in order remote, onsite ("full"/"part" time), hybrid; anything else is unknown.
    pub fn from_schedule_type(schedule_type: &str) -> Option<Self> {
        let s = schedule_type.to_lowercase();
        if s.contains("remote") || s.contains("remoto") {
            Some(Modality::Remote)
        } else if s.contains("full") || s.contains("part") {
            Some(Modality::Onsite)
        } else if s.contains("hybrid") || s.contains("híbrido") || s.contains("hibrido") {
            Some(Modality::Hybrid)
        } else {
            None
        }
    }
}

/// One entry of the fixed job-category taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Category {
    pub slug: &'static str,
    pub label: &'static str,
    pub search_query: &'static str,
}

pub const JOB_CATEGORIES: &[Category] = &[
    Category { slug: "software-development", label: "Software Development", search_query: "software developer" },
    Category { slug: "marketing", label: "Marketing", search_query: "marketing manager" },
    Category { slug: "design", label: "Design", search_query: "product designer" },
    Category { slug: "customer-service", label: "Customer Service", search_query: "customer support" },
    Category { slug: "sales-business", label: "Sales / Business", search_query: "sales representative" },
    Category { slug: "product", label: "Product", search_query: "product manager" },
    Category { slug: "project-management", label: "Project Management", search_query: "project manager" },
    Category { slug: "ai-ml", label: "AI / ML", search_query: "machine learning engineer" },
    Category { slug: "data", label: "Data Analysis", search_query: "data analyst" },
    Category { slug: "devops", label: "DevOps / Sysadmin", search_query: "devops engineer" },
    Category { slug: "finance", label: "Finance", search_query: "financial analyst" },
    Category { slug: "human-resources", label: "Human Resources", search_query: "hr manager" },
    Category { slug: "qa", label: "QA", search_query: "qa engineer" },
    Category { slug: "writing", label: "Writing", search_query: "content writer" },
    Category { slug: "legal", label: "Legal", search_query: "legal counsel" },
    Category { slug: "medical", label: "Medical", search_query: "medical" },
    Category { slug: "education", label: "Education", search_query: "education" },
    Category { slug: "all-others", label: "All others", search_query: "remote jobs" },
];

pub const DEFAULT_CATEGORY_SLUG: &str = "software-development";

pub fn find_category(slug: &str) -> Option<&'static Category> {
    JOB_CATEGORIES.iter().find(|c| c.slug == slug)
}

pub fn default_category() -> &'static Category {
    &JOB_CATEGORIES[0]
}

/// Valid slugs from a stored category preference (a JSON array of slugs), in order.
/// Unknown slugs are dropped and duplicates collapsed; may be empty.
pub fn chosen_categories(raw: Option<&str>) -> Vec<&'static Category> {
    let parsed = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok());

    let mut out: Vec<&'static Category> = Vec::new();
    if let Some(serde_json::Value::Array(items)) = parsed {
        for item in items {
            if let Some(category) = item.as_str().and_then(find_category) {
                if !out.contains(&category) {
                    out.push(category);
                }
            }
        }
    }
    out
}

/// Like [`chosen_categories`], falling back to the default category when nothing valid was chosen.
pub fn parse_user_categories(raw: Option<&str>) -> Vec<&'static Category> {
    let mut out = chosen_categories(raw);
    if out.is_empty() {
        out.push(default_category());
    }
    out
}

/// Decrypted provider credential. Never printed or serialized in plaintext.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Short stable digest, safe for logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..4])
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.fingerprint())
    }
}

/// Provider-independent handoff contract from adapters into dedup and persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub company: String,
    pub role: String,
    pub offer_link: Option<String>,
    pub source: String,
    pub category: Option<String>,
    pub external_id: Option<String>,
    pub seniority: Option<String>,
    pub modality: Option<String>,
    pub description: Option<String>,
}

impl NormalizedListing {
    pub fn new(source: impl Into<String>, company: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            company: company.into(),
            role: role.into(),
            offer_link: None,
            source: source.into(),
            category: None,
            external_id: None,
            seniority: None,
            modality: None,
            description: None,
        }
    }

    pub fn identity_key(&self) -> ListingKey {
        match self
            .external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            Some(external_id) => ListingKey::External {
                source: self.source.clone(),
                external_id: external_id.to_string(),
            },
            None => ListingKey::Loose {
                source: self.source.clone(),
                anchor: self
                    .offer_link
                    .clone()
                    .unwrap_or_else(|| self.company.clone()),
                role: self.role.clone(),
            },
        }
    }

    /// Trims and length-caps every field. `None` when company, role or source ends up empty.
    pub fn validated(&self) -> Option<ValidatedListing> {
        let company = capped(&self.company, MAX_COMPANY_CHARS);
        let role = capped(&self.role, MAX_ROLE_CHARS);
        let source = capped(&self.source, MAX_SOURCE_CHARS);
        if company.is_empty() || role.is_empty() || source.is_empty() {
            return None;
        }
        Some(ValidatedListing {
            company,
            role,
            source,
            offer_link: capped_opt(self.offer_link.as_deref(), MAX_LINK_CHARS),
            category: capped_opt(self.category.as_deref(), MAX_CATEGORY_CHARS),
            external_id: self
                .external_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(ToString::to_string),
            seniority: capped_opt(self.seniority.as_deref(), MAX_SENIORITY_CHARS),
            modality: capped_opt(self.modality.as_deref(), MAX_MODALITY_CHARS),
            description: capped_opt(self.description.as_deref(), MAX_DESCRIPTION_CHARS),
        })
    }
}

/// Identity of a listing within one batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListingKey {
    External { source: String, external_id: String },
    Loose { source: String, anchor: String, role: String },
}

/// A listing that passed validation and fits every column cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedListing {
    pub company: String,
    pub role: String,
    pub source: String,
    pub offer_link: Option<String>,
    pub category: Option<String>,
    pub external_id: Option<String>,
    pub seniority: Option<String>,
    pub modality: Option<String>,
    pub description: Option<String>,
}

/// Persisted listing. `owner_id == None` means globally visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredListing {
    pub id: Uuid,
    pub owner_id: Option<String>,
    pub source: String,
    pub external_id: Option<String>,
    pub category: Option<String>,
    pub company: String,
    pub role: String,
    pub offer_link: Option<String>,
    pub seniority: Option<String>,
    pub modality: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredListing {
    pub fn from_validated(listing: &ValidatedListing, owner_id: Option<&str>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.map(ToString::to_string),
            source: listing.source.clone(),
            external_id: listing.external_id.clone(),
            category: listing.category.clone(),
            company: listing.company.clone(),
            role: listing.role.clone(),
            offer_link: listing.offer_link.clone(),
            seniority: listing.seniority.clone(),
            modality: listing.modality.clone(),
            description: listing.description.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Refreshes the descriptive fields from a newer scrape. Identity fields and
    /// `created_at` never change; an absent link keeps the stored one.
    pub fn refresh_from(&mut self, listing: &ValidatedListing, now: DateTime<Utc>) {
        self.company = listing.company.clone();
        self.role = listing.role.clone();
        if listing.offer_link.is_some() {
            self.offer_link = listing.offer_link.clone();
        }
        self.seniority = listing.seniority.clone();
        self.modality = listing.modality.clone();
        self.description = listing.description.clone();
        self.updated_at = now;
    }
}

/// Trims and truncates to at most `max_chars` characters without splitting one.
pub fn truncate_chars(input: &str, max_chars: usize) -> &str {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => &input[..idx],
        None => input,
    }
}

fn capped(input: &str, max_chars: usize) -> String {
    truncate_chars(input.trim(), max_chars).trim_end().to_string()
}

fn capped_opt(input: Option<&str>, max_chars: usize) -> Option<String> {
    input
        .map(|s| capped(s, max_chars))
        .filter(|s| !s.is_empty())
}
