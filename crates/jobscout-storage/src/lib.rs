//! HTTP fetch utilities and listing/user persistence for the aggregation pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use jobscout_core::{Credential, StoredListing, ValidatedListing};
use reqwest::StatusCode;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    /// Overrides `per_source_concurrency` for individual sources.
    pub per_source_limits: HashMap<String, usize>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            per_source_limits: HashMap::new(),
        }
    }
}

/// Single-attempt HTTP client shared by every adapter in a run.
///
/// Concurrency is bounded globally and per source so that category fan-out never
/// exceeds a provider's budget.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_default: usize,
    per_source_limits: HashMap<String, usize>,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport failure. The URL is stripped so query-string credentials never reach logs.
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("concurrency limiter closed")]
    LimiterClosed,
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Request(err.without_url())
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_default: config.per_source_concurrency.max(1),
            per_source_limits: config.per_source_limits,
            per_source: Mutex::new(HashMap::new()),
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let limit = self
            .per_source_limits
            .get(source_id)
            .copied()
            .unwrap_or(self.per_source_default)
            .max(1);
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone()
    }

    /// Issues one GET. `url` must not carry secrets; pass them through `query`.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = tracing::info_span!("http_fetch", %run_id, source_id, url);
        async {
            let _global = self
                .global_limit
                .acquire()
                .await
                .map_err(|_| FetchError::LimiterClosed)?;
            let per_source = self.per_source_semaphore(source_id).await;
            let _source = per_source
                .acquire()
                .await
                .map_err(|_| FetchError::LimiterClosed)?;

            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok::<_, FetchError>(FetchedResponse { status, body })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("no credential stored for user {0}")]
    MissingCredential(String),
    #[error("credential for user {user_id} could not be decrypted: {reason}")]
    Decrypt { user_id: String, reason: String },
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Storage seam for the reconcile engine. Every lookup is scoped by owner:
/// `None` matches only global rows.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Atomic insert-or-refresh on `(source, external_id, owner_id)`.
    /// Callers guarantee `listing.external_id` is set.
    async fn upsert_by_external_id(
        &self,
        listing: &ValidatedListing,
        owner_id: Option<&str>,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn find_by_offer_link(
        &self,
        source: &str,
        offer_link: &str,
        owner_id: Option<&str>,
    ) -> Result<Option<StoredListing>, StoreError>;

    /// Case-insensitive on company and role.
    async fn find_by_company_role(
        &self,
        source: &str,
        company: &str,
        role: &str,
        owner_id: Option<&str>,
    ) -> Result<Option<StoredListing>, StoreError>;

    async fn insert(
        &self,
        listing: &ValidatedListing,
        owner_id: Option<&str>,
    ) -> Result<StoredListing, StoreError>;

    /// Refreshes descriptive fields of row `id`; a `None` link keeps the stored one.
    async fn refresh(&self, id: Uuid, listing: &ValidatedListing) -> Result<(), StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

/// A user's stored category preference, as raw JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCategoryPreference {
    pub user_id: String,
    pub categories_json: Option<String>,
}

/// Read-only view of user preferences and stored provider credentials.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn category_preferences(&self) -> Result<Vec<UserCategoryPreference>, StoreError>;

    /// Ids of users with a stored credential, in stable order.
    async fn users_with_credentials(&self) -> Result<Vec<String>, StoreError>;

    /// Decrypts one user's credential.
    async fn reveal_credential(&self, user_id: &str) -> Result<Credential, StoreError>;
}

const LISTING_COLUMNS: &str = "id, owner_id, source, external_id, category, company, role, offer_link, seniority, modality, description, created_at, updated_at";

pub async fn connect_pg(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn listing_from_row(row: &sqlx::postgres::PgRow) -> Result<StoredListing, sqlx::Error> {
    Ok(StoredListing {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        source: row.try_get("source")?,
        external_id: row.try_get("external_id")?,
        category: row.try_get("category")?,
        company: row.try_get("company")?,
        role: row.try_get("role")?,
        offer_link: row.try_get("offer_link")?,
        seniority: row.try_get("seniority")?,
        modality: row.try_get("modality")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn upsert_by_external_id(
        &self,
        listing: &ValidatedListing,
        owner_id: Option<&str>,
    ) -> Result<UpsertOutcome, StoreError> {
        if listing.external_id.is_none() {
            return Err(StoreError::Message(
                "upsert_by_external_id called without external_id".to_string(),
            ));
        }
        let row = sqlx::query(
            r#"
            INSERT INTO job_listings
                (id, owner_id, source, external_id, category, company, role,
                 offer_link, seniority, modality, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
            ON CONFLICT (source, external_id, (COALESCE(owner_id, '')))
                WHERE external_id IS NOT NULL
            DO UPDATE SET
                company = EXCLUDED.company,
                role = EXCLUDED.role,
                offer_link = COALESCE(EXCLUDED.offer_link, job_listings.offer_link),
                seniority = EXCLUDED.seniority,
                modality = EXCLUDED.modality,
                description = EXCLUDED.description,
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(&listing.source)
        .bind(&listing.external_id)
        .bind(&listing.category)
        .bind(&listing.company)
        .bind(&listing.role)
        .bind(&listing.offer_link)
        .bind(&listing.seniority)
        .bind(&listing.modality)
        .bind(&listing.description)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn find_by_offer_link(
        &self,
        source: &str,
        offer_link: &str,
        owner_id: Option<&str>,
    ) -> Result<Option<StoredListing>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {LISTING_COLUMNS}
              FROM job_listings
             WHERE source = $1
               AND offer_link = $2
               AND owner_id IS NOT DISTINCT FROM $3
             ORDER BY created_at
             LIMIT 1
            "#
        ))
        .bind(source)
        .bind(offer_link)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(listing_from_row).transpose()?)
    }

    async fn find_by_company_role(
        &self,
        source: &str,
        company: &str,
        role: &str,
        owner_id: Option<&str>,
    ) -> Result<Option<StoredListing>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {LISTING_COLUMNS}
              FROM job_listings
             WHERE source = $1
               AND LOWER(company) = LOWER($2)
               AND LOWER(role) = LOWER($3)
               AND owner_id IS NOT DISTINCT FROM $4
             ORDER BY created_at
             LIMIT 1
            "#
        ))
        .bind(source)
        .bind(company)
        .bind(role)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(listing_from_row).transpose()?)
    }

    async fn insert(
        &self,
        listing: &ValidatedListing,
        owner_id: Option<&str>,
    ) -> Result<StoredListing, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO job_listings
                (id, owner_id, source, external_id, category, company, role,
                 offer_link, seniority, modality, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
            RETURNING {LISTING_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(&listing.source)
        .bind(&listing.external_id)
        .bind(&listing.category)
        .bind(&listing.company)
        .bind(&listing.role)
        .bind(&listing.offer_link)
        .bind(&listing.seniority)
        .bind(&listing.modality)
        .bind(&listing.description)
        .fetch_one(&self.pool)
        .await?;
        Ok(listing_from_row(&row)?)
    }

    async fn refresh(&self, id: Uuid, listing: &ValidatedListing) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE job_listings
               SET company = $2,
                   role = $3,
                   offer_link = COALESCE($4, offer_link),
                   seniority = $5,
                   modality = $6,
                   description = $7,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&listing.company)
        .bind(&listing.role)
        .bind(&listing.offer_link)
        .bind(&listing.seniority)
        .bind(&listing.modality)
        .bind(&listing.description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

const CREDENTIAL_KEY_SALT: &[u8] = b"jobtracker-serpapi-key";
const CREDENTIAL_IV_LEN: usize = 16;
const CREDENTIAL_TAG_LEN: usize = 16;
const MIN_SECRET_CHARS: usize = 16;

type CredentialAead = AesGcm<Aes256, U16>;

/// Opens per-user provider keys as the web application stores them:
/// base64 of `iv (16) | tag (16) | ciphertext`, AES-256-GCM under a key
/// derived with scrypt (N = 2^14, r = 8, p = 1) from the application secret.
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher(..)")
    }
}

impl CredentialCipher {
    pub fn new(secret: &str) -> Result<Self, StoreError> {
        if secret.chars().count() < MIN_SECRET_CHARS {
            return Err(StoreError::Message(format!(
                "AUTH_SECRET must be at least {MIN_SECRET_CHARS} characters"
            )));
        }
        let params = scrypt::Params::new(14, 8, 1, 32)
            .map_err(|err| StoreError::Message(format!("scrypt parameters: {err}")))?;
        let mut key = [0u8; 32];
        scrypt::scrypt(secret.as_bytes(), CREDENTIAL_KEY_SALT, &params, &mut key)
            .map_err(|err| StoreError::Message(format!("deriving credential key: {err}")))?;
        Ok(Self { key })
    }

    pub fn open(&self, user_id: &str, encoded: &str) -> Result<Credential, StoreError> {
        let failed = |reason: &str| StoreError::Decrypt {
            user_id: user_id.to_string(),
            reason: reason.to_string(),
        };
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|_| failed("stored value is not base64"))?;
        if raw.len() < CREDENTIAL_IV_LEN + CREDENTIAL_TAG_LEN {
            return Err(failed("stored value is too short"));
        }
        let (iv, rest) = raw.split_at(CREDENTIAL_IV_LEN);
        let (tag, ciphertext) = rest.split_at(CREDENTIAL_TAG_LEN);

        let cipher = CredentialAead::new_from_slice(&self.key).map_err(|_| failed("invalid key length"))?;
        let mut plain = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(iv),
                b"",
                &mut plain,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| failed("authentication failed"))?;
        let plain = String::from_utf8(plain).map_err(|_| failed("plaintext is not UTF-8"))?;
        Credential::new(plain).ok_or_else(|| StoreError::MissingCredential(user_id.to_string()))
    }

    #[cfg(test)]
    fn seal(&self, iv: &[u8; CREDENTIAL_IV_LEN], plain: &str) -> String {
        let cipher = CredentialAead::new_from_slice(&self.key).unwrap();
        let mut ciphertext = plain.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(iv), b"", &mut ciphertext)
            .unwrap();
        let mut out = iv.to_vec();
        out.extend_from_slice(&tag);
        out.extend_from_slice(&ciphertext);
        BASE64.encode(out)
    }
}

/// Reads the application-owned `users` table. Each stored key is fetched and
/// opened on its own, so one bad value only affects its user.
#[derive(Debug, Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
    cipher: Option<CredentialCipher>,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool, cipher: Option<CredentialCipher>) -> Self {
        Self { pool, cipher }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn category_preferences(&self) -> Result<Vec<UserCategoryPreference>, StoreError> {
        let rows = sqlx::query("SELECT id, job_categories FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(UserCategoryPreference {
                    user_id: row.try_get("id")?,
                    categories_json: row.try_get("job_categories")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(Into::into)
    }

    async fn users_with_credentials(&self) -> Result<Vec<String>, StoreError> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM users WHERE serpapi_key_encrypted IS NOT NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn reveal_credential(&self, user_id: &str) -> Result<Credential, StoreError> {
        let Some(cipher) = self.cipher.as_ref() else {
            return Err(StoreError::Decrypt {
                user_id: user_id.to_string(),
                reason: "AUTH_SECRET is not configured".to_string(),
            });
        };
        let stored = sqlx::query_scalar::<_, Option<String>>(
            "SELECT serpapi_key_encrypted FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .flatten()
        .ok_or_else(|| StoreError::MissingCredential(user_id.to_string()))?;

        cipher.open(user_id, &stored)
    }
}

/// In-process store with the same matching rules as [`PgListingStore`].
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    rows: Mutex<Vec<StoredListing>>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<StoredListing> {
        self.rows.lock().await.clone()
    }
}

fn same_owner(row: &StoredListing, owner_id: Option<&str>) -> bool {
    row.owner_id.as_deref() == owner_id
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn upsert_by_external_id(
        &self,
        listing: &ValidatedListing,
        owner_id: Option<&str>,
    ) -> Result<UpsertOutcome, StoreError> {
        let Some(external_id) = listing.external_id.as_deref() else {
            return Err(StoreError::Message(
                "upsert_by_external_id called without external_id".to_string(),
            ));
        };
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.iter_mut().find(|r| {
            r.source == listing.source
                && r.external_id.as_deref() == Some(external_id)
                && same_owner(r, owner_id)
        }) {
            row.refresh_from(listing, now);
            return Ok(UpsertOutcome::Updated);
        }
        rows.push(StoredListing::from_validated(listing, owner_id, now));
        Ok(UpsertOutcome::Inserted)
    }

    async fn find_by_offer_link(
        &self,
        source: &str,
        offer_link: &str,
        owner_id: Option<&str>,
    ) -> Result<Option<StoredListing>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .find(|r| {
                r.source == source
                    && r.offer_link.as_deref() == Some(offer_link)
                    && same_owner(r, owner_id)
            })
            .cloned())
    }

    async fn find_by_company_role(
        &self,
        source: &str,
        company: &str,
        role: &str,
        owner_id: Option<&str>,
    ) -> Result<Option<StoredListing>, StoreError> {
        let company = company.to_lowercase();
        let role = role.to_lowercase();
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .find(|r| {
                r.source == source
                    && r.company.to_lowercase() == company
                    && r.role.to_lowercase() == role
                    && same_owner(r, owner_id)
            })
            .cloned())
    }

    async fn insert(
        &self,
        listing: &ValidatedListing,
        owner_id: Option<&str>,
    ) -> Result<StoredListing, StoreError> {
        let stored = StoredListing::from_validated(listing, owner_id, Utc::now());
        self.rows.lock().await.push(stored.clone());
        Ok(stored)
    }

    async fn refresh(&self, id: Uuid, listing: &ValidatedListing) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::Message(format!("listing {id} not found")))?;
        row.refresh_from(listing, Utc::now());
        Ok(())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.rows.lock().await.len() as u64)
    }
}

/// In-process user directory. A user mapped to `None` has a stored credential
/// that fails to decrypt.
#[derive(Debug, Default, Clone)]
pub struct MemoryUserDirectory {
    pub preferences: Vec<UserCategoryPreference>,
    pub credentials: Vec<(String, Option<String>)>,
}

impl MemoryUserDirectory {
    pub fn with_user(mut self, user_id: &str, categories_json: Option<&str>) -> Self {
        self.preferences.push(UserCategoryPreference {
            user_id: user_id.to_string(),
            categories_json: categories_json.map(ToString::to_string),
        });
        self
    }

    pub fn with_credential(mut self, user_id: &str, credential: Option<&str>) -> Self {
        self.credentials
            .push((user_id.to_string(), credential.map(ToString::to_string)));
        self
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn category_preferences(&self) -> Result<Vec<UserCategoryPreference>, StoreError> {
        Ok(self.preferences.clone())
    }

    async fn users_with_credentials(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.credentials.iter().map(|(id, _)| id.clone()).collect())
    }

    async fn reveal_credential(&self, user_id: &str) -> Result<Credential, StoreError> {
        match self.credentials.iter().find(|(id, _)| id == user_id) {
            Some((_, Some(raw))) => {
                Credential::new(raw).ok_or_else(|| StoreError::MissingCredential(user_id.to_string()))
            }
            Some((_, None)) => Err(StoreError::Decrypt {
                user_id: user_id.to_string(),
                reason: "authentication tag mismatch".to_string(),
            }),
            None => Err(StoreError::MissingCredential(user_id.to_string())),
        }
    }
}
