//! DocumentStore client for the remote ledger
//!
//! The ledger is an append-only collection API:
//! - `GET /all?collection-id=<id>` returns every document of a collection,
//!   either as a bare array or wrapped as `{"result": [...]}`
//! - `POST /` with `{"collectionId", "fields"}` appends one document and
//!   echoes it back (again bare or wrapped)
//!
//! This layer performs exactly one HTTP call per operation. It never retries;
//! retry policy belongs to the caller.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use types::document::{Fields, LedgerDocument};
use types::errors::LedgerError;
use types::ids::{CollectionId, DocumentId};

/// Read/append access to ledger collections.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch every document of a collection. Order is not meaningful.
    async fn fetch_all(&self, collection: &CollectionId) -> Result<Vec<LedgerDocument>, LedgerError>;

    /// Append one document and return the ledger's echo of it.
    async fn append(
        &self,
        collection: &CollectionId,
        fields: Fields,
    ) -> Result<LedgerDocument, LedgerError>;
}

/// Connection settings for [`HttpLedger`].
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub base_url: String,
    pub api_key: String,
    /// Sent as the `clearance` header when set.
    pub clearance: Option<String>,
    pub timeout: Duration,
}

/// Errors building an [`HttpLedger`].
#[derive(Debug, thiserror::Error)]
pub enum LedgerSetupError {
    #[error("invalid ledger url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Accepts both response shapes the ledger produces.
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Bare(T),
    Wrapped { result: T },
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Bare(inner) | Envelope::Wrapped { result: inner } => inner,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AppendRequest<'a> {
    collection_id: &'a CollectionId,
    fields: &'a Fields,
}

/// reqwest-backed ledger client.
pub struct HttpLedger {
    client: Client,
    base_url: String,
    api_key: String,
    clearance: Option<String>,
}

impl HttpLedger {
    pub fn new(config: LedgerConfig) -> Result<Self, LedgerSetupError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Url::parse(&base_url).map_err(|e| LedgerSetupError::InvalidUrl {
            url: config.base_url.clone(),
            reason: e.to_string(),
        })?;

        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
            clearance: config.clearance,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Authorization", format!("Key {}", self.api_key));
        match &self.clearance {
            Some(clearance) => request.header("clearance", clearance),
            None => request,
        }
    }

    fn url(&self, path: &str) -> Result<Url, LedgerError> {
        Url::parse(&format!("{}/{}", self.base_url, path)).map_err(|e| LedgerError::Unavailable {
            status: None,
            body: format!("invalid ledger url: {e}"),
        })
    }
}

#[async_trait]
impl DocumentStore for HttpLedger {
    async fn fetch_all(&self, collection: &CollectionId) -> Result<Vec<LedgerDocument>, LedgerError> {
        let mut url = self.url("all")?;
        url.query_pairs_mut()
            .append_pair("collection-id", collection.as_str());

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(transport_error)?;
        let body = success_body(response).await?;

        let documents = decode_documents(&body)?;
        debug!(
            collection = %collection,
            count = documents.len(),
            "Fetched ledger collection"
        );
        Ok(documents)
    }

    async fn append(
        &self,
        collection: &CollectionId,
        fields: Fields,
    ) -> Result<LedgerDocument, LedgerError> {
        let url = self.url("")?;
        let payload = AppendRequest {
            collection_id: collection,
            fields: &fields,
        };

        let response = self
            .authorize(self.client.post(url))
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;
        let body = success_body(response).await?;

        let echo: Envelope<LedgerDocument> = serde_json::from_str(&body)
            .map_err(|e| LedgerError::MalformedResponse(e.to_string()))?;
        let document = echo.into_inner();
        debug!(collection = %collection, id = %document.id, "Appended ledger document");
        Ok(document)
    }
}

fn transport_error(err: reqwest::Error) -> LedgerError {
    if err.is_timeout() {
        LedgerError::Timeout
    } else {
        LedgerError::Unavailable {
            status: None,
            body: err.to_string(),
        }
    }
}

/// Read the body, classifying non-2xx statuses with the body verbatim.
async fn success_body(response: Response) -> Result<String, LedgerError> {
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;

    if status.is_success() {
        Ok(body)
    } else if status.is_client_error() {
        Err(LedgerError::Rejected {
            status: status.as_u16(),
            body,
        })
    } else {
        Err(LedgerError::Unavailable {
            status: Some(status.as_u16()),
            body,
        })
    }
}

/// Decode a fetch-all body. Entries that are not valid documents are
/// skipped so that one bad record cannot hide the rest of the collection.
pub fn decode_documents(body: &str) -> Result<Vec<LedgerDocument>, LedgerError> {
    let envelope: Envelope<Vec<serde_json::Value>> =
        serde_json::from_str(body).map_err(|e| LedgerError::MalformedResponse(e.to_string()))?;

    let documents = envelope
        .into_inner()
        .into_iter()
        .enumerate()
        .filter_map(|(index, raw)| match serde_json::from_value::<LedgerDocument>(raw) {
            Ok(document) => Some(document),
            Err(e) => {
                warn!(index, error = %e, "Skipping malformed ledger document");
                None
            }
        })
        .collect();

    Ok(documents)
}

/// In-process ledger with the same contract as [`HttpLedger`].
///
/// Used by tests and local runs. A failure can be injected to exercise
/// caller error paths.
#[derive(Default)]
pub struct MemoryLedger {
    collections: Mutex<HashMap<CollectionId, Vec<LedgerDocument>>>,
    failure: Mutex<Option<LedgerError>>,
    next_id: Mutex<u64>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document verbatim, keeping its timestamps.
    pub fn insert(&self, collection: &CollectionId, document: LedgerDocument) {
        let mut collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        collections
            .entry(collection.clone())
            .or_default()
            .push(document);
    }

    /// Make every subsequent call fail with `error` (or succeed again with `None`).
    pub fn set_failure(&self, error: Option<LedgerError>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Current contents of a collection, in append order.
    pub fn documents(&self, collection: &CollectionId) -> Vec<LedgerDocument> {
        let collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        collections.get(collection).cloned().unwrap_or_default()
    }

    fn check_failure(&self) -> Result<(), LedgerError> {
        match self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryLedger {
    async fn fetch_all(&self, collection: &CollectionId) -> Result<Vec<LedgerDocument>, LedgerError> {
        self.check_failure()?;
        Ok(self.documents(collection))
    }

    async fn append(
        &self,
        collection: &CollectionId,
        fields: Fields,
    ) -> Result<LedgerDocument, LedgerError> {
        self.check_failure()?;

        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            DocumentId::new(format!("mem-{}", *next))
        };
        let now = Utc::now();
        let document = LedgerDocument {
            id,
            collection_id: Some(collection.clone()),
            fields,
            creation_time: Some(now),
            update_time: Some(now),
        };
        self.insert(collection, document.clone());
        Ok(document)
    }
}
