use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tagsync_core::{Feedback, LabelSet, Record};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    classify_reqwest_error, classify_status, BackoffPolicy, HttpClientConfig, RecordFilter,
    RecordPage, RecordStore, RetryDisposition, SimpleTokenBucket, StoreError,
};

const PAGE_LIMIT: &str = "100";

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// Base URL ending in `/`, e.g. `https://api.lever.co/v1/`.
    pub base_url: String,
    pub api_key: String,
    /// User the store attributes writes to.
    pub perform_as: Option<String>,
    pub client: HttpClientConfig,
}

/// Opportunity-style REST store: records are opportunities, labels are tags,
/// annotations are links, entities are contacts.
#[derive(Debug)]
pub struct HttpRecordStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    perform_as: Option<String>,
    token_bucket: Option<SimpleTokenBucket>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageEnvelope {
    data: Vec<ApiOpportunity>,
    #[serde(default)]
    has_next: bool,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiOpportunity {
    id: String,
    contact: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    links: Vec<String>,
    last_interaction_at: i64,
    created_at: i64,
    #[serde(default)]
    archived: Option<serde_json::Value>,
    #[serde(default)]
    is_anonymized: bool,
    #[serde(default)]
    applications: Vec<ApiApplication>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiApplication {
    #[serde(default)]
    posting: Option<String>,
    #[serde(default)]
    custom_questions: Vec<ApiQuestionSet>,
}

#[derive(Debug, Deserialize)]
struct ApiQuestionSet {
    #[serde(default)]
    fields: Vec<ApiField>,
}

#[derive(Debug, Deserialize)]
struct ApiField {
    text: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiFeedback {
    id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    completed_at: Option<i64>,
    #[serde(default)]
    fields: Vec<ApiField>,
}

#[derive(Debug, Serialize)]
struct TagsBody<'a> {
    tags: &'a LabelSet,
}

#[derive(Debug, Serialize)]
struct LinksBody<'a> {
    links: &'a LabelSet,
}

#[derive(Debug, Serialize)]
struct NoteBody<'a> {
    value: &'a str,
}

fn millis(raw: i64, field: &str) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(raw)
        .single()
        .ok_or_else(|| StoreError::Decode(format!("{field} out of range: {raw}")))
}

fn answer_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(answer_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

impl TryFrom<ApiOpportunity> for Record {
    type Error = StoreError;

    fn try_from(api: ApiOpportunity) -> Result<Self, Self::Error> {
        let mut record = Record::new(api.id, api.contact, millis(api.created_at, "createdAt")?);
        record.last_external_activity = millis(api.last_interaction_at, "lastInteractionAt")?;
        record.labels = api.tags.into_iter().collect();
        record.annotations = api.links.iter().cloned().collect();
        record.annotation_order = api.links;
        record.archived = api.archived.is_some_and(|v| !v.is_null());
        record.anonymized = api.is_anonymized;

        if let Some(application) = api.applications.into_iter().next() {
            record.bucket = application.posting;
            for field in application
                .custom_questions
                .into_iter()
                .flat_map(|set| set.fields)
            {
                record.fields.insert(field.text, answer_text(&field.value));
            }
        }
        Ok(record)
    }
}

impl TryFrom<ApiFeedback> for Feedback {
    type Error = StoreError;

    fn try_from(api: ApiFeedback) -> Result<Self, Self::Error> {
        let completed_at = api
            .completed_at
            .map(|raw| millis(raw, "completedAt"))
            .transpose()?;
        Ok(Feedback {
            id: api.id,
            title: api.text,
            completed_at,
            fields: api
                .fields
                .into_iter()
                .map(|field| (field.text, answer_text(&field.value)))
                .collect(),
        })
    }
}

impl HttpRecordStore {
    pub fn new(config: HttpStoreConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.client.timeout);

        if let Some(user_agent) = &config.client.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .client
            .token_bucket
            .map(|c| SimpleTokenBucket::new(c.capacity, c.refill_every));

        let mut base_url = config.base_url;
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
            perform_as: config.perform_as,
            token_bucket,
            backoff: config.client.backoff,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.api_key, Some(""))
    }

    fn write_request(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.request(Method::POST, path);
        match &self.perform_as {
            Some(user) => builder.query(&[("perform_as", user.as_str())]),
            None => builder,
        }
    }

    /// Send with retries; `build` is called once per attempt.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, StoreError>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }
            let may_retry = attempt < self.backoff.max_retries;

            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable && may_retry {
                        warn!(%status, url, attempt, "retrying store call");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && may_retry {
                        warn!(error = %err, attempt, "retrying store call");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(StoreError::Transport(err));
                }
            }
        }
    }

    async fn send_json<T, F>(&self, build: F) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let resp = self.send(build).await?;
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn get_page(&self, query: &[(&str, &str)]) -> Result<RecordPage, StoreError> {
        let page: PageEnvelope = self
            .send_json(|| self.request(Method::GET, "opportunities").query(query))
            .await?;
        let records = page
            .data
            .into_iter()
            .map(Record::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let next = if page.has_next { page.next } else { None };
        Ok(RecordPage { records, next })
    }

    async fn post_set<B>(&self, id: &str, action: &str, body: &B) -> Result<(), StoreError>
    where
        B: Serialize + Sync,
    {
        let path = format!("opportunities/{id}/{action}");
        self.send(|| self.write_request(&path).json(body))
            .instrument(info_span!("store_call", record_id = id, action))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn fetch(&self, id: &str) -> Result<Record, StoreError> {
        let path = format!("opportunities/{id}");
        let envelope: Envelope<ApiOpportunity> = self
            .send_json(|| {
                self.request(Method::GET, &path)
                    .query(&[("expand", "applications")])
            })
            .instrument(info_span!("store_call", record_id = id, action = "fetch"))
            .await
            .map_err(|err| match err {
                StoreError::HttpStatus { status: 404, .. } => StoreError::NotFound(id.to_string()),
                other => other,
            })?;
        Record::try_from(envelope.data)
    }

    async fn fetch_page(
        &self,
        filter: &RecordFilter,
        cursor: Option<&str>,
    ) -> Result<RecordPage, StoreError> {
        let mut query = vec![("limit", PAGE_LIMIT), ("expand", "applications")];
        match filter.archived {
            Some(true) => query.push(("archived", "true")),
            Some(false) => query.push(("archived", "false")),
            None => {}
        }
        if let Some(offset) = cursor {
            query.push(("offset", offset));
        }
        let page = self
            .get_page(&query)
            .instrument(info_span!("store_call", action = "fetch_page"))
            .await?;
        debug!(records = page.records.len(), more = page.next.is_some(), "fetched page");
        Ok(page)
    }

    async fn fetch_by_entity(&self, entity_id: &str) -> Result<Vec<Record>, StoreError> {
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![
                ("limit", PAGE_LIMIT),
                ("expand", "applications"),
                ("contact_id", entity_id),
            ];
            if let Some(offset) = cursor.as_deref() {
                query.push(("offset", offset));
            }
            let page = self
                .get_page(&query)
                .instrument(info_span!("store_call", entity_id, action = "fetch_by_entity"))
                .await?;
            records.extend(page.records);
            match page.next {
                Some(next) => cursor = Some(next),
                None => return Ok(records),
            }
        }
    }

    async fn fetch_feedback(&self, id: &str) -> Result<Vec<Feedback>, StoreError> {
        let path = format!("opportunities/{id}/feedback");
        let envelope: Envelope<Vec<ApiFeedback>> = self
            .send_json(|| self.request(Method::GET, &path))
            .instrument(info_span!("store_call", record_id = id, action = "fetch_feedback"))
            .await?;
        envelope.data.into_iter().map(Feedback::try_from).collect()
    }

    async fn add_labels(&self, id: &str, labels: &LabelSet) -> Result<(), StoreError> {
        self.post_set(id, "addTags", &TagsBody { tags: labels }).await
    }

    async fn remove_labels(&self, id: &str, labels: &LabelSet) -> Result<(), StoreError> {
        self.post_set(id, "removeTags", &TagsBody { tags: labels })
            .await
    }

    async fn add_annotations(&self, id: &str, annotations: &LabelSet) -> Result<(), StoreError> {
        self.post_set(id, "addLinks", &LinksBody { links: annotations })
            .await
    }

    async fn remove_annotations(
        &self,
        id: &str,
        annotations: &LabelSet,
    ) -> Result<(), StoreError> {
        self.post_set(id, "removeLinks", &LinksBody { links: annotations })
            .await
    }

    async fn add_note(&self, id: &str, text: &str) -> Result<DateTime<Utc>, StoreError> {
        self.post_set(id, "notes", &NoteBody { value: text }).await?;
        Ok(Utc::now())
    }
}
