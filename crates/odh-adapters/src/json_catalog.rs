//! JSON catalog adapter: paged catalog APIs and manual JSON exports share one record shape.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use odh_core::{Agent, Distribution, License, ResourceKind, TemporalRange};
use odh_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::{
    AdapterError, AdapterKind, FieldError, FieldResult, HarvestContext, MetadataDocument,
    SourceAdapter,
};

pub const DEFAULT_PAGE_SIZE: usize = 100;
/// Upper bound on pages fetched in one run.
pub const MAX_PAGES: usize = 10_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Many(values) => values,
            Self::One(value) => vec![value],
        }
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonDistribution {
    #[serde(default)]
    pub access_url: Option<String>,
    #[serde(default)]
    format: OneOrMany<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Catalogs publish sizes as numbers or numeric strings.
    #[serde(default)]
    pub byte_size: Option<JsonValue>,
    #[serde(default)]
    pub issued: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonTemporal {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

/// One catalog entry as published by the source.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRecord {
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type")]
    pub record_type: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub issued: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    publisher: OneOrMany<Agent>,
    #[serde(default)]
    contact_point: OneOrMany<Agent>,
    #[serde(default)]
    creator: OneOrMany<Agent>,
    #[serde(default)]
    originator: OneOrMany<Agent>,
    #[serde(default)]
    pub license: Option<License>,
    #[serde(default)]
    pub accrual_periodicity: Option<String>,
    #[serde(default)]
    pub spatial: Option<JsonValue>,
    #[serde(default)]
    pub spatial_text: Option<String>,
    #[serde(default)]
    pub temporal: Vec<JsonTemporal>,
    #[serde(default)]
    pub distributions: Vec<JsonDistribution>,
    #[serde(default)]
    pub operates_on: Vec<String>,
    #[serde(default)]
    pub feature_type: bool,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub subsections: Vec<String>,
    #[serde(default)]
    pub landing_page: Option<String>,
    #[serde(default)]
    pub draft: bool,
}

#[derive(Debug, Clone)]
pub struct JsonRecordDocument {
    record: JsonRecord,
    raw: String,
}

impl JsonRecordDocument {
    pub fn from_value(value: JsonValue) -> Result<Self, serde_json::Error> {
        let raw = value.to_string();
        let record = serde_json::from_value(value)?;
        Ok(Self { record, raw })
    }

    pub fn record(&self) -> &JsonRecord {
        &self.record
    }
}

fn parse_date(field: &'static str, value: Option<&str>) -> FieldResult<Option<DateTime<Utc>>> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Some(naive.and_utc()))
        .ok_or_else(|| FieldError::Malformed {
            field,
            value: value.to_string(),
        })
}

fn parse_byte_size(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl MetadataDocument for JsonRecordDocument {
    fn generated_id(&self) -> FieldResult<String> {
        Ok(non_empty(&self.record.identifier).unwrap_or_default())
    }

    fn title(&self) -> FieldResult<Option<String>> {
        match non_empty(&self.record.title) {
            Some(title) => Ok(Some(title)),
            None => Err(FieldError::MissingMandatory { field: "title" }),
        }
    }

    fn description(&self) -> FieldResult<Option<String>> {
        Ok(non_empty(&self.record.description))
    }

    async fn distributions(&self, ctx: &HarvestContext) -> FieldResult<Vec<Distribution>> {
        let mut out = Vec::with_capacity(self.record.distributions.len());
        for dist in &self.record.distributions {
            let Some(access_url) = non_empty(&dist.access_url) else {
                ctx.stats.warn(format!(
                    "{}: distribution without access url ignored",
                    self.record.identifier.as_deref().unwrap_or("<unidentified>")
                ));
                continue;
            };
            let byte_size = dist.byte_size.as_ref().and_then(parse_byte_size);
            if dist.byte_size.is_some() && byte_size.is_none() {
                debug!(url = %access_url, "ignoring unparseable byte size");
            }
            out.push(Distribution {
                access_url,
                format: dist.format.clone().into_vec(),
                title: non_empty(&dist.title),
                byte_size,
                issued: parse_date("distribution.issued", dist.issued.as_deref()).unwrap_or(None),
                modified: parse_date("distribution.modified", dist.modified.as_deref()).unwrap_or(None),
            });
        }
        Ok(out)
    }

    fn publisher(&self) -> FieldResult<Vec<Agent>> {
        Ok(self.record.publisher.clone().into_vec())
    }

    fn contact_point(&self) -> FieldResult<Vec<Agent>> {
        Ok(self.record.contact_point.clone().into_vec())
    }

    fn creator(&self) -> FieldResult<Vec<Agent>> {
        Ok(self.record.creator.clone().into_vec())
    }

    fn originator(&self) -> FieldResult<Vec<Agent>> {
        Ok(self.record.originator.clone().into_vec())
    }

    fn spatial(&self) -> FieldResult<Option<JsonValue>> {
        Ok(self.record.spatial.clone().filter(|v| !v.is_null()))
    }

    fn spatial_text(&self) -> FieldResult<Option<String>> {
        Ok(non_empty(&self.record.spatial_text))
    }

    fn temporal(&self) -> FieldResult<Vec<TemporalRange>> {
        self.record
            .temporal
            .iter()
            .map(|t| {
                Ok(TemporalRange {
                    gte: parse_date("temporal.start", t.start.as_deref())?,
                    lte: parse_date("temporal.end", t.end.as_deref())?,
                })
            })
            .collect()
    }

    fn keywords(&self) -> FieldResult<Vec<String>> {
        let mut keywords: Vec<String> = Vec::new();
        for keyword in &self.record.keywords {
            let keyword = keyword.trim();
            if !keyword.is_empty() && !keywords.iter().any(|k| k == keyword) {
                keywords.push(keyword.to_string());
            }
        }
        Ok(keywords)
    }

    fn themes(&self, _keywords: &[String]) -> FieldResult<Vec<String>> {
        Ok(self.record.themes.clone())
    }

    fn categories(&self, _keywords: &[String]) -> FieldResult<Vec<String>> {
        Ok(self.record.categories.clone())
    }

    fn accrual_periodicity(&self) -> FieldResult<Option<String>> {
        Ok(non_empty(&self.record.accrual_periodicity))
    }

    fn license(&self) -> FieldResult<Option<License>> {
        Ok(self.record.license.clone())
    }

    fn groups(&self) -> FieldResult<Vec<String>> {
        Ok(self.record.groups.clone())
    }

    fn sub_sections(&self) -> FieldResult<Vec<String>> {
        Ok(self.record.subsections.clone())
    }

    fn metadata_source(&self) -> FieldResult<Option<String>> {
        Ok(non_empty(&self.record.landing_page))
    }

    fn issued(&self) -> FieldResult<Option<DateTime<Utc>>> {
        parse_date("issued", self.record.issued.as_deref())
    }

    fn modified(&self) -> FieldResult<Option<DateTime<Utc>>> {
        parse_date("modified", self.record.modified.as_deref())
    }

    fn harvested_raw_payload(&self) -> Option<String> {
        Some(self.raw.clone())
    }

    fn resource_kind(&self) -> ResourceKind {
        match self.record.record_type.as_deref() {
            Some(t) if t.eq_ignore_ascii_case("service") => ResourceKind::Service,
            _ => ResourceKind::Dataset,
        }
    }

    fn operates_on(&self) -> Vec<String> {
        self.record.operates_on.clone()
    }

    fn is_feature_type(&self) -> bool {
        self.record.feature_type
    }

    fn should_be_skipped(&self, _keywords: &[String]) -> bool {
        self.record.draft
    }
}

#[derive(Debug, Clone)]
enum Location {
    Remote { url: String, page_size: usize },
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct JsonCatalogAdapter {
    source_id: String,
    location: Location,
}

impl JsonCatalogAdapter {
    pub fn remote(source_id: &str, url: String, page_size: usize) -> Self {
        let page_size = if page_size == 0 { DEFAULT_PAGE_SIZE } else { page_size };
        Self {
            source_id: source_id.to_string(),
            location: Location::Remote { url, page_size },
        }
    }

    pub fn file(source_id: &str, path: PathBuf) -> Self {
        Self {
            source_id: source_id.to_string(),
            location: Location::File(path),
        }
    }

    async fn fetch_pages(
        &self,
        http: &HttpFetcher,
        ctx: &HarvestContext,
        base: &str,
        page_size: usize,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        let mut values = Vec::new();
        let mut cursor = PageCursor::new(page_size, MAX_PAGES);
        loop {
            let mut url = reqwest::Url::parse(base)
                .map_err(|err| AdapterError::Message(format!("invalid catalog url {base}: {err}")))?;
            url.query_pairs_mut()
                .append_pair("offset", &cursor.offset().to_string())
                .append_pair("limit", &page_size.to_string());

            let response = http.fetch_bytes(ctx.run_id, &self.source_id, url.as_str()).await?;
            let page = records_of(serde_json::from_slice(&response.body)?)?;
            debug!(source_id = %self.source_id, offset = cursor.offset(), fetched = page.len(), "fetched catalog page");

            match cursor.accept(&page) {
                PageStep::More => values.extend(page),
                PageStep::Last => {
                    values.extend(page);
                    break;
                }
                PageStep::Repeated => {
                    warn!(source_id = %self.source_id, offset = cursor.offset(), "catalog repeated a page; paging stopped");
                    ctx.stats
                        .warn(format!("catalog ignored offset {}; paging stopped", cursor.offset()));
                    break;
                }
                PageStep::Capped => {
                    values.extend(page);
                    warn!(source_id = %self.source_id, pages = MAX_PAGES, "page limit reached; paging stopped");
                    ctx.stats.warn(format!("page limit of {MAX_PAGES} reached; paging stopped"));
                    break;
                }
            }
        }
        Ok(values)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageStep {
    More,
    Last,
    /// Same records as the previous page; the page is dropped.
    Repeated,
    /// Kept, but no further page is requested.
    Capped,
}

/// Offset/limit paging state. Stops on a short page, on a page identical to the previous
/// one, or after `max_pages`.
#[derive(Debug)]
struct PageCursor {
    page_size: usize,
    max_pages: usize,
    offset: usize,
    pages: usize,
    previous: Option<Vec<String>>,
}

impl PageCursor {
    fn new(page_size: usize, max_pages: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            max_pages: max_pages.max(1),
            offset: 0,
            pages: 0,
            previous: None,
        }
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn accept(&mut self, page: &[JsonValue]) -> PageStep {
        let fingerprint: Vec<String> = page.iter().map(JsonValue::to_string).collect();
        if !page.is_empty() && self.previous.as_ref() == Some(&fingerprint) {
            return PageStep::Repeated;
        }
        self.previous = Some(fingerprint);
        self.pages += 1;
        self.offset += page.len();

        if page.len() < self.page_size {
            PageStep::Last
        } else if self.pages >= self.max_pages {
            PageStep::Capped
        } else {
            PageStep::More
        }
    }
}

/// Accepts `{ "records": [...] }` or a bare array.
fn records_of(payload: JsonValue) -> Result<Vec<JsonValue>, AdapterError> {
    match payload {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(mut map) => match map.remove("records") {
            Some(JsonValue::Array(items)) => Ok(items),
            _ => Err(AdapterError::Message("catalog payload has no records array".into())),
        },
        _ => Err(AdapterError::Message("catalog payload is not a JSON object".into())),
    }
}

#[async_trait]
impl SourceAdapter for JsonCatalogAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> AdapterKind {
        match self.location {
            Location::Remote { .. } => AdapterKind::CatalogApi,
            Location::File(_) => AdapterKind::ManualExport,
        }
    }

    async fn fetch_documents(
        &self,
        http: &HttpFetcher,
        ctx: &HarvestContext,
    ) -> Result<Vec<Box<dyn MetadataDocument>>, AdapterError> {
        let values = match &self.location {
            Location::Remote { url, page_size } => self.fetch_pages(http, ctx, url, *page_size).await?,
            Location::File(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                records_of(serde_json::from_slice(&bytes)?)?
            }
        };

        let mut documents: Vec<Box<dyn MetadataDocument>> = Vec::with_capacity(values.len());
        for (position, value) in values.into_iter().enumerate() {
            match JsonRecordDocument::from_value(value) {
                Ok(doc) => documents.push(Box::new(doc)),
                Err(err) => ctx
                    .stats
                    .error(format!("record #{position}: unparseable catalog entry: {err}")),
            }
        }
        info!(source_id = %self.source_id, documents = documents.len(), "parsed catalog records");
        Ok(documents)
    }
}
