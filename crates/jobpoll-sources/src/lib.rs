//! Source registry + generic listing parsers that turn fetched bodies into listing sets.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use jobpoll_core::{IntervalBounds, Listing, PollTarget};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobpoll-sources";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub min_poll_minutes: Option<u32>,
    #[serde(default)]
    pub max_poll_minutes: Option<u32>,
    /// Only listings updated within this many days take part in change detection.
    #[serde(default)]
    pub max_listing_age_days: Option<u32>,
    pub parser: ParserConfig,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn poll_target(&self, global: IntervalBounds) -> PollTarget {
        PollTarget::new(
            self.url.clone(),
            self.display_name.clone(),
            global.narrowed(self.min_poll_minutes, self.max_poll_minutes),
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParserConfig {
    Json(JsonParserConfig),
    Html(HtmlParserConfig),
}

/// Field locations inside a JSON document, as JSON pointers (RFC 6901).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonParserConfig {
    /// Pointer to the array of items; empty means the document root.
    #[serde(default)]
    pub items_pointer: String,
    pub id: String,
    pub title: String,
    pub application_url: String,
    #[serde(default)]
    pub company: Option<String>,
    /// Used when the payload does not carry a company per item.
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HtmlParserConfig {
    pub item_selector: String,
    pub title_selector: String,
    #[serde(default = "default_link_selector")]
    pub link_selector: String,
    #[serde(default)]
    pub company_selector: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub location_selector: Option<String>,
    /// Prefix for root-relative links (`/jobs/1`).
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_link_selector() -> String {
    "a[href]".to_string()
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("body is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("no array at JSON pointer '{pointer}'")]
    MissingItems { pointer: String },
    #[error("invalid CSS selector '{selector}': {message}")]
    InvalidSelector { selector: String, message: String },
}

/// Turns one fetched body into the listing set handed to delta detection.
pub trait ListingParser: Send + Sync {
    fn parse(&self, source_id: &str, body: &[u8]) -> Result<Vec<Listing>, ParseError>;
}

pub fn parser_for(config: &ParserConfig) -> Box<dyn ListingParser> {
    match config {
        ParserConfig::Json(cfg) => Box::new(JsonListingParser::new(cfg.clone())),
        ParserConfig::Html(cfg) => Box::new(HtmlListingParser::new(cfg.clone())),
    }
}

pub fn load_source_registry(path: impl AsRef<Path>) -> Result<SourceRegistry> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let registry: SourceRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    validate_registry(&registry).with_context(|| format!("validating {}", path.display()))?;
    Ok(registry)
}

pub fn validate_registry(registry: &SourceRegistry) -> Result<()> {
    let mut ids = HashSet::new();
    let mut urls = HashSet::new();
    for source in &registry.sources {
        if source.url.trim().is_empty() {
            bail!("source {} has an empty url", source.source_id);
        }
        if !ids.insert(source.source_id.as_str()) {
            bail!("duplicate source_id {}", source.source_id);
        }
        if !urls.insert(source.url.trim()) {
            bail!("duplicate url {} (source {})", source.url, source.source_id);
        }
    }
    Ok(())
}

/// Keep listings updated at or after `since`. Listings without a parseable marker are kept.
pub fn listings_updated_since(listings: Vec<Listing>, since: DateTime<Utc>) -> Vec<Listing> {
    listings
        .into_iter()
        .filter(|l| {
            l.updated_at
                .as_deref()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|ts| ts.with_timezone(&Utc) >= since)
                .unwrap_or(true)
        })
        .collect()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn scoped_id(source_id: &str, raw: &str) -> String {
    format!("{source_id}-{raw}")
}

fn json_text(value: &JsonValue, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct JsonListingParser {
    config: JsonParserConfig,
}

impl JsonListingParser {
    pub fn new(config: JsonParserConfig) -> Self {
        Self { config }
    }
}

impl ListingParser for JsonListingParser {
    fn parse(&self, source_id: &str, body: &[u8]) -> Result<Vec<Listing>, ParseError> {
        let cfg = &self.config;
        let document: JsonValue = serde_json::from_slice(body)?;
        let items = document
            .pointer(&cfg.items_pointer)
            .and_then(JsonValue::as_array)
            .ok_or_else(|| ParseError::MissingItems {
                pointer: cfg.items_pointer.clone(),
            })?;

        let opt = |item: &JsonValue, pointer: &Option<String>| {
            pointer.as_deref().and_then(|p| json_text(item, p))
        };

        Ok(items
            .iter()
            .filter_map(|item| {
                let raw_id = json_text(item, &cfg.id)?;
                Some(Listing {
                    id: scoped_id(source_id, &raw_id),
                    title: json_text(item, &cfg.title).unwrap_or_default(),
                    company_name: opt(item, &cfg.company)
                        .or_else(|| cfg.company_name.clone())
                        .unwrap_or_default(),
                    application_url: json_text(item, &cfg.application_url).unwrap_or_default(),
                    updated_at: opt(item, &cfg.updated_at),
                    description: opt(item, &cfg.description),
                    location: opt(item, &cfg.location),
                    scraped_at: Some(Utc::now()),
                })
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct HtmlListingParser {
    config: HtmlParserConfig,
}

impl HtmlListingParser {
    pub fn new(config: HtmlParserConfig) -> Self {
        Self { config }
    }

    fn absolute(&self, href: &str) -> String {
        match &self.config.base_url {
            Some(base) if href.starts_with('/') => {
                format!("{}{}", base.trim_end_matches('/'), href)
            }
            _ => href.to_string(),
        }
    }
}

fn selector(raw: &str) -> Result<Selector, ParseError> {
    Selector::parse(raw).map_err(|e| ParseError::InvalidSelector {
        selector: raw.to_string(),
        message: e.to_string(),
    })
}

fn first_text(scope: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

impl ListingParser for HtmlListingParser {
    fn parse(&self, source_id: &str, body: &[u8]) -> Result<Vec<Listing>, ParseError> {
        let cfg = &self.config;
        let text = std::str::from_utf8(body)?;
        let item_sel = selector(&cfg.item_selector)?;
        let title_sel = selector(&cfg.title_selector)?;
        let link_sel = selector(&cfg.link_selector)?;
        let company_sel = cfg.company_selector.as_deref().map(selector).transpose()?;
        let location_sel = cfg.location_selector.as_deref().map(selector).transpose()?;

        let document = Html::parse_document(text);
        let scraped_at = Utc::now();
        let mut out = Vec::new();

        for item in document.select(&item_sel) {
            let Some(title) = first_text(&item, &title_sel) else {
                continue;
            };
            let href = item
                .select(&link_sel)
                .next()
                .and_then(|n| n.value().attr("href"))
                .and_then(|s| text_or_none(s.to_string()))
                .map(|s| self.absolute(&s));
            let company_name = company_sel
                .as_ref()
                .and_then(|sel| first_text(&item, sel))
                .or_else(|| cfg.company_name.clone())
                .unwrap_or_default();

            let raw_id = match &href {
                Some(url) => url.clone(),
                None => Uuid::new_v5(
                    &Uuid::NAMESPACE_URL,
                    format!("{source_id}:{company_name}:{title}").as_bytes(),
                )
                .to_string(),
            };

            out.push(Listing {
                id: scoped_id(source_id, &raw_id),
                title,
                company_name,
                application_url: href.unwrap_or_default(),
                updated_at: None,
                description: None,
                location: location_sel.as_ref().and_then(|sel| first_text(&item, sel)),
                scraped_at: Some(scraped_at),
            });
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn board_parser() -> JsonListingParser {
        JsonListingParser::new(JsonParserConfig {
            items_pointer: "/jobs".into(),
            id: "/id".into(),
            title: "/title".into(),
            application_url: "/absolute_url".into(),
            company: None,
            company_name: Some("Stripe".into()),
            updated_at: Some("/updated_at".into()),
            description: None,
            location: Some("/location/name".into()),
        })
    }

    #[test]
    fn json_parser_extracts_nested_items() {
        let body = br#"{"jobs":[
            {"id":4021,"title":"Software Engineering Intern","absolute_url":"https://jobs.test/4021","updated_at":"2026-09-01T10:00:00Z","location":{"name":"Remote"}},
            {"id":"4022","title":"  Data Intern ","absolute_url":"https://jobs.test/4022"},
            {"title":"no id, skipped"}
        ]}"#;
        let listings = board_parser().parse("greenhouse-stripe", body).unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].id, "greenhouse-stripe-4021");
        assert_eq!(listings[0].company_name, "Stripe");
        assert_eq!(listings[0].location.as_deref(), Some("Remote"));
        assert_eq!(listings[0].updated_at.as_deref(), Some("2026-09-01T10:00:00Z"));
        assert_eq!(listings[1].title, "Data Intern");
        assert!(listings[1].updated_at.is_none());
    }

    #[test]
    fn json_parser_reads_root_arrays_and_per_item_company() {
        let parser = JsonListingParser::new(JsonParserConfig {
            items_pointer: String::new(),
            id: "/id".into(),
            title: "/text".into(),
            application_url: "/hostedUrl".into(),
            company: Some("/categories/team".into()),
            company_name: Some("fallback".into()),
            updated_at: None,
            description: None,
            location: None,
        });
        let body = br#"[{"id":"a1","text":"Intern","hostedUrl":"https://l.test/a1","categories":{"team":"Platform"}}]"#;
        let listings = parser.parse("lever-acme", body).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].company_name, "Platform");
    }

    #[test]
    fn json_parser_reports_missing_items_and_bad_json() {
        let err = board_parser().parse("s", br#"{"postings":[]}"#).unwrap_err();
        assert!(matches!(err, ParseError::MissingItems { .. }));
        let err = board_parser().parse("s", b"<html>").unwrap_err();
        assert!(matches!(err, ParseError::InvalidJson(_)));
    }

    #[test]
    fn json_parser_accepts_empty_listing_sets() {
        let listings = board_parser().parse("s", br#"{"jobs":[]}"#).unwrap();
        assert!(listings.is_empty());
    }

    #[test]
    fn html_parser_uses_selectors_and_resolves_links() {
        let parser = HtmlListingParser::new(HtmlParserConfig {
            item_selector: "li.job".into(),
            title_selector: ".title".into(),
            link_selector: "a[href]".into(),
            company_selector: Some(".company".into()),
            company_name: None,
            location_selector: None,
            base_url: Some("https://careers.test/".into()),
        });
        let body = br#"<html><body><ul>
            <li class="job"><span class="title">SWE Intern</span><span class="company">Acme</span><a href="/jobs/7">Apply</a></li>
            <li class="job"><span class="title">Design Intern</span></li>
            <li class="job"><span class="title">  </span></li>
        </ul></body></html>"#;
        let listings = parser.parse("careers", body).unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].application_url, "https://careers.test/jobs/7");
        assert_eq!(listings[0].id, "careers-https://careers.test/jobs/7");
        assert_eq!(listings[0].company_name, "Acme");
        assert!(listings[1].application_url.is_empty());
        assert!(listings[1].id.starts_with("careers-"));

        let again = parser.parse("careers", body).unwrap();
        assert_eq!(listings[1].id, again[1].id);
    }

    #[test]
    fn html_parser_rejects_invalid_selectors() {
        let parser = HtmlListingParser::new(HtmlParserConfig {
            item_selector: "li[".into(),
            title_selector: ".title".into(),
            link_selector: default_link_selector(),
            company_selector: None,
            company_name: None,
            location_selector: None,
            base_url: None,
        });
        assert!(matches!(
            parser.parse("s", b"<ul></ul>"),
            Err(ParseError::InvalidSelector { .. })
        ));
    }

    #[test]
    fn updated_since_keeps_fresh_and_unmarked_listings() {
        let mk = |id: &str, updated_at: Option<&str>| Listing {
            id: id.into(),
            updated_at: updated_at.map(ToString::to_string),
            ..Listing::default()
        };
        let since = Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).single().unwrap();
        let kept = listings_updated_since(
            vec![
                mk("old", Some("2026-08-01T00:00:00Z")),
                mk("new", Some("2026-09-02T00:00:00+02:00")),
                mk("none", None),
                mk("junk", Some("yesterday")),
            ],
            since,
        );
        let ids = kept.iter().map(|l| l.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["new", "none", "junk"]);
    }

    #[test]
    fn registry_loads_yaml_and_rejects_duplicates() {
        let yaml = r#"
sources:
  - source_id: greenhouse-stripe
    display_name: Stripe (Greenhouse)
    url: https://boards-api.greenhouse.io/v1/boards/stripe/jobs
    min_poll_minutes: 15
    parser:
      kind: json
      items_pointer: /jobs
      id: /id
      title: /title
      application_url: /absolute_url
      company_name: Stripe
  - source_id: careers-html
    display_name: Careers page
    url: https://careers.test/interns
    enabled: false
    parser:
      kind: html
      item_selector: li.job
      title_selector: .title
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        let registry = load_source_registry(file.path()).unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.enabled().count(), 1);
        assert!(matches!(registry.sources[1].parser, ParserConfig::Html(_)));

        let target = registry.sources[0].poll_target(IntervalBounds::default());
        assert_eq!(target.bounds.min_minutes, 15);
        assert_eq!(target.bounds.default_minutes, 30);

        let mut dup = registry.clone();
        dup.sources[1].source_id = "greenhouse-stripe".into();
        assert!(validate_registry(&dup).is_err());
    }
}
