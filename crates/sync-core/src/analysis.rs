//! Paper analysis through a language model, with a metadata-only fallback.
//!
//! Two stages: a lite model extracts the bibliographic basics from the first
//! pages (skipped when the library already supplied them), then the full model
//! produces the abstract, claims, method, findings, excerpts, tags and topic
//! hub assignments. Anything that cannot be analyzed still yields a usable
//! [`Analysis`] built from the PDF metadata.

use std::time::Duration;

use async_trait::async_trait;
use literature_notes::{Biblio, SectionText};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::extraction::ExtractedDocument;
use crate::topics::TopicHubs;

/// Characters of paper text sent to the full model.
pub const MAX_TEXT_CHARS: usize = 30_000;
/// Characters of paper text sent to the lite model.
pub const STAGE1_TEXT_CHARS: usize = 8_000;
/// Page count from which a document is treated as a thesis.
pub const THESIS_MIN_PAGES: u32 = 50;
pub const THESIS_KEYWORDS: [&str; 5] = ["학위", "석사", "박사", "thesis", "dissertation"];

/// First line of structured excerpts.
pub const EXCERPT_HEADING: &str = "### **Paper analysis**";
/// Theme heading of excerpts copied from the text instead of analyzed.
pub const FALLBACK_EXCERPT_THEME: &str = "#### **1. Excerpts from the text**";
pub const KEY_CLAIMS_PLACEHOLDER: &str = "> [Summarize the key claims]";
pub const ABSTRACT_PLACEHOLDER: &str = "[Abstract could not be extracted. Check the source PDF.]";

const MAX_ABSTRACT_CHARS: usize = 1_000;
/// Section text shorter than this is not worth rewriting excerpts from.
const MIN_SECTION_CHARS: usize = 80;
const MIN_EXCERPT_PARAGRAPH_CHARS: usize = 120;
const MAX_EXCERPT_CHARS: usize = 500;
const MAX_EXCERPTS: usize = 3;

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid regex"));
static BARE_JSON: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));
static ABSTRACT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)(?:Abstract|초록)[:\s]*(.+?)(?:\n\n|\nKeyword|\nIntroduction|\n1[.\s])")
        .expect("valid regex")
});
static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"((?:19|20)\d{2})").expect("valid regex"));
static PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").expect("valid regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("temporary failure: {0}")]
    Transient(String),

    /// Bad credentials or unknown model; retrying will not help.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("unexpected response shape: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The item should be retried on a later poll.
    #[error("model {model} temporarily unavailable: {source}")]
    Unavailable {
        model: String,
        #[source]
        source: LlmError,
    },
}

impl AnalysisError {
    /// The endpoint asked us to slow down.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            AnalysisError::Unavailable {
                source: LlmError::RateLimited(_),
                ..
            }
        )
    }
}

/// Text generation backend.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, LlmError>;
}

/// A topic hub the paper was assigned to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TopicAssignment {
    pub name: String,
    pub is_new: bool,
    pub description: String,
}

/// Analysis result, ready to be rendered into a note.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    /// Bibliographic values: library fields first, then model or PDF metadata.
    pub biblio: Biblio,
    pub abstract_text: String,
    pub key_claims: SectionText,
    pub method: String,
    pub findings: SectionText,
    pub excerpts: SectionText,
    pub topics: Vec<TopicAssignment>,
    /// Built from metadata only; no model output was used.
    pub degraded: bool,
}

/// Degree thesis by page count or by keywords in the title, subject or file name.
pub fn is_thesis(doc: &ExtractedDocument) -> bool {
    if doc.page_count >= THESIS_MIN_PAGES {
        return true;
    }
    let haystack = format!(
        "{} {} {}",
        doc.metadata.title, doc.metadata.subject, doc.file_name
    )
    .to_lowercase();
    THESIS_KEYWORDS.iter().any(|kw| haystack.contains(kw))
}

/// Pull a JSON object out of a model response, fenced or bare.
pub fn parse_json_response(text: &str) -> Option<Map<String, Value>> {
    let candidate = FENCED_JSON
        .captures(text)
        .and_then(|caps| caps.get(1))
        .or_else(|| BARE_JSON.find(text))
        .map(|m| m.as_str())
        .unwrap_or(text);
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn take_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

fn fallback_excerpts(full_text: &str) -> String {
    let points: Vec<String> = PARAGRAPH_BREAK
        .split(full_text)
        .map(str::trim)
        .filter(|p| p.chars().count() >= MIN_EXCERPT_PARAGRAPH_CHARS)
        .take(MAX_EXCERPTS)
        .map(|p| take_chars(&WHITESPACE.replace_all(p, " "), MAX_EXCERPT_CHARS).trim().to_string())
        .collect();

    if points.is_empty() {
        return format!(
            "{EXCERPT_HEADING}\n\n\
             {FALLBACK_EXCERPT_THEME}\n\
             - [Not enough text to excerpt automatically.]\n\n\
             ### **Executive summary**\n\
             Check the source PDF and complete the excerpts."
        );
    }

    let bullets = points
        .iter()
        .map(|p| format!("- {p}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{EXCERPT_HEADING}\n\n\
         {FALLBACK_EXCERPT_THEME}\n\
         {bullets}\n\n\
         ### **Executive summary**\n\
         Key passages taken from the text. A model analysis produces structured excerpts."
    )
}

/// Whether section text is a template placeholder rather than content.
pub fn is_placeholder_text(text: &str) -> bool {
    let text = text.trim();
    text.is_empty() || text.starts_with("> [") || text.contains(ABSTRACT_PLACEHOLDER)
}

/// Metadata-only analysis of an extracted document.
pub fn fallback_analysis(doc: &ExtractedDocument) -> Analysis {
    let meta = &doc.metadata;

    let abstract_text = ABSTRACT
        .captures(&doc.full_text)
        .map(|caps| take_chars(caps[1].trim(), MAX_ABSTRACT_CHARS))
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| ABSTRACT_PLACEHOLDER.to_string());

    let year = YEAR
        .captures(&meta.creation_date)
        .or_else(|| YEAR.captures(&doc.file_name))
        .map(|caps| caps[1].to_string())
        .unwrap_or_default();

    let title = if meta.title.trim().is_empty() {
        doc.file_name.replace(".pdf", "")
    } else {
        meta.title.trim().to_string()
    };

    Analysis {
        biblio: Biblio {
            title,
            author: meta.author.trim().to_string(),
            year,
            journal: meta.subject.trim().to_string(),
            ..Default::default()
        },
        abstract_text,
        key_claims: SectionText::Text(format!("{KEY_CLAIMS_PLACEHOLDER}\n\n-")),
        method: "> [Summarize the method]\n\n-".to_string(),
        findings: SectionText::Text("> [Summarize the main findings]\n\n1.\n2.\n3.".to_string()),
        excerpts: SectionText::Text(fallback_excerpts(&doc.full_text)),
        topics: Vec::new(),
        degraded: true,
    }
}

/// Overwrite `base` with every non-empty value of `top`.
fn overlay(base: &mut Biblio, top: &Biblio) {
    let pairs = [
        (&mut base.title, &top.title),
        (&mut base.author, &top.author),
        (&mut base.year, &top.year),
        (&mut base.journal, &top.journal),
        (&mut base.publisher, &top.publisher),
        (&mut base.volume, &top.volume),
        (&mut base.issue, &top.issue),
        (&mut base.pages, &top.pages),
        (&mut base.doi, &top.doi),
        (&mut base.issn, &top.issn),
        (&mut base.url, &top.url),
        (&mut base.language, &top.language),
        (&mut base.abstract_note, &top.abstract_note),
    ];
    for (slot, value) in pairs {
        if !value.trim().is_empty() {
            *slot = value.trim().to_string();
        }
    }
    if !top.tags.is_empty() {
        base.tags = top.tags.clone();
    }
}

/// String value of a JSON field; numbers are accepted, lists are joined.
fn text_field(obj: &Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        _ => String::new(),
    }
}

fn section_field(obj: &Map<String, Value>, key: &str) -> Option<SectionText> {
    let section = match obj.get(key)? {
        Value::String(s) => SectionText::Text(s.clone()),
        Value::Array(items) => SectionText::Items(
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        ),
        _ => return None,
    };
    (!section.is_empty()).then_some(section)
}

fn tags_field(obj: &Map<String, Value>) -> Vec<String> {
    match obj.get("tags") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn topics_field(obj: &Map<String, Value>) -> Vec<TopicAssignment> {
    let raw = obj
        .get("topic_assignments")
        .or_else(|| obj.get("moc_assignments"));
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|v| match v {
            Value::String(name) => Some(TopicAssignment {
                name: name.clone(),
                ..Default::default()
            }),
            other => serde_json::from_value::<TopicAssignment>(other.clone()).ok(),
        })
        .filter(|t| !t.name.trim().is_empty())
        .collect()
}

fn metadata_prompt(text: &str) -> String {
    format!(
        r#"Extract only the bibliographic information from the paper text below.
Respond with JSON only, in exactly this shape and with no other commentary:

{{
  "title": "paper title",
  "author": "authors, comma separated",
  "year": "four digit publication year, or an empty string if unknown",
  "journal": "journal, conference or other venue"
}}

Paper text:
{text}
"#
    )
}

fn analysis_prompt(biblio: &Biblio, catalog: &str, text: &str) -> String {
    format!(
        r#"You are an expert reader of academic papers. Analyze the paper below and
respond with JSON only, in exactly this shape and with no other commentary.

Bibliographic information (for reference):
- Title: {title}
- Author: {author}
- Year: {year}
- Journal: {journal}

{{
  "abstract": "the paper's abstract, verbatim",
  "key_claims": ["key claim 1", "key claim 2", "key claim 3"],
  "method": "summary of the research method",
  "findings": ["1. finding", "2. finding", "3. finding"],
  "excerpts": "markdown string in this layout:\n### **Paper analysis**\n#### **1. [theme]**\n- [excerpt or commentary grounded in the text]\n#### **2. [theme]**\n- [excerpt or commentary grounded in the text]\n### **Executive summary**\n[3 to 5 sentences on practical implications]",
  "tags": ["tag1", "tag2", "tag3"],
  "topic_assignments": [
    {{"name": "MOC_Existing-Topic", "is_new": false}},
    {{"name": "MOC_New-Topic", "is_new": true, "description": "research hub for the new topic"}}
  ]
}}

Topic hub rules:
- Existing topic hubs:
{catalog}
- Choose 1 to 3 fitting existing hubs with "is_new": false.
- If none fits, propose a new hub with "is_new": true; names start with MOC_.

Paper text:
{text}
"#,
        title = biblio.title,
        author = biblio.author,
        year = biblio.year,
        journal = biblio.journal,
    )
}

/// What an excerpt rewrite is based on: the note's own sections, or the
/// paper text when those are still placeholders.
#[derive(Debug, Clone, Default)]
pub struct ExcerptSource {
    pub biblio: Biblio,
    pub abstract_text: String,
    pub key_claims: String,
    pub method: String,
    pub findings: String,
    pub full_text: String,
}

impl ExcerptSource {
    /// Sections with real content to work from.
    pub fn has_section_content(&self) -> bool {
        [&self.abstract_text, &self.key_claims, &self.findings]
            .into_iter()
            .any(|s| s.trim().chars().count() > MIN_SECTION_CHARS && !is_placeholder_text(s))
    }

    pub fn is_empty(&self) -> bool {
        !self.has_section_content() && self.full_text.trim().is_empty()
    }
}

fn excerpts_prompt(source: &ExcerptSource) -> String {
    let b = &source.biblio;
    let material = if source.has_section_content() {
        format!(
            "[Abstract]\n{}\n\n[Key claims]\n{}\n\n[Method]\n{}\n\n[Findings]\n{}",
            take_chars(&source.abstract_text, 2_000),
            take_chars(&source.key_claims, 1_500),
            take_chars(&source.method, 1_000),
            take_chars(&source.findings, 1_500),
        )
    } else {
        format!("[Paper text]\n{}", take_chars(&source.full_text, STAGE1_TEXT_CHARS))
    };
    format!(
        r#"You are an expert reader of academic papers. Write the excerpts section of a
literature note from the material below. Output markdown only, no JSON and no
commentary, in exactly this layout with 2 to 4 themes:

{EXCERPT_HEADING}

#### **1. [theme]**
[2 to 3 sentences of analysis grounded in the paper]

* **[concept]:** [explanation]
* **[concept]:** [explanation]

#### **2. [theme]**
[analysis]

### **Executive summary**
[3 to 5 sentences on practical and research implications]

Paper:
- Title: {title}
- Author: {author}
- Year: {year}
- Journal: {journal}

{material}
"#,
        title = take_chars(&b.title, 200),
        author = take_chars(&b.author, 100),
        year = b.year,
        journal = take_chars(&b.journal, 100),
    )
}

/// Strip a surrounding ```` ```markdown ```` fence.
fn strip_fence(text: &str) -> &str {
    let text = text.trim();
    let inner = text
        .strip_prefix("```markdown")
        .or_else(|| text.strip_prefix("```md"))
        .or_else(|| text.strip_prefix("```"))
        .map(|rest| rest.strip_suffix("```").unwrap_or(rest));
    inner.unwrap_or(text).trim()
}

/// Runs the two-stage analysis against an [`LlmBackend`].
pub struct Analyzer<B> {
    backend: B,
    model: String,
    lite_model: String,
    request_delay: Duration,
}

impl<B: LlmBackend> Analyzer<B> {
    pub fn new(backend: B, model: impl Into<String>, lite_model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
            lite_model: lite_model.into(),
            request_delay: Duration::ZERO,
        }
    }

    /// Pause after every model call, failed ones included.
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Analyze `doc`. With `biblio` the library's fields are authoritative and
    /// the lite stage is skipped.
    ///
    /// Rate limits and temporary failures are returned as errors so the item
    /// is retried later; every other problem degrades to the fallback.
    pub async fn analyze(
        &self,
        doc: &ExtractedDocument,
        biblio: Option<&Biblio>,
        hubs: &TopicHubs,
        breaker: &mut CircuitBreaker,
    ) -> Result<Analysis, AnalysisError> {
        let mut result = fallback_analysis(doc);
        let text = take_chars(&doc.full_text, MAX_TEXT_CHARS);

        match biblio {
            Some(biblio) => {
                debug!("Using library metadata; skipping bibliographic stage");
                overlay(&mut result.biblio, biblio);
                if !biblio.abstract_note.trim().is_empty() {
                    result.abstract_text = biblio.abstract_note.trim().to_string();
                }
            }
            None => {
                if is_thesis(doc) {
                    info!("{} looks like a thesis; using metadata only", doc.file_name);
                    return Ok(result);
                }
                let prompt = metadata_prompt(&take_chars(&text, STAGE1_TEXT_CHARS));
                if let Some(raw) = self.call(&self.lite_model, &prompt, breaker).await? {
                    match parse_json_response(&raw) {
                        Some(obj) => {
                            let stage1 = Biblio {
                                title: text_field(&obj, "title"),
                                author: text_field(&obj, "author"),
                                year: text_field(&obj, "year"),
                                journal: text_field(&obj, "journal"),
                                ..Default::default()
                            };
                            overlay(&mut result.biblio, &stage1);
                            debug!("Bibliographic stage done for {}", doc.file_name);
                        }
                        None => warn!("Unparseable bibliographic response for {}", doc.file_name),
                    }
                }
            }
        }

        let catalog = match hubs.scan().await {
            Ok(found) => TopicHubs::catalog_text(&found),
            Err(e) => {
                warn!("Failed to scan topic hubs in {}: {}", hubs.dir().display(), e);
                TopicHubs::catalog_text(&Default::default())
            }
        };
        let prompt = analysis_prompt(&result.biblio, &catalog, &text);
        let Some(raw) = self.call(&self.model, &prompt, breaker).await? else {
            return Ok(result);
        };
        let Some(obj) = parse_json_response(&raw) else {
            warn!("Unparseable analysis response for {}; using metadata only", doc.file_name);
            return Ok(result);
        };

        let abstract_text = text_field(&obj, "abstract");
        if !abstract_text.is_empty() {
            result.abstract_text = abstract_text;
        }
        if let Some(claims) = section_field(&obj, "key_claims") {
            result.key_claims = claims;
        }
        if let Some(method) = section_field(&obj, "method") {
            result.method = method.to_bullets();
        }
        if let Some(findings) = section_field(&obj, "findings") {
            result.findings = findings;
        }
        if let Some(excerpts) = section_field(&obj, "excerpts") {
            result.excerpts = excerpts;
        }
        let tags = tags_field(&obj);
        if !tags.is_empty() {
            result.biblio.tags = tags;
        }
        result.topics = topics_field(&obj);
        result.degraded = false;
        info!("Analysis done for {}", doc.file_name);
        Ok(result)
    }

    /// Rewrite a note's excerpts with the full model.
    ///
    /// `Ok(None)` when the model is unavailable or its answer lacks the
    /// structured layout.
    pub async fn regenerate_excerpts(
        &self,
        source: &ExcerptSource,
        breaker: &mut CircuitBreaker,
    ) -> Result<Option<String>, AnalysisError> {
        let Some(raw) = self.call(&self.model, &excerpts_prompt(source), breaker).await? else {
            return Ok(None);
        };
        let text = strip_fence(&raw);
        if !text.contains(EXCERPT_HEADING) {
            warn!("Excerpt answer from {} lacks the expected layout", self.model);
            return Ok(None);
        }
        Ok(Some(text.to_string()))
    }

    /// One model call. `Ok(None)` means "use the fallback".
    async fn call(
        &self,
        model: &str,
        prompt: &str,
        breaker: &mut CircuitBreaker,
    ) -> Result<Option<String>, AnalysisError> {
        if !breaker.allows(model) {
            debug!("Model {} is unavailable; skipping call", model);
            return Ok(None);
        }

        let result = self.backend.generate(model, prompt).await;
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
        match result {
            Ok(text) => {
                breaker.record_success(model);
                Ok(Some(text))
            }
            Err(LlmError::Permanent(reason)) => {
                breaker.record_permanent_failure(model, &reason);
                Ok(None)
            }
            Err(LlmError::Malformed(reason)) => {
                warn!("Model {} returned a malformed response: {}", model, reason);
                Ok(None)
            }
            Err(source) => Err(AnalysisError::Unavailable {
                model: model.to_string(),
                source,
            }),
        }
    }
}
