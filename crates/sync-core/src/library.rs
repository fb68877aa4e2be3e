//! Reference library abstraction.
//!
//! Implementations:
//! - `InMemoryLibrary` - For testing
//! - `ZoteroClient` (in sync-daemon) - Zotero Web API v3 over HTTP
//!
//! Every item carries a version. A write names the version it was based on
//! and fails with `LibraryError::VersionConflict` if the item moved on since,
//! so a stale write never overwrites newer remote data.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use literature_notes::Biblio;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"((?:19|20)\d{2})").expect("valid regex"));

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("library temporarily unavailable: {0}")]
    Transient(String),

    #[error("library rejected credentials: {0}")]
    Auth(String),

    #[error("item not found: {0}")]
    NotFound(String),

    #[error("item {key} changed remotely (write was based on version {expected})")]
    VersionConflict { key: String, expected: u64 },

    #[error("malformed library response: {0}")]
    Malformed(String),
}

impl LibraryError {
    /// Errors worth retrying on the next poll.
    pub fn is_transient(&self) -> bool {
        matches!(self, LibraryError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, LibraryError>;

/// Item types that never become notes.
pub const EXCLUDED_ITEM_TYPES: [&str; 4] = ["attachment", "note", "thesis", "dissertation"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Creator {
    pub creator_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub first_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_name: String,
    /// Single-field form used for institutions.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl Creator {
    pub fn author(last_name: &str, first_name: &str) -> Self {
        Self {
            creator_type: "author".to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            name: String::new(),
        }
    }

    /// `Last, First`, or the single name.
    pub fn display_name(&self) -> String {
        match (self.last_name.trim(), self.first_name.trim()) {
            ("", "") => self.name.trim().to_string(),
            (last, "") => last.to_string(),
            ("", first) => first.to_string(),
            (last, first) => format!("{last}, {first}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub tag: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<u8>,
}

impl Tag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into(), kind: None }
    }
}

/// Editable fields of a library item. Fields this crate does not know about
/// are kept in `extra` and written back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemData {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub version: u64,
    pub item_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub creators: Vec<Creator>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub date: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub publication_title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub book_title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proceedings_title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub publisher: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issue: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pages: String,
    #[serde(rename = "DOI", default, skip_serializing_if = "String::is_empty")]
    pub doi: String,
    #[serde(rename = "ISSN", default, skip_serializing_if = "String::is_empty")]
    pub issn: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub abstract_note: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_item: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    /// HTML body of note items.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Scalar fields that can be written back to the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RemoteField {
    Title,
    Date,
    PublicationTitle,
    Publisher,
    Volume,
    Issue,
    Pages,
    Doi,
    Issn,
    Url,
    Language,
    AbstractNote,
}

impl RemoteField {
    /// Field name on the wire.
    pub fn api_name(self) -> &'static str {
        match self {
            RemoteField::Title => "title",
            RemoteField::Date => "date",
            RemoteField::PublicationTitle => "publicationTitle",
            RemoteField::Publisher => "publisher",
            RemoteField::Volume => "volume",
            RemoteField::Issue => "issue",
            RemoteField::Pages => "pages",
            RemoteField::Doi => "DOI",
            RemoteField::Issn => "ISSN",
            RemoteField::Url => "url",
            RemoteField::Language => "language",
            RemoteField::AbstractNote => "abstractNote",
        }
    }
}

impl ItemData {
    pub fn get(&self, field: RemoteField) -> &str {
        match field {
            RemoteField::Title => &self.title,
            RemoteField::Date => &self.date,
            RemoteField::PublicationTitle => &self.publication_title,
            RemoteField::Publisher => &self.publisher,
            RemoteField::Volume => &self.volume,
            RemoteField::Issue => &self.issue,
            RemoteField::Pages => &self.pages,
            RemoteField::Doi => &self.doi,
            RemoteField::Issn => &self.issn,
            RemoteField::Url => &self.url,
            RemoteField::Language => &self.language,
            RemoteField::AbstractNote => &self.abstract_note,
        }
    }

    pub fn set(&mut self, field: RemoteField, value: String) {
        let slot = match field {
            RemoteField::Title => &mut self.title,
            RemoteField::Date => &mut self.date,
            RemoteField::PublicationTitle => &mut self.publication_title,
            RemoteField::Publisher => &mut self.publisher,
            RemoteField::Volume => &mut self.volume,
            RemoteField::Issue => &mut self.issue,
            RemoteField::Pages => &mut self.pages,
            RemoteField::Doi => &mut self.doi,
            RemoteField::Issn => &mut self.issn,
            RemoteField::Url => &mut self.url,
            RemoteField::Language => &mut self.language,
            RemoteField::AbstractNote => &mut self.abstract_note,
        };
        *slot = value;
    }

    pub fn is_excluded_type(&self) -> bool {
        EXCLUDED_ITEM_TYPES.contains(&self.item_type.as_str())
    }

    /// Authors as `Last, First; Last, First`. Editors and other roles are left out.
    pub fn authors(&self) -> String {
        self.creators
            .iter()
            .filter(|c| c.creator_type == "author")
            .map(Creator::display_name)
            .filter(|n| !n.is_empty())
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn year(&self) -> String {
        YEAR.captures(&self.date)
            .map(|caps| caps[1].to_string())
            .unwrap_or_default()
    }

    /// Journal, book, proceedings or publisher, whichever is set first.
    pub fn container_title(&self) -> &str {
        [
            &self.publication_title,
            &self.book_title,
            &self.proceedings_title,
            &self.publisher,
        ]
        .into_iter()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .unwrap_or("")
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.tags.iter().map(|t| t.tag.clone()).collect()
    }

    /// Flat bibliographic record for notes and analysis.
    pub fn biblio(&self) -> Biblio {
        Biblio {
            title: self.title.trim().to_string(),
            author: self.authors(),
            year: self.year(),
            journal: self.container_title().to_string(),
            publisher: self.publisher.trim().to_string(),
            volume: self.volume.trim().to_string(),
            issue: self.issue.trim().to_string(),
            pages: self.pages.trim().to_string(),
            doi: self.doi.trim().to_string(),
            issn: self.issn.trim().to_string(),
            url: self.url.trim().to_string(),
            language: self.language.trim().to_string(),
            abstract_note: self.abstract_note.trim().to_string(),
            tags: self.tag_names(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub key: String,
    pub version: u64,
    pub data: ItemData,
}

/// Partial update of an item. Only the listed fields are sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdate {
    pub fields: BTreeMap<RemoteField, String>,
    /// Replaces the whole tag list when set.
    pub tags: Option<Vec<String>>,
    /// Replaces the creator list when set.
    pub creators: Option<Vec<Creator>>,
}

impl FieldUpdate {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.tags.is_none() && self.creators.is_none()
    }

    pub fn set(&mut self, field: RemoteField, value: impl Into<String>) {
        self.fields.insert(field, value.into());
    }

    /// Names of the fields this update touches, for logging.
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.fields.keys().map(|f| f.api_name()).collect();
        if self.tags.is_some() {
            names.push("tags");
        }
        if self.creators.is_some() {
            names.push("creators");
        }
        names
    }

    /// JSON body for a partial update request.
    pub fn to_json(&self) -> Value {
        let mut body = Map::new();
        for (field, value) in &self.fields {
            body.insert(field.api_name().to_string(), Value::String(value.clone()));
        }
        if let Some(tags) = &self.tags {
            let tags: Vec<Tag> = tags.iter().map(Tag::new).collect();
            body.insert("tags".to_string(), serde_json::to_value(tags).unwrap_or_default());
        }
        if let Some(creators) = &self.creators {
            body.insert(
                "creators".to_string(),
                serde_json::to_value(creators).unwrap_or_default(),
            );
        }
        Value::Object(body)
    }

    fn apply_to(&self, data: &mut ItemData) {
        for (field, value) in &self.fields {
            data.set(*field, value.clone());
        }
        if let Some(tags) = &self.tags {
            data.tags = tags.iter().map(Tag::new).collect();
        }
        if let Some(creators) = &self.creators {
            data.creators = creators.clone();
        }
    }
}

/// Outcome of a batch create, by position in the submitted batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateResult {
    pub created: BTreeMap<usize, String>,
    pub failed: BTreeMap<usize, String>,
}

/// Remote, versioned store of bibliographic items.
#[async_trait]
pub trait Library: Send + Sync {
    /// Top-level items (no attachments) changed after `since`.
    async fn items_since(&self, since: u64) -> Result<Vec<Item>>;

    /// Current library version marker.
    async fn library_version(&self) -> Result<u64>;

    async fn item(&self, key: &str) -> Result<Item>;

    /// Attachments and notes under an item.
    async fn children(&self, key: &str) -> Result<Vec<Item>>;

    /// Apply `update` if the item is still at `version`. Returns the new version.
    async fn update_item(&self, key: &str, version: u64, update: &FieldUpdate) -> Result<u64>;

    async fn create_items(&self, items: &[ItemData]) -> Result<CreateResult>;

    /// Delete if the item is still at `version`.
    async fn delete_item(&self, key: &str, version: u64) -> Result<()>;
}

#[derive(Debug, Default)]
struct LibraryInner {
    version: u64,
    items: BTreeMap<String, Item>,
    next_key: u64,
    offline: bool,
}

/// In-memory library for testing, following the remote versioning rules.
#[derive(Debug, Default)]
pub struct InMemoryLibrary {
    inner: Mutex<LibraryInner>,
}

impl InMemoryLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LibraryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add an item as if created remotely. Uses `data.key` when set.
    pub fn insert(&self, mut data: ItemData) -> String {
        let mut inner = self.lock();
        inner.version += 1;
        let version = inner.version;
        if data.key.is_empty() {
            inner.next_key += 1;
            data.key = format!("GEN{:05}", inner.next_key);
        }
        data.version = version;
        let key = data.key.clone();
        inner.items.insert(key.clone(), Item { key: key.clone(), version, data });
        key
    }

    /// Edit an item as a remote user would, bumping its version.
    pub fn edit(&self, key: &str, f: impl FnOnce(&mut ItemData)) {
        let mut inner = self.lock();
        inner.version += 1;
        let version = inner.version;
        if let Some(item) = inner.items.get_mut(key) {
            f(&mut item.data);
            item.version = version;
            item.data.version = version;
        }
    }

    pub fn get(&self, key: &str) -> Option<Item> {
        self.lock().items.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every call fail with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    fn check_online(inner: &LibraryInner) -> Result<()> {
        if inner.offline {
            Err(LibraryError::Transient("library offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Library for InMemoryLibrary {
    async fn items_since(&self, since: u64) -> Result<Vec<Item>> {
        let inner = self.lock();
        Self::check_online(&inner)?;
        Ok(inner
            .items
            .values()
            .filter(|item| item.version > since)
            .filter(|item| item.data.parent_item.is_none())
            .filter(|item| item.data.item_type != "attachment")
            .cloned()
            .collect())
    }

    async fn library_version(&self) -> Result<u64> {
        let inner = self.lock();
        Self::check_online(&inner)?;
        Ok(inner.version)
    }

    async fn item(&self, key: &str) -> Result<Item> {
        let inner = self.lock();
        Self::check_online(&inner)?;
        inner
            .items
            .get(key)
            .cloned()
            .ok_or_else(|| LibraryError::NotFound(key.to_string()))
    }

    async fn children(&self, key: &str) -> Result<Vec<Item>> {
        let inner = self.lock();
        Self::check_online(&inner)?;
        Ok(inner
            .items
            .values()
            .filter(|item| item.data.parent_item.as_deref() == Some(key))
            .cloned()
            .collect())
    }

    async fn update_item(&self, key: &str, version: u64, update: &FieldUpdate) -> Result<u64> {
        let mut inner = self.lock();
        Self::check_online(&inner)?;
        let current = inner
            .items
            .get(key)
            .map(|item| item.version)
            .ok_or_else(|| LibraryError::NotFound(key.to_string()))?;
        if current != version {
            return Err(LibraryError::VersionConflict {
                key: key.to_string(),
                expected: version,
            });
        }

        inner.version += 1;
        let new_version = inner.version;
        if let Some(item) = inner.items.get_mut(key) {
            update.apply_to(&mut item.data);
            item.version = new_version;
            item.data.version = new_version;
        }
        Ok(new_version)
    }

    async fn create_items(&self, items: &[ItemData]) -> Result<CreateResult> {
        {
            let inner = self.lock();
            Self::check_online(&inner)?;
        }
        let mut result = CreateResult::default();
        for (idx, data) in items.iter().enumerate() {
            if data.item_type.is_empty() {
                result.failed.insert(idx, "missing itemType".to_string());
                continue;
            }
            let mut data = data.clone();
            data.key.clear();
            let key = self.insert(data);
            result.created.insert(idx, key);
        }
        Ok(result)
    }

    async fn delete_item(&self, key: &str, version: u64) -> Result<()> {
        let mut inner = self.lock();
        Self::check_online(&inner)?;
        let current = inner
            .items
            .get(key)
            .map(|item| item.version)
            .ok_or_else(|| LibraryError::NotFound(key.to_string()))?;
        if current != version {
            return Err(LibraryError::VersionConflict {
                key: key.to_string(),
                expected: version,
            });
        }
        inner.items.remove(key);
        inner.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(key: &str, title: &str) -> ItemData {
        ItemData {
            key: key.to_string(),
            item_type: "journalArticle".to_string(),
            title: title.to_string(),
            ..Default::default()
        }
    }

    // ==================== ItemData tests ====================

    #[test]
    fn test_item_data_deserialize_keeps_unknown_fields() {
        let json = r#"{
            "key": "K1", "version": 3, "itemType": "journalArticle",
            "title": "T", "DOI": "10.1/x", "publicationTitle": "J",
            "creators": [{"creatorType": "author", "firstName": "Jane", "lastName": "Doe"}],
            "tags": [{"tag": "nlp"}, {"tag": "auto", "type": 1}],
            "series": "Lecture Notes", "relations": {}
        }"#;
        let data: ItemData = serde_json::from_str(json).unwrap();
        assert_eq!(data.doi, "10.1/x");
        assert_eq!(data.publication_title, "J");
        assert_eq!(data.extra.get("series"), Some(&Value::String("Lecture Notes".into())));

        let back = serde_json::to_value(&data).unwrap();
        assert_eq!(back["series"], "Lecture Notes");
        assert_eq!(back["DOI"], "10.1/x");
        assert_eq!(back["tags"][1]["type"], 1);
    }

    #[test]
    fn test_biblio_from_item() {
        let data = ItemData {
            item_type: "conferencePaper".into(),
            title: "  A Title ".into(),
            creators: vec![
                Creator::author("Doe", "Jane"),
                Creator {
                    creator_type: "editor".into(),
                    last_name: "Ed".into(),
                    ..Default::default()
                },
                Creator {
                    creator_type: "author".into(),
                    name: "ACME Lab".into(),
                    ..Default::default()
                },
            ],
            date: "March 2021".into(),
            proceedings_title: "Proc. X".into(),
            publisher: "Pub".into(),
            ..Default::default()
        };
        let biblio = data.biblio();
        assert_eq!(biblio.title, "A Title");
        assert_eq!(biblio.author, "Doe, Jane; ACME Lab");
        assert_eq!(biblio.year, "2021");
        assert_eq!(biblio.journal, "Proc. X");
        assert_eq!(biblio.publisher, "Pub");
    }

    #[test]
    fn test_excluded_types() {
        for t in EXCLUDED_ITEM_TYPES {
            let data = ItemData { item_type: t.into(), ..Default::default() };
            assert!(data.is_excluded_type());
        }
        assert!(!article("K", "T").is_excluded_type());
    }

    #[test]
    fn test_field_update_json() {
        let mut update = FieldUpdate::default();
        update.set(RemoteField::Doi, "10.1/x");
        update.tags = Some(vec!["a".into()]);
        assert_eq!(
            update.to_json(),
            serde_json::json!({"DOI": "10.1/x", "tags": [{"tag": "a"}]})
        );
        assert_eq!(update.field_names(), vec!["DOI", "tags"]);
    }

    // ==================== InMemoryLibrary tests ====================

    #[tokio::test]
    async fn test_versions_increase_on_every_mutation() {
        let lib = InMemoryLibrary::new();
        lib.insert(article("K1", "One"));
        let v1 = lib.library_version().await.unwrap();

        let item = lib.item("K1").await.unwrap();
        let mut update = FieldUpdate::default();
        update.set(RemoteField::Volume, "3");
        let v2 = lib.update_item("K1", item.version, &update).await.unwrap();

        assert!(v2 > v1);
        assert_eq!(lib.get("K1").unwrap().data.volume, "3");
        assert_eq!(lib.items_since(v1).await.unwrap().len(), 1);
        assert!(lib.items_since(v2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected() {
        let lib = InMemoryLibrary::new();
        lib.insert(article("K1", "One"));
        let stale = lib.item("K1").await.unwrap().version;
        lib.edit("K1", |d| d.volume = "9".into());

        let mut update = FieldUpdate::default();
        update.set(RemoteField::Volume, "3");
        let err = lib.update_item("K1", stale, &update).await.unwrap_err();
        assert!(matches!(err, LibraryError::VersionConflict { .. }));
        assert_eq!(lib.get("K1").unwrap().data.volume, "9");
    }

    #[tokio::test]
    async fn test_children_and_top_level() {
        let lib = InMemoryLibrary::new();
        lib.insert(article("K1", "One"));
        lib.insert(ItemData {
            key: "A1".into(),
            item_type: "attachment".into(),
            parent_item: Some("K1".into()),
            content_type: "application/pdf".into(),
            ..Default::default()
        });

        assert_eq!(lib.items_since(0).await.unwrap().len(), 1);
        let children = lib.children("K1").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].key, "A1");
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let lib = InMemoryLibrary::new();
        let result = lib
            .create_items(&[article("", "New"), ItemData::default()])
            .await
            .unwrap();
        assert_eq!(result.created.len(), 1);
        assert_eq!(result.failed.len(), 1);

        let key = result.created[&0].clone();
        let version = lib.item(&key).await.unwrap().version;
        assert!(matches!(
            lib.delete_item(&key, version - 1).await,
            Err(LibraryError::VersionConflict { .. })
        ));
        lib.delete_item(&key, version).await.unwrap();
        assert!(lib.is_empty());
    }

    #[tokio::test]
    async fn test_offline_is_transient() {
        let lib = InMemoryLibrary::new();
        lib.set_offline(true);
        let err = lib.items_since(0).await.unwrap_err();
        assert!(err.is_transient());
    }
}
