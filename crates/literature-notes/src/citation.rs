//! Citation fields shared by notes and the reference library.

use serde::{Deserialize, Serialize};

/// A labelled line in a note's Citation section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CitationField {
    Author,
    Year,
    Journal,
    Publisher,
    Volume,
    Issue,
    Pages,
    Doi,
    Issn,
    Url,
    Language,
    Tags,
}

impl CitationField {
    /// Every field in the order it appears in a rendered note.
    pub const ALL: [CitationField; 12] = [
        CitationField::Author,
        CitationField::Year,
        CitationField::Journal,
        CitationField::Publisher,
        CitationField::Volume,
        CitationField::Issue,
        CitationField::Pages,
        CitationField::Doi,
        CitationField::Issn,
        CitationField::Url,
        CitationField::Language,
        CitationField::Tags,
    ];

    /// Fields backfilled from the reference library, in merge order.
    pub const BIBLIOGRAPHIC: [CitationField; 11] = [
        CitationField::Author,
        CitationField::Year,
        CitationField::Journal,
        CitationField::Publisher,
        CitationField::Volume,
        CitationField::Issue,
        CitationField::Pages,
        CitationField::Doi,
        CitationField::Issn,
        CitationField::Url,
        CitationField::Language,
    ];

    pub fn label(self) -> &'static str {
        match self {
            CitationField::Author => "Author",
            CitationField::Year => "Year",
            CitationField::Journal => "Journal",
            CitationField::Publisher => "Publisher",
            CitationField::Volume => "Volume",
            CitationField::Issue => "Issue",
            CitationField::Pages => "Pages",
            CitationField::Doi => "DOI",
            CitationField::Issn => "ISSN",
            CitationField::Url => "URL",
            CitationField::Language => "Language",
            CitationField::Tags => "Tags",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.label() == label)
    }
}

/// Flat bibliographic record, the common currency between the reference
/// library, note rendering and the merge engine.
///
/// Values are plain strings; an empty string means "unknown".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Biblio {
    pub title: String,
    pub author: String,
    pub year: String,
    pub journal: String,
    pub publisher: String,
    pub volume: String,
    pub issue: String,
    pub pages: String,
    pub doi: String,
    pub issn: String,
    pub url: String,
    pub language: String,
    #[serde(rename = "abstract")]
    pub abstract_note: String,
    pub tags: Vec<String>,
}

impl Biblio {
    /// Value for a citation field. Tags are joined as hashtags.
    pub fn get(&self, field: CitationField) -> String {
        match field {
            CitationField::Author => self.author.clone(),
            CitationField::Year => self.year.clone(),
            CitationField::Journal => self.journal.clone(),
            CitationField::Publisher => self.publisher.clone(),
            CitationField::Volume => self.volume.clone(),
            CitationField::Issue => self.issue.clone(),
            CitationField::Pages => self.pages.clone(),
            CitationField::Doi => self.doi.clone(),
            CitationField::Issn => self.issn.clone(),
            CitationField::Url => self.url.clone(),
            CitationField::Language => self.language.clone(),
            CitationField::Tags => crate::render::format_hashtags(&self.tags),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_round_trip() {
        for field in CitationField::ALL {
            assert_eq!(CitationField::from_label(field.label()), Some(field));
        }
        assert_eq!(CitationField::from_label("Editor"), None);
    }

    #[test]
    fn test_biblio_get() {
        let biblio = Biblio {
            doi: "10.1/abc".into(),
            tags: vec!["Deep Learning".into(), "nlp".into()],
            ..Default::default()
        };
        assert_eq!(biblio.get(CitationField::Doi), "10.1/abc");
        assert_eq!(biblio.get(CitationField::Tags), "#deep-learning #nlp");
        assert_eq!(biblio.get(CitationField::Volume), "");
    }
}
