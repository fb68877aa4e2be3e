//! Structured literature note.
//!
//! A note is parsed into three parts:
//! ```markdown
//! ---
//! title: "Deep Learning for X"
//! zotero_key: K1
//! doi:
//! ---
//!
//! ## Citation
//! - **DOI**:
//! ```
//! - the header block, an ordered list of `key: value` entries,
//! - the body, where lines of the form `- **Label**: value` inside the
//!   `## Citation` section are recognized as citation fields,
//! - everything else, kept verbatim.
//!
//! Every line remembers its exact text and line ending, so a note that is
//! parsed and not edited serializes back byte-for-byte. Header and citation
//! edits are limited to filling blank entries and inserting missing ones.
//! The only overwriting edit is [`Note::replace_section`], which swaps the
//! content of a whole `##` body section.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::citation::CitationField;

static HEADER_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_-]*):([ \t]*)(.*)$").expect("valid regex"));
static CITATION_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\s*[-*]\s+)\*\*([^*]+)\*\*:([ \t]*)(.*)$").expect("valid regex")
});
static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.*)$").expect("valid regex"));
static BLOCK_LIST_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s+-\s+(.*)$").expect("valid regex"));

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NoteError {
    #[error("note has no header block")]
    MissingHeader,

    #[error("note has no Citation section")]
    MissingCitationSection,

    #[error("note has no {0} section")]
    MissingSection(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Line {
    text: String,
    eol: String,
}

impl Line {
    fn write_to(&self, out: &mut String) {
        out.push_str(&self.text);
        out.push_str(&self.eol);
    }
}

fn split_lines(raw: &str) -> Vec<Line> {
    raw.split_inclusive('\n')
        .map(|chunk| {
            if let Some(text) = chunk.strip_suffix("\r\n") {
                Line { text: text.to_string(), eol: "\r\n".to_string() }
            } else if let Some(text) = chunk.strip_suffix('\n') {
                Line { text: text.to_string(), eol: "\n".to_string() }
            } else {
                Line { text: chunk.to_string(), eol: String::new() }
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HeaderEntry {
    Field {
        key: String,
        sep: String,
        value: String,
        eol: String,
    },
    Raw(Line),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    open: Line,
    entries: Vec<HeaderEntry>,
    close: Line,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CitationLine {
    prefix: String,
    field: CitationField,
    sep: String,
    value: String,
    eol: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BodyLine {
    Citation(CitationLine),
    /// A `## Citation` heading. Tracked so missing fields can be inserted.
    CitationHeading(Line),
    Text(Line),
}

/// A parsed literature note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    header: Option<Header>,
    body: Vec<BodyLine>,
}

/// Placeholder values left by generated templates, such as `> [summarize ...]` or a lone `-`.
fn is_placeholder(value: &str) -> bool {
    value.starts_with('>') || value == "-"
}

/// Whether `text` is a level-1 or level-2 heading.
fn is_top_heading(text: &str) -> bool {
    HEADING.captures(text).is_some_and(|caps| caps[1].len() <= 2)
}

/// `## Name` or a bilingual `## ... (Name)` heading.
fn is_section_heading(text: &str, name: &str) -> bool {
    let Some(caps) = HEADING.captures(text) else {
        return false;
    };
    if caps[1].len() != 2 {
        return false;
    }
    let title = caps[2].trim();
    title.eq_ignore_ascii_case(name) || title.ends_with(&format!("({name})"))
}

impl Note {
    pub fn parse(raw: &str) -> Self {
        let lines = split_lines(raw);

        let (header, body_start) = match Self::parse_header(&lines) {
            Some((header, consumed)) => (Some(header), consumed),
            None => (None, 0),
        };

        let mut body = Vec::with_capacity(lines.len() - body_start);
        let mut in_citation = false;
        for line in lines.into_iter().skip(body_start) {
            if let Some(caps) = HEADING.captures(&line.text) {
                let level = caps[1].len();
                if level <= 2 {
                    in_citation = level == 2 && caps[2].to_lowercase().contains("citation");
                }
                if in_citation && level == 2 {
                    body.push(BodyLine::CitationHeading(line));
                    continue;
                }
            } else if in_citation {
                if let Some(citation) = Self::parse_citation_line(&line) {
                    body.push(BodyLine::Citation(citation));
                    continue;
                }
            }
            body.push(BodyLine::Text(line));
        }

        Self { header, body }
    }

    fn parse_header(lines: &[Line]) -> Option<(Header, usize)> {
        let open = lines.first()?;
        if open.text != "---" {
            return None;
        }
        let close_idx = lines.iter().skip(1).position(|l| l.text == "---")? + 1;

        let entries = lines[1..close_idx]
            .iter()
            .map(|line| match HEADER_FIELD.captures(&line.text) {
                Some(caps) => HeaderEntry::Field {
                    key: caps[1].to_string(),
                    sep: caps[2].to_string(),
                    value: caps[3].to_string(),
                    eol: line.eol.clone(),
                },
                None => HeaderEntry::Raw(line.clone()),
            })
            .collect();

        let header = Header {
            open: open.clone(),
            entries,
            close: lines[close_idx].clone(),
        };
        Some((header, close_idx + 1))
    }

    fn parse_citation_line(line: &Line) -> Option<CitationLine> {
        let caps = CITATION_LINE.captures(&line.text)?;
        let field = CitationField::from_label(caps[2].trim())?;
        Some(CitationLine {
            prefix: caps[1].to_string(),
            field,
            sep: caps[3].to_string(),
            value: caps[4].to_string(),
            eol: line.eol.clone(),
        })
    }

    /// Serialize back to markdown. Untouched notes reproduce their input exactly.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        if let Some(header) = &self.header {
            header.open.write_to(&mut out);
            for entry in &header.entries {
                match entry {
                    HeaderEntry::Field { key, sep, value, eol } => {
                        out.push_str(key);
                        out.push(':');
                        out.push_str(sep);
                        out.push_str(value);
                        out.push_str(eol);
                    }
                    HeaderEntry::Raw(line) => line.write_to(&mut out),
                }
            }
            header.close.write_to(&mut out);
        }
        for line in &self.body {
            match line {
                BodyLine::Citation(c) => {
                    out.push_str(&c.prefix);
                    out.push_str("**");
                    out.push_str(c.field.label());
                    out.push_str("**:");
                    out.push_str(&c.sep);
                    out.push_str(&c.value);
                    out.push_str(&c.eol);
                }
                BodyLine::CitationHeading(line) | BodyLine::Text(line) => line.write_to(&mut out),
            }
        }
        out
    }

    // ==================== Header ====================

    pub fn has_header(&self) -> bool {
        self.header.is_some()
    }

    /// Raw header value, trimmed. `None` when the key is absent.
    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.header.as_ref()?.entries.iter().find_map(|entry| match entry {
            HeaderEntry::Field { key: k, value, .. } if k == key => Some(value.trim()),
            _ => None,
        })
    }

    /// Header value decoded as a YAML scalar, e.g. a quoted title.
    fn header_scalar(&self, key: &str) -> Option<String> {
        let raw = self.header_value(key)?;
        if raw.is_empty() {
            return None;
        }
        let decoded = match serde_yaml::from_str::<serde_yaml::Value>(raw) {
            Ok(serde_yaml::Value::String(s)) => s,
            Ok(serde_yaml::Value::Number(n)) => n.to_string(),
            _ => raw.to_string(),
        };
        Some(decoded)
    }

    pub fn title(&self) -> Option<String> {
        self.header_scalar("title")
    }

    pub fn year(&self) -> Option<String> {
        self.header_scalar("year")
    }

    /// Back-reference to the reference-library item, if set.
    pub fn zotero_key(&self) -> Option<&str> {
        self.header_value("zotero_key").filter(|k| !k.is_empty())
    }

    /// Header tags, supporting both `[a, b]` and block-list forms.
    pub fn tags(&self) -> Vec<String> {
        let Some(header) = &self.header else {
            return Vec::new();
        };
        let Some(idx) = header.entries.iter().position(
            |e| matches!(e, HeaderEntry::Field { key, .. } if key == "tags"),
        ) else {
            return Vec::new();
        };
        let raw = match &header.entries[idx] {
            HeaderEntry::Field { value, .. } => value.trim(),
            HeaderEntry::Raw(_) => return Vec::new(),
        };

        if raw.is_empty() {
            return header.entries[idx + 1..]
                .iter()
                .map_while(|entry| match entry {
                    HeaderEntry::Raw(line) => BLOCK_LIST_ITEM
                        .captures(&line.text)
                        .map(|caps| caps[1].trim().to_string()),
                    HeaderEntry::Field { .. } => None,
                })
                .filter(|t| !t.is_empty())
                .collect();
        }

        match serde_yaml::from_str::<serde_yaml::Value>(raw) {
            Ok(serde_yaml::Value::Sequence(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    serde_yaml::Value::String(s) => Some(s),
                    serde_yaml::Value::Number(n) => Some(n.to_string()),
                    serde_yaml::Value::Bool(b) => Some(b.to_string()),
                    _ => None,
                })
                .filter(|t| !t.trim().is_empty())
                .collect(),
            _ => raw
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    /// Fill a header entry only if it is blank.
    ///
    /// A missing key is inserted after `created:` (or at the end of the
    /// header). Returns whether the note changed; populated entries are never
    /// touched.
    pub fn fill_header(&mut self, key: &str, value: &str) -> Result<bool, NoteError> {
        let header = self.header.as_mut().ok_or(NoteError::MissingHeader)?;
        let value = value.trim();
        if value.is_empty() {
            return Ok(false);
        }

        for entry in header.entries.iter_mut() {
            if let HeaderEntry::Field { key: k, sep, value: v, .. } = entry {
                if k.as_str() == key {
                    if !v.trim().is_empty() {
                        return Ok(false);
                    }
                    *sep = " ".to_string();
                    *v = value.to_string();
                    return Ok(true);
                }
            }
        }

        Self::insert_header_entry(header, key, value);
        Ok(true)
    }

    /// Add an empty `key:` entry if the header lacks one.
    pub fn ensure_header_key(&mut self, key: &str) -> Result<bool, NoteError> {
        let header = self.header.as_mut().ok_or(NoteError::MissingHeader)?;
        let present = header
            .entries
            .iter()
            .any(|e| matches!(e, HeaderEntry::Field { key: k, .. } if k == key));
        if present {
            return Ok(false);
        }
        Self::insert_header_entry(header, key, "");
        Ok(true)
    }

    fn insert_header_entry(header: &mut Header, key: &str, value: &str) {
        let anchor = header
            .entries
            .iter()
            .position(|e| matches!(e, HeaderEntry::Field { key, .. } if key == "created"));
        let at = anchor.map(|i| i + 1).unwrap_or(header.entries.len());
        let eol = match header.entries.get(at.saturating_sub(1)) {
            Some(HeaderEntry::Field { eol, .. }) | Some(HeaderEntry::Raw(Line { eol, .. }))
                if !eol.is_empty() =>
            {
                eol.clone()
            }
            _ => header.open.eol.clone(),
        };
        header.entries.insert(
            at,
            HeaderEntry::Field {
                key: key.to_string(),
                sep: if value.is_empty() { String::new() } else { " ".to_string() },
                value: value.to_string(),
                eol,
            },
        );
    }

    // ==================== Citation section ====================

    pub fn has_citation_section(&self) -> bool {
        self.body.iter().any(|l| matches!(l, BodyLine::CitationHeading(_)))
    }

    fn citation_line(&self, field: CitationField) -> Option<&CitationLine> {
        self.body.iter().find_map(|line| match line {
            BodyLine::Citation(c) if c.field == field => Some(c),
            _ => None,
        })
    }

    /// Fields that have a line in the Citation section.
    pub fn citation_fields(&self) -> Vec<CitationField> {
        self.body
            .iter()
            .filter_map(|line| match line {
                BodyLine::Citation(c) => Some(c.field),
                _ => None,
            })
            .collect()
    }

    /// Trimmed citation value, treating template placeholders as blank.
    pub fn citation_value(&self, field: CitationField) -> Option<&str> {
        let value = self.citation_line(field)?.value.trim();
        if value.is_empty() || is_placeholder(value) {
            None
        } else {
            Some(value)
        }
    }

    /// True when the field's line exists and nothing but whitespace follows the colon.
    pub fn is_citation_blank(&self, field: CitationField) -> bool {
        self.citation_line(field).is_some_and(|c| c.value.trim().is_empty())
    }

    /// Fill a blank citation line. Returns whether the note changed.
    pub fn fill_citation(&mut self, field: CitationField, value: &str) -> bool {
        let value = value.trim();
        if value.is_empty() {
            return false;
        }
        for line in self.body.iter_mut() {
            if let BodyLine::Citation(c) = line {
                if c.field == field {
                    if !c.value.trim().is_empty() {
                        return false;
                    }
                    c.sep = " ".to_string();
                    c.value = value.to_string();
                    return true;
                }
            }
        }
        false
    }

    // ==================== Body sections ====================

    /// Line range under the `## name` heading, up to the next `#`/`##` heading.
    fn section_range(&self, name: &str) -> Option<std::ops::Range<usize>> {
        let start = self
            .body
            .iter()
            .position(|l| matches!(l, BodyLine::Text(line) if is_section_heading(&line.text, name)))?
            + 1;
        let end = self.body[start..]
            .iter()
            .position(|l| match l {
                BodyLine::Text(line) => is_top_heading(&line.text),
                BodyLine::CitationHeading(_) => true,
                BodyLine::Citation(_) => false,
            })
            .map_or(self.body.len(), |i| start + i);
        Some(start..end)
    }

    /// Trimmed content of a `##` body section. `None` when the heading is absent.
    pub fn section(&self, name: &str) -> Option<String> {
        let range = self.section_range(name)?;
        let mut out = String::new();
        for line in &self.body[range] {
            if let BodyLine::Text(line) = line {
                line.write_to(&mut out);
            }
        }
        Some(out.trim().to_string())
    }

    /// Replace the content of a `##` body section, keeping one blank line
    /// before the next heading. Returns whether the note changed.
    pub fn replace_section(&mut self, name: &str, content: &str) -> Result<bool, NoteError> {
        let range = self
            .section_range(name)
            .ok_or_else(|| NoteError::MissingSection(name.to_string()))?;
        let eol = match &self.body[range.start - 1] {
            BodyLine::Text(line) if !line.eol.is_empty() => line.eol.clone(),
            _ => "\n".to_string(),
        };

        let mut lines: Vec<BodyLine> = content
            .trim_end()
            .lines()
            .map(|text| BodyLine::Text(Line { text: text.to_string(), eol: eol.clone() }))
            .collect();
        if range.end < self.body.len() {
            lines.push(BodyLine::Text(Line { text: String::new(), eol: eol.clone() }));
        }

        if self.body[range.clone()] == lines[..] {
            return Ok(false);
        }
        self.body.splice(range, lines);
        Ok(true)
    }

    /// Insert blank lines for citation fields the note lacks, in template order.
    pub fn ensure_citation_fields(&mut self) -> Result<Vec<CitationField>, NoteError> {
        let heading_idx = self
            .body
            .iter()
            .position(|l| matches!(l, BodyLine::CitationHeading(_)))
            .ok_or(NoteError::MissingCitationSection)?;

        let mut added = Vec::new();
        for (order, field) in CitationField::ALL.into_iter().enumerate() {
            if self.citation_line(field).is_some() {
                continue;
            }
            let preceding = &CitationField::ALL[..order];
            let at = self
                .body
                .iter()
                .rposition(|l| matches!(l, BodyLine::Citation(c) if preceding.contains(&c.field)))
                .unwrap_or(heading_idx)
                + 1;
            let (prefix, eol) = match &self.body[at - 1] {
                BodyLine::Citation(c) => (c.prefix.clone(), c.eol.clone()),
                BodyLine::CitationHeading(l) | BodyLine::Text(l) => ("- ".to_string(), l.eol.clone()),
            };
            self.body.insert(
                at,
                BodyLine::Citation(CitationLine {
                    prefix,
                    field,
                    sep: String::new(),
                    value: String::new(),
                    eol: if eol.is_empty() { "\n".to_string() } else { eol },
                }),
            );
            added.push(field);
        }
        Ok(added)
    }
}
