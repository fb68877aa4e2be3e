//! PDF text and metadata extraction with lopdf.

use std::path::Path;

use lopdf::{Dictionary, Document, Object};
use sync_core::{ExtractError, ExtractedDocument, Extractor, PdfMetadata};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct LopdfExtractor;

impl LopdfExtractor {
    pub fn new() -> Self {
        Self
    }
}

/// PDF text strings are UTF-16BE with a byte order mark, or a single-byte
/// encoding that is close enough to Latin-1 for titles and names.
fn decode_text_string(bytes: &[u8]) -> String {
    if let Some(utf16) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = utf16
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn info_dictionary(doc: &Document) -> Option<&Dictionary> {
    match doc.trailer.get(b"Info").ok()? {
        Object::Reference(id) => doc.get_dictionary(*id).ok(),
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

fn info_value(info: Option<&Dictionary>, key: &[u8]) -> String {
    match info.and_then(|dict| dict.get(key).ok()) {
        Some(Object::String(bytes, _)) => decode_text_string(bytes).trim().to_string(),
        _ => String::new(),
    }
}

fn metadata(doc: &Document) -> PdfMetadata {
    let info = info_dictionary(doc);
    PdfMetadata {
        title: info_value(info, b"Title"),
        author: info_value(info, b"Author"),
        subject: info_value(info, b"Subject"),
        creator: info_value(info, b"Creator"),
        producer: info_value(info, b"Producer"),
        creation_date: info_value(info, b"CreationDate"),
        mod_date: info_value(info, b"ModDate"),
    }
}

impl Extractor for LopdfExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, ExtractError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size = std::fs::metadata(path)?.len();
        let doc = Document::load(path).map_err(|e| ExtractError::Parse {
            file: file_name.clone(),
            reason: e.to_string(),
        })?;

        let pages = doc.get_pages();
        let mut full_text = String::new();
        for page in pages.keys() {
            match doc.extract_text(&[*page]) {
                Ok(text) => full_text.push_str(&text),
                Err(e) => debug!("No text on page {} of {}: {}", page, file_name, e),
            }
        }

        Ok(ExtractedDocument {
            metadata: metadata(&doc),
            page_count: pages.len() as u32,
            file_size_kb: (size as f64 / 1024.0 * 10.0).round() / 10.0,
            full_text,
            file_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Stream};
    use tempfile::TempDir;

    fn write_pdf(path: &Path, title: &str) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal("Hello")]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        let info_id = doc.add_object(dictionary! {
            "Title" => Object::string_literal(title),
            "CreationDate" => Object::string_literal("D:20210304120000"),
        });
        doc.trailer.set("Root", catalog_id);
        doc.trailer.set("Info", info_id);
        doc.save(path).unwrap();
    }

    #[test]
    fn test_extract_metadata_and_pages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("paper.pdf");
        write_pdf(&path, "Sparse Attention");

        let doc = LopdfExtractor::new().extract(&path).unwrap();
        assert_eq!(doc.file_name, "paper.pdf");
        assert_eq!(doc.page_count, 1);
        assert_eq!(doc.metadata.title, "Sparse Attention");
        assert_eq!(doc.metadata.creation_date, "D:20210304120000");
        assert!(doc.file_size_kb > 0.0);
    }

    #[test]
    fn test_unreadable_pdf_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"not a pdf").unwrap();

        let err = LopdfExtractor::new().extract(&path).unwrap_err();
        assert!(matches!(err, ExtractError::Parse { ref file, .. } if file == "broken.pdf"));
    }

    #[test]
    fn test_decode_text_string() {
        assert_eq!(decode_text_string(b"\xFE\xFF\x00H\x00i"), "Hi");
        assert_eq!(decode_text_string("Déjà".as_bytes()), "Déjà");
        assert_eq!(decode_text_string(b"caf\xE9"), "café");
    }
}
