//! Text extraction for uploaded files.
//!
//! Only `.txt` and `.pdf` uploads are accepted. Text files are decoded as
//! UTF-8, falling back to Latin-1 so legacy files never fail outright.

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Unsupported file type. Only .txt and .pdf allowed.")]
    UnsupportedType,
    #[error("Failed to parse PDF document.")]
    Pdf(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Text,
    Pdf,
}

impl FileKind {
    /// Classify by extension, case-insensitively.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = Path::new(filename).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "txt" => Some(Self::Text),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }
}

/// Final path component of a client-supplied name; `None` if nothing is left.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

pub fn extract_text(filename: &str, bytes: &[u8]) -> Result<String, ExtractError> {
    match FileKind::from_filename(filename).ok_or(ExtractError::UnsupportedType)? {
        FileKind::Text => Ok(decode_text(bytes)),
        FileKind::Pdf => {
            pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
        }
    }
}

fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        // Latin-1 maps each byte to the code point of the same value.
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_extension() {
        assert_eq!(FileKind::from_filename("notes.TXT"), Some(FileKind::Text));
        assert_eq!(FileKind::from_filename("paper.pdf"), Some(FileKind::Pdf));
        assert_eq!(FileKind::from_filename("sheet.xlsx"), None);
        assert_eq!(FileKind::from_filename("README"), None);
    }

    #[test]
    fn strips_directories_from_filenames() {
        assert_eq!(sanitize_filename("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_filename("C:\\docs\\a.txt").as_deref(), Some("a.txt"));
        assert_eq!(sanitize_filename("dir/"), None);
    }

    #[test]
    fn latin1_fallback() {
        let text = extract_text("old.txt", &[b'c', b'a', b'f', 0xE9]).unwrap();
        assert_eq!(text, "café");
    }

    #[test]
    fn rejects_other_types_and_bad_pdfs() {
        assert!(matches!(
            extract_text("x.docx", b"PK"),
            Err(ExtractError::UnsupportedType)
        ));
        assert!(matches!(
            extract_text("x.pdf", b"not a pdf"),
            Err(ExtractError::Pdf(_))
        ));
    }
}
