use std::path::Path;

/// Ingestion source formats. Inferred from the uploaded filename extension
/// on the upload path, stored on the job, and used by the parser router as
/// the fallback dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "source_type", rename_all = "lowercase")]
pub enum SourceType {
    Pdf,
    Docx,
    Txt,
    Csv,
    Xlsx,
    Html,
}

impl SourceType {
    pub fn from_filename(filename: &str) -> Option<Self> {
        let extension = Path::new(filename).extension()?.to_str()?.to_lowercase();
        match extension.as_str() {
            "pdf" => Some(SourceType::Pdf),
            "docx" | "doc" => Some(SourceType::Docx),
            "txt" | "text" | "md" => Some(SourceType::Txt),
            "csv" => Some(SourceType::Csv),
            "xlsx" | "xls" => Some(SourceType::Xlsx),
            "html" | "htm" => Some(SourceType::Html),
            _ => None,
        }
    }

    /// Canonical MIME type, the secondary key in the parser dispatch table.
    pub fn canonical_mime(&self) -> &'static str {
        match self {
            SourceType::Pdf => "application/pdf",
            SourceType::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            SourceType::Txt => "text/plain",
            SourceType::Csv => "text/csv",
            SourceType::Xlsx => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            SourceType::Html => "text/html",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Pdf => "pdf",
            SourceType::Docx => "docx",
            SourceType::Txt => "txt",
            SourceType::Csv => "csv",
            SourceType::Xlsx => "xlsx",
            SourceType::Html => "html",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
