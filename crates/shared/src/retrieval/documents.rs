use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use walkdir::WalkDir;

use super::KnowledgeBaseError;

pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["txt", "md", "pdf"];

const SAMPLE_FILE_NAME: &str = "sample.txt";
const SAMPLE_FILE_CONTENT: &str = "Guardrails ensure LLMs follow strict validation rules. \
The orchestrator coordinates retrieval, generation and validation.";

#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Path relative to the documents directory, with `/` separators.
    pub source_id: String,
    pub filename: String,
    pub extension: String,
    pub content: String,
    pub file_size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

pub fn is_supported_extension(extension: &str) -> bool {
    SUPPORTED_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str())
}

pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

/// Creates `docs_path` with a sample document if it does not exist yet.
pub fn ensure_docs_dir(docs_path: &Path) -> Result<(), KnowledgeBaseError> {
    if docs_path.exists() {
        return Ok(());
    }

    fs::create_dir_all(docs_path).map_err(|err| KnowledgeBaseError::io(docs_path, err))?;
    let sample = docs_path.join(SAMPLE_FILE_NAME);
    fs::write(&sample, SAMPLE_FILE_CONTENT).map_err(|err| KnowledgeBaseError::io(&sample, err))?;
    info!(path = %docs_path.display(), "created documents directory with sample file");
    Ok(())
}

/// Loads every supported file below `docs_path`, sorted by source id.
/// Unreadable files are logged and skipped.
pub fn load_documents(docs_path: &Path) -> Result<Vec<SourceDocument>, KnowledgeBaseError> {
    ensure_docs_dir(docs_path)?;

    let mut documents = Vec::new();
    for path in supported_files(docs_path)? {
        match read_document(docs_path, &path) {
            Ok(document) => documents.push(document),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable document"),
        }
    }

    documents.sort_by(|left, right| left.source_id.cmp(&right.source_id));
    info!(count = documents.len(), path = %docs_path.display(), "loaded documents");
    Ok(documents)
}

/// Supported files below `docs_path`. Symlinks are not followed, so a link
/// cannot pull files from outside the directory or loop back into it.
pub fn supported_files(docs_path: &Path) -> Result<Vec<PathBuf>, KnowledgeBaseError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(docs_path).sort_by_file_name() {
        let entry = entry.map_err(|err| KnowledgeBaseError::Io {
            path: err.path().unwrap_or(docs_path).display().to_string(),
            message: err.to_string(),
        })?;
        if entry.file_type().is_file()
            && extension_of(entry.path()).is_some_and(|ext| is_supported_extension(&ext))
        {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

/// Text content of a document. PDFs go through `lopdf`, everything else must
/// be UTF-8.
pub fn document_text(
    name: &str,
    extension: &str,
    bytes: &[u8],
) -> Result<String, KnowledgeBaseError> {
    if extension.eq_ignore_ascii_case("pdf") {
        return pdf_text(name, bytes);
    }

    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| KnowledgeBaseError::InvalidDocument(format!("{name}: not valid UTF-8 text")))
}

fn pdf_text(name: &str, bytes: &[u8]) -> Result<String, KnowledgeBaseError> {
    let invalid = |err: lopdf::Error| KnowledgeBaseError::InvalidDocument(format!("{name}: {err}"));

    let document = lopdf::Document::load_mem(bytes).map_err(invalid)?;
    let pages = document.get_pages().keys().copied().collect::<Vec<_>>();
    if pages.is_empty() {
        return Ok(String::new());
    }
    document.extract_text(&pages).map_err(invalid)
}

fn read_document(docs_path: &Path, path: &Path) -> Result<SourceDocument, KnowledgeBaseError> {
    let bytes = fs::read(path).map_err(|err| KnowledgeBaseError::io(path, err))?;
    let metadata = fs::metadata(path).map_err(|err| KnowledgeBaseError::io(path, err))?;
    let source_id = source_id(docs_path, path);
    let extension = extension_of(path).unwrap_or_default();
    let content = document_text(&source_id, &extension, &bytes)?;

    Ok(SourceDocument {
        source_id,
        filename: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        extension,
        content,
        file_size: metadata.len(),
        modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
    })
}

pub fn source_id(docs_path: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(docs_path).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Digest over source ids and contents, used to tell whether a persisted
/// index still matches the documents on disk.
pub fn fingerprint(documents: &[SourceDocument]) -> String {
    let mut hasher = Sha256::new();
    for document in documents {
        hasher.update(document.source_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(document.content.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Single-page PDF with `text` drawn in a standard font.
#[cfg(test)]
pub(crate) fn pdf_fixture(text: &str) -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::{Document, Object, Stream, dictionary};

    let mut document = Document::with_version("1.5");
    let pages_id = document.new_object_id();
    let font_id = document.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = document.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });
    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 12.into()]),
            Operation::new("Td", vec![72.into(), 720.into()]),
            Operation::new("Tj", vec![Object::string_literal(text)]),
            Operation::new("ET", vec![]),
        ],
    };
    let content_id = document.add_object(Stream::new(
        dictionary! {},
        content.encode().expect("content should encode"),
    ));
    let page_id = document.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
    });
    document.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = document.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    document.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    document.save_to(&mut bytes).expect("pdf should serialize");
    bytes
}
