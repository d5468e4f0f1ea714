//! File attachments for a chat turn: images get base64-inlined, text files
//! get read verbatim, everything else is referenced by name only.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MAX_FILE_SIZE: u64 = 20 * 1024 * 1024;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];
const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "json", "csv", "xml", "yaml", "yml"];

/// A single file attached to a chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub path: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(default)]
    pub base64_data: Option<String>,
}

/// Holds the attachments queued for the next completion request.
#[derive(Debug, Default)]
pub struct AttachmentManager {
    attachments: Vec<Attachment>,
}

fn extension_lower(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn guess_mime_type(path: &Path) -> String {
    match extension_lower(path).as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "json" => "application/json",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "yaml" | "yml" => "application/x-yaml",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
    .to_string()
}

impl AttachmentManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file as an attachment. Returns a human-readable status line on
    /// success, mirroring the tool-result string shown to the model.
    pub fn add_attachment(&mut self, file_path: &str) -> Result<String, String> {
        let path: PathBuf = match std::fs::canonicalize(file_path) {
            Ok(p) => p,
            Err(_) => return Err(format!("File not found: {file_path}")),
        };

        if !path.is_file() {
            return Err(format!("Not a file: {file_path}"));
        }

        let size = path
            .metadata()
            .map_err(|e| format!("Error adding attachment: {e}"))?
            .len();

        if size > MAX_FILE_SIZE {
            return Err(format!(
                "File too large: {:.1}MB (max: {}MB)",
                size as f64 / 1024.0 / 1024.0,
                MAX_FILE_SIZE / 1024 / 1024
            ));
        }

        let mime_type = guess_mime_type(&path);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let ext = extension_lower(&path);
        let base64_data = if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            let bytes = std::fs::read(&path).map_err(|e| format!("Error adding attachment: {e}"))?;
            Some(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                bytes,
            ))
        } else {
            None
        };

        let attachment = Attachment {
            path: path.to_string_lossy().to_string(),
            name: name.clone(),
            mime_type: mime_type.clone(),
            size,
            base64_data,
        };
        self.attachments.push(attachment);

        Ok(format!(
            "Added: {name} ({mime_type}, {:.1}KB)",
            size as f64 / 1024.0
        ))
    }

    pub fn remove_attachment(&mut self, index: usize) -> Result<String, String> {
        if index < self.attachments.len() {
            let removed = self.attachments.remove(index);
            Ok(format!("Removed: {}", removed.name))
        } else {
            Err("Invalid attachment index".to_string())
        }
    }

    pub fn clear_attachments(&mut self) {
        self.attachments.clear();
    }

    pub fn list_attachments(&self) -> Vec<serde_json::Value> {
        self.attachments
            .iter()
            .enumerate()
            .map(|(index, a)| {
                let size = if a.size < 1024 * 1024 {
                    format!("{:.1}KB", a.size as f64 / 1024.0)
                } else {
                    format!("{:.1}MB", a.size as f64 / 1024.0 / 1024.0)
                };
                serde_json::json!({
                    "index": index,
                    "name": a.name,
                    "type": a.mime_type,
                    "size": size,
                })
            })
            .collect()
    }

    /// Render queued attachments into provider-agnostic content blocks ready
    /// to splice into a user turn.
    pub fn prepare_for_api(&self) -> Vec<serde_json::Value> {
        self.attachments
            .iter()
            .map(|a| {
                if let Some(data) = &a.base64_data {
                    serde_json::json!({
                        "type": "image_url",
                        "image_url": { "url": format!("data:{};base64,{}", a.mime_type, data) },
                    })
                } else {
                    let ext = extension_lower(Path::new(&a.path));
                    if TEXT_EXTENSIONS.contains(&ext.as_str()) {
                        match std::fs::read_to_string(&a.path) {
                            Ok(content) => serde_json::json!({
                                "type": "text",
                                "text": format!("[File: {}]\n{}", a.name, content),
                            }),
                            Err(e) => serde_json::json!({
                                "type": "text",
                                "text": format!("[Error reading {}: {}]", a.name, e),
                            }),
                        }
                    } else {
                        serde_json::json!({
                            "type": "text",
                            "text": format!("[Attached file: {} ({})]", a.name, a.mime_type),
                        })
                    }
                }
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.attachments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn add_text_attachment_round_trips_through_prepare_for_api() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("notes.md");
        let mut f = std::fs::File::create(&file_path).unwrap();
        writeln!(f, "hello world").unwrap();

        let mut manager = AttachmentManager::new();
        let msg = manager.add_attachment(file_path.to_str().unwrap()).unwrap();
        assert!(msg.starts_with("Added: notes.md"));

        let prepared = manager.prepare_for_api();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0]["type"], "text");
        assert!(prepared[0]["text"].as_str().unwrap().contains("hello world"));
    }

    #[test]
    fn missing_file_is_rejected() {
        let mut manager = AttachmentManager::new();
        let err = manager.add_attachment("/no/such/file.txt").unwrap_err();
        assert!(err.starts_with("File not found"));
    }

    #[test]
    fn remove_out_of_range_index_errors() {
        let mut manager = AttachmentManager::new();
        let err = manager.remove_attachment(0).unwrap_err();
        assert_eq!(err, "Invalid attachment index");
    }
}
