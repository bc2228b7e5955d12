use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::database::{Database, NewFile};
use crate::errors::{ApiError, ApiResult};
use crate::file_storage::StorageBackend;
use crate::models::{File, FileWithCard};
use crate::{log_service_error, log_service_start, log_service_success, log_service_warn};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Allow-listed changes accepted by a file PATCH.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilePatch {
    pub name: Option<String>,
    /// `Some(None)` detaches the file from its card.
    pub card_pk: Option<Option<i64>>,
}

impl FilePatch {
    /// Build a patch from a request body; only `name` and `card_pk` are accepted.
    pub fn from_json(value: &Value) -> ApiResult<Self> {
        let fields = value.as_object().ok_or_else(|| {
            ApiError::ValidationError("Request body must be a JSON object".to_string())
        })?;
        if fields.is_empty() {
            return Err(ApiError::ValidationError("No update data provided".to_string()));
        }

        let mut patch = FilePatch::default();
        for (key, field) in fields {
            match key.as_str() {
                "name" => {
                    let name = field
                        .as_str()
                        .map(str::trim)
                        .filter(|n| !n.is_empty())
                        .ok_or_else(|| {
                            ApiError::ValidationError("name must be a non-empty string".to_string())
                        })?;
                    patch.name = Some(name.to_string());
                }
                "card_pk" => {
                    let card_pk = match field {
                        Value::Null => None,
                        other => Some(other.as_i64().ok_or_else(|| {
                            ApiError::ValidationError(
                                "card_pk must be an integer or null".to_string(),
                            )
                        })?),
                    };
                    patch.card_pk = Some(card_pk);
                }
                other => {
                    return Err(ApiError::ValidationError(format!(
                        "Unknown field '{}'",
                        other
                    )));
                }
            }
        }
        Ok(patch)
    }
}

/// An attachment received from a multipart upload.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub original_name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
    pub card_pk: Option<i64>,
}

/// A blob ready to be sent back to the client.
#[derive(Debug, Clone)]
pub struct FileDownload {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[derive(Clone)]
pub struct FileService {
    db: Database,
    storage: Arc<dyn StorageBackend>,
}

impl FileService {
    pub fn new(db: Database, storage: Arc<dyn StorageBackend>) -> Self {
        Self { db, storage }
    }

    /// Store the blob, then record its metadata row.
    ///
    /// The blob is removed again if the row cannot be written, so a failed
    /// upload leaves neither a row nor an orphaned blob.
    pub async fn upload(&self, user_id: i64, upload: FileUpload) -> ApiResult<FileWithCard> {
        log_service_start!("file_service", "upload");

        let name = sanitize_filename(&upload.original_name)
            .ok_or_else(|| ApiError::ValidationError("No selected file".to_string()))?;

        if let Some(card_pk) = upload.card_pk {
            self.require_card(card_pk).await?;
        }

        let extension = Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();
        let storage_key = format!("{}{}", Uuid::new_v4(), extension);

        self.storage
            .write(&storage_key, &upload.data)
            .await
            .map_err(|e| {
                log_service_error!("file_service", "upload", error = e);
                ApiError::StorageError(format!("{:#}", e))
            })?;

        let new_file = NewFile {
            name,
            file_type: upload
                .content_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            path: self.storage.location(&storage_key),
            filename: storage_key.clone(),
            size: upload.data.len() as i64,
            card_pk: upload.card_pk,
            user_id,
        };

        let file_id = match self.db.insert_file(&new_file).await {
            Ok(id) => id,
            Err(e) => {
                if let Err(cleanup) = self.storage.delete(&storage_key).await {
                    log_service_warn!(
                        "file_service",
                        "upload",
                        format!("failed to remove blob {}: {:#}", storage_key, cleanup)
                    );
                }
                return Err(e.into());
            }
        };

        log_service_success!(
            "file_service",
            "upload",
            format!("file {} stored as {}", file_id, storage_key)
        );
        let file = self.get(file_id).await?;
        self.with_card(file).await
    }

    /// Metadata for a live file.
    pub async fn get(&self, id: i64) -> ApiResult<File> {
        self.db
            .get_file(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("File not found".to_string()))
    }

    /// Every live file, each with its attached card (if any).
    pub async fn list(&self) -> ApiResult<Vec<FileWithCard>> {
        let files = self.db.list_files().await?;
        let mut results = Vec::with_capacity(files.len());
        for file in files {
            results.push(self.with_card(file).await?);
        }
        Ok(results)
    }

    /// Rename and/or re-attach a file. Validation happens before any write.
    pub async fn patch(&self, id: i64, body: &Value, user_id: i64) -> ApiResult<File> {
        let patch = FilePatch::from_json(body)?;
        if let Some(Some(card_pk)) = patch.card_pk {
            self.require_card(card_pk).await?;
        }

        if !self.db.update_file(id, &patch, user_id).await? {
            return Err(ApiError::NotFound("File not found".to_string()));
        }
        self.get(id).await
    }

    /// Flag the file as deleted; the blob stays on disk.
    pub async fn soft_delete(&self, id: i64, user_id: i64) -> ApiResult<()> {
        if !self.db.soft_delete_file(id, user_id).await? {
            return Err(ApiError::NotFound("File not found".to_string()));
        }
        log_service_success!("file_service", "soft_delete", format!("file {} flagged deleted", id));
        Ok(())
    }

    pub async fn download(&self, id: i64) -> ApiResult<FileDownload> {
        let file = self.get(id).await?;

        let present = self
            .storage
            .exists(&file.filename)
            .await
            .map_err(|e| ApiError::StorageError(format!("{:#}", e)))?;
        if !present {
            log_service_warn!(
                "file_service",
                "download",
                format!("blob {} missing for file {}", file.filename, id)
            );
            return Err(ApiError::NotFound("File content not found".to_string()));
        }

        let data = self
            .storage
            .read(&file.filename)
            .await
            .map_err(|e| ApiError::StorageError(format!("{:#}", e)))?;

        Ok(FileDownload {
            name: file.name,
            content_type: file.file_type,
            data,
        })
    }

    async fn with_card(&self, file: File) -> ApiResult<FileWithCard> {
        let card = match file.card_pk {
            Some(card_pk) => self.db.get_partial_card(card_pk).await?,
            None => None,
        };
        Ok(FileWithCard { file, card })
    }

    async fn require_card(&self, card_pk: i64) -> ApiResult<()> {
        match self.db.get_partial_card(card_pk).await? {
            Some(_) => Ok(()),
            None => Err(ApiError::NotFound(format!(
                "Card with id '{}' not found",
                card_pk
            ))),
        }
    }
}

/// Reduce a client-supplied filename to a safe display name.
///
/// Directory components are dropped, whitespace and characters outside
/// `[A-Za-z0-9._-]` become `_`, and leading or trailing dots and underscores
/// are trimmed. Returns `None` when nothing usable remains.
pub fn sanitize_filename(original: &str) -> Option<String> {
    let base = original.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
