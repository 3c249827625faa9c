use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::{error_chain_text, now_utc_iso, response_json_or_error, sniff_image_mime};

/// Opaque durable reference to bytes persisted in a blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(String);

impl StorageId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id with every character outside `[A-Za-z0-9_-]` replaced by `_`, safe to
    /// embed in a file name.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                    ch
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StorageId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Single-use write destination handed out by [`BlobStore::create_upload_slot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSlot {
    pub url: String,
}

pub trait BlobStore: Send + Sync {
    /// Reserve a write destination. Nothing is visible in the store until bytes land.
    fn create_upload_slot(&self) -> Result<UploadSlot>;

    /// Write raw bytes with their content type to a slot, consuming it.
    fn write_slot(&self, slot: &UploadSlot, bytes: &[u8], content_type: &str) -> Result<StorageId>;

    /// Fetchable URL for stored bytes, `None` when the identifier is unknown.
    fn resolve(&self, id: &StorageId) -> Result<Option<String>>;

    fn store(&self, bytes: &[u8], content_type: Option<&str>) -> Result<StorageId> {
        let content_type = content_type
            .or_else(|| sniff_image_mime(bytes))
            .unwrap_or("application/octet-stream");
        let slot = self.create_upload_slot()?;
        self.write_slot(&slot, bytes, content_type)
    }
}

/// Filesystem-backed store. Identifiers are sequential (`img_1`, `img_2`, ...) and
/// bytes are staged then renamed so a failed write never leaves a visible blob.
#[derive(Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_base: Option<String>,
    state: Mutex<LocalState>,
}

#[derive(Debug, Default)]
struct LocalState {
    next_id: u64,
    open_slots: HashSet<String>,
}

const SLOT_SCHEME: &str = "slot://";

impl LocalBlobStore {
    pub fn open(root: impl Into<PathBuf>, public_base: Option<String>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(".staging"))
            .map_err(|err| Error::storage(&format!("failed to create {}", root.display()), err))?;
        let next_id = highest_existing_id(&root) + 1;
        Ok(Self {
            root,
            public_base: public_base
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty()),
            state: Mutex::new(LocalState {
                next_id,
                open_slots: HashSet::new(),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, id: &StorageId) -> Option<PathBuf> {
        let raw = id.as_str();
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        valid.then(|| self.root.join(raw))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LocalState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn highest_existing_id(root: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(root) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("img_"))
                .and_then(|tail| tail.parse::<u64>().ok())
        })
        .max()
        .unwrap_or(0)
}

impl BlobStore for LocalBlobStore {
    fn create_upload_slot(&self) -> Result<UploadSlot> {
        let token = Uuid::new_v4().to_string();
        self.lock_state().open_slots.insert(token.clone());
        Ok(UploadSlot {
            url: format!("{SLOT_SCHEME}{token}"),
        })
    }

    fn write_slot(&self, slot: &UploadSlot, bytes: &[u8], content_type: &str) -> Result<StorageId> {
        let token = slot
            .url
            .strip_prefix(SLOT_SCHEME)
            .ok_or_else(|| Error::Storage(format!("not a local upload slot: {}", slot.url)))?;
        if !self.lock_state().open_slots.remove(token) {
            return Err(Error::Storage(format!(
                "upload slot already used or unknown: {}",
                slot.url
            )));
        }
        if bytes.is_empty() {
            return Err(Error::Storage("refusing to store an empty payload".to_string()));
        }

        let staged = self.root.join(".staging").join(token);
        fs::write(&staged, bytes)
            .map_err(|err| Error::storage(&format!("failed to write {}", staged.display()), err))?;

        let id = {
            let mut state = self.lock_state();
            let id = StorageId::new(format!("img_{}", state.next_id));
            state.next_id += 1;
            id
        };
        let meta = json!({
            "content_type": content_type,
            "bytes": bytes.len(),
            "stored_at": now_utc_iso(),
        });
        let meta_path = self.root.join(format!("{id}.meta.json"));
        let final_path = self.root.join(id.as_str());
        let written = fs::write(&meta_path, meta.to_string())
            .and_then(|_| fs::rename(&staged, &final_path));
        if let Err(err) = written {
            let _ = fs::remove_file(&staged);
            let _ = fs::remove_file(&meta_path);
            return Err(Error::storage(&format!("failed to commit blob {id}"), err));
        }
        Ok(id)
    }

    fn resolve(&self, id: &StorageId) -> Result<Option<String>> {
        let Some(path) = self.blob_path(id) else {
            return Ok(None);
        };
        if !path.is_file() {
            return Ok(None);
        }
        let url = match &self.public_base {
            Some(base) => format!("{base}/{id}"),
            None => {
                let absolute = fs::canonicalize(&path).unwrap_or(path);
                format!("file://{}", absolute.to_string_lossy())
            }
        };
        Ok(Some(url))
    }
}

/// Client for an HTTP blob service that hands out upload URLs:
///
/// - `POST {api}/upload-url` answers `{"uploadUrl": "..."}`
/// - `POST <uploadUrl>` with the raw bytes answers `{"storageId": "..."}`
/// - `GET {api}/files/{id}/url` answers `{"url": "..."}`, `{"url": null}` or 404
pub struct HttpBlobStore {
    api_base: String,
    http: HttpClient,
}

impl HttpBlobStore {
    pub fn new(api_base: &str) -> Self {
        Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
        }
    }

    fn storage_error(context: &str, err: anyhow::Error) -> Error {
        Error::Storage(format!("{context}: {}", error_chain_text(&err, 512)))
    }

    /// `{api}/files/{id}/url` with the id percent-encoded as a single path segment.
    fn resolve_endpoint(&self, id: &StorageId) -> Result<Url> {
        let mut url = Url::parse(&self.api_base).map_err(|err| {
            Error::Storage(format!("invalid blob api base {}: {err}", self.api_base))
        })?;
        url.path_segments_mut()
            .map_err(|_| Error::Storage(format!("blob api base has no path: {}", self.api_base)))?
            .pop_if_empty()
            .extend(["files", id.as_str(), "url"]);
        Ok(url)
    }
}

impl BlobStore for HttpBlobStore {
    fn create_upload_slot(&self) -> Result<UploadSlot> {
        let endpoint = format!("{}/upload-url", self.api_base);
        let payload = self
            .http
            .post(&endpoint)
            .send()
            .map_err(anyhow::Error::from)
            .and_then(|response| response_json_or_error("Blob store", response))
            .map_err(|err| Self::storage_error("upload slot request failed", err))?;
        let url = payload
            .get("uploadUrl")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::Storage("blob store returned no uploadUrl".to_string()))?;
        Ok(UploadSlot {
            url: url.to_string(),
        })
    }

    fn write_slot(&self, slot: &UploadSlot, bytes: &[u8], content_type: &str) -> Result<StorageId> {
        let payload = self
            .http
            .post(&slot.url)
            .header(CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .map_err(anyhow::Error::from)
            .and_then(|response| response_json_or_error("Blob upload", response))
            .map_err(|err| Self::storage_error("upload failed", err))?;
        payload
            .get("storageId")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(StorageId::new)
            .ok_or_else(|| Error::Storage("blob upload returned no storageId".to_string()))
    }

    fn resolve(&self, id: &StorageId) -> Result<Option<String>> {
        let endpoint = self.resolve_endpoint(id)?;
        let response = self
            .http
            .get(endpoint)
            .send()
            .map_err(|err| Self::storage_error("resolve request failed", err.into()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let payload = response_json_or_error("Blob resolve", response)
            .map_err(|err| Self::storage_error("resolve failed", err))?;
        Ok(payload
            .get("url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string))
    }
}
