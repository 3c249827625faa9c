use std::path::Path;

use anyhow::{bail, Context};
use reqwest::blocking::Response as HttpResponse;
use salon_contracts::events::EventWriter;
use serde_json::{Map, Value};

mod blob;
mod config;
mod engine;
mod error;
mod fetch;
mod generation;
mod pipeline;
mod transform;

#[cfg(test)]
mod testing;

pub use blob::{BlobStore, HttpBlobStore, LocalBlobStore, StorageId, UploadSlot};
pub use config::{BlobBackend, EngineConfig, ProviderKind, ReplicateSettings};
pub use engine::SalonEngine;
pub use error::{Error, FailureReport, Result};
pub use fetch::{FetchedImage, HttpImageFetcher, ImageFetcher};
pub use generation::{
    DryrunProvider, FileOutput, GenerationClient, GenerationProvider, GenerationResult,
    OutputShape, ProviderOutput, ProviderReply, ReplicateProvider,
};
pub use pipeline::{
    AssetHandle, AssetId, AssetView, PipelineStage, RestyleTicket, SessionPipeline,
    SessionSnapshot, UploadStatus,
};
pub use transform::{GeneratedImage, TransformInputs, TransformationService};

/// Event logging must never fail a pipeline operation.
pub(crate) fn record_event(events: &EventWriter, event_type: &str, payload: Value) {
    if let Err(err) = events.emit(event_type, map_object(payload)) {
        eprintln!("salon warning: failed to record {event_type} event: {err:#}");
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> anyhow::Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

/// Image MIME type implied by a file extension, matched case-insensitively.
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

/// Best guess at an image MIME type from leading magic bytes.
pub(crate) fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some("image/png");
    }
    if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        return Some("image/jpeg");
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if bytes.starts_with(b"GIF8") {
        return Some("image/gif");
    }
    None
}
