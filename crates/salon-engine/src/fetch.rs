use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;

use crate::error::{Error, Result};
use crate::{error_chain_text, mime_for_path, sniff_image_mime, truncate_text};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Retrieves image bytes behind a URL. Provider result URLs are usually short-lived,
/// so results are fetched once and persisted.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<FetchedImage>;
}

/// Fetches `http(s)://` over the network, `file://` from disk and `data:` inline.
pub struct HttpImageFetcher {
    http: HttpClient,
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpImageFetcher {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }

    fn fetch_http(&self, url: &str) -> anyhow::Result<FetchedImage> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!("image download failed ({code}): {}", truncate_text(&body, 512));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading image bytes")?
            .to_vec();
        Ok(FetchedImage {
            bytes,
            content_type,
        })
    }
}

/// The remainder of `url` after `scheme`, matching the scheme case-insensitively.
fn strip_scheme<'a>(url: &'a str, scheme: &str) -> Option<&'a str> {
    let head = url.get(..scheme.len())?;
    head.eq_ignore_ascii_case(scheme)
        .then(|| &url[scheme.len()..])
}

fn fetch_file(path: &str) -> anyhow::Result<FetchedImage> {
    let path = PathBuf::from(path);
    let bytes = fs::read(&path).with_context(|| format!("failed reading {}", path.display()))?;
    let content_type = mime_for_path(&path)
        .or_else(|| sniff_image_mime(&bytes))
        .map(str::to_string);
    Ok(FetchedImage {
        bytes,
        content_type,
    })
}

fn fetch_data_url(body: &str) -> anyhow::Result<FetchedImage> {
    let Some((header, payload)) = body.split_once(',') else {
        bail!("malformed data URL");
    };
    let Some(mime) = header.strip_suffix(";base64") else {
        bail!("only base64 data URLs are supported");
    };
    let bytes = BASE64
        .decode(payload.trim())
        .context("invalid base64 in data URL")?;
    Ok(FetchedImage {
        bytes,
        content_type: (!mime.is_empty()).then(|| mime.to_string()),
    })
}

pub(crate) fn data_url_for(image: &FetchedImage) -> String {
    let mime = image
        .content_type
        .as_deref()
        .or_else(|| sniff_image_mime(&image.bytes))
        .unwrap_or("image/png");
    format!("data:{mime};base64,{}", BASE64.encode(&image.bytes))
}

impl ImageFetcher for HttpImageFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedImage> {
        let trimmed = url.trim();
        let fetched = if let Some(path) = strip_scheme(trimmed, "file://") {
            fetch_file(path)
        } else if let Some(body) = strip_scheme(trimmed, "data:") {
            fetch_data_url(body)
        } else if strip_scheme(trimmed, "http://").is_some()
            || strip_scheme(trimmed, "https://").is_some()
        {
            self.fetch_http(trimmed)
        } else {
            Err(anyhow::anyhow!("unsupported URL scheme"))
        };
        match fetched {
            Ok(image) if image.bytes.is_empty() => Err(Error::ResultFetch {
                url: truncate_text(trimmed, 256),
                message: "empty response body".to_string(),
            }),
            Ok(image) => Ok(image),
            Err(err) => Err(Error::ResultFetch {
                url: truncate_text(trimmed, 256),
                message: error_chain_text(&err, 512),
            }),
        }
    }
}
