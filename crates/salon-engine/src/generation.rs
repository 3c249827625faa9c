use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use image::{Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use salon_contracts::events::EventWriter;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::config::ReplicateSettings;
use crate::error::{Error, Result};
use crate::fetch::{data_url_for, HttpImageFetcher, ImageFetcher};
use crate::{error_chain_text, map_object, record_event, response_json_or_error, truncate_text};

/// A provider result that produces its URL on demand.
pub trait FileOutput: Send + fmt::Debug {
    fn url(&self) -> Option<String>;
}

/// Raw result of one provider call, before normalization.
#[derive(Debug)]
pub enum ProviderOutput {
    /// A plain URL string.
    Url(String),
    /// A file handle exposing a URL accessor.
    File(Box<dyn FileOutput>),
    /// A structured record carrying a `url` field.
    Record(Map<String, Value>),
    /// Anything else the provider sent back.
    Unknown(Value),
}

/// Files delivered as a JSON list of URLs; the accessor yields the first one.
#[derive(Debug, Clone)]
struct DeliveredFiles {
    urls: Vec<String>,
}

impl FileOutput for DeliveredFiles {
    fn url(&self) -> Option<String> {
        self.urls.first().cloned()
    }
}

impl ProviderOutput {
    /// Classify a JSON output payload into one of the recognized shapes.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::String(url) => ProviderOutput::Url(url),
            Value::Object(map) => ProviderOutput::Record(map),
            Value::Array(rows)
                if !rows.is_empty() && rows.iter().all(|row| row.is_string()) =>
            {
                let urls = rows
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                ProviderOutput::File(Box::new(DeliveredFiles { urls }))
            }
            other => ProviderOutput::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    Url,
    Accessor,
    Field,
}

impl OutputShape {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputShape::Url => "url",
            OutputShape::Accessor => "accessor",
            OutputShape::Field => "field",
        }
    }
}

#[derive(Debug)]
pub struct ProviderReply {
    pub output: ProviderOutput,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
}

pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> Option<&str> {
        None
    }

    /// Verify the provider is usable without generating anything.
    fn check(&self) -> anyhow::Result<String>;

    fn run(&self, instruction: &str, source_urls: &[String]) -> anyhow::Result<ProviderReply>;
}

/// Normalized result of one generation call.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub url: String,
    pub shape: OutputShape,
    pub provider: String,
    pub model: Option<String>,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
}

pub struct GenerationClient {
    provider: Box<dyn GenerationProvider>,
    events: EventWriter,
}

impl GenerationClient {
    pub fn new(provider: Box<dyn GenerationProvider>, events: EventWriter) -> Self {
        Self { provider, events }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn model(&self) -> Option<&str> {
        self.provider.model()
    }

    pub fn check(&self) -> Result<String> {
        self.provider.check().map_err(|err| self.generation_error(&err))
    }

    /// One remote call. Failures are returned as-is; retry policy belongs to the caller.
    pub fn invoke(&self, instruction: &str, source_urls: &[String]) -> Result<GenerationResult> {
        let started = Instant::now();
        let reply = self
            .provider
            .run(instruction, source_urls)
            .map_err(|err| self.generation_error(&err))?;
        let (url, shape) = normalize_output(reply.output)?;

        record_event(
            &self.events,
            "generation_completed",
            json!({
                "provider": self.provider.name(),
                "model": self.provider.model(),
                "source_images": source_urls.len(),
                "output_shape": shape.as_str(),
                "latency_s": started.elapsed().as_secs_f64(),
            }),
        );

        Ok(GenerationResult {
            url,
            shape,
            provider: self.provider.name().to_string(),
            model: self.provider.model().map(str::to_string),
            provider_request: reply.provider_request,
            provider_response: reply.provider_response,
        })
    }

    fn generation_error(&self, err: &anyhow::Error) -> Error {
        Error::Generation {
            provider: self.provider.name().to_string(),
            message: error_chain_text(err, 1024),
        }
    }
}

fn normalize_output(output: ProviderOutput) -> Result<(String, OutputShape)> {
    let (candidate, shape) = match output {
        ProviderOutput::Url(url) => (Some(url), OutputShape::Url),
        ProviderOutput::File(file) => (file.url(), OutputShape::Accessor),
        ProviderOutput::Record(map) => {
            let url = map.get("url").and_then(Value::as_str).map(str::to_string);
            if url.is_none() {
                return Err(unrecognized(&Value::Object(map)));
            }
            (url, OutputShape::Field)
        }
        ProviderOutput::Unknown(value) => return Err(unrecognized(&value)),
    };
    match candidate {
        Some(url) if is_resolvable_url(&url) => Ok((url.trim().to_string(), shape)),
        Some(url) => Err(Error::UnrecognizedProviderOutput(format!(
            "{} output is not a URL: {}",
            shape.as_str(),
            truncate_text(&url, 200)
        ))),
        None => Err(Error::UnrecognizedProviderOutput(format!(
            "{} output produced no URL",
            shape.as_str()
        ))),
    }
}

fn unrecognized(value: &Value) -> Error {
    let rendered = serde_json::to_string(value).unwrap_or_default();
    Error::UnrecognizedProviderOutput(truncate_text(&rendered, 200))
}

fn is_resolvable_url(raw: &str) -> bool {
    let lowered = raw.trim().to_ascii_lowercase();
    ["https://", "http://", "file://", "data:image/"]
        .iter()
        .any(|prefix| lowered.starts_with(prefix) && lowered.len() > prefix.len())
}

pub struct ReplicateProvider {
    settings: ReplicateSettings,
    http: HttpClient,
    fetcher: HttpImageFetcher,
}

impl ReplicateProvider {
    pub fn new(settings: ReplicateSettings) -> Self {
        Self {
            settings,
            http: HttpClient::new(),
            fetcher: HttpImageFetcher::new(),
        }
    }

    fn predictions_endpoint(&self) -> String {
        format!("{}/predictions", self.settings.api_base)
    }

    fn api_key(&self) -> anyhow::Result<&str> {
        self.settings
            .api_token
            .as_deref()
            .context("REPLICATE_API_TOKEN not set")
    }

    /// Replicate cannot reach local files, so `file://` inputs travel inline.
    fn prepare_image_inputs(&self, source_urls: &[String]) -> anyhow::Result<Vec<String>> {
        source_urls
            .iter()
            .map(|url| {
                if url.to_ascii_lowercase().starts_with("file://") {
                    let image = self
                        .fetcher
                        .fetch(url)
                        .with_context(|| format!("failed to inline input image ({url})"))?;
                    Ok(data_url_for(&image))
                } else {
                    Ok(url.clone())
                }
            })
            .collect()
    }

    fn poll_prediction(&self, poll_url: &str, api_key: &str) -> anyhow::Result<Value> {
        let started = Instant::now();
        loop {
            let response = self
                .http
                .get(poll_url)
                .bearer_auth(api_key)
                .send()
                .with_context(|| format!("Replicate poll request failed ({poll_url})"))?;
            let payload = response_json_or_error("Replicate poll", response)?;
            match prediction_status(&payload).as_str() {
                "succeeded" => return Ok(payload),
                "failed" | "canceled" => bail!(prediction_failure(&payload)),
                _ => {}
            }
            if started.elapsed().as_secs_f64() >= self.settings.poll_timeout_s {
                bail!(
                    "Replicate polling timed out after {:.1}s",
                    self.settings.poll_timeout_s
                );
            }
            thread::sleep(Duration::from_secs_f64(self.settings.poll_interval_s));
        }
    }
}

fn prediction_status(prediction: &Value) -> String {
    prediction
        .get("status")
        .and_then(Value::as_str)
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default()
}

fn prediction_failure(prediction: &Value) -> String {
    let detail = prediction
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| truncate_text(&prediction.to_string(), 512));
    format!("Replicate prediction failed: {detail}")
}

impl GenerationProvider for ReplicateProvider {
    fn name(&self) -> &str {
        "replicate"
    }

    fn model(&self) -> Option<&str> {
        Some(self.settings.model.as_str())
    }

    fn check(&self) -> anyhow::Result<String> {
        self.api_key()?;
        Ok(format!(
            "Replicate configured for {} at {}",
            self.settings.model, self.settings.api_base
        ))
    }

    fn run(&self, instruction: &str, source_urls: &[String]) -> anyhow::Result<ProviderReply> {
        let api_key = self.api_key()?;
        let endpoint = self.predictions_endpoint();
        let image_input = self.prepare_image_inputs(source_urls)?;
        let payload = json!({
            "model": self.settings.model,
            "input": {
                "prompt": instruction,
                "image_input": image_input,
            },
        });

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header("Prefer", "wait")
            .json(&payload)
            .send()
            .with_context(|| format!("Replicate request failed ({endpoint})"))?;
        let mut prediction = response_json_or_error("Replicate", response)?;
        let status = prediction_status(&prediction);
        if status != "succeeded" {
            if matches!(status.as_str(), "starting" | "processing") {
                let poll_url = prediction
                    .get("urls")
                    .and_then(Value::as_object)
                    .and_then(|obj| obj.get("get"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("Replicate prediction missing poll URL"))?
                    .to_string();
                prediction = self.poll_prediction(&poll_url, api_key)?;
            } else {
                bail!(prediction_failure(&prediction));
            }
        }

        let output = prediction.get("output").cloned().unwrap_or(Value::Null);
        Ok(ProviderReply {
            output: ProviderOutput::from_json(output),
            provider_request: map_object(json!({
                "endpoint": endpoint,
                "payload": payload,
            })),
            provider_response: map_object(json!({
                "prediction_id": prediction.get("id").cloned().unwrap_or(Value::Null),
                "status": prediction.get("status").cloned().unwrap_or(Value::Null),
                "metrics": prediction.get("metrics").cloned().unwrap_or(Value::Null),
            })),
        })
    }
}

/// Offline provider. Paints a solid PNG whose color is derived from the instruction
/// and inputs, so identical requests produce identical images.
pub struct DryrunProvider {
    out_dir: PathBuf,
    size: u32,
    counter: AtomicU64,
}

impl DryrunProvider {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            size: 256,
            counter: AtomicU64::new(0),
        }
    }
}

fn color_from_request(instruction: &str, source_urls: &[String]) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(instruction.as_bytes());
    for url in source_urls {
        hasher.update(url.as_bytes());
    }
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

impl GenerationProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn model(&self) -> Option<&str> {
        Some("dryrun-image-1")
    }

    fn check(&self) -> anyhow::Result<String> {
        Ok(format!("dryrun provider writing to {}", self.out_dir.display()))
    }

    fn run(&self, instruction: &str, source_urls: &[String]) -> anyhow::Result<ProviderReply> {
        fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("failed to create {}", self.out_dir.display()))?;
        let (r, g, b) = color_from_request(instruction, source_urls);
        let idx = self.counter.fetch_add(1, Ordering::SeqCst);
        let path = self
            .out_dir
            .join(format!("dryrun-{:02x}{:02x}{:02x}-{idx:03}.png", r, g, b));

        let mut image = RgbImage::new(self.size, self.size);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        image
            .save(&path)
            .with_context(|| format!("failed to save {}", path.display()))?;

        let absolute = fs::canonicalize(&path).unwrap_or(path);
        Ok(ProviderReply {
            output: ProviderOutput::Url(format!("file://{}", absolute.to_string_lossy())),
            provider_request: map_object(json!({
                "endpoint": "dryrun-native",
                "payload": {
                    "prompt": instruction,
                    "image_input": source_urls,
                },
            })),
            provider_response: map_object(json!({
                "status": "succeeded",
                "color": hex::encode([r, g, b]),
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProvider, FakeReply};

    fn client(provider: FakeProvider) -> (GenerationClient, EventWriter) {
        let events = EventWriter::memory("session-test");
        (GenerationClient::new(Box::new(provider), events.clone()), events)
    }

    #[test]
    fn plain_string_output_is_used_directly() -> anyhow::Result<()> {
        let (client, events) = client(FakeProvider::replying(vec![FakeReply::Json(json!(
            "https://provider/out1"
        ))]));
        let result = client.invoke("make it so", &[])?;
        assert_eq!(result.url, "https://provider/out1");
        assert_eq!(result.shape, OutputShape::Url);
        assert_eq!(events.recorded_types(), vec!["generation_completed"]);
        Ok(())
    }

    #[test]
    fn url_field_and_accessor_shapes_are_normalized() -> anyhow::Result<()> {
        let (client, _) = client(FakeProvider::replying(vec![
            FakeReply::Json(json!({"url": "https://provider/field.png", "size": 3})),
            FakeReply::Json(json!(["https://provider/first.png", "https://provider/second.png"])),
        ]));
        let field = client.invoke("a", &["https://store/img_1".to_string()])?;
        assert_eq!(field.url, "https://provider/field.png");
        assert_eq!(field.shape, OutputShape::Field);

        let sources = vec![
            "https://store/img_1".to_string(),
            "https://store/img_2".to_string(),
        ];
        let accessor = client.invoke("b", &sources)?;
        assert_eq!(accessor.url, "https://provider/first.png");
        assert_eq!(accessor.shape, OutputShape::Accessor);
        Ok(())
    }

    #[test]
    fn unknown_shapes_fail_loudly() {
        let (client, _) = client(FakeProvider::replying(vec![
            FakeReply::Json(json!(42)),
            FakeReply::Json(json!({"href": "https://provider/x.png"})),
            FakeReply::Json(json!("not a url")),
            FakeReply::Json(Value::Null),
        ]));
        for _ in 0..4 {
            let err = client.invoke("x", &[]).err();
            assert!(matches!(err, Some(Error::UnrecognizedProviderOutput(_))));
        }
    }

    #[test]
    fn provider_failure_surfaces_message_without_retry() {
        let provider = FakeProvider::replying(vec![
            FakeReply::Fail("model overloaded".to_string()),
            FakeReply::Json(json!("https://provider/never.png")),
        ]);
        let calls = provider.calls();
        let (client, _) = client(provider);

        match client.invoke("x", &[]) {
            Err(Error::Generation { provider, message }) => {
                assert_eq!(provider, "fake");
                assert!(message.contains("model overloaded"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.lock().map(|calls| calls.len()).unwrap_or(0), 1);
    }

    #[test]
    fn dryrun_provider_is_deterministic_per_request() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = EventWriter::memory("session-test");
        let client = GenerationClient::new(Box::new(DryrunProvider::new(temp.path())), events);

        let sources = vec!["https://store/img_1".to_string()];
        let first = client.invoke("seat them", &sources)?;
        let second = client.invoke("seat them", &sources)?;
        let other = client.invoke("restyle them", &sources)?;
        assert!(first.url.starts_with("file://"));
        assert_ne!(first.url, second.url);
        assert_eq!(
            first.provider_response["color"],
            second.provider_response["color"]
        );
        assert_ne!(
            first.provider_response["color"],
            other.provider_response["color"]
        );

        let fetched = HttpImageFetcher::new().fetch(&first.url)?;
        assert_eq!(fetched.content_type.as_deref(), Some("image/png"));
        Ok(())
    }

    #[test]
    fn replicate_without_token_fails_check() {
        let provider = ReplicateProvider::new(ReplicateSettings {
            api_token: None,
            ..ReplicateSettings::default()
        });
        let err = provider.check().err().map(|err| err.to_string());
        assert_eq!(err.as_deref(), Some("REPLICATE_API_TOKEN not set"));
        assert_eq!(provider.model(), Some("google/nano-banana"));
    }
}
