use std::path::PathBuf;
use std::sync::Arc;

use salon_contracts::events::EventWriter;
use salon_contracts::runs::receipts::{
    build_receipt, write_receipt, ReceiptInputs, ResolvedTransform, TransformOutcome,
    TransformRequest,
};
use serde_json::json;

use crate::blob::{BlobStore, StorageId};
use crate::error::{Error, Result};
use crate::fetch::{FetchedImage, ImageFetcher};
use crate::generation::{GenerationClient, GenerationResult};
use crate::record_event;

/// Result of one transformation. Both references point at the same image content and
/// never change; a new transformation yields a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    result_url: String,
    storage_id: StorageId,
}

impl GeneratedImage {
    pub(crate) fn new(result_url: String, storage_id: StorageId) -> Self {
        Self {
            result_url,
            storage_id,
        }
    }

    /// Provider URL, suitable for immediate display.
    pub fn result_url(&self) -> &str {
        &self.result_url
    }

    /// Durable reference to the persisted copy.
    pub fn storage_id(&self) -> &StorageId {
        &self.storage_id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformInputs {
    pub urls: Vec<String>,
    pub storage_ids: Vec<StorageId>,
}

impl TransformInputs {
    pub fn from_urls(urls: Vec<String>) -> Self {
        Self {
            urls,
            storage_ids: Vec::new(),
        }
    }

    pub fn from_storage_ids(storage_ids: Vec<StorageId>) -> Self {
        Self {
            urls: Vec::new(),
            storage_ids,
        }
    }

    fn to_receipt(&self) -> ReceiptInputs {
        ReceiptInputs {
            urls: self.urls.clone(),
            storage_ids: self
                .storage_ids
                .iter()
                .map(|id| id.as_str().to_string())
                .collect(),
        }
    }
}

pub struct TransformationService {
    blobs: Arc<dyn BlobStore>,
    generator: GenerationClient,
    fetcher: Arc<dyn ImageFetcher>,
    events: EventWriter,
    receipts_dir: Option<PathBuf>,
}

impl TransformationService {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        generator: GenerationClient,
        fetcher: Arc<dyn ImageFetcher>,
        events: EventWriter,
    ) -> Self {
        Self {
            blobs,
            generator,
            fetcher,
            events,
            receipts_dir: None,
        }
    }

    pub fn with_receipts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.receipts_dir = Some(dir.into());
        self
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn generator(&self) -> &GenerationClient {
        &self.generator
    }

    /// Resolve inputs, generate, fetch the provider's result and persist it.
    ///
    /// The operation is all-or-nothing: any failure before the final `store` leaves no
    /// [`GeneratedImage`] behind, and a generation failure never touches the store.
    pub fn transform(&self, instruction: &str, inputs: &TransformInputs) -> Result<GeneratedImage> {
        let (source_urls, degraded) = self.resolve_inputs(inputs)?;
        let generation = self.generator.invoke(instruction, &source_urls)?;
        let fetched = self.fetcher.fetch(&generation.url)?;
        let storage_id = self
            .blobs
            .store(&fetched.bytes, fetched.content_type.as_deref())?;
        let image = GeneratedImage::new(generation.url.clone(), storage_id);

        record_event(
            &self.events,
            "transform_completed",
            json!({
                "result_url": image.result_url(),
                "storage_id": image.storage_id().as_str(),
                "source_images": source_urls.len(),
                "degraded_inputs": degraded.len(),
            }),
        );
        self.write_receipt(
            instruction,
            inputs,
            &source_urls,
            &degraded,
            &generation,
            &fetched,
            &image,
        );
        Ok(image)
    }

    /// Fetch the bytes of a persisted image through its resolved URL.
    pub fn fetch_stored(&self, id: &StorageId) -> Result<FetchedImage> {
        let url = self
            .blobs
            .resolve(id)?
            .ok_or_else(|| Error::Storage(format!("unknown storage id {id}")))?;
        self.fetcher.fetch(&url)
    }

    /// Direct URLs first, then resolved storage URLs, each in input order. Unknown
    /// storage ids are skipped and logged.
    fn resolve_inputs(&self, inputs: &TransformInputs) -> Result<(Vec<String>, Vec<StorageId>)> {
        let mut urls = inputs.urls.clone();
        let mut degraded = Vec::new();
        for id in &inputs.storage_ids {
            match self.blobs.resolve(id)? {
                Some(url) => urls.push(url),
                None => {
                    record_event(
                        &self.events,
                        "input_degraded",
                        json!({
                            "storage_id": id.as_str(),
                            "reason": "not_found",
                        }),
                    );
                    degraded.push(id.clone());
                }
            }
        }
        Ok((urls, degraded))
    }

    #[allow(clippy::too_many_arguments)]
    fn write_receipt(
        &self,
        instruction: &str,
        inputs: &TransformInputs,
        source_urls: &[String],
        degraded: &[StorageId],
        generation: &GenerationResult,
        fetched: &FetchedImage,
        image: &GeneratedImage,
    ) {
        let Some(dir) = &self.receipts_dir else {
            return;
        };
        let receipt_path = dir.join(format!("receipt-{}.json", image.storage_id().file_stem()));
        let request = TransformRequest {
            instruction: instruction.to_string(),
            inputs: inputs.to_receipt(),
        };
        let resolved = ResolvedTransform {
            provider: generation.provider.clone(),
            model: generation.model.clone(),
            source_urls: source_urls.to_vec(),
            degraded_storage_ids: degraded.iter().map(|id| id.as_str().to_string()).collect(),
            output_shape: generation.shape.as_str().to_string(),
        };
        let outcome = TransformOutcome {
            result_url: image.result_url().to_string(),
            storage_id: image.storage_id().as_str().to_string(),
            content_type: fetched.content_type.clone(),
            bytes: fetched.bytes.len() as u64,
        };
        let payload = build_receipt(
            &request,
            &resolved,
            &generation.provider_request,
            &generation.provider_response,
            &outcome,
            &receipt_path,
        );
        if let Err(err) = write_receipt(&receipt_path, &payload) {
            record_event(
                &self.events,
                "receipt_failed",
                json!({
                    "path": receipt_path.to_string_lossy(),
                    "error": format!("{err:#}"),
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::testing::{FakeFetcher, FakeProvider, FakeReply, MemoryBlobStore};

    struct Harness {
        service: TransformationService,
        blobs: Arc<MemoryBlobStore>,
        fetcher: Arc<FakeFetcher>,
        calls: Arc<std::sync::Mutex<Vec<crate::testing::ProviderCall>>>,
        events: EventWriter,
    }

    fn harness(provider: FakeProvider, fetcher: FakeFetcher) -> Harness {
        let blobs = Arc::new(MemoryBlobStore::default());
        let fetcher = Arc::new(fetcher);
        let events = EventWriter::memory("session-test");
        let calls = provider.calls();
        let service = TransformationService::new(
            blobs.clone(),
            GenerationClient::new(Box::new(provider), events.clone()),
            fetcher.clone(),
            events.clone(),
        );
        Harness {
            service,
            blobs,
            fetcher,
            calls,
            events,
        }
    }

    fn recorded_calls(harness: &Harness) -> Vec<crate::testing::ProviderCall> {
        harness
            .calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    #[test]
    fn direct_urls_pass_through_without_resolving() -> anyhow::Result<()> {
        let h = harness(FakeProvider::replying(Vec::new()), FakeFetcher::default());
        let urls = vec![
            "https://example.com/b.png".to_string(),
            "https://example.com/a.png".to_string(),
        ];

        let image = h
            .service
            .transform("blend", &TransformInputs::from_urls(urls.clone()))?;

        assert_eq!(h.blobs.resolve_calls(), 0);
        assert_eq!(recorded_calls(&h)[0].source_urls, urls);
        assert_eq!(image.result_url(), "https://provider/out1");
        assert_eq!(image.storage_id().as_str(), "img_1");
        assert_eq!(
            h.blobs.blob("img_1"),
            Some(b"bytes of https://provider/out1".to_vec())
        );
        Ok(())
    }

    #[test]
    fn urls_come_before_resolved_storage_ids() -> anyhow::Result<()> {
        let h = harness(FakeProvider::replying(Vec::new()), FakeFetcher::default());
        let first = h.blobs.store(b"one", None)?;
        let second = h.blobs.store(b"two", None)?;

        let inputs = TransformInputs {
            urls: vec!["https://example.com/direct.png".to_string()],
            storage_ids: vec![second, first],
        };
        h.service.transform("mix", &inputs)?;

        assert_eq!(
            recorded_calls(&h)[0].source_urls,
            vec![
                "https://example.com/direct.png".to_string(),
                "https://store/img_2".to_string(),
                "https://store/img_1".to_string(),
            ]
        );
        Ok(())
    }

    #[test]
    fn missing_storage_id_is_skipped_and_logged() -> anyhow::Result<()> {
        let h = harness(FakeProvider::replying(Vec::new()), FakeFetcher::default());
        let kept = h.blobs.store(b"one", None)?;
        let also_kept = h.blobs.store(b"two", None)?;

        let inputs = TransformInputs::from_storage_ids(vec![
            kept,
            StorageId::from("img_404"),
            also_kept,
        ]);
        let image = h.service.transform("restyle", &inputs)?;

        assert_eq!(
            recorded_calls(&h)[0].source_urls,
            vec![
                "https://store/img_1".to_string(),
                "https://store/img_2".to_string(),
            ]
        );
        assert_eq!(image.storage_id().as_str(), "img_3");
        let degraded = h
            .events
            .recorded()
            .into_iter()
            .find(|event| event["type"] == Value::String("input_degraded".to_string()))
            .map(|event| event["storage_id"].clone());
        assert_eq!(degraded, Some(Value::String("img_404".to_string())));
        Ok(())
    }

    #[test]
    fn generation_failure_writes_nothing() -> anyhow::Result<()> {
        let h = harness(
            FakeProvider::replying(vec![FakeReply::Fail("nsfw filter".to_string())]),
            FakeFetcher::default(),
        );
        let source = h.blobs.store(b"source", None)?;
        let stores_before = h.blobs.store_calls();

        let err = h
            .service
            .transform("x", &TransformInputs::from_storage_ids(vec![source]))
            .err();

        assert!(matches!(err, Some(Error::Generation { .. })));
        assert_eq!(h.blobs.store_calls(), stores_before);
        assert_eq!(h.blobs.blob_count(), 1);
        assert!(h.fetcher.fetched().is_empty());
        Ok(())
    }

    #[test]
    fn unrecognized_output_writes_nothing() {
        let h = harness(
            FakeProvider::replying(vec![FakeReply::Json(serde_json::json!({"status": "ok"}))]),
            FakeFetcher::default(),
        );
        let err = h.service.transform("x", &TransformInputs::default()).err();
        assert!(matches!(err, Some(Error::UnrecognizedProviderOutput(_))));
        assert_eq!(h.blobs.store_calls(), 0);
    }

    #[test]
    fn unfetchable_result_fails_whole_operation() {
        let h = harness(
            FakeProvider::replying(Vec::new()),
            FakeFetcher::failing_on("https://provider/out1"),
        );
        let err = h.service.transform("x", &TransformInputs::default()).err();
        assert!(matches!(err, Some(Error::ResultFetch { .. })));
        assert_eq!(h.blobs.store_calls(), 0);
        assert_eq!(h.blobs.blob_count(), 0);
    }

    #[test]
    fn zero_sources_run_unconditioned() -> anyhow::Result<()> {
        let h = harness(FakeProvider::replying(Vec::new()), FakeFetcher::default());
        h.service.transform("a portrait", &TransformInputs::default())?;
        assert!(recorded_calls(&h)[0].source_urls.is_empty());
        Ok(())
    }

    #[test]
    fn receipts_are_written_when_configured() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let h = harness(FakeProvider::replying(Vec::new()), FakeFetcher::default());
        let service = h.service.with_receipts_dir(temp.path());

        let image = service.transform("seat", &TransformInputs::default())?;

        let receipt_path = temp
            .path()
            .join(format!("receipt-{}.json", image.storage_id()));
        let receipt: Value = serde_json::from_str(&std::fs::read_to_string(receipt_path)?)?;
        assert_eq!(receipt["outcome"]["result_url"], "https://provider/out1");
        assert_eq!(receipt["resolved"]["provider"], "fake");
        assert_eq!(receipt["resolved"]["output_shape"], "url");
        Ok(())
    }

    /// Hands out ids shaped like relative paths, as a remote store is free to do.
    struct PathLikeIds(MemoryBlobStore);

    impl BlobStore for PathLikeIds {
        fn create_upload_slot(&self) -> Result<crate::blob::UploadSlot> {
            self.0.create_upload_slot()
        }

        fn write_slot(
            &self,
            slot: &crate::blob::UploadSlot,
            bytes: &[u8],
            content_type: &str,
        ) -> Result<StorageId> {
            let id = self.0.write_slot(slot, bytes, content_type)?;
            Ok(StorageId::new(format!("../../{id}")))
        }

        fn resolve(&self, _id: &StorageId) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[test]
    fn receipt_names_stay_inside_receipts_dir() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let receipts = temp.path().join("a").join("receipts");
        let events = EventWriter::memory("session-test");
        let service = TransformationService::new(
            Arc::new(PathLikeIds(MemoryBlobStore::default())),
            GenerationClient::new(Box::new(FakeProvider::replying(Vec::new())), events.clone()),
            Arc::new(FakeFetcher::default()),
            events,
        )
        .with_receipts_dir(&receipts);

        let image = service.transform("seat", &TransformInputs::default())?;
        assert_eq!(image.storage_id().as_str(), "../../img_1");

        let names: Vec<String> = std::fs::read_dir(&receipts)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["receipt-______img_1.json".to_string()]);
        assert!(!temp.path().join("receipt-img_1.json").exists());
        Ok(())
    }

    #[test]
    fn fetch_stored_reads_through_resolved_url() -> anyhow::Result<()> {
        let h = harness(FakeProvider::replying(Vec::new()), FakeFetcher::default());
        let id = h.blobs.store(b"kept", None)?;
        let fetched = h.service.fetch_stored(&id)?;
        assert_eq!(fetched.bytes, b"bytes of https://store/img_1".to_vec());
        assert!(matches!(
            h.service.fetch_stored(&StorageId::from("img_9")),
            Err(Error::Storage(_))
        ));
        Ok(())
    }
}
