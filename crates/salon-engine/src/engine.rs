use std::sync::Arc;

use salon_contracts::events::EventWriter;
use serde_json::json;

use crate::blob::{BlobStore, HttpBlobStore, LocalBlobStore};
use crate::config::{BlobBackend, EngineConfig, ProviderKind};
use crate::error::Result;
use crate::fetch::HttpImageFetcher;
use crate::generation::{DryrunProvider, GenerationClient, GenerationProvider, ReplicateProvider};
use crate::pipeline::SessionPipeline;
use crate::record_event;
use crate::transform::{GeneratedImage, TransformInputs, TransformationService};

/// Wires blob store, provider and fetcher from an [`EngineConfig`] and hands out
/// session pipelines sharing one transformation service.
pub struct SalonEngine {
    config: EngineConfig,
    events: EventWriter,
    service: Arc<TransformationService>,
}

impl SalonEngine {
    pub fn new(config: EngineConfig, events: EventWriter) -> Result<Self> {
        let blobs: Arc<dyn BlobStore> = match &config.blob {
            BlobBackend::Local { dir, public_base } => {
                Arc::new(LocalBlobStore::open(dir.clone(), public_base.clone())?)
            }
            BlobBackend::Http { api_base } => Arc::new(HttpBlobStore::new(api_base)),
        };
        let provider: Box<dyn GenerationProvider> = match config.provider {
            ProviderKind::Replicate => Box::new(ReplicateProvider::new(config.replicate.clone())),
            ProviderKind::Dryrun => Box::new(DryrunProvider::new(config.dryrun_dir.clone())),
        };
        let generator = GenerationClient::new(provider, events.clone());
        let mut service = TransformationService::new(
            blobs,
            generator,
            Arc::new(HttpImageFetcher::new()),
            events.clone(),
        );
        if let Some(dir) = &config.receipts_dir {
            service = service.with_receipts_dir(dir.clone());
        }

        let blob_backend = match &config.blob {
            BlobBackend::Local { dir, .. } => format!("local:{}", dir.display()),
            BlobBackend::Http { api_base } => format!("http:{api_base}"),
        };
        record_event(
            &events,
            "session_started",
            json!({
                "provider": service.generator().provider_name(),
                "model": service.generator().model(),
                "blob_backend": blob_backend,
            }),
        );

        Ok(Self {
            config,
            events,
            service: Arc::new(service),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    pub fn service(&self) -> &Arc<TransformationService> {
        &self.service
    }

    pub fn pipeline(&self) -> SessionPipeline {
        SessionPipeline::new(self.service.clone(), self.events.clone())
    }

    /// Confirms the provider is configured without generating anything.
    pub fn check_provider(&self) -> Result<String> {
        self.service.generator().check()
    }

    /// One-shot prompt over direct image URLs, outside any session.
    pub fn generate_direct(&self, prompt: &str, image_urls: Vec<String>) -> Result<GeneratedImage> {
        self.service
            .transform(prompt, &TransformInputs::from_urls(image_urls))
    }
}
