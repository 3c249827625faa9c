//! Hand-written fakes shared by the engine's unit tests.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use serde_json::{json, Map, Value};

use crate::blob::{BlobStore, StorageId, UploadSlot};
use crate::error::{Error, Result};
use crate::fetch::{FetchedImage, ImageFetcher};
use crate::generation::{GenerationProvider, ProviderOutput, ProviderReply};

pub(crate) const FAILING_CONTENT_TYPE: &str = "application/x-fail";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProviderCall {
    pub instruction: String,
    pub source_urls: Vec<String>,
}

pub(crate) enum FakeReply {
    Json(Value),
    Fail(String),
}

/// Replays queued replies; once the queue is empty answers `https://provider/out{n}`
/// for the n-th call. A gated provider blocks each call until a permit arrives.
pub(crate) struct FakeProvider {
    replies: Mutex<VecDeque<FakeReply>>,
    calls: Arc<Mutex<Vec<ProviderCall>>>,
    gate: Option<Mutex<Receiver<()>>>,
}

impl FakeProvider {
    pub fn replying(replies: Vec<FakeReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
            gate: None,
        }
    }

    pub fn gated(replies: Vec<FakeReply>) -> (Self, Sender<()>) {
        let (permits, gate) = channel();
        let mut provider = Self::replying(replies);
        provider.gate = Some(Mutex::new(gate));
        (provider, permits)
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<ProviderCall>>> {
        self.calls.clone()
    }
}

impl GenerationProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn model(&self) -> Option<&str> {
        Some("fake-model")
    }

    fn check(&self) -> anyhow::Result<String> {
        Ok("fake provider ready".to_string())
    }

    fn run(&self, instruction: &str, source_urls: &[String]) -> anyhow::Result<ProviderReply> {
        let call_number = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| anyhow::anyhow!("calls lock poisoned"))?;
            calls.push(ProviderCall {
                instruction: instruction.to_string(),
                source_urls: source_urls.to_vec(),
            });
            calls.len()
        };
        if let Some(gate) = &self.gate {
            let gate = gate
                .lock()
                .map_err(|_| anyhow::anyhow!("gate lock poisoned"))?;
            if gate.recv_timeout(Duration::from_secs(10)).is_err() {
                bail!("fake provider gate never opened");
            }
        }
        let reply = self
            .replies
            .lock()
            .map_err(|_| anyhow::anyhow!("replies lock poisoned"))?
            .pop_front()
            .unwrap_or_else(|| {
                FakeReply::Json(json!(format!("https://provider/out{call_number}")))
            });
        match reply {
            FakeReply::Json(output) => Ok(ProviderReply {
                output: ProviderOutput::from_json(output),
                provider_request: Map::new(),
                provider_response: Map::new(),
            }),
            FakeReply::Fail(message) => bail!(message),
        }
    }
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    next_slot: u64,
    blobs: BTreeMap<String, (Vec<u8>, String)>,
    open_slots: HashSet<String>,
}

/// In-memory blob store handing out `img_N` ids that resolve to `https://store/img_N`.
/// Writes tagged with [`FAILING_CONTENT_TYPE`] fail. A gated store holds every slot
/// write until a permit arrives.
#[derive(Default)]
pub(crate) struct MemoryBlobStore {
    state: Mutex<MemoryState>,
    resolve_calls: AtomicUsize,
    store_calls: AtomicUsize,
    gate: Option<Mutex<Receiver<()>>>,
}

impl MemoryBlobStore {
    pub fn gated() -> (Self, Sender<()>) {
        let (permits, gate) = channel();
        let store = Self {
            gate: Some(Mutex::new(gate)),
            ..Self::default()
        };
        (store, permits)
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }

    pub fn blob(&self, id: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.blobs.get(id).map(|(bytes, _)| bytes.clone()))
    }

    pub fn blob_count(&self) -> usize {
        self.state.lock().map(|state| state.blobs.len()).unwrap_or(0)
    }
}

impl BlobStore for MemoryBlobStore {
    fn create_upload_slot(&self) -> Result<UploadSlot> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Storage("memory store poisoned".to_string()))?;
        state.next_slot += 1;
        let token = format!("slot-{}", state.next_slot);
        state.open_slots.insert(token.clone());
        Ok(UploadSlot {
            url: format!("https://store/upload/{token}"),
        })
    }

    fn write_slot(&self, slot: &UploadSlot, bytes: &[u8], content_type: &str) -> Result<StorageId> {
        if let Some(gate) = &self.gate {
            let gate = gate
                .lock()
                .map_err(|_| Error::Storage("gate lock poisoned".to_string()))?;
            if gate.recv_timeout(Duration::from_secs(10)).is_err() {
                return Err(Error::Storage("memory store gate never opened".to_string()));
            }
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Storage("memory store poisoned".to_string()))?;
        let token = slot.url.rsplit('/').next().unwrap_or_default().to_string();
        if !state.open_slots.remove(&token) {
            return Err(Error::Storage(format!("unknown slot {}", slot.url)));
        }
        if content_type == FAILING_CONTENT_TYPE {
            return Err(Error::Storage("quota exceeded".to_string()));
        }
        state.next_id += 1;
        let id = format!("img_{}", state.next_id);
        state
            .blobs
            .insert(id.clone(), (bytes.to_vec(), content_type.to_string()));
        Ok(StorageId::new(id))
    }

    fn resolve(&self, id: &StorageId) -> Result<Option<String>> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let state = self
            .state
            .lock()
            .map_err(|_| Error::Storage("memory store poisoned".to_string()))?;
        Ok(state
            .blobs
            .contains_key(id.as_str())
            .then(|| format!("https://store/{id}")))
    }

    fn store(&self, bytes: &[u8], content_type: Option<&str>) -> Result<StorageId> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        let slot = self.create_upload_slot()?;
        self.write_slot(&slot, bytes, content_type.unwrap_or("image/png"))
    }
}

/// Answers every URL with `bytes of <url>` unless the URL was marked as failing.
#[derive(Default)]
pub(crate) struct FakeFetcher {
    failing: Mutex<HashSet<String>>,
    fetched: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn failing_on(url: &str) -> Self {
        let fetcher = Self::default();
        if let Ok(mut failing) = fetcher.failing.lock() {
            failing.insert(url.to_string());
        }
        fetcher
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched
            .lock()
            .map(|fetched| fetched.clone())
            .unwrap_or_default()
    }
}

impl ImageFetcher for FakeFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedImage> {
        if let Ok(mut fetched) = self.fetched.lock() {
            fetched.push(url.to_string());
        }
        let failing = self
            .failing
            .lock()
            .map(|failing| failing.contains(url))
            .unwrap_or(false);
        if failing {
            return Err(Error::ResultFetch {
                url: url.to_string(),
                message: "410 Gone".to_string(),
            });
        }
        Ok(FetchedImage {
            bytes: format!("bytes of {url}").into_bytes(),
            content_type: Some("image/png".to_string()),
        })
    }
}
