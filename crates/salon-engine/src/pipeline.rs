use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use salon_contracts::events::EventWriter;
use salon_contracts::styles::{
    compose_instruction, StyleSelection, StyleUpdate, SALON_SEATING_INSTRUCTION,
};
use serde_json::{json, Value};

use crate::blob::StorageId;
use crate::error::{Error, FailureReport, Result};
use crate::record_event;
use crate::transform::{GeneratedImage, TransformInputs, TransformationService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    AwaitingUpload,
    TransformingBase,
    Styling,
    /// `styling` with a restyle call outstanding.
    Restyling,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::AwaitingUpload => "awaiting-upload",
            PipelineStage::TransformingBase => "transforming-base",
            PipelineStage::Styling => "styling",
            PipelineStage::Restyling => "restyling",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(u64);

impl AssetId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "asset-{}", self.0)
    }
}

/// Upload lifecycle of one submitted file: `Pending -> Uploading -> Stored | Failed`.
/// The storage id exists only once the asset is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    Uploading,
    Stored(StorageId),
    Failed(String),
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Stored(_) => "stored",
            UploadStatus::Failed(_) => "failed",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, UploadStatus::Stored(_) | UploadStatus::Failed(_))
    }

    pub fn storage_id(&self) -> Option<&StorageId> {
        match self {
            UploadStatus::Stored(id) => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct AssetCell {
    status: Mutex<UploadStatus>,
    changed: Condvar,
}

impl AssetCell {
    fn new() -> Self {
        Self {
            status: Mutex::new(UploadStatus::Pending),
            changed: Condvar::new(),
        }
    }

    fn get(&self) -> UploadStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, status: UploadStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
        self.changed.notify_all();
    }
}

/// Caller's view of one submitted file. Stays valid after the asset leaves the
/// session's active set.
#[derive(Debug, Clone)]
pub struct AssetHandle {
    id: AssetId,
    cell: Arc<AssetCell>,
}

impl AssetHandle {
    pub fn id(&self) -> AssetId {
        self.id
    }

    pub fn status(&self) -> UploadStatus {
        self.cell.get()
    }

    /// Block until the upload is stored or failed.
    pub fn wait(&self) -> UploadStatus {
        let guard = self.cell.status.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = self
            .cell
            .changed
            .wait_while(guard, |status| !status.is_settled())
            .unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }

    /// Like [`AssetHandle::wait`], giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<UploadStatus> {
        let guard = self.cell.status.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, result) = self
            .cell
            .changed
            .wait_timeout_while(guard, timeout, |status| !status.is_settled())
            .unwrap_or_else(PoisonError::into_inner);
        (!result.timed_out()).then(|| guard.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetView {
    pub id: AssetId,
    pub status: UploadStatus,
    pub content_type: String,
    pub byte_len: usize,
}

/// Identifies one accepted restyle. Results for a ticket that is no longer current are
/// dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestyleTicket {
    pub epoch: u64,
    pub id: u64,
    pub selection: StyleSelection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub epoch: u64,
    pub stage: PipelineStage,
    pub assets: Vec<AssetView>,
    /// Asset the running base transform was started from.
    pub transforming: Option<AssetId>,
    pub base: Option<GeneratedImage>,
    pub latest: Option<GeneratedImage>,
    pub displayed: Option<GeneratedImage>,
    pub selection: StyleSelection,
    pub last_error: Option<FailureReport>,
    pub uploads_stored: u64,
    pub uploads_failed: u64,
    pub restyles_completed: u64,
}

struct AssetRecord {
    id: AssetId,
    content_type: String,
    byte_len: usize,
    cell: Arc<AssetCell>,
}

impl AssetRecord {
    fn view(&self) -> AssetView {
        AssetView {
            id: self.id,
            status: self.cell.get(),
            content_type: self.content_type.clone(),
            byte_len: self.byte_len,
        }
    }
}

enum Stage {
    AwaitingUpload,
    TransformingBase {
        asset: AssetId,
        ticket: u64,
    },
    Styling {
        base: GeneratedImage,
        latest: Option<GeneratedImage>,
        restyle: Option<RestyleTicket>,
    },
}

impl Stage {
    fn public(&self) -> PipelineStage {
        match self {
            Stage::AwaitingUpload => PipelineStage::AwaitingUpload,
            Stage::TransformingBase { .. } => PipelineStage::TransformingBase,
            Stage::Styling { restyle: None, .. } => PipelineStage::Styling,
            Stage::Styling {
                restyle: Some(_), ..
            } => PipelineStage::Restyling,
        }
    }
}

struct SessionState {
    epoch: u64,
    next_asset: u64,
    next_ticket: u64,
    stage: Stage,
    assets: Vec<AssetRecord>,
    selection: StyleSelection,
    last_error: Option<FailureReport>,
    uploads_stored: u64,
    uploads_failed: u64,
    restyles_completed: u64,
    in_flight: usize,
}

impl SessionState {
    fn new() -> Self {
        Self {
            epoch: 0,
            next_asset: 0,
            next_ticket: 0,
            stage: Stage::AwaitingUpload,
            assets: Vec::new(),
            selection: StyleSelection::default(),
            last_error: None,
            uploads_stored: 0,
            uploads_failed: 0,
            restyles_completed: 0,
            in_flight: 0,
        }
    }

    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn displayed(&self) -> Option<&GeneratedImage> {
        match &self.stage {
            Stage::Styling { base, latest, .. } => Some(latest.as_ref().unwrap_or(base)),
            _ => None,
        }
    }
}

struct Shared {
    state: Mutex<SessionState>,
    idle: Condvar,
    service: Arc<TransformationService>,
    events: EventWriter,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event_type: &str, payload: Value) {
        record_event(&self.events, event_type, payload);
    }
}

/// Counts one outstanding upload or transformation; `wait_idle` returns once every
/// guard is gone. Never drop one while holding the session lock.
struct InFlight(Arc<Shared>);

impl InFlight {
    fn enter(shared: &Arc<Shared>, state: &mut SessionState) -> Self {
        state.in_flight += 1;
        Self(shared.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.0.idle.notify_all();
    }
}

/// One restyle session: uploads, the base transform, restyles and the displayed image.
///
/// Uploads and transformations run on worker threads. Every piece of work is stamped
/// with the session epoch when it starts; `reset` bumps the epoch so late results are
/// recognised and discarded instead of resurrecting cleared state.
pub struct SessionPipeline {
    shared: Arc<Shared>,
}

impl SessionPipeline {
    pub fn new(service: Arc<TransformationService>, events: EventWriter) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::new()),
                idle: Condvar::new(),
                service,
                events,
            }),
        }
    }

    pub fn events(&self) -> &EventWriter {
        &self.shared.events
    }

    pub fn service(&self) -> &Arc<TransformationService> {
        &self.shared.service
    }

    /// Start uploading one file. Returns immediately; the first upload of the epoch to
    /// reach `stored` while awaiting an upload starts the base transform.
    pub fn submit_file(&self, bytes: Vec<u8>, content_type: impl Into<String>) -> AssetHandle {
        let content_type = content_type.into();
        let cell = Arc::new(AssetCell::new());
        let (id, epoch, guard) = {
            let mut state = self.shared.lock();
            state.next_asset += 1;
            let id = AssetId(state.next_asset);
            state.assets.push(AssetRecord {
                id,
                content_type: content_type.clone(),
                byte_len: bytes.len(),
                cell: cell.clone(),
            });
            let guard = InFlight::enter(&self.shared, &mut state);
            (id, state.epoch, guard)
        };
        self.shared.emit(
            "asset_upload_started",
            json!({
                "asset": id.get(),
                "content_type": content_type,
                "bytes": bytes.len(),
            }),
        );

        let shared = self.shared.clone();
        let worker_cell = cell.clone();
        let spawned = thread::Builder::new()
            .name(format!("salon-upload-{}", id.get()))
            .spawn(move || {
                let _guard = guard;
                upload_asset(&shared, epoch, id, &worker_cell, &bytes, &content_type);
            });
        if let Err(err) = spawned {
            fail_upload(&self.shared, epoch, id, &cell, &Error::Io(err));
        }
        AssetHandle { id, cell }
    }

    /// Re-run the base transform after a failure, using the first stored asset.
    /// Returns `Ok(None)` when no stored asset is left to transform.
    pub fn retry_base_transform(&self) -> Result<Option<AssetId>> {
        let (asset, storage_id, epoch, ticket, guard) = {
            let mut state = self.shared.lock();
            if !matches!(state.stage, Stage::AwaitingUpload) {
                return Err(Error::InvalidStage {
                    operation: "retry_base_transform",
                    stage: state.stage.public(),
                });
            }
            let stored = state.assets.iter().find_map(|record| {
                record
                    .cell
                    .get()
                    .storage_id()
                    .map(|storage_id| (record.id, storage_id.clone()))
            });
            let Some((asset, storage_id)) = stored else {
                return Ok(None);
            };
            let ticket = state.issue_ticket();
            state.stage = Stage::TransformingBase { asset, ticket };
            let guard = InFlight::enter(&self.shared, &mut state);
            (asset, storage_id, state.epoch, ticket, guard)
        };

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("salon-base-{ticket}"))
            .spawn(move || {
                let _guard = guard;
                run_base_transform(&shared, epoch, ticket, asset, storage_id);
            });
        if let Err(err) = spawned {
            let err = Error::Io(err);
            let mut state = self.shared.lock();
            if state.epoch == epoch {
                state.stage = Stage::AwaitingUpload;
                state.last_error = Some(FailureReport::new(&err, PipelineStage::TransformingBase));
            }
            return Err(err);
        }
        Ok(Some(asset))
    }

    /// Apply a partial style update. Rejected while the base transform is running.
    pub fn set_style_selection(&self, update: StyleUpdate) -> Result<StyleSelection> {
        let selection = {
            let mut state = self.shared.lock();
            if matches!(state.stage, Stage::TransformingBase { .. }) {
                return Err(Error::InvalidStage {
                    operation: "set_style_selection",
                    stage: state.stage.public(),
                });
            }
            state.selection.apply(update);
            state.selection
        };
        self.shared.emit(
            "style_selected",
            json!({
                "haircut": selection.haircut.value(),
                "color": selection.color.value(),
                "look": selection.look.map(|look| look.value()),
            }),
        );
        Ok(selection)
    }

    /// Compose the current selection and restyle the base image. At most one restyle
    /// is outstanding; a second request is rejected rather than queued.
    pub fn trigger_restyle(&self) -> Result<RestyleTicket> {
        let (ticket, base_id, guard) = {
            let mut state = self.shared.lock();
            let base_id = match &state.stage {
                Stage::Styling {
                    restyle: None,
                    base,
                    ..
                } => base.storage_id().clone(),
                Stage::Styling {
                    restyle: Some(outstanding),
                    ..
                } => {
                    let outstanding = outstanding.id;
                    drop(state);
                    self.shared.emit(
                        "restyle_rejected",
                        json!({ "outstanding_ticket": outstanding }),
                    );
                    return Err(Error::RestyleInFlight);
                }
                other => {
                    return Err(Error::InvalidStage {
                        operation: "trigger_restyle",
                        stage: other.public(),
                    })
                }
            };
            let ticket = RestyleTicket {
                epoch: state.epoch,
                id: state.issue_ticket(),
                selection: state.selection,
            };
            if let Stage::Styling { restyle, .. } = &mut state.stage {
                *restyle = Some(ticket.clone());
            }
            let guard = InFlight::enter(&self.shared, &mut state);
            (ticket, base_id, guard)
        };

        let shared = self.shared.clone();
        let worker_ticket = ticket.clone();
        let spawned = thread::Builder::new()
            .name(format!("salon-restyle-{}", ticket.id))
            .spawn(move || {
                let _guard = guard;
                run_restyle(&shared, worker_ticket, base_id);
            });
        if let Err(err) = spawned {
            let mut state = self.shared.lock();
            if let Stage::Styling { restyle, .. } = &mut state.stage {
                if restyle.as_ref().map(|current| current.id) == Some(ticket.id) {
                    *restyle = None;
                }
            }
            return Err(Error::Io(err));
        }
        Ok(ticket)
    }

    /// Clear assets, images, selection and errors and return to `awaiting-upload`.
    /// Work still running is left to finish; its results are discarded.
    pub fn reset(&self) {
        let epoch = {
            let mut state = self.shared.lock();
            state.epoch += 1;
            state.stage = Stage::AwaitingUpload;
            state.assets.clear();
            state.selection = StyleSelection::default();
            state.last_error = None;
            state.epoch
        };
        self.shared.emit("session_reset", json!({ "epoch": epoch }));
    }

    pub fn stage(&self) -> PipelineStage {
        self.shared.lock().stage.public()
    }

    pub fn displayed_image(&self) -> Option<GeneratedImage> {
        self.shared.lock().displayed().cloned()
    }

    pub fn selection(&self) -> StyleSelection {
        self.shared.lock().selection
    }

    pub fn asset(&self, id: AssetId) -> Result<AssetView> {
        self.shared
            .lock()
            .assets
            .iter()
            .find(|record| record.id == id)
            .map(AssetRecord::view)
            .ok_or(Error::UnknownAsset(id))
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.shared.lock();
        let (base, latest) = match &state.stage {
            Stage::Styling { base, latest, .. } => (Some(base.clone()), latest.clone()),
            _ => (None, None),
        };
        SessionSnapshot {
            epoch: state.epoch,
            stage: state.stage.public(),
            assets: state.assets.iter().map(AssetRecord::view).collect(),
            transforming: match state.stage {
                Stage::TransformingBase { asset, .. } => Some(asset),
                _ => None,
            },
            base,
            latest,
            displayed: state.displayed().cloned(),
            selection: state.selection,
            last_error: state.last_error.clone(),
            uploads_stored: state.uploads_stored,
            uploads_failed: state.uploads_failed,
            restyles_completed: state.restyles_completed,
        }
    }

    /// Block until no upload or transformation is outstanding, including work
    /// belonging to an epoch that has since been reset.
    pub fn wait_idle(&self) {
        let state = self.shared.lock();
        let _idle = self
            .shared
            .idle
            .wait_while(state, |state| state.in_flight > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Returns `false` if work was still outstanding after `timeout`.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (_state, result) = self
            .shared
            .idle
            .wait_timeout_while(state, timeout, |state| state.in_flight > 0)
            .unwrap_or_else(PoisonError::into_inner);
        !result.timed_out()
    }

    /// Save the persisted copy of the displayed image to `path`.
    pub fn download_displayed(&self, path: &Path) -> Result<GeneratedImage> {
        let displayed = {
            let state = self.shared.lock();
            match state.displayed() {
                Some(image) => image.clone(),
                None => {
                    return Err(Error::InvalidStage {
                        operation: "download_displayed",
                        stage: state.stage.public(),
                    })
                }
            }
        };
        let fetched = self.shared.service.fetch_stored(displayed.storage_id())?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &fetched.bytes)?;
        self.shared.emit(
            "image_downloaded",
            json!({
                "storage_id": displayed.storage_id().as_str(),
                "path": path.to_string_lossy(),
                "bytes": fetched.bytes.len(),
            }),
        );
        Ok(displayed)
    }
}

fn upload_asset(
    shared: &Arc<Shared>,
    epoch: u64,
    id: AssetId,
    cell: &AssetCell,
    bytes: &[u8],
    content_type: &str,
) {
    cell.set(UploadStatus::Uploading);
    let blobs = shared.service.blobs();
    let written = blobs
        .create_upload_slot()
        .and_then(|slot| blobs.write_slot(&slot, bytes, content_type));
    let storage_id = match written {
        Ok(storage_id) => storage_id,
        Err(err) => {
            fail_upload(shared, epoch, id, cell, &err);
            return;
        }
    };

    let (current, base_ticket) = {
        let mut state = shared.lock();
        // Status flips under the session lock so a stored handle already sees the
        // base transform stage it triggered.
        cell.set(UploadStatus::Stored(storage_id.clone()));
        if state.epoch != epoch {
            (false, None)
        } else {
            state.uploads_stored += 1;
            let ticket = match state.stage {
                Stage::AwaitingUpload => {
                    let ticket = state.issue_ticket();
                    state.stage = Stage::TransformingBase { asset: id, ticket };
                    Some(ticket)
                }
                _ => None,
            };
            (true, ticket)
        }
    };

    if !current {
        shared.emit(
            "stale_result_discarded",
            json!({
                "work": "upload",
                "asset": id.get(),
                "storage_id": storage_id.as_str(),
                "epoch": epoch,
            }),
        );
        return;
    }
    shared.emit(
        "asset_stored",
        json!({
            "asset": id.get(),
            "storage_id": storage_id.as_str(),
        }),
    );
    if let Some(ticket) = base_ticket {
        run_base_transform(shared, epoch, ticket, id, storage_id);
    }
}

fn fail_upload(shared: &Shared, epoch: u64, id: AssetId, cell: &AssetCell, err: &Error) {
    cell.set(UploadStatus::Failed(err.to_string()));
    {
        let mut state = shared.lock();
        if state.epoch == epoch {
            state.assets.retain(|record| record.id != id);
            state.uploads_failed += 1;
        }
    }
    let mut payload = err.event_fields();
    payload["asset"] = json!(id.get());
    shared.emit("asset_failed", payload);
}

fn run_base_transform(
    shared: &Shared,
    epoch: u64,
    ticket: u64,
    asset: AssetId,
    storage_id: StorageId,
) {
    shared.emit(
        "base_transform_started",
        json!({
            "asset": asset.get(),
            "storage_id": storage_id.as_str(),
            "ticket": ticket,
        }),
    );
    let result = shared.service.transform(
        SALON_SEATING_INSTRUCTION,
        &TransformInputs::from_storage_ids(vec![storage_id]),
    );

    let applied = {
        let mut state = shared.lock();
        let current = state.epoch == epoch
            && matches!(state.stage, Stage::TransformingBase { ticket: active, .. } if active == ticket);
        if current {
            match &result {
                Ok(image) => {
                    state.stage = Stage::Styling {
                        base: image.clone(),
                        latest: None,
                        restyle: None,
                    };
                    state.last_error = None;
                }
                Err(err) => {
                    state.stage = Stage::AwaitingUpload;
                    state.last_error =
                        Some(FailureReport::new(err, PipelineStage::TransformingBase));
                }
            }
        }
        current
    };

    if !applied {
        discard_stale(shared, "base_transform", epoch, ticket, &result);
        return;
    }
    match result {
        Ok(image) => shared.emit(
            "base_transform_completed",
            json!({
                "ticket": ticket,
                "result_url": image.result_url(),
                "storage_id": image.storage_id().as_str(),
            }),
        ),
        Err(err) => {
            let mut payload = err.event_fields();
            payload["ticket"] = json!(ticket);
            shared.emit("base_transform_failed", payload);
        }
    }
}

fn run_restyle(shared: &Shared, ticket: RestyleTicket, base_id: StorageId) {
    let instruction = compose_instruction(&ticket.selection);
    shared.emit(
        "restyle_started",
        json!({
            "ticket": ticket.id,
            "base_storage_id": base_id.as_str(),
            "instruction": instruction,
        }),
    );
    let result = shared
        .service
        .transform(&instruction, &TransformInputs::from_storage_ids(vec![base_id]));

    let applied = {
        let mut state = shared.lock();
        let epoch_matches = state.epoch == ticket.epoch;
        let mut current = false;
        if let Stage::Styling {
            latest, restyle, ..
        } = &mut state.stage
        {
            if epoch_matches && restyle.as_ref().map(|active| active.id) == Some(ticket.id) {
                current = true;
                *restyle = None;
                if let Ok(image) = &result {
                    *latest = Some(image.clone());
                }
            }
        }
        if current {
            match &result {
                Ok(_) => {
                    state.restyles_completed += 1;
                    state.last_error = None;
                }
                Err(err) => {
                    state.last_error = Some(FailureReport::new(err, PipelineStage::Restyling));
                }
            }
        }
        current
    };

    if !applied {
        discard_stale(shared, "restyle", ticket.epoch, ticket.id, &result);
        return;
    }
    match result {
        Ok(image) => shared.emit(
            "restyle_completed",
            json!({
                "ticket": ticket.id,
                "result_url": image.result_url(),
                "storage_id": image.storage_id().as_str(),
            }),
        ),
        Err(err) => {
            let mut payload = err.event_fields();
            payload["ticket"] = json!(ticket.id);
            shared.emit("restyle_failed", payload);
        }
    }
}

fn discard_stale(
    shared: &Shared,
    work: &str,
    epoch: u64,
    ticket: u64,
    result: &Result<GeneratedImage>,
) {
    let mut payload = json!({
        "work": work,
        "epoch": epoch,
        "ticket": ticket,
    });
    match result {
        Ok(image) => payload["storage_id"] = json!(image.storage_id().as_str()),
        Err(err) => payload["error_kind"] = json!(err.kind()),
    }
    shared.emit("stale_result_discarded", payload);
}
