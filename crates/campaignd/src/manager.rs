//! Campaign manager
//!
//! Owns the canonical decoder manifest and collection scheme list. Keeps
//! two time-ordered queues of scheme start/stop events; each tick activates
//! matured schemes and expires ended ones, then re-runs both extractions
//! and fans the fresh snapshots out to subscribers. Cloud artifacts are
//! persisted on arrival and restored on boot.

use crate::dictionary_extractor::extract_decoder_dictionaries;
use crate::matrix_extractor::{extract_matrices, patch_partial_signal_types};
use parking_lot::Mutex;
use roadcast_core::inspection::{FetchMatrix, InspectionMatrix};
use roadcast_core::manifest::{DecoderManifest, SyncId};
use roadcast_core::scheme::{ActiveCollectionSchemes, CollectionScheme};
use roadcast_core::time::{Clock, Timestamp};
use roadcast_decode::dictionary::DecoderDictionaryMap;
use roadcast_decode::translator::CanInterfaceIdTranslator;
use roadcast_store::persist::{CacheAndPersist, DataType, PersistenceError};
use roadcast_store::stream::StreamManager;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{error, info, warn};

pub type DictionaryListener = Box<dyn Fn(&DecoderDictionaryMap) + Send + Sync>;
pub type InspectionMatrixListener = Box<dyn Fn(Arc<InspectionMatrix>) + Send + Sync>;
pub type FetchMatrixListener = Box<dyn Fn(Arc<FetchMatrix>) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    dictionary: Vec<DictionaryListener>,
    inspection_matrix: Vec<InspectionMatrixListener>,
    fetch_matrix: Vec<FetchMatrixListener>,
}

#[derive(Default)]
struct ManagerState {
    decoder_manifest: Option<Arc<DecoderManifest>>,
    all_schemes: Vec<Arc<CollectionScheme>>,
    enabled: BTreeMap<SyncId, Arc<CollectionScheme>>,
    /// (time, sync id) events, popped as time passes.
    start_queue: BTreeSet<(Timestamp, SyncId)>,
    stop_queue: BTreeSet<(Timestamp, SyncId)>,
    /// Forces re-extraction on the next tick even without a time event.
    dirty: bool,
}

pub struct CampaignManager {
    clock: Arc<dyn Clock>,
    persistence: Mutex<CacheAndPersist>,
    stream_manager: Arc<StreamManager>,
    translator: CanInterfaceIdTranslator,
    state: Mutex<ManagerState>,
    listeners: Mutex<Listeners>,
}

impl CampaignManager {
    pub fn new(
        clock: Arc<dyn Clock>,
        persistence: CacheAndPersist,
        stream_manager: Arc<StreamManager>,
        translator: CanInterfaceIdTranslator,
    ) -> Self {
        Self {
            clock,
            persistence: Mutex::new(persistence),
            stream_manager,
            translator,
            state: Mutex::new(ManagerState::default()),
            listeners: Mutex::new(Listeners::default()),
        }
    }

    pub fn subscribe_dictionary(&self, listener: DictionaryListener) {
        self.listeners.lock().dictionary.push(listener);
    }

    pub fn subscribe_inspection_matrix(&self, listener: InspectionMatrixListener) {
        self.listeners.lock().inspection_matrix.push(listener);
    }

    pub fn subscribe_fetch_matrix(&self, listener: FetchMatrixListener) {
        self.listeners.lock().fetch_matrix.push(listener);
    }

    /// Load the persisted manifest and scheme list written by a previous
    /// run. Corrupt or missing artifacts are skipped.
    pub fn restore_persisted(&self) {
        if let Some(bytes) = self.read_persisted(DataType::DecoderManifest) {
            match DecoderManifest::from_bytes(&bytes) {
                Ok(manifest) => {
                    info!(sync_id = %manifest.sync_id, "Restored persisted decoder manifest");
                    let mut state = self.state.lock();
                    state.decoder_manifest = Some(Arc::new(manifest));
                    state.dirty = true;
                }
                Err(err) => warn!(error = %err, "Persisted decoder manifest unreadable"),
            }
        }
        if let Some(bytes) = self.read_persisted(DataType::CollectionSchemeList) {
            match ActiveCollectionSchemes::from_bytes(&bytes) {
                Ok(schemes) => {
                    info!(count = schemes.schemes.len(), "Restored persisted scheme list");
                    self.install_scheme_list(schemes);
                }
                Err(err) => warn!(error = %err, "Persisted scheme list unreadable"),
            }
        }
    }

    /// A new decoder manifest arrived from the cloud. It replaces the
    /// active one atomically on the next tick.
    pub fn on_decoder_manifest_update(&self, manifest: DecoderManifest) {
        match manifest.to_bytes() {
            Ok(bytes) => self.write_persisted(DataType::DecoderManifest, &bytes),
            Err(err) => warn!(error = %err, "Could not serialize manifest for persistence"),
        }
        info!(sync_id = %manifest.sync_id, "Decoder manifest updated");
        let mut state = self.state.lock();
        state.decoder_manifest = Some(Arc::new(manifest));
        state.dirty = true;
    }

    /// A new collection scheme list arrived from the cloud, replacing the
    /// previous list as a whole.
    pub fn on_collection_scheme_list_update(&self, schemes: ActiveCollectionSchemes) {
        match schemes.to_bytes() {
            Ok(bytes) => self.write_persisted(DataType::CollectionSchemeList, &bytes),
            Err(err) => warn!(error = %err, "Could not serialize scheme list for persistence"),
        }
        info!(count = schemes.schemes.len(), "Collection scheme list updated");
        self.install_scheme_list(schemes);
    }

    fn install_scheme_list(&self, schemes: ActiveCollectionSchemes) {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.start_queue.clear();
        state.stop_queue.clear();
        state.all_schemes = schemes.schemes.into_iter().map(Arc::new).collect();
        for scheme in &state.all_schemes {
            state
                .start_queue
                .insert((scheme.start_time, scheme.sync_id.clone()));
            if scheme.expiry_time != 0 {
                state
                    .stop_queue
                    .insert((scheme.expiry_time, scheme.sync_id.clone()));
            }
        }
        state.dirty = true;
    }

    /// Process due start/stop events and republish if the enabled set (or
    /// an artifact) changed. Returns true when new snapshots were
    /// published.
    pub fn tick(&self) -> bool {
        let now = self.clock.system_time_since_epoch_ms();
        let mut state = self.state.lock();

        let mut due = false;
        loop {
            let next = state.start_queue.first().cloned();
            match next {
                Some(event) if event.0 <= now => {
                    state.start_queue.remove(&event);
                    due = true;
                }
                _ => break,
            }
        }
        loop {
            let next = state.stop_queue.first().cloned();
            match next {
                Some(event) if event.0 <= now => {
                    state.stop_queue.remove(&event);
                    due = true;
                }
                _ => break,
            }
        }
        if !due && !state.dirty {
            return false;
        }
        state.dirty = false;

        let Some(manifest) = state.decoder_manifest.clone() else {
            // Without a manifest there is nothing to decode against.
            return false;
        };

        let enabled: BTreeMap<SyncId, Arc<CollectionScheme>> = state
            .all_schemes
            .iter()
            .filter(|scheme| {
                scheme.start_time <= now
                    && (scheme.expiry_time == 0 || now < scheme.expiry_time)
                    && scheme.decoder_manifest_sync_id == manifest.sync_id
            })
            .map(|scheme| (scheme.sync_id.clone(), Arc::clone(scheme)))
            .collect();
        state.enabled = enabled.clone();
        drop(state);

        info!(enabled = enabled.len(), "Re-running extraction");

        // Streams first, so spooled partitions exist before any forward
        // condition starts firing.
        let stream_schemes = ActiveCollectionSchemes {
            schemes: enabled
                .values()
                .map(|scheme| CollectionScheme::clone(scheme))
                .collect(),
        };
        self.stream_manager
            .on_change_collection_scheme_list(&stream_schemes);

        let mut matrices = extract_matrices(&enabled, &manifest);
        let extraction = extract_decoder_dictionaries(&manifest, &enabled, &self.translator);
        patch_partial_signal_types(&mut matrices.inspection, &extraction.partial_signal_types);

        let inspection = Arc::new(matrices.inspection);
        let fetch = Arc::new(matrices.fetch);
        let listeners = self.listeners.lock();
        for listener in &listeners.dictionary {
            listener(&extraction.dictionaries);
        }
        for listener in &listeners.inspection_matrix {
            listener(Arc::clone(&inspection));
        }
        for listener in &listeners.fetch_matrix {
            listener(Arc::clone(&fetch));
        }
        true
    }

    /// Earliest pending start/stop event, for schedulers that want to sleep
    /// until something changes.
    pub fn next_event_time(&self) -> Option<Timestamp> {
        let state = self.state.lock();
        let start = state.start_queue.first().map(|event| event.0);
        let stop = state.stop_queue.first().map(|event| event.0);
        match (start, stop) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn enabled_scheme_ids(&self) -> Vec<SyncId> {
        self.state.lock().enabled.keys().cloned().collect()
    }

    fn read_persisted(&self, data_type: DataType) -> Option<Vec<u8>> {
        let persistence = self.persistence.lock();
        let size = persistence.get_size(data_type, None);
        if size == 0 {
            return None;
        }
        match persistence.read(size as usize, data_type, None) {
            Ok(bytes) => Some(bytes),
            Err(PersistenceError::FileNotFound) => None,
            Err(err) => {
                warn!(error = %err, "Failed to read persisted artifact");
                None
            }
        }
    }

    fn write_persisted(&self, data_type: DataType, bytes: &[u8]) {
        if let Err(err) = self.persistence.lock().write(bytes, data_type, None) {
            error!(error = %err, "Failed to persist cloud artifact");
        }
    }
}
