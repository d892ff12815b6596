//! Store-and-forward record streams
//!
//! One append-only record log per (campaign, partition), kept under the
//! campaign's storage location below the persistence root. Each log carries
//! a sidecar key/value tree holding the persistent read cursor, so a stream
//! resumes where it left off after a restart. Logs are bounded by the
//! partition's byte quota (oldest records evicted first) and records past
//! their minimum TTL may be dropped opportunistically.

use parking_lot::Mutex;
use roadcast_core::campaign::{campaign_name_from_arn, CampaignName, PartitionId};
use roadcast_core::collection::{CollectedSignal, TriggeredCollectionSchemeData};
use roadcast_core::scheme::ActiveCollectionSchemes;
use roadcast_core::signal::SignalId;
use roadcast_core::time::{Clock, Timestamp};
use roadcast_uplink::payload::TelemetryEnvelope;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Sidecar key holding the stream's persistent iterator position.
pub const STREAM_ITER_IDENTIFIER: &str = "stream_iterator";
/// Name of the sidecar key/value tree.
pub const KV_STORE_IDENTIFIER: &str = "kv_store";
/// Checkpoint operations between forced flushes of the sidecar.
pub const KV_COMPACT_AFTER: u64 = 512;

const RECORDS_TREE: &str = "records";
const CHECKPOINT_OPS_KEY: &str = "checkpoint_ops";

#[derive(Debug, Error)]
pub enum StreamError {
    /// The (campaign, partition) pair is not known to the stream manager.
    #[error("Stream not found")]
    StreamNotFound,
    /// The iterator reached the current end; appends may arrive later.
    #[error("End of stream")]
    EndOfStream,
    /// The data carries no signals for any partition.
    #[error("No signal data to store")]
    EmptyData,
    /// A single record exceeds the partition's byte quota.
    #[error("Record larger than the partition quota")]
    RecordTooLarge,
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Metadata of one stored record, available without deserializing the
/// payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordMetadata {
    pub num_signals: usize,
    pub trigger_time: Timestamp,
}

/// Advances the stream past the record it was returned for and persists the
/// new cursor. Invoke only after the record was handled successfully.
pub type Checkpoint = Box<dyn FnOnce() + Send>;

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    trigger_time: Timestamp,
    num_signals: u64,
    payload: Vec<u8>,
}

struct Partition {
    id: PartitionId,
    db: sled::Db,
    records: sled::Tree,
    kv: sled::Tree,
    signal_ids: HashSet<SignalId>,
    max_bytes: u64,
    min_ttl_seconds: u32,
    current_bytes: u64,
    next_seq: u64,
}

impl Partition {
    fn open(
        path: &Path,
        id: PartitionId,
        signal_ids: HashSet<SignalId>,
        max_bytes: u64,
        min_ttl_seconds: u32,
    ) -> Result<Self, StreamError> {
        let db = sled::open(path)?;
        let records = db.open_tree(RECORDS_TREE)?;
        let kv = db.open_tree(KV_STORE_IDENTIFIER)?;

        let mut current_bytes = 0u64;
        for item in records.iter() {
            let (_, value) = item?;
            current_bytes += value.len() as u64;
        }
        let next_seq = match records.last()? {
            Some((key, _)) => decode_seq(&key) + 1,
            None => 0,
        };
        Ok(Self {
            id,
            db,
            records,
            kv,
            signal_ids,
            max_bytes,
            min_ttl_seconds,
            current_bytes,
            next_seq,
        })
    }

    fn append(&mut self, record: &[u8], now_system_ms: Timestamp) -> Result<(), StreamError> {
        if record.len() as u64 > self.max_bytes {
            return Err(StreamError::RecordTooLarge);
        }
        self.drop_expired(now_system_ms)?;
        while self.current_bytes + record.len() as u64 > self.max_bytes {
            match self.records.pop_min()? {
                Some((_, value)) => {
                    self.current_bytes -= value.len() as u64;
                }
                None => break,
            }
        }
        self.records
            .insert(self.next_seq.to_be_bytes(), record)?;
        self.current_bytes += record.len() as u64;
        self.next_seq += 1;
        Ok(())
    }

    /// Drop head records whose age exceeds the minimum TTL. Best effort:
    /// the TTL only promises data is retained that long, not dropped right
    /// after.
    fn drop_expired(&mut self, now_system_ms: Timestamp) -> Result<(), StreamError> {
        if self.min_ttl_seconds == 0 {
            return Ok(());
        }
        let ttl_ms = u64::from(self.min_ttl_seconds) * 1000;
        while let Some((_, value)) = self.records.first()? {
            let record: StoredRecord = match postcard::from_bytes(&value) {
                Ok(record) => record,
                Err(_) => break,
            };
            if record.trigger_time.saturating_add(ttl_ms) >= now_system_ms {
                break;
            }
            if let Some((_, dropped)) = self.records.pop_min()? {
                self.current_bytes -= dropped.len() as u64;
            }
        }
        Ok(())
    }

    fn cursor(&self) -> Result<u64, StreamError> {
        Ok(self
            .kv
            .get(STREAM_ITER_IDENTIFIER)?
            .map(|value| decode_seq(&value))
            .unwrap_or(0))
    }
}

struct Campaign {
    partitions: Vec<Partition>,
}

/// Owns all store-and-forward streams. Thread safe: one internal lock
/// serializes campaign changes, appends, and reads; checkpoints touch only
/// the sidecar tree and run lock free.
pub struct StreamManager {
    persistence_root: PathBuf,
    campaigns: Mutex<HashMap<CampaignName, Campaign>>,
    clock: Arc<dyn Clock>,
}

impl StreamManager {
    pub fn new(persistence_root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            persistence_root: persistence_root.into(),
            campaigns: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Diff the new scheme list against the current campaigns: open streams
    /// for new (campaign, partition) pairs, keep matching ones, drop streams
    /// of retracted campaigns.
    pub fn on_change_collection_scheme_list(&self, active: &ActiveCollectionSchemes) {
        let mut campaigns = self.campaigns.lock();
        let mut retained: HashMap<CampaignName, Campaign> = HashMap::new();

        for scheme in &active.schemes {
            if scheme.partitions.is_empty() {
                continue;
            }
            let name = campaign_name_from_arn(&scheme.campaign_arn).to_string();
            if retained.contains_key(&name) {
                continue;
            }
            let mut previous = campaigns.remove(&name);
            let mut partitions = Vec::new();
            for (index, config) in scheme.partitions.iter().enumerate() {
                let id = index as PartitionId;
                let signal_ids: HashSet<SignalId> = scheme
                    .collect_signals
                    .iter()
                    .filter(|signal| signal.data_partition_id == id)
                    .map(|signal| signal.signal_id)
                    .collect();

                let reused = previous.as_mut().and_then(|campaign| {
                    campaign
                        .partitions
                        .iter()
                        .position(|partition| partition.id == id)
                        .map(|pos| campaign.partitions.swap_remove(pos))
                });
                let partition = match reused {
                    Some(mut partition) => {
                        partition.signal_ids = signal_ids;
                        partition.max_bytes = config.storage_options.maximum_size_in_bytes;
                        partition.min_ttl_seconds =
                            config.storage_options.minimum_time_to_live_in_seconds;
                        partition
                    }
                    None => {
                        let path = self
                            .persistence_root
                            .join(&name)
                            .join(&config.storage_options.storage_location);
                        match Partition::open(
                            &path,
                            id,
                            signal_ids,
                            config.storage_options.maximum_size_in_bytes,
                            config.storage_options.minimum_time_to_live_in_seconds,
                        ) {
                            Ok(partition) => partition,
                            Err(err) => {
                                error!(
                                    campaign = %name,
                                    partition = id,
                                    error = %err,
                                    "Failed to open stream, skipping partition"
                                );
                                continue;
                            }
                        }
                    }
                };
                partitions.push(partition);
            }
            info!(campaign = %name, partitions = partitions.len(), "Stream campaign active");
            retained.insert(name, Campaign { partitions });
        }

        for name in campaigns.keys() {
            info!(campaign = %name, "Dropping streams of retracted campaign");
        }
        *campaigns = retained;
    }

    /// Append the triggered data to every partition whose signal set
    /// intersects it. Partitions with an empty intersection are skipped.
    pub fn append_to_streams(
        &self,
        data: &TriggeredCollectionSchemeData,
    ) -> Result<(), StreamError> {
        if data.signals.is_empty() {
            return Err(StreamError::EmptyData);
        }
        let name = campaign_name_from_arn(&data.metadata.campaign_arn);
        let mut campaigns = self.campaigns.lock();
        let campaign = campaigns.get_mut(name).ok_or(StreamError::StreamNotFound)?;
        let now = self.clock.system_time_since_epoch_ms();

        for partition in &mut campaign.partitions {
            let subset: Vec<CollectedSignal> = data
                .signals
                .iter()
                .filter(|signal| partition.signal_ids.contains(&signal.signal_id))
                .cloned()
                .collect();
            if subset.is_empty() {
                continue;
            }
            let num_signals = subset.len() as u64;
            let envelope = TelemetryEnvelope {
                event_id: data.event_id,
                collection_scheme_id: data.metadata.collection_scheme_id.clone(),
                decoder_id: data.metadata.decoder_id.clone(),
                trigger_time: data.trigger_time,
                signals: subset,
                active_dtcs: data
                    .active_dtcs
                    .as_ref()
                    .map(|dtcs| dtcs.codes.clone())
                    .unwrap_or_default(),
            };
            let record = StoredRecord {
                trigger_time: data.trigger_time,
                num_signals,
                payload: envelope.to_bytes()?,
            };
            partition.append(&postcard::to_allocvec(&record)?, now)?;
        }
        Ok(())
    }

    /// Read the record at the stream's cursor. The returned checkpoint
    /// advances the cursor past the record and persists it; a record read
    /// but not checkpointed is returned again next time.
    pub fn read_from_stream(
        &self,
        campaign_id: &str,
        partition_id: PartitionId,
    ) -> Result<(Vec<u8>, RecordMetadata, Checkpoint), StreamError> {
        let name = campaign_name_from_arn(campaign_id);
        let campaigns = self.campaigns.lock();
        let campaign = campaigns.get(name).ok_or(StreamError::StreamNotFound)?;
        let partition = campaign
            .partitions
            .iter()
            .find(|partition| partition.id == partition_id)
            .ok_or(StreamError::StreamNotFound)?;

        let cursor = partition.cursor()?;
        let (key, value) = match partition.records.range(cursor.to_be_bytes()..).next() {
            None => return Err(StreamError::EndOfStream),
            Some(item) => item?,
        };
        let record: StoredRecord = postcard::from_bytes(&value)?;
        let metadata = RecordMetadata {
            num_signals: record.num_signals as usize,
            trigger_time: record.trigger_time,
        };

        let next = decode_seq(&key) + 1;
        let kv = partition.kv.clone();
        let db = partition.db.clone();
        let checkpoint: Checkpoint = Box::new(move || {
            if let Err(err) = kv.insert(STREAM_ITER_IDENTIFIER, &next.to_be_bytes()) {
                error!(error = %err, "Failed to persist stream cursor");
                return;
            }
            let ops = kv
                .get(CHECKPOINT_OPS_KEY)
                .ok()
                .flatten()
                .map(|value| decode_seq(&value))
                .unwrap_or(0)
                + 1;
            if let Err(err) = kv.insert(CHECKPOINT_OPS_KEY, &ops.to_be_bytes()) {
                warn!(error = %err, "Failed to update checkpoint counter");
            }
            if ops % KV_COMPACT_AFTER == 0 {
                if let Err(err) = db.flush() {
                    warn!(error = %err, "Failed to flush stream sidecar");
                }
            }
        });
        Ok((record.payload, metadata, checkpoint))
    }

    pub fn has_campaign(&self, campaign_id: &str) -> bool {
        let name = campaign_name_from_arn(campaign_id);
        self.campaigns.lock().contains_key(name)
    }

    pub fn partition_ids_from_campaign(&self, campaign_id: &str) -> BTreeSet<PartitionId> {
        let name = campaign_name_from_arn(campaign_id);
        self.campaigns
            .lock()
            .get(name)
            .map(|campaign| {
                campaign
                    .partitions
                    .iter()
                    .map(|partition| partition.id)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn decode_seq(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[8 - len..].copy_from_slice(&bytes[..len]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use roadcast_core::collection::PassThroughMetadata;
    use roadcast_core::scheme::{
        CollectionScheme, PartitionConfiguration, SignalCollectionInfo, StorageOptions,
    };
    use roadcast_core::signal::SignalValue;
    use roadcast_core::time::TestClock;
    use tempfile::tempdir;

    const CAMPAIGN1: &str = "arn:aws:iam::1:user/campaign1";

    fn scheme_with_partitions(campaign_arn: &str, signals_per_partition: &[&[SignalId]]) -> CollectionScheme {
        let mut scheme = CollectionScheme {
            sync_id: format!("{campaign_arn}-sync"),
            campaign_arn: campaign_arn.to_string(),
            decoder_manifest_sync_id: "dm-1".into(),
            ..Default::default()
        };
        for (index, signals) in signals_per_partition.iter().enumerate() {
            scheme.partitions.push(PartitionConfiguration {
                storage_options: StorageOptions {
                    maximum_size_in_bytes: 1_000_000,
                    storage_location: format!("partition{index}"),
                    minimum_time_to_live_in_seconds: 1_000_000,
                },
                upload_condition: None,
            });
            for signal_id in signals.iter() {
                scheme.collect_signals.push(SignalCollectionInfo {
                    signal_id: *signal_id,
                    sample_buffer_size: 100,
                    data_partition_id: index as u32,
                    ..Default::default()
                });
            }
        }
        scheme
    }

    fn triggered(campaign_arn: &str, signal_ids: &[SignalId], trigger_time: Timestamp) -> TriggeredCollectionSchemeData {
        TriggeredCollectionSchemeData {
            metadata: PassThroughMetadata {
                collection_scheme_id: "scheme-1".into(),
                decoder_id: "dm-1".into(),
                campaign_arn: campaign_arn.to_string(),
                ..Default::default()
            },
            event_id: 1234,
            trigger_time,
            signals: signal_ids
                .iter()
                .map(|id| CollectedSignal {
                    signal_id: *id,
                    receive_time: trigger_time,
                    value: SignalValue::U8(5),
                })
                .collect(),
            active_dtcs: None,
        }
    }

    fn manager_with_campaign(
        root: &Path,
        clock: Arc<TestClock>,
    ) -> StreamManager {
        let manager = StreamManager::new(root, clock);
        let schemes = ActiveCollectionSchemes {
            schemes: vec![scheme_with_partitions(CAMPAIGN1, &[&[0, 1], &[2, 3]])],
        };
        manager.on_change_collection_scheme_list(&schemes);
        manager
    }

    #[test]
    fn test_append_read_checkpoint_cycle() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(TestClock::new(10_000));
        let manager = manager_with_campaign(dir.path(), clock);

        manager.append_to_streams(&triggered(CAMPAIGN1, &[0, 1], 100)).unwrap();
        manager.append_to_streams(&triggered(CAMPAIGN1, &[0], 200)).unwrap();

        let (payload, metadata, checkpoint) = manager.read_from_stream(CAMPAIGN1, 0).unwrap();
        assert_eq!(metadata.num_signals, 2);
        assert_eq!(metadata.trigger_time, 100);
        let envelope = TelemetryEnvelope::from_bytes(&payload).unwrap();
        assert_eq!(envelope.signals.len(), 2);

        // Without a checkpoint the same record comes back.
        let (_, metadata_again, checkpoint_again) = manager.read_from_stream(CAMPAIGN1, 0).unwrap();
        assert_eq!(metadata_again.trigger_time, 100);
        drop(checkpoint_again);

        checkpoint();
        let (_, metadata_next, checkpoint_next) = manager.read_from_stream(CAMPAIGN1, 0).unwrap();
        assert_eq!(metadata_next.trigger_time, 200);
        checkpoint_next();
        assert!(matches!(
            manager.read_from_stream(CAMPAIGN1, 0),
            Err(StreamError::EndOfStream)
        ));
    }

    #[test]
    fn test_signals_route_to_their_partitions() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(TestClock::new(10_000));
        let manager = manager_with_campaign(dir.path(), clock);

        manager
            .append_to_streams(&triggered(CAMPAIGN1, &[0, 2], 100))
            .unwrap();

        let (payload0, _, _) = manager.read_from_stream(CAMPAIGN1, 0).unwrap();
        let envelope0 = TelemetryEnvelope::from_bytes(&payload0).unwrap();
        assert_eq!(envelope0.signals[0].signal_id, 0);

        let (payload1, _, _) = manager.read_from_stream(CAMPAIGN1, 1).unwrap();
        let envelope1 = TelemetryEnvelope::from_bytes(&payload1).unwrap();
        assert_eq!(envelope1.signals[0].signal_id, 2);
    }

    #[test]
    fn test_empty_intersection_skips_partition() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(TestClock::new(10_000));
        let manager = manager_with_campaign(dir.path(), clock);

        // Signals only for partition 0.
        manager.append_to_streams(&triggered(CAMPAIGN1, &[1], 100)).unwrap();
        assert!(matches!(
            manager.read_from_stream(CAMPAIGN1, 1),
            Err(StreamError::EndOfStream)
        ));
    }

    #[test]
    fn test_empty_data_rejected() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(TestClock::new(10_000));
        let manager = manager_with_campaign(dir.path(), clock);
        assert!(matches!(
            manager.append_to_streams(&triggered(CAMPAIGN1, &[], 100)),
            Err(StreamError::EmptyData)
        ));
    }

    #[test]
    fn test_unknown_campaign() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(TestClock::new(10_000));
        let manager = manager_with_campaign(dir.path(), clock);
        assert!(matches!(
            manager.append_to_streams(&triggered("arn:aws:iam::1:user/other", &[0], 100)),
            Err(StreamError::StreamNotFound)
        ));
        assert!(matches!(
            manager.read_from_stream("arn:aws:iam::1:user/other", 0),
            Err(StreamError::StreamNotFound)
        ));
    }

    #[test]
    fn test_campaign_removal_drops_streams() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(TestClock::new(10_000));
        let manager = manager_with_campaign(dir.path(), clock);
        assert!(manager.has_campaign(CAMPAIGN1));

        manager.on_change_collection_scheme_list(&ActiveCollectionSchemes::default());
        assert!(!manager.has_campaign(CAMPAIGN1));
        assert!(matches!(
            manager.read_from_stream(CAMPAIGN1, 0),
            Err(StreamError::StreamNotFound)
        ));
    }

    #[test]
    fn test_cursor_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let clock = Arc::new(TestClock::new(10_000));
            let manager = manager_with_campaign(dir.path(), clock);
            manager.append_to_streams(&triggered(CAMPAIGN1, &[0], 100)).unwrap();
            manager.append_to_streams(&triggered(CAMPAIGN1, &[0], 200)).unwrap();
            let (_, _, checkpoint) = manager.read_from_stream(CAMPAIGN1, 0).unwrap();
            checkpoint();
        }
        let clock = Arc::new(TestClock::new(20_000));
        let manager = manager_with_campaign(dir.path(), clock);
        let (_, metadata, _) = manager.read_from_stream(CAMPAIGN1, 0).unwrap();
        assert_eq!(metadata.trigger_time, 200);
    }

    #[test]
    fn test_quota_evicts_oldest() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(TestClock::new(10_000));
        let manager = StreamManager::new(dir.path(), clock);

        let mut scheme = scheme_with_partitions(CAMPAIGN1, &[&[0]]);
        scheme.partitions[0].storage_options.maximum_size_in_bytes = 256;
        manager.on_change_collection_scheme_list(&ActiveCollectionSchemes {
            schemes: vec![scheme],
        });

        for i in 0..50u64 {
            manager
                .append_to_streams(&triggered(CAMPAIGN1, &[0], 1000 + i))
                .unwrap();
        }
        // Oldest records were evicted: the first readable record is late in
        // the sequence and the backlog fits the quota.
        let (_, metadata, _) = manager.read_from_stream(CAMPAIGN1, 0).unwrap();
        assert!(metadata.trigger_time > 1000);
    }

    #[test]
    fn test_partition_ids_and_default_partition() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(TestClock::new(10_000));
        let manager = manager_with_campaign(dir.path(), clock);
        let ids = manager.partition_ids_from_campaign(CAMPAIGN1);
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![0, 1]);
        assert!(manager
            .partition_ids_from_campaign("arn:aws:iam::1:user/none")
            .is_empty());
    }
}
