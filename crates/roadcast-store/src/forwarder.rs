//! Stream forwarder
//!
//! Background worker draining eligible (campaign, partition) streams into
//! the telemetry sender. Forwarding is enabled per partition by one or more
//! sources (an upload condition, or an IoT job); the worker reads records
//! in order, gates uploads on the rate limiter, checkpoints a record only
//! after the sender confirms it, and tracks job completion against optional
//! end-time cutoffs.

use crate::ratelimit::RateLimiter;
use crate::stream::{StreamError, StreamManager};
use parking_lot::{Condvar, Mutex};
use roadcast_core::campaign::{CampaignId, PartitionId};
use roadcast_core::time::{Clock, Timestamp};
use roadcast_uplink::telemetry::TelemetryDataSender;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, trace};

/// Who requested forwarding of a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Source {
    IotJob,
    Condition,
}

/// Invoked once per campaign when an IoT job has drained all its
/// partitions. Never called while internal locks are held.
pub type JobCompletionCallback = Arc<dyn Fn(&str) + Send + Sync>;

type CampaignPartition = (CampaignId, PartitionId);

/// How long a partition rests after reaching end-of-stream.
const WAIT_FOR_DATA_MS: u64 = 1000;

#[derive(Default)]
struct State {
    partitions_to_upload: BTreeMap<CampaignPartition, BTreeSet<Source>>,
    job_campaign_to_partitions: BTreeMap<CampaignId, BTreeSet<PartitionId>>,
    job_campaign_to_end_time: BTreeMap<CampaignId, u64>,
}

/// Flag-backed condition signal; a notification arriving before the wait
/// is not lost.
struct Signal {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn notify(&self) {
        *self.notified.lock() = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut notified = self.notified.lock();
        while !*notified {
            self.condvar.wait(&mut notified);
        }
        *notified = false;
    }

    fn wait_timeout(&self, timeout_ms: u64) {
        let mut notified = self.notified.lock();
        if !*notified {
            self.condvar
                .wait_for(&mut notified, Duration::from_millis(timeout_ms));
        }
        *notified = false;
    }
}

pub struct StreamForwarder {
    stream_manager: Arc<StreamManager>,
    data_sender: Arc<TelemetryDataSender>,
    state: Mutex<State>,
    job_completion_callback: Mutex<Option<JobCompletionCallback>>,
    wait: Signal,
    sender_finished: Signal,
    idle_time_ms: u64,
    should_stop: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    rate_limiter: Mutex<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl StreamForwarder {
    pub fn new(
        stream_manager: Arc<StreamManager>,
        data_sender: Arc<TelemetryDataSender>,
        rate_limiter: RateLimiter,
        idle_time_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            stream_manager,
            data_sender,
            state: Mutex::new(State::default()),
            job_completion_callback: Mutex::new(None),
            wait: Signal::new(),
            sender_finished: Signal::new(),
            idle_time_ms,
            should_stop: AtomicBool::new(false),
            thread: Mutex::new(None),
            rate_limiter: Mutex::new(rate_limiter),
            clock,
        }
    }

    pub fn register_job_completion_callback(&self, callback: JobCompletionCallback) {
        *self.job_completion_callback.lock() = Some(callback);
    }

    pub fn start(self: &Arc<Self>) -> bool {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return true;
        }
        self.should_stop.store(false, Ordering::Relaxed);
        let forwarder = Arc::clone(self);
        match std::thread::Builder::new()
            .name("stream-forwarder".into())
            .spawn(move || forwarder.run())
        {
            Ok(handle) => {
                info!("Stream forwarder thread started");
                *thread = Some(handle);
                true
            }
            Err(err) => {
                error!(error = %err, "Stream forwarder thread failed to start");
                false
            }
        }
    }

    /// Stop the worker. In-flight uploads are not cancelled; their records
    /// are not checkpointed by the exiting worker.
    pub fn stop(&self) -> bool {
        let handle = self.thread.lock().take();
        let Some(handle) = handle else {
            return true;
        };
        info!("Stream forwarder thread stopping");
        self.should_stop.store(true, Ordering::Relaxed);
        self.wait.notify();
        self.sender_finished.notify();
        let _ = handle.join();
        self.should_stop.store(false, Ordering::Relaxed);
        info!("Stream forwarder thread stopped");
        true
    }

    pub fn is_alive(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::Relaxed)
    }

    /// Enable forwarding of one partition for `source`.
    pub fn begin_forward(&self, campaign_id: &str, partition_id: PartitionId, source: Source) {
        let mut state = self.state.lock();
        let enabled = state
            .partitions_to_upload
            .entry((campaign_id.to_string(), partition_id))
            .or_default();
        if enabled.insert(source) {
            trace!(campaign = campaign_id, partition = partition_id, "Forward requested");
            self.wait.notify();
        }
    }

    /// Disable forwarding of one partition for `source`; the partition
    /// entry is dropped once no source remains.
    pub fn cancel_forward(&self, campaign_id: &str, partition_id: PartitionId, source: Source) {
        let mut state = self.state.lock();
        let key = (campaign_id.to_string(), partition_id);
        if let Some(enabled) = state.partitions_to_upload.get_mut(&key) {
            if enabled.remove(&source) {
                trace!(
                    campaign = campaign_id,
                    partition = partition_id,
                    "Forward cancellation requested"
                );
            }
            if enabled.is_empty() {
                state.partitions_to_upload.remove(&key);
            }
        }
    }

    /// Enable job-driven forwarding of every partition of a campaign, with
    /// an optional end time (0 means unbounded). A second job targeting the
    /// same campaign merges end times: the maximum of the two, unless either
    /// is zero, which wins and keeps the campaign unbounded.
    pub fn begin_job_forward(&self, campaign_id: &str, end_time: u64) {
        let partitions = self.stream_manager.partition_ids_from_campaign(campaign_id);
        let mut state = self.state.lock();
        for partition_id in partitions {
            trace!(
                campaign = campaign_id,
                partition = partition_id,
                end_time,
                "Job forward requested"
            );
            let already_tracked = state
                .job_campaign_to_partitions
                .get(campaign_id)
                .map(|set| set.contains(&partition_id))
                .unwrap_or(false)
                && state.job_campaign_to_end_time.contains_key(campaign_id);
            if already_tracked {
                let current_end_time = state.job_campaign_to_end_time[campaign_id];
                let merged = if end_time != 0 && current_end_time != 0 {
                    current_end_time.max(end_time)
                } else {
                    0
                };
                state
                    .job_campaign_to_end_time
                    .insert(campaign_id.to_string(), merged);
            } else {
                state
                    .job_campaign_to_end_time
                    .insert(campaign_id.to_string(), end_time);
            }
            state
                .job_campaign_to_partitions
                .entry(campaign_id.to_string())
                .or_default()
                .insert(partition_id);
            state
                .partitions_to_upload
                .entry((campaign_id.to_string(), partition_id))
                .or_default()
                .insert(Source::IotJob);
        }
        drop(state);
        self.wait.notify();
    }

    fn run(self: Arc<Self>) {
        // Only the worker touches the waiting-for-data bookkeeping.
        let mut waiting_for_data: BTreeMap<CampaignPartition, Timestamp> = BTreeMap::new();

        while !self.should_stop() {
            let now = self.clock.monotonic_time_since_epoch_ms();
            waiting_for_data.retain(|_, deadline| *deadline > now);

            let mut skipped = 0usize;
            let mut partitions_to_read: Vec<(CampaignPartition, u64)> = Vec::new();
            {
                let state = self.state.lock();
                for (campaign_partition, enabled) in &state.partitions_to_upload {
                    if waiting_for_data.contains_key(campaign_partition) {
                        skipped += 1;
                    } else if !enabled.is_empty() {
                        let end_time = state
                            .job_campaign_to_end_time
                            .get(&campaign_partition.0)
                            .copied()
                            .unwrap_or(0);
                        partitions_to_read.push((campaign_partition.clone(), end_time));
                    }
                }
            }

            if partitions_to_read.is_empty() {
                if skipped == 0 {
                    trace!("Waiting indefinitely until campaign forwarding is requested");
                    self.wait.wait();
                } else {
                    // All partitions are resting; wait for data to arrive.
                    self.wait.wait_timeout(self.idle_time_ms);
                }
                continue;
            }

            // Partitions whose streams disappeared (campaign retracted).
            let mut partitions_to_remove: Vec<CampaignPartition> = Vec::new();

            for (campaign_partition, end_time) in partitions_to_read {
                if self.should_stop() {
                    return;
                }
                match self
                    .stream_manager
                    .read_from_stream(&campaign_partition.0, campaign_partition.1)
                {
                    Ok((payload, metadata, checkpoint)) => {
                        if end_time != 0 && metadata.trigger_time >= end_time {
                            self.check_if_job_completed(&campaign_partition);
                            continue;
                        }
                        if !self.rate_limiter.lock().consume_token() {
                            self.wait.wait_timeout(self.idle_time_ms);
                            continue;
                        }
                        info!(
                            campaign = %campaign_partition.0,
                            partition = campaign_partition.1,
                            num_signals = metadata.num_signals,
                            "Processing stored record"
                        );
                        let forwarder = Arc::clone(&self);
                        self.data_sender.process_serialized_data(
                            payload,
                            Box::new(move |success| {
                                if success {
                                    checkpoint();
                                }
                                forwarder.sender_finished.notify();
                            }),
                        );
                        self.sender_finished.wait();
                    }
                    Err(StreamError::EndOfStream) => {
                        self.check_if_job_completed(&campaign_partition);
                        waiting_for_data.insert(
                            campaign_partition,
                            self.clock.monotonic_time_since_epoch_ms() + WAIT_FOR_DATA_MS,
                        );
                    }
                    Err(StreamError::StreamNotFound) => {
                        partitions_to_remove.push(campaign_partition);
                    }
                    Err(err) => {
                        error!(
                            campaign = %campaign_partition.0,
                            partition = campaign_partition.1,
                            error = %err,
                            "Unable to read from stream"
                        );
                    }
                }
            }

            if !partitions_to_remove.is_empty() {
                let mut state = self.state.lock();
                for campaign_partition in partitions_to_remove {
                    if state.partitions_to_upload.remove(&campaign_partition).is_some() {
                        trace!(
                            campaign = %campaign_partition.0,
                            partition = campaign_partition.1,
                            "Stream for partition not found, removing"
                        );
                    }
                }
            }

            self.wait.wait_timeout(self.idle_time_ms);
        }
    }

    /// A stream under an IoT job reached its end (of data, or of the job's
    /// time window): release the partition and, when it was the last one of
    /// the job, fire the completion callback outside the lock.
    fn check_if_job_completed(&self, campaign_partition: &CampaignPartition) {
        let campaign_id = &campaign_partition.0;
        let mut callback = None;
        {
            let mut state = self.state.lock();
            if !state.job_campaign_to_partitions.contains_key(campaign_id) {
                return;
            }
            trace!(
                campaign = %campaign_id,
                partition = campaign_partition.1,
                "Cancelling IoT job forward for partition"
            );
            if let Some(partitions) = state.job_campaign_to_partitions.get_mut(campaign_id) {
                partitions.remove(&campaign_partition.1);
            }
            if let Some(enabled) = state.partitions_to_upload.get_mut(campaign_partition) {
                enabled.remove(&Source::IotJob);
            }
            let job_drained = state
                .job_campaign_to_partitions
                .get(campaign_id)
                .map(|partitions| partitions.is_empty())
                .unwrap_or(false);
            if job_drained {
                state.job_campaign_to_partitions.remove(campaign_id);
                state.job_campaign_to_end_time.remove(campaign_id);
                callback = self.job_completion_callback.lock().clone();
            }
        }
        if let Some(callback) = callback {
            trace!(campaign = %campaign_id, "Notifying that a job finished uploading data");
            callback(campaign_id);
        }
    }
}

impl Drop for StreamForwarder {
    fn drop(&mut self) {
        if self.thread.get_mut().is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use roadcast_core::collection::{
        CollectedSignal, PassThroughMetadata, TriggeredCollectionSchemeData,
    };
    use roadcast_core::scheme::{
        ActiveCollectionSchemes, CollectionScheme, PartitionConfiguration, SignalCollectionInfo,
        StorageOptions,
    };
    use roadcast_core::signal::{SignalId, SignalValue};
    use roadcast_core::time::SystemClock;
    use roadcast_uplink::sender::{ConnectivityError, OnSendCallback, Sender};
    use roadcast_uplink::telemetry::PayloadAdaptionConfig;
    use tempfile::tempdir;

    const CAMPAIGN1: &str = "arn:aws:iam::1:user/campaign1";
    const CAMPAIGN2: &str = "arn:aws:iam::1:user/campaign2";

    struct MockSender {
        sent: PlMutex<Vec<Vec<u8>>>,
        fail_first: PlMutex<usize>,
    }

    impl MockSender {
        fn new() -> Self {
            Self {
                sent: PlMutex::new(Vec::new()),
                fail_first: PlMutex::new(0),
            }
        }

        fn failing_first(failures: usize) -> Self {
            Self {
                fail_first: PlMutex::new(failures),
                ..Self::new()
            }
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }
    }

    impl Sender for MockSender {
        fn get_max_send_size(&self) -> usize {
            4096
        }

        fn send_buffer(&self, _topic: &str, data: &[u8], on_done: OnSendCallback) {
            let mut fail = self.fail_first.lock();
            if *fail > 0 {
                *fail -= 1;
                on_done(Err(ConnectivityError::NoConnection));
                return;
            }
            self.sent.lock().push(data.to_vec());
            on_done(Ok(()));
        }
    }

    struct Fixture {
        mock: Arc<MockSender>,
        stream_manager: Arc<StreamManager>,
        forwarder: Arc<StreamForwarder>,
        _dir: tempfile::TempDir,
    }

    fn scheme(campaign_arn: &str, partition_signals: &[&[SignalId]]) -> CollectionScheme {
        let mut scheme = CollectionScheme {
            sync_id: format!("{campaign_arn}-sync"),
            campaign_arn: campaign_arn.to_string(),
            decoder_manifest_sync_id: "dm-1".into(),
            ..Default::default()
        };
        for (index, signals) in partition_signals.iter().enumerate() {
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

    fn fixture_with_sender(mock: Arc<MockSender>) -> Fixture {
        let dir = tempdir().unwrap();
        let clock: Arc<SystemClock> = Arc::new(SystemClock::new());
        let stream_manager = Arc::new(StreamManager::new(dir.path(), clock.clone()));
        stream_manager.on_change_collection_scheme_list(&ActiveCollectionSchemes {
            schemes: vec![
                scheme(CAMPAIGN1, &[&[0, 1], &[2, 3]]),
                scheme(CAMPAIGN2, &[&[4, 5], &[6, 7]]),
            ],
        });
        let config = PayloadAdaptionConfig::new(80, 70, 90, 10);
        let data_sender = Arc::new(TelemetryDataSender::new(
            mock.clone(),
            "vehicle/signals",
            config,
            config,
        ));
        let rate_limiter = RateLimiter::with_defaults(clock.clone());
        let forwarder = Arc::new(StreamForwarder::new(
            stream_manager.clone(),
            data_sender,
            rate_limiter,
            10,
            clock,
        ));
        Fixture {
            mock,
            stream_manager,
            forwarder,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_sender(Arc::new(MockSender::new()))
    }

    fn triggered(
        campaign_arn: &str,
        signal_ids: &[SignalId],
        trigger_time: u64,
    ) -> TriggeredCollectionSchemeData {
        TriggeredCollectionSchemeData {
            metadata: PassThroughMetadata {
                collection_scheme_id: format!("{campaign_arn}-sync"),
                decoder_id: "dm-1".into(),
                campaign_arn: campaign_arn.to_string(),
                ..Default::default()
            },
            event_id: 42,
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

    fn wait_until(mut condition: impl FnMut() -> bool, timeout_ms: u64) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_forwards_all_enabled_partitions() {
        let f = fixture();
        // One record in each of the four partitions.
        f.stream_manager.append_to_streams(&triggered(CAMPAIGN1, &[0, 1], 100)).unwrap();
        f.stream_manager.append_to_streams(&triggered(CAMPAIGN1, &[2, 3], 100)).unwrap();
        f.stream_manager.append_to_streams(&triggered(CAMPAIGN2, &[4, 5], 100)).unwrap();
        f.stream_manager.append_to_streams(&triggered(CAMPAIGN2, &[6, 7], 100)).unwrap();

        assert!(f.forwarder.start());
        for campaign in [CAMPAIGN1, CAMPAIGN2] {
            for partition in [0, 1] {
                f.forwarder.begin_forward(campaign, partition, Source::Condition);
            }
        }
        assert!(wait_until(|| f.mock.sent_count() == 4, 3000));
        // Every stream is drained; nothing further arrives.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(f.mock.sent_count(), 4);
        f.forwarder.stop();
    }

    #[test]
    fn test_cancel_restores_enabled_set() {
        let f = fixture();
        f.forwarder.begin_forward(CAMPAIGN1, 0, Source::Condition);
        assert!(f
            .forwarder
            .state
            .lock()
            .partitions_to_upload
            .contains_key(&(CAMPAIGN1.to_string(), 0)));
        f.forwarder.cancel_forward(CAMPAIGN1, 0, Source::Condition);
        assert!(!f
            .forwarder
            .state
            .lock()
            .partitions_to_upload
            .contains_key(&(CAMPAIGN1.to_string(), 0)));
    }

    #[test]
    fn test_cancel_keeps_other_sources() {
        let f = fixture();
        f.forwarder.begin_forward(CAMPAIGN1, 0, Source::Condition);
        f.forwarder.begin_forward(CAMPAIGN1, 0, Source::IotJob);
        f.forwarder.cancel_forward(CAMPAIGN1, 0, Source::Condition);
        let state = f.forwarder.state.lock();
        let enabled = &state.partitions_to_upload[&(CAMPAIGN1.to_string(), 0)];
        assert_eq!(enabled.iter().copied().collect::<Vec<_>>(), vec![Source::IotJob]);
    }

    #[test]
    fn test_job_completion_without_end_bound() {
        let f = fixture();
        // One record in partition 0 of each campaign; partition 1 is empty
        // and completes through end-of-stream directly.
        f.stream_manager.append_to_streams(&triggered(CAMPAIGN1, &[0], 100)).unwrap();
        f.stream_manager.append_to_streams(&triggered(CAMPAIGN2, &[4], 100)).unwrap();

        let completed: Arc<PlMutex<Vec<String>>> = Arc::new(PlMutex::new(Vec::new()));
        let completed_cb = completed.clone();
        let forwarder_in_cb = Arc::downgrade(&f.forwarder);
        f.forwarder.register_job_completion_callback(Arc::new(move |campaign| {
            // The partition mutex must not be held during the callback.
            if let Some(forwarder) = forwarder_in_cb.upgrade() {
                assert!(forwarder.state.try_lock().is_some());
            }
            completed_cb.lock().push(campaign.to_string());
        }));

        assert!(f.forwarder.start());
        f.forwarder.begin_job_forward(CAMPAIGN1, 0);
        f.forwarder.begin_job_forward(CAMPAIGN2, 0);

        assert!(wait_until(|| completed.lock().len() == 2, 3000));
        assert!(wait_until(|| f.mock.sent_count() == 2, 1000));
        let calls = completed.lock();
        assert_eq!(calls.iter().filter(|c| c.as_str() == CAMPAIGN1).count(), 1);
        assert_eq!(calls.iter().filter(|c| c.as_str() == CAMPAIGN2).count(), 1);
        f.forwarder.stop();
    }

    #[test]
    fn test_job_end_time_cuts_off_records() {
        let f = fixture();
        // Records at trigger time 1000; the job's window ends at 500.
        f.stream_manager.append_to_streams(&triggered(CAMPAIGN1, &[0], 1000)).unwrap();

        let completed: Arc<PlMutex<usize>> = Arc::new(PlMutex::new(0));
        let completed_cb = completed.clone();
        f.forwarder
            .register_job_completion_callback(Arc::new(move |_| *completed_cb.lock() += 1));

        assert!(f.forwarder.start());
        f.forwarder.begin_job_forward(CAMPAIGN1, 500);
        assert!(wait_until(|| *completed.lock() == 1, 3000));
        assert_eq!(f.mock.sent_count(), 0);
        f.forwarder.stop();
    }

    #[test]
    fn test_job_end_time_merge_zero_wins() {
        let f = fixture();
        f.forwarder.begin_job_forward(CAMPAIGN1, 100);
        f.forwarder.begin_job_forward(CAMPAIGN1, 200);
        assert_eq!(
            f.forwarder.state.lock().job_campaign_to_end_time[CAMPAIGN1],
            200
        );
        f.forwarder.begin_job_forward(CAMPAIGN1, 0);
        assert_eq!(
            f.forwarder.state.lock().job_campaign_to_end_time[CAMPAIGN1],
            0
        );
        // Zero propagates: a later bounded job cannot re-bound the campaign.
        f.forwarder.begin_job_forward(CAMPAIGN1, 300);
        assert_eq!(
            f.forwarder.state.lock().job_campaign_to_end_time[CAMPAIGN1],
            0
        );
    }

    #[test]
    fn test_failed_upload_is_retried() {
        let f = fixture_with_sender(Arc::new(MockSender::failing_first(1)));
        f.stream_manager.append_to_streams(&triggered(CAMPAIGN1, &[0], 100)).unwrap();

        assert!(f.forwarder.start());
        f.forwarder.begin_forward(CAMPAIGN1, 0, Source::Condition);
        // First attempt fails and is not checkpointed; the worker reads the
        // same record again and succeeds.
        assert!(wait_until(|| f.mock.sent_count() == 1, 3000));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(f.mock.sent_count(), 1);
        f.forwarder.stop();
    }

    #[test]
    fn test_retracted_campaign_partition_removed() {
        let f = fixture();
        f.stream_manager.append_to_streams(&triggered(CAMPAIGN1, &[0], 100)).unwrap();
        assert!(f.forwarder.start());
        f.forwarder.begin_forward(CAMPAIGN1, 0, Source::Condition);
        assert!(wait_until(|| f.mock.sent_count() == 1, 3000));

        // Retract all campaigns; the worker drops the partition entry.
        f.stream_manager
            .on_change_collection_scheme_list(&ActiveCollectionSchemes::default());
        assert!(wait_until(
            || f.forwarder.state.lock().partitions_to_upload.is_empty(),
            3000
        ));
        f.forwarder.stop();
    }
}
