//! Per-partition offset ledger
//!
//! Tracks which offsets are eligible to commit for each owned partition,
//! under every ack mode. With out-of-order acknowledgments enabled, also
//! tracks delivered-but-unacked offsets so a gap pauses the partition until
//! it closes. Committed offsets never move backwards.

use crate::client::{OffsetAndMetadata, OffsetMap, TopicPartition};
use crate::config::AckMode;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct PartitionOffsets {
    /// Next offset eligible to commit, when ahead of the committed floor
    pending: Option<i64>,

    /// Highest offset already handed out for commit; pending never falls
    /// at or below this
    floor: Option<i64>,

    /// Delivered-but-unacked offsets, in delivery order
    in_flight: VecDeque<i64>,

    /// Acked offsets not yet absorbed into the committable prefix
    acked: BTreeSet<i64>,

    /// Whether this partition is currently paused for an ack gap
    gap_paused: bool,
}

impl PartitionOffsets {
    fn advance_pending(&mut self, next_offset: i64) -> bool {
        if let Some(floor) = self.floor {
            if next_offset <= floor {
                return false;
            }
        }
        match self.pending {
            Some(current) if current >= next_offset => false,
            _ => {
                self.pending = Some(next_offset);
                true
            }
        }
    }

    fn has_gap(&self) -> bool {
        !self.in_flight.is_empty() && !self.acked.is_empty()
    }
}

/// Result of draining acknowledgment state: partitions whose gap state
/// changed since the last check
#[derive(Debug, Default, PartialEq, Eq)]
pub struct GapTransitions {
    /// Partitions that must be paused until their gap closes
    pub to_pause: Vec<TopicPartition>,

    /// Partitions whose gap closed and can resume
    pub to_resume: Vec<TopicPartition>,
}

/// In-memory ledger mapping each owned partition to the highest offset
/// safe to commit next
pub struct OffsetTracker {
    ack_mode: AckMode,
    async_acks: bool,
    ack_count: u32,
    ack_time: Duration,
    partitions: HashMap<TopicPartition, PartitionOffsets>,
    uncommitted: u32,
    last_commit: Instant,
}

impl OffsetTracker {
    /// Create a tracker for the given commit policy
    pub fn new(ack_mode: AckMode, async_acks: bool, ack_count: u32, ack_time: Duration) -> Self {
        Self {
            ack_mode,
            async_acks,
            ack_count,
            ack_time,
            partitions: HashMap::new(),
            uncommitted: 0,
            last_commit: Instant::now(),
        }
    }

    fn tracks_in_flight(&self) -> bool {
        self.ack_mode.is_manual() || self.async_acks
    }

    /// Start tracking a newly assigned partition
    pub fn on_partition_assigned(&mut self, tp: &TopicPartition) {
        self.partitions.entry(tp.clone()).or_default();
    }

    /// Stop tracking revoked partitions, returning their pending offsets
    /// so the caller can commit them before the revocation completes
    pub fn on_partitions_revoked(&mut self, partitions: &[TopicPartition]) -> OffsetMap {
        let mut offsets = OffsetMap::new();
        for tp in partitions {
            if let Some(mut state) = self.partitions.remove(tp) {
                if let Some(pending) = state.pending.take() {
                    offsets.insert(tp.clone(), OffsetAndMetadata::new(pending));
                }
            }
        }
        offsets
    }

    /// Drop state for lost partitions. Their offsets are already owned
    /// elsewhere; nothing is committed.
    pub fn on_partitions_lost(&mut self, partitions: &[TopicPartition]) {
        for tp in partitions {
            self.partitions.remove(tp);
        }
    }

    /// Record a delivery; with manual or async acks the offset joins the
    /// in-flight queue for gap detection. Redelivery of an offset that is
    /// already in flight (retained records) is not tracked twice.
    pub fn record_delivered(&mut self, tp: &TopicPartition, offset: i64) {
        if !self.tracks_in_flight() {
            return;
        }
        let state = self.partitions.entry(tp.clone()).or_default();
        if !state.in_flight.contains(&offset) {
            state.in_flight.push_back(offset);
        }
    }

    /// Record a successful dispatch under the automatic ack modes
    pub fn record_processed(&mut self, tp: &TopicPartition, offset: i64) {
        let tracks = self.tracks_in_flight();
        let state = self.partitions.entry(tp.clone()).or_default();
        if tracks {
            if let Some(front) = state.in_flight.front() {
                if *front == offset {
                    state.in_flight.pop_front();
                }
            }
        }
        if state.advance_pending(offset + 1) {
            self.uncommitted += 1;
            trace!(partition = %tp, next = offset + 1, "Offset eligible to commit");
        }
    }

    /// Record an acknowledgment from an ack handle; absorbs the fully
    /// acked prefix of the in-flight queue into the committable offset
    pub fn record_acked(&mut self, tp: &TopicPartition, offset: i64) {
        let state = self.partitions.entry(tp.clone()).or_default();
        state.acked.insert(offset);

        let mut absorbed = 0u32;
        let mut last = None;
        while let Some(front) = state.in_flight.front().copied() {
            if state.acked.remove(&front) {
                state.in_flight.pop_front();
                last = Some(front);
                absorbed += 1;
            } else {
                break;
            }
        }
        if let Some(last) = last {
            if state.advance_pending(last + 1) {
                self.uncommitted += absorbed;
            }
        }
    }

    /// Gap state changes since the last call. Only meaningful with async
    /// acks; a partition pauses while an earlier offset is still unacked.
    pub fn gap_transitions(&mut self) -> GapTransitions {
        let mut transitions = GapTransitions::default();
        if !self.async_acks {
            return transitions;
        }
        for (tp, state) in &mut self.partitions {
            let gap = state.has_gap();
            if gap && !state.gap_paused {
                state.gap_paused = true;
                transitions.to_pause.push(tp.clone());
            } else if !gap && state.gap_paused {
                state.gap_paused = false;
                transitions.to_resume.push(tp.clone());
            }
        }
        transitions.to_pause.sort();
        transitions.to_resume.sort();
        transitions
    }

    /// Discard delivery tracking at and above `offset` after a seek-back;
    /// the records will be redelivered
    pub fn on_seek(&mut self, tp: &TopicPartition, offset: i64) {
        if let Some(state) = self.partitions.get_mut(tp) {
            state.in_flight.retain(|o| *o < offset);
            state.acked.retain(|o| *o < offset);
        }
    }

    /// Offsets ready to commit under the configured policy. Time and count
    /// thresholds are applied here; the other modes drain unconditionally.
    pub fn take_commits(&mut self) -> OffsetMap {
        let due = match self.ack_mode {
            AckMode::Record
            | AckMode::Batch
            | AckMode::Manual
            | AckMode::ManualImmediate => true,
            AckMode::Time => self.last_commit.elapsed() >= self.ack_time,
            AckMode::Count => self.uncommitted >= self.ack_count,
            AckMode::CountTime => {
                self.uncommitted >= self.ack_count || self.last_commit.elapsed() >= self.ack_time
            }
        };
        if !due {
            return OffsetMap::new();
        }
        self.drain_pending()
    }

    /// Drain every pending offset regardless of thresholds; used at stop
    /// and before revocation commits
    pub fn take_all_pending(&mut self) -> OffsetMap {
        self.drain_pending()
    }

    fn drain_pending(&mut self) -> OffsetMap {
        let mut offsets = OffsetMap::new();
        for (tp, state) in &mut self.partitions {
            if let Some(pending) = state.pending.take() {
                state.floor = Some(pending - 1);
                offsets.insert(tp.clone(), OffsetAndMetadata::new(pending));
            }
        }
        if !offsets.is_empty() {
            self.uncommitted = 0;
            self.last_commit = Instant::now();
            debug!(count = offsets.len(), "Offsets drained for commit");
        }
        offsets
    }

    /// Partitions currently tracked
    pub fn tracked_partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<TopicPartition> = self.partitions.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Whether any offset is waiting to be committed
    pub fn has_pending(&self) -> bool {
        self.partitions.values().any(|s| s.pending.is_some())
    }
}
