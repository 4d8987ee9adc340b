//! Turning the record stream back into pings.
//!
//! The device sends each record of a ping as its own message, so a ping is reassembled by
//! collecting records until the next 7000 arrives. Water column (7018) and element (7038)
//! records are requested out of band and kept in latest-value slots instead.
//!
//! Chunks whose size fields disagree with each other or with the bytes received are dropped
//! without complaint. The stream has to keep flowing past the odd corrupt datagram.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::frame::{u32_at, validate_chunk, MIN_RECORD_CHUNK, NETWORK_FRAME_SIZE};
use crate::record::{
    CommandReply, DiagnosticKind, PingSettings, Record, RecordClass, RecordType,
};
use crate::sweep::SweepCounter;

/// Upper bound on a single message, anything larger is treated as garbage
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Where a receive loop delivers what it reads
pub trait RecordSink: Send {
    /// Handle one chunk exactly as read from the socket
    fn consume(&mut self, chunk: &[u8]) -> Result<()>;

    /// Called once when the receive loop ends
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// All records received between two ping boundaries, keyed by type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingBundle {
    /// Counts published bundles, starting at zero
    pub sequence: u64,
    records: BTreeMap<RecordType, Record>,
}

/// Result of pairing two records of a bundle by their time stamps
#[derive(Debug, PartialEq)]
pub enum Correlation<'a> {
    Matched(&'a Record, &'a Record),
    /// Both records are present but were stamped at different times
    Ambiguous,
    /// At least one of the records is missing
    Missing,
}

impl PingBundle {
    pub fn get(&self, record_type: RecordType) -> Option<&Record> {
        self.records.get(&record_type)
    }

    pub fn contains(&self, record_type: RecordType) -> bool {
        self.records.contains_key(&record_type)
    }

    pub fn record_types(&self) -> impl Iterator<Item = RecordType> + '_ {
        self.records.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Settings from the 7000 record that opened this bundle
    pub fn ping_settings(&self) -> Option<PingSettings> {
        self.get(RecordType::Ping)
            .and_then(|r| PingSettings::from_record(r).ok())
    }

    /// Pair two records of the bundle, requiring identical time stamps
    pub fn correlate(&self, a: RecordType, b: RecordType) -> Correlation<'_> {
        match (self.get(a), self.get(b)) {
            (Some(ra), Some(rb)) if ra.time_bytes() == rb.time_bytes() => {
                Correlation::Matched(ra, rb)
            }
            (Some(_), Some(_)) => {
                warn!(%a, %b, sequence = self.sequence, "records carry different time stamps");
                Correlation::Ambiguous
            }
            _ => Correlation::Missing,
        }
    }

    fn insert(&mut self, record: Record) {
        self.records.insert(record.record_type, record);
    }
}

/// Latest record of one diagnostic type, plus whether it has been read yet
#[derive(Debug, Default)]
pub struct LatestSlot {
    record: Mutex<Option<Record>>,
    arrived: Condvar,
}

impl LatestSlot {
    fn lock(&self) -> MutexGuard<'_, Option<Record>> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put(&self, record: Record) {
        *self.lock() = Some(record);
        self.arrived.notify_all();
    }

    /// True when a record arrived that nobody has taken yet
    pub fn is_fresh(&self) -> bool {
        self.lock().is_some()
    }

    pub fn take(&self) -> Option<Record> {
        self.lock().take()
    }

    pub fn clear(&self) {
        self.lock().take();
    }

    /// Wait up to `timeout` for a fresh record and take it
    pub fn wait_fresh(&self, timeout: Duration) -> Option<Record> {
        let guard = self.lock();
        let (mut guard, _) = self
            .arrived
            .wait_timeout_while(guard, timeout, |slot| slot.is_none())
            .unwrap_or_else(|e| e.into_inner());
        guard.take()
    }
}

#[derive(Debug, Default)]
pub struct DiagnosticSlots {
    water_column: LatestSlot,
    element_samples: LatestSlot,
}

impl DiagnosticSlots {
    pub fn slot(&self, kind: DiagnosticKind) -> &LatestSlot {
        match kind {
            DiagnosticKind::WaterColumn => &self.water_column,
            DiagnosticKind::ElementSamples => &self.element_samples,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    pub accepted: u64,
    pub rejected: u64,
    pub published: u64,
    /// Bundles lost because the consumer fell behind
    pub dropped: u64,
}

/// Classifies validated records into ping bundles, diagnostic slots and replies
pub struct Demultiplexer {
    current: PingBundle,
    next_sequence: u64,
    bundles: Sender<PingBundle>,
    diagnostics: Arc<DiagnosticSlots>,
    replies: Option<Sender<Record>>,
    sweep: Option<Arc<SweepCounter>>,
    stats: DemuxStats,
}

impl Demultiplexer {
    pub fn new(bundles: Sender<PingBundle>, diagnostics: Arc<DiagnosticSlots>) -> Self {
        Self {
            current: PingBundle::default(),
            next_sequence: 0,
            bundles,
            diagnostics,
            replies: None,
            sweep: None,
            stats: DemuxStats::default(),
        }
    }

    /// Forward 7501, 7502 and 7503 records to `replies`
    pub fn with_replies(mut self, replies: Sender<Record>) -> Self {
        self.replies = Some(replies);
        self
    }

    /// Feed the settings of every 7000 record to `sweep`
    pub fn with_sweep(mut self, sweep: Arc<SweepCounter>) -> Self {
        self.sweep = Some(sweep);
        self
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats
    }

    /// Validate and classify one chunk. Returns whether it held a record.
    pub fn handle(&mut self, chunk: &[u8]) -> bool {
        let Some(record) = Record::from_chunk(chunk) else {
            self.stats.rejected += 1;
            trace!(len = chunk.len(), "dropping inconsistent chunk");
            return false;
        };
        self.stats.accepted += 1;
        match record.record_type.class() {
            RecordClass::Boundary => {
                if let Some(sweep) = &self.sweep {
                    match PingSettings::from_record(&record) {
                        Ok(settings) => sweep.observe_ping(&settings),
                        Err(e) => debug!("unreadable ping settings: {}", e),
                    }
                }
                self.publish();
                self.current.insert(record);
            }
            RecordClass::Diagnostic(kind) => self.diagnostics.slot(kind).put(record),
            RecordClass::Reply => self.reply(record),
            RecordClass::Bundled => self.current.insert(record),
        }
        true
    }

    fn publish(&mut self) {
        let mut bundle = std::mem::take(&mut self.current);
        if bundle.is_empty() {
            return;
        }
        bundle.sequence = self.next_sequence;
        self.next_sequence += 1;
        match self.bundles.try_send(bundle) {
            Ok(()) => self.stats.published += 1,
            Err(TrySendError::Full(bundle)) => {
                self.stats.dropped += 1;
                warn!(sequence = bundle.sequence, "bundle consumer is behind, dropping ping");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped += 1;
                trace!("no bundle consumer");
            }
        }
    }

    fn reply(&mut self, record: Record) {
        if let Ok(CommandReply::Nak { ticket, error_code }) = CommandReply::from_record(&record) {
            warn!(ticket, error_code, "device rejected command");
        }
        if let Some(replies) = &self.replies {
            // Nobody waiting on a reply is fine
            let _ = replies.try_send(record);
        }
    }
}

impl RecordSink for Demultiplexer {
    fn consume(&mut self, chunk: &[u8]) -> Result<()> {
        self.handle(chunk);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let stats = self.stats;
        debug!(
            accepted = stats.accepted,
            rejected = stats.rejected,
            published = stats.published,
            dropped = stats.dropped,
            "demultiplexer finished"
        );
        Ok(())
    }
}

/// Writes the stream to storage without decoding it, network frames stripped
pub struct RawCapture<W> {
    writer: W,
    sweep: Option<Arc<SweepCounter>>,
    written: u64,
}

impl<W: Write + Send> RawCapture<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            sweep: None,
            written: 0,
        }
    }

    /// Count pings for a sweep while capturing
    pub fn with_sweep(mut self, sweep: Arc<SweepCounter>) -> Self {
        self.sweep = Some(sweep);
        self
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn track(&self, chunk: &[u8]) {
        let Some(sweep) = &self.sweep else { return };
        if validate_chunk(chunk) != Some(RecordType::Ping.code()) {
            return;
        }
        if let Some(record) = Record::from_chunk(chunk) {
            if let Ok(settings) = PingSettings::from_record(&record) {
                sweep.observe_ping(&settings);
            }
        }
    }
}

impl<W: Write + Send> RecordSink for RawCapture<W> {
    fn consume(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.len() <= NETWORK_FRAME_SIZE {
            return Ok(());
        }
        self.writer.write_all(&chunk[NETWORK_FRAME_SIZE..])?;
        self.written += (chunk.len() - NETWORK_FRAME_SIZE) as u64;
        self.track(chunk);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        debug!(bytes = self.written, "capture finished");
        Ok(())
    }
}

/// Cuts a byte stream into messages using the packet size of each network frame
pub struct Reassembler<S> {
    inner: S,
    buffer: Vec<u8>,
}

impl<S: RecordSink> Reassembler<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: RecordSink> RecordSink for Reassembler<S> {
    fn consume(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        let mut start = 0;
        while let Some(size) = u32_at(&self.buffer[start..], 12) {
            let size = size as usize;
            if !(MIN_RECORD_CHUNK..=MAX_MESSAGE_SIZE).contains(&size) {
                // Lost framing, throw away what we have and pick up at the next read
                trace!(size, buffered = self.buffer.len() - start, "discarding unframed bytes");
                start = self.buffer.len();
                break;
            }
            if self.buffer.len() - start < size {
                break;
            }
            self.inner.consume(&self.buffer[start..start + size])?;
            start += size;
        }
        self.buffer.drain(..start);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.inner.finish()
    }
}
