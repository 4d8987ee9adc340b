//! Periodic subscribe, wait, unsubscribe sampling of diagnostic records.
//!
//! Water column and raw element records are expensive to stream, so they are only
//! subscribed long enough to catch one copy. The caller turns that copy into a number.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::command::{Command, CommandLink};
use crate::demux::DiagnosticSlots;
use crate::error::{Error, Result};
use crate::record::{DiagnosticKind, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleConfig {
    pub kind: DiagnosticKind,
    /// Pause between samples
    pub period: Duration,
    /// How long one subscription waits for its record
    pub timeout: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            kind: DiagnosticKind::WaterColumn,
            period: Duration::from_secs(5),
            timeout: Duration::from_secs(1),
        }
    }
}

/// Take one sample: subscribe, wait for a fresh record, unsubscribe, process.
///
/// The unsubscribe is sent whether or not anything arrived. `Ok(None)` means the estimate
/// is unavailable this round.
pub fn run_once<L, F>(
    link: &L,
    slots: &DiagnosticSlots,
    kind: DiagnosticKind,
    timeout: Duration,
    processor: &mut F,
) -> Result<Option<f32>>
where
    L: CommandLink + ?Sized,
    F: FnMut(&Record) -> Option<f32>,
{
    let slot = slots.slot(kind);
    let records = vec![kind.record_type()];
    // Stale copies from an earlier subscription don't count
    slot.clear();
    link.send_command(&Command::SelfRecordRequest(records.clone()))?;
    let record = slot.wait_fresh(timeout);
    link.send_command(&Command::StopSelfRecordRequest(records))?;
    match record {
        Some(record) => Ok(processor(&record)),
        None => {
            // A copy landing while we unsubscribed belongs to no sample
            slot.clear();
            debug!(record_type = %kind.record_type(), "no diagnostic record before timeout");
            Ok(None)
        }
    }
}

/// A background thread running [`run_once`] every period
pub struct DiagnosticCycle {
    stop: Arc<AtomicBool>,
    estimate: Arc<Mutex<Option<f32>>>,
    handle: Option<JoinHandle<()>>,
}

impl DiagnosticCycle {
    pub fn start<L, F>(
        link: L,
        slots: Arc<DiagnosticSlots>,
        config: CycleConfig,
        mut processor: F,
    ) -> Result<Self>
    where
        L: CommandLink + Send + 'static,
        F: FnMut(&Record) -> Option<f32> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let estimate = Arc::new(Mutex::new(None));
        let handle = {
            let stop = stop.clone();
            let estimate = estimate.clone();
            thread::Builder::new()
                .name("diag-cycle".to_owned())
                .spawn(move || {
                    info!(record_type = %config.kind.record_type(), period = ?config.period, "starting diagnostic cycle");
                    while !stop.load(Ordering::Relaxed) {
                        let sample =
                            run_once(&link, &slots, config.kind, config.timeout, &mut processor)
                                .unwrap_or_else(|e| {
                                    warn!("diagnostic cycle failed: {}", e);
                                    None
                                });
                        *estimate.lock().unwrap_or_else(|e| e.into_inner()) = sample;
                        let resume = Instant::now() + config.period;
                        while !stop.load(Ordering::Relaxed) {
                            let now = Instant::now();
                            if now >= resume {
                                break;
                            }
                            thread::park_timeout(resume - now);
                        }
                    }
                    debug!("diagnostic cycle exiting");
                })?
        };
        Ok(Self {
            stop,
            estimate,
            handle: Some(handle),
        })
    }

    /// Most recent estimate, None when the last sample was unavailable
    pub fn estimate(&self) -> Option<f32> {
        *self.estimate.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Ask the loop to end and wait for it. A sample already in flight finishes first.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        match self.handle.take() {
            Some(handle) => {
                handle.thread().unpark();
                handle.join().map_err(|_| Error::LoopPanicked("diagnostic cycle"))
            }
            None => Ok(()),
        }
    }
}

impl Drop for DiagnosticCycle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("{}", e);
        }
    }
}
