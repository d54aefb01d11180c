//! Measurement cycle: start, collect, and the cancellable background variant
//!
//! ```text
//!  Idle --start_read--> Armed --end_read--------------------------> Idle
//!                         |
//!                         +--end_read_async--> Collecting --join/cancel--> Idle
//! ```
//!
//! Starting a measurement sends `[0x03, ms, average]`; the first active
//! channel's samples arrive as the reply once the integration time has
//! elapsed. Every further active channel is requested with `[0x04, channel]`.
//! Blocks are decoded into staging and only committed once every active
//! channel has arrived, so a failed or cancelled cycle leaves all channel
//! buffers untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use super::{Instrument, Spectrometer};
use crate::channel::{PixelLayout, SampleBlock};
use crate::command::{exchange, validate_reply, REPLY_TIMEOUT};
use crate::error::{Result, SpectrometerError};
use crate::protocol::{self, SAMPLE_TAG};

/// Longest the worker goes without checking for cancellation.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The worker starts polling this long before the integration time ends.
pub const EARLY_POLL_GUARD: Duration = Duration::from_millis(10);

/// How an asynchronous read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Every active channel was decoded and committed
    Completed,
    /// Cancelled before completion; no channel was updated
    Cancelled,
}

/// Decoded blocks waiting to be committed.
struct Collected {
    blocks: Vec<SampleBlock>,
    first_reply: DateTime<Utc>,
}

type WorkerOutput = (Instrument, Result<Option<Collected>>);

/// Background read in flight.
pub(crate) struct PendingRead {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<WorkerOutput>,
    integration: Duration,
}

impl PendingRead {
    /// Stop the worker and wait for it, discarding the result.
    pub(crate) fn abandon(self) {
        self.cancel.store(true, Ordering::Release);
        if self.handle.join().is_err() {
            error!("Read worker panicked");
        }
    }
}

/// Sleep for `total` in slices, returning `false` as soon as `cancel` is set.
fn sleep_unless_cancelled(total: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.load(Ordering::Acquire) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(remaining.min(POLL_INTERVAL));
    }
}

impl Instrument {
    fn active_channels(&self) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, ch)| ch.is_active())
            .map(|(i, _)| i)
            .collect()
    }

    /// Blocking collection of every active channel.
    fn collect(&mut self, integration: Duration, layout: PixelLayout) -> Result<Collected> {
        let mut blocks = Vec::new();
        let mut first_reply = None;

        for (n, ch) in self.active_channels().into_iter().enumerate() {
            let reply = if n == 0 {
                // Data for the first channel answers the start command
                exchange(self.transport.as_mut(), &[], SAMPLE_TAG, 0, integration)?
            } else {
                let message = protocol::read_next_channel(ch as u8);
                exchange(self.transport.as_mut(), &message, SAMPLE_TAG, 0, Duration::ZERO)?
            };
            first_reply.get_or_insert_with(Utc::now);
            blocks.push(self.channels[ch].decode_sample_block(&reply, layout)?);
        }

        Ok(Collected {
            blocks,
            first_reply: first_reply.unwrap_or_else(Utc::now),
        })
    }

    /// Collection on the worker thread; `Ok(None)` when cancelled.
    fn collect_cancellable(
        &mut self,
        integration: Duration,
        layout: PixelLayout,
        cancel: &AtomicBool,
    ) -> Result<Option<Collected>> {
        if !sleep_unless_cancelled(integration.saturating_sub(EARLY_POLL_GUARD), cancel) {
            return Ok(None);
        }

        let mut blocks = Vec::new();
        let mut first_reply = None;

        for (n, ch) in self.active_channels().into_iter().enumerate() {
            if cancel.load(Ordering::Acquire) {
                return Ok(None);
            }
            let reply = if n == 0 {
                loop {
                    if cancel.load(Ordering::Acquire) {
                        return Ok(None);
                    }
                    match self.transport.read_message(POLL_INTERVAL, 0, SAMPLE_TAG) {
                        Ok(reply) => break reply,
                        Err(SpectrometerError::Timeout(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
            } else {
                let message = protocol::read_next_channel(ch as u8);
                self.transport.write_message(&message)?;
                self.transport
                    .read_message(REPLY_TIMEOUT, 0, SAMPLE_TAG)?
            };
            validate_reply(&reply, SAMPLE_TAG, 0)?;
            first_reply.get_or_insert_with(Utc::now);
            blocks.push(self.channels[ch].decode_sample_block(&reply, layout)?);
        }

        Ok(Some(Collected {
            blocks,
            first_reply: first_reply.unwrap_or_else(Utc::now),
        }))
    }
}

impl Spectrometer {
    /// Commit staged blocks and record the measurement.
    fn apply(&mut self, collected: Collected, integration: Duration) -> Result<()> {
        let inst = self
            .instrument
            .as_mut()
            .ok_or(SpectrometerError::TransportLost)?;
        for block in collected.blocks {
            let ch = usize::from(block.channel);
            inst.channels[ch].commit(block);
        }
        self.last_measurement = Some(collected.first_reply);
        self.measured_integration_time = Some(integration);
        Ok(())
    }

    /// True between [`start_read`](Self::start_read) and the end of the cycle.
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Start an integration with the current integration time and average.
    ///
    /// Does nothing if a cycle is already armed.
    pub fn start_read(&mut self) -> Result<()> {
        if self.pending.is_some() {
            return Err(SpectrometerError::ReadInProgress);
        }
        if self.armed.is_some() {
            debug!("Measurement already armed");
            return Ok(());
        }

        let ms = u16::try_from(self.integration_time.as_millis()).map_err(|_| {
            SpectrometerError::InvalidArgument(format!(
                "integration time {:?} exceeds {} ms",
                self.integration_time,
                u16::MAX
            ))
        })?;
        let message = protocol::start_measurement(ms, self.average);
        self.instrument()?.transport.write_message(&message)?;

        self.armed = Some(Duration::from_millis(u64::from(ms)));
        debug!("Measurement armed: {} ms, average {}", ms, self.average);
        Ok(())
    }

    /// Wait for the armed integration and read every active channel.
    ///
    /// The cycle is over afterwards whether or not it succeeded.
    pub fn end_read(&mut self) -> Result<()> {
        if self.pending.is_some() {
            return Err(SpectrometerError::ReadInProgress);
        }
        let integration = self.armed.ok_or(SpectrometerError::NotArmed)?;
        let layout = self.layout;

        let result = self.instrument()?.collect(integration, layout);
        self.armed = None;
        self.apply(result?, integration)?;
        debug!("Measurement complete");
        Ok(())
    }

    /// Collect the armed cycle on a background thread.
    ///
    /// The transport stays with the worker until the read is joined or
    /// cancelled; until then any other operation returns
    /// [`ReadInProgress`](SpectrometerError::ReadInProgress).
    pub fn end_read_async(&mut self) -> Result<()> {
        if self.pending.is_some() {
            return Err(SpectrometerError::ReadInProgress);
        }
        let integration = self.armed.ok_or(SpectrometerError::NotArmed)?;
        let mut instrument = self
            .instrument
            .take()
            .ok_or(SpectrometerError::TransportLost)?;

        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let layout = self.layout;
        let handle = thread::spawn(move || {
            let result = instrument.collect_cancellable(integration, layout, &flag);
            (instrument, result)
        });

        info!("Background read started ({:?} integration)", integration);
        self.pending = Some(PendingRead {
            cancel,
            handle,
            integration,
        });
        Ok(())
    }

    /// An asynchronous read is outstanding and must be joined or cancelled.
    pub fn is_read_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The outstanding asynchronous read has finished and can be joined
    /// without blocking.
    pub fn is_read_finished(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| p.handle.is_finished())
    }

    /// Stop the outstanding asynchronous read and wait for the worker.
    ///
    /// Returns [`ReadOutcome::Completed`] if every channel had already been
    /// collected; those results are committed.
    pub fn cancel_read_async(&mut self) -> Result<ReadOutcome> {
        let pending = self
            .pending
            .take()
            .ok_or(SpectrometerError::NoReadInProgress)?;
        pending.cancel.store(true, Ordering::Release);
        self.finish(pending)
    }

    /// Wait for the outstanding asynchronous read to finish.
    pub fn join_read_async(&mut self) -> Result<ReadOutcome> {
        let pending = self
            .pending
            .take()
            .ok_or(SpectrometerError::NoReadInProgress)?;
        self.finish(pending)
    }

    fn finish(&mut self, pending: PendingRead) -> Result<ReadOutcome> {
        let PendingRead {
            handle,
            integration,
            ..
        } = pending;
        let joined = handle.join();
        self.armed = None;

        let (instrument, result) = joined.map_err(|_| {
            error!("Read worker panicked, transport lost");
            SpectrometerError::WorkerPanicked
        })?;
        self.instrument = Some(instrument);

        match result? {
            Some(collected) => {
                self.apply(collected, integration)?;
                info!("Background read complete");
                Ok(ReadOutcome::Completed)
            }
            None => {
                info!("Background read cancelled");
                Ok(ReadOutcome::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_unless_cancelled() {
        let flag = AtomicBool::new(false);
        let start = Instant::now();
        assert!(sleep_unless_cancelled(Duration::from_millis(30), &flag));
        assert!(start.elapsed() >= Duration::from_millis(30));

        flag.store(true, Ordering::Release);
        let start = Instant::now();
        assert!(!sleep_unless_cancelled(Duration::from_secs(5), &flag));
        assert!(start.elapsed() < POLL_INTERVAL);
    }

    #[test]
    fn test_zero_wait_returns_immediately() {
        let flag = AtomicBool::new(false);
        assert!(sleep_unless_cancelled(Duration::ZERO, &flag));
    }
}
