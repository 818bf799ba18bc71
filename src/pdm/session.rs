//! A running microphone: capture ring, transport and decoders tied together
//!
//! The session is owned by the application. [`MicrophoneSession::split`] hands out the two halves
//! that live in different execution contexts: the [`Capture`] handle, shared with the completion
//! interrupt, and the [`SessionReader`] that decodes slots on demand.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::Mutex;
use log::{info, warn};

use crate::buffer::{CaptureRing, DriftCompensator, SlotStorage};
use crate::config::MicConfig;
use crate::dma::CaptureTransport;
use crate::pdm_processing::{PdmProcessing, PdmProcessor};
use crate::Error;

/// Called from the completion context each time a slot is complete
pub type SamplesReadyHandler = fn();

/// Producer-side half of a session
pub struct Capture<T> {
    ring: CaptureRing,
    transport: T,
    handler: Mutex<Cell<Option<SamplesReadyHandler>>>,
    running: AtomicBool,
    stalled: AtomicBool,
}

impl<T: CaptureTransport> Capture<T> {
    /// Completion notification for transfer `channel`
    ///
    /// Advances the ring, re-arms the transfer on its next slot and calls the samples-ready
    /// handler. Ignored while the session is stopped.
    pub fn on_slot_complete(&self, channel: usize) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let next = self.ring.complete(channel);
        if self.transport.arm(channel, self.ring.slot_ptr(next)).is_err() {
            warn!("PDM transfer {} could not be re-armed, capture stalled", channel);
            self.stalled.store(true, Ordering::Release);
        }
        let handler = critical_section::with(|cs| self.handler.borrow(cs).get());
        if let Some(handler) = handler {
            handler();
        }
    }

    pub fn ring(&self) -> &CaptureRing {
        &self.ring
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// A transfer could not be re-armed; no further slots will complete on it
    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    /// Slots completed since the last start, wrapping
    pub fn produced(&self) -> usize {
        self.ring.produced()
    }

    pub fn set_samples_ready_handler(&self, handler: Option<SamplesReadyHandler>) {
        critical_section::with(|cs| self.handler.borrow(cs).set(handler));
    }
}

/// Consumer-side half of a session
pub struct SessionReader<'a, T> {
    capture: &'a Capture<T>,
    processing: &'a mut PdmProcessing,
    drift: &'a mut DriftCompensator,
}

impl<'a, T: CaptureTransport> SessionReader<'a, T> {
    /// Decode the next safe slot into `out`
    ///
    /// Writes up to `n_requested` samples per channel, channel `j` starting at
    /// `out[j * n_requested]`, and returns the count per channel. Returns 0 without blocking when
    /// no new slot has completed. An `out` shorter than `channels * n_requested` is rejected with 0
    /// and leaves the slot for the next call.
    pub fn read(&mut self, out: &mut [i16], n_requested: usize) -> usize {
        if out.len() < self.processing.channels().count() * n_requested {
            return 0;
        }
        let ring = self.capture.ring();
        let slot = match ring.acquire(self.drift) {
            Some(slot) => slot,
            None => return 0,
        };
        let processing = &mut *self.processing;
        let written = ring.with_slot(slot, |raw| processing.process_pdm(raw, out, n_requested));
        ring.release(slot);
        written
    }

    pub fn set_volume(&mut self, volume: u16) {
        self.processing.set_volume(volume);
    }

    pub fn set_gain(&mut self, gain: u8) {
        self.processing.set_gain(gain);
    }

    pub fn set_max_volume(&mut self, max_volume: u8) {
        self.processing.set_max_volume(max_volume);
    }

    pub fn rebases(&self) -> usize {
        self.drift.rebases()
    }
}

/// One microphone data line
///
/// The transport writes into the ring storage on its own, so the storage is `'static` and the
/// session itself can be moved freely, even while capturing.
pub struct MicrophoneSession<T: CaptureTransport> {
    config: MicConfig,
    capture: Capture<T>,
    processing: PdmProcessing,
    drift: DriftCompensator,
}

impl<T: CaptureTransport> MicrophoneSession<T> {
    /// Build a session over `storage`, which must hold at least [`MicConfig::storage_len`] bytes
    pub fn new(config: MicConfig, storage: SlotStorage, mut transport: T) -> Result<Self, Error> {
        config.validate()?;
        let ring = CaptureRing::new(storage, config.slot_len(), config.slot_count, config.chaining.transports())?;
        let processing = PdmProcessing::new(&config)?;
        transport.claim(config.chaining.transports())?;

        info!(
            "PDM session: {} Hz, {} channel(s), decimation {}, {} slots of {} bytes",
            config.sample_rate,
            config.channels.count(),
            config.decimation.factor(),
            config.slot_count,
            config.slot_len(),
        );
        Ok(Self {
            config,
            capture: Capture {
                ring,
                transport,
                handler: Mutex::new(Cell::new(None)),
                running: AtomicBool::new(false),
                stalled: AtomicBool::new(false),
            },
            processing,
            drift: DriftCompensator::new(config.drift, config.guard_slots),
        })
    }

    pub fn config(&self) -> &MicConfig {
        &self.config
    }

    /// Begin capturing from slot 0 with fresh filters
    pub fn start(&mut self) -> Result<(), Error> {
        if self.capture.is_running() {
            return Ok(());
        }
        self.processing.reset();
        self.drift.reset();
        self.capture.ring.reset();
        self.capture.stalled.store(false, Ordering::Release);

        self.capture.transport.listen()?;
        self.capture.running.store(true, Ordering::Release);
        for channel in 0..self.capture.ring.transports() {
            if let Err(e) = self.capture.transport.arm(channel, self.capture.ring.slot_ptr(channel)) {
                self.halt();
                return Err(e);
            }
        }
        info!("PDM capture started");
        Ok(())
    }

    /// Stop capturing; completed slots stay readable
    pub fn stop(&mut self) {
        if self.capture.is_running() {
            self.halt();
            info!("PDM capture stopped");
        }
    }

    fn halt(&self) {
        self.capture.running.store(false, Ordering::Release);
        self.capture.transport.disarm();
        self.capture.transport.unlisten();
    }

    pub fn read(&mut self, out: &mut [i16], n_requested: usize) -> usize {
        self.reader().read(out, n_requested)
    }

    pub fn set_volume(&mut self, volume: u16) {
        self.processing.set_volume(volume);
    }

    pub fn set_gain(&mut self, gain: u8) {
        self.processing.set_gain(gain);
    }

    pub fn set_max_volume(&mut self, max_volume: u8) {
        self.processing.set_max_volume(max_volume);
    }

    pub fn set_samples_ready_handler(&self, handler: SamplesReadyHandler) {
        self.capture.set_samples_ready_handler(Some(handler));
    }

    pub fn capture(&self) -> &Capture<T> {
        &self.capture
    }

    pub fn is_stalled(&self) -> bool {
        self.capture.is_stalled()
    }

    fn reader(&mut self) -> SessionReader<'_, T> {
        SessionReader {
            capture: &self.capture,
            processing: &mut self.processing,
            drift: &mut self.drift,
        }
    }

    /// Split into the interrupt-side handle and the reader
    pub fn split(&mut self) -> (&Capture<T>, SessionReader<'_, T>) {
        let capture = &self.capture;
        (
            capture,
            SessionReader {
                capture,
                processing: &mut self.processing,
                drift: &mut self.drift,
            },
        )
    }
}

impl<T: CaptureTransport> Drop for MicrophoneSession<T> {
    fn drop(&mut self) {
        self.stop();
        self.capture.transport.release();
    }
}
