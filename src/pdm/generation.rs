//! Synthetic PDM streams and a simulated capture transport, for exercising sessions on a host

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::config::{Channels, Decimation};
use crate::demux;
use crate::dma::{CaptureTransport, MAX_TRANSPORTS};
use crate::session::Capture;
use crate::{Error, HardwareError, Resource};

/// First order delta-sigma modulator
///
/// The output bit is the carry of a 32-bit phase accumulator, so a constant input `x` produces ones
/// with a density of `x / 2^32`. The accumulator starts at mid-scale.
#[derive(Clone, Copy, Debug)]
pub struct DeltaSigma {
    accum: u32,
}

impl Default for DeltaSigma {
    fn default() -> Self {
        Self { accum: 1 << 31 }
    }
}

impl DeltaSigma {
    pub fn push(&mut self, x: u32) -> bool {
        let (accum, carry) = self.accum.overflowing_add(x);
        self.accum = accum;
        carry
    }
}

fn density_word(density: f32) -> u32 {
    (density.clamp(0.0, 1.0) as f64 * u32::MAX as f64) as u32
}

/// Ones density of a source over time, indexed by output sample
#[derive(Clone, Copy, Debug)]
pub enum Waveform {
    /// Fixed density in [0, 1]
    Constant(f32),
    /// `half_period` samples at `high`, then `half_period` samples at `low`; a zero half period
    /// is taken as one
    Square { high: f32, low: f32, half_period: usize },
    /// Sine around one half, `period` in samples
    Sine { amplitude: f32, period: f32 },
    /// Uniform noise around one half
    WhiteNoise { amplitude: f32 },
}

impl Waveform {
    pub fn density(&self, sample: u64) -> f32 {
        match *self {
            Waveform::Constant(d) => d,
            Waveform::Square { high, low, half_period } => {
                if (sample / half_period.max(1) as u64) % 2 == 0 {
                    high
                } else {
                    low
                }
            }
            Waveform::Sine { amplitude, period } => {
                let phase = 2.0 * std::f32::consts::PI * (sample as f32 / period).fract();
                0.5 + 0.5 * amplitude * phase.sin()
            }
            Waveform::WhiteNoise { amplitude } => {
                // Get random number uniform over (-1, 1)
                let rand_sample: f32 = rand::random::<f32>() * 2.0 - 1.0;
                0.5 + 0.5 * amplitude * rand_sample
            }
        }
    }
}

/// A single microphone producing PDM bytes, first bit in the MSB
pub struct PdmSource {
    waveform: Waveform,
    decimation: u64,
    dsm: DeltaSigma,
    /// Bits emitted so far
    bits: u64,
    level: u32,
}

impl PdmSource {
    pub fn new(waveform: Waveform, decimation: Decimation) -> Self {
        Self {
            waveform,
            decimation: decimation.factor() as u64,
            dsm: DeltaSigma::default(),
            bits: 0,
            level: 0,
        }
    }

    /// Output samples covered so far
    pub fn position(&self) -> u64 {
        self.bits / self.decimation
    }

    pub fn fill(&mut self, out: &mut [u8]) {
        for byte in out.iter_mut() {
            let mut b = 0u8;
            for bit in 0..8 {
                if self.bits % self.decimation == 0 {
                    self.level = density_word(self.waveform.density(self.bits / self.decimation));
                }
                if self.dsm.push(self.level) {
                    b |= 0x80 >> bit;
                }
                self.bits += 1;
            }
            *byte = b;
        }
    }
}

/// Fill a whole slot with the next bytes of every source, interleaved as the hardware would
pub fn fill_slot(channels: Channels, sources: &mut [PdmSource], slot: &mut [u8]) {
    let per_channel = slot.len() / channels.count();
    let mut streams = vec![0u8; per_channel * channels.count()];
    for (stream, source) in streams.chunks_mut(per_channel).zip(sources.iter_mut()) {
        source.fill(stream);
    }
    demux::multiplex(channels, &streams, slot);
}

/// In-memory stand-in for the PIO and DMA channels
///
/// Slots handed over by `arm` are filled by [`SimulatedTransport::deliver`], which then raises the
/// completion the way the DMA interrupt would. Transfers complete in chain order.
pub struct SimulatedTransport {
    available: usize,
    claimed: usize,
    armed: [AtomicPtr<u8>; MAX_TRANSPORTS],
    armed_len: [AtomicUsize; MAX_TRANSPORTS],
    listening: AtomicBool,
    next: AtomicUsize,
    /// Remaining successful arms, `usize::MAX` for unlimited
    arm_budget: AtomicUsize,
    notification_fails: bool,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::with_channels(MAX_TRANSPORTS)
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport with only `available` free transfer channels
    pub fn with_channels(available: usize) -> Self {
        Self {
            available,
            claimed: 0,
            armed: [AtomicPtr::new(std::ptr::null_mut()), AtomicPtr::new(std::ptr::null_mut())],
            armed_len: [AtomicUsize::new(0), AtomicUsize::new(0)],
            listening: AtomicBool::new(false),
            next: AtomicUsize::new(0),
            arm_budget: AtomicUsize::new(usize::MAX),
            notification_fails: false,
        }
    }

    /// Accept only `arms` more arm requests, failing every one after
    pub fn with_arm_budget(self, arms: usize) -> Self {
        self.arm_budget.store(arms, Ordering::Relaxed);
        self
    }

    /// Refuse to install the completion notification
    pub fn without_notification(mut self) -> Self {
        self.notification_fails = true;
        self
    }

    pub fn claimed(&self) -> usize {
        self.claimed
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn is_armed(&self, channel: usize) -> bool {
        self.armed
            .get(channel)
            .map_or(false, |p| !p.load(Ordering::Acquire).is_null())
    }

    /// Copy `data` into the slot armed on the next transfer and report its completion
    ///
    /// Returns false when no transfer is armed, as when capture is stopped or stalled.
    pub fn deliver(capture: &Capture<Self>, data: &[u8]) -> bool {
        let t = capture.transport();
        if t.claimed == 0 || !t.is_listening() {
            return false;
        }
        let channel = t.next.load(Ordering::Relaxed) % t.claimed;
        let ptr = t.armed[channel].swap(std::ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            return false;
        }
        let len = t.armed_len[channel].load(Ordering::Acquire).min(data.len());
        // SAFETY: the session armed this slot and leaves it alone until its completion is reported
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, len) };
        t.next.store((channel + 1) % t.claimed, Ordering::Relaxed);
        capture.on_slot_complete(channel);
        true
    }
}

impl CaptureTransport for SimulatedTransport {
    fn claim(&mut self, channels: usize) -> Result<(), Error> {
        if channels > self.available || channels > MAX_TRANSPORTS {
            return Err(Error::ResourceExhaustion(Resource::TransportChannel));
        }
        self.claimed = channels;
        Ok(())
    }

    fn release(&mut self) {
        self.disarm();
        self.claimed = 0;
    }

    fn listen(&self) -> Result<(), Error> {
        if self.notification_fails {
            return Err(Error::Hardware(HardwareError::Notification));
        }
        self.listening.store(true, Ordering::Release);
        Ok(())
    }

    fn unlisten(&self) {
        self.listening.store(false, Ordering::Release);
    }

    fn arm(&self, channel: usize, slot: *mut [u8]) -> Result<(), Error> {
        if channel >= self.claimed {
            return Err(Error::Hardware(HardwareError::Arm));
        }
        let budget = self.arm_budget.load(Ordering::Relaxed);
        if budget == 0 {
            return Err(Error::Hardware(HardwareError::Arm));
        }
        if budget != usize::MAX {
            self.arm_budget.store(budget - 1, Ordering::Relaxed);
        }
        self.armed_len[channel].store(slot.len(), Ordering::Relaxed);
        self.armed[channel].store(slot as *mut u8, Ordering::Release);
        Ok(())
    }

    fn disarm(&self) {
        for p in self.armed.iter() {
            p.store(std::ptr::null_mut(), Ordering::Release);
        }
        self.next.store(0, Ordering::Relaxed);
    }
}
