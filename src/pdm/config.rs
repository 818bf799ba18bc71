//! Configuration surface of a microphone session.

use crate::cic::FilterConfig;
use crate::ConfigError;

/// Highest supported output sample rate
pub const MAX_SAMPLE_RATE: u32 = 192_000;
/// Size of the de-interleave scratch, which bounds the size of a single capture slot
pub const MAX_SLOT_BYTES: usize = 16 * 1024;
/// Most microphones that can share one data line
pub const MAX_CHANNELS: usize = 4;

const DEFAULT_SAMPLE_RATE: u32 = 16_000;
const DEFAULT_BUFFER_SIZE: usize = 16;
const DEFAULT_SLOT_COUNT: usize = 64;
const DEFAULT_HP_HZ: u32 = 10;
const DEFAULT_MAX_VOLUME: u8 = 64;
const DEFAULT_GAIN: u8 = 16;

/// Number of microphones multiplexed on the data line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channels {
    Mono = 1,
    Stereo = 2,
    Quad = 4,
}

impl Channels {
    pub const fn count(self) -> usize {
        self as usize
    }
}

/// Input bits per output sample
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decimation {
    X64 = 64,
    X128 = 128,
}

impl Decimation {
    pub const fn factor(self) -> usize {
        self as usize
    }

    /// Raw bytes of one channel consumed per output sample
    pub const fn bytes_per_sample(self) -> usize {
        self.factor() / 8
    }
}

/// How the decimator sums each byte of input against its coefficients
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterStrategy {
    /// Test every bit against its coefficient
    Direct,
    /// Precomputed per-byte partial sums, shared by all channels of a session
    LookupTable,
}

/// Assumed speed of the consumer relative to the producer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriftPolicy {
    /// Reader falls behind; rebase to the freshest slot when about to be lapped
    ConsumerSlower,
    /// Reader catches up with the writer; rebase to the deepest safe slot
    ConsumerFaster,
    /// Pick one of the two by comparing completions with slots read since the last rebase; polls
    /// that find nothing new are not reads
    Measured,
}

/// Number of transfers that fill the ring
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Chaining {
    /// One transfer, re-armed from the completion interrupt
    Single,
    /// Two transfers chained back to back, each owning every other slot
    Chained,
}

impl Chaining {
    pub const fn transports(self) -> usize {
        match self {
            Chaining::Single => 1,
            Chaining::Chained => 2,
        }
    }
}

/// Hardware identifiers, passed through untouched to the integrator's transport
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PinConfig {
    pub gpio_data: u8,
    pub gpio_clk: u8,
    pub pio: u8,
    pub pio_sm: u8,
}

/// Filter settings applied to every channel at session creation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterDefaults {
    /// Low-pass cutoff, `None` selects half the sample rate
    pub lp_hz: Option<u32>,
    pub hp_hz: u32,
    pub max_volume: u8,
    pub gain: u8,
}

impl Default for FilterDefaults {
    fn default() -> Self {
        Self {
            lp_hz: None,
            hp_hz: DEFAULT_HP_HZ,
            max_volume: DEFAULT_MAX_VOLUME,
            gain: DEFAULT_GAIN,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MicConfig {
    pub pins: PinConfig,
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Output samples per channel held by one slot
    pub sample_buffer_size: usize,
    pub channels: Channels,
    pub decimation: Decimation,
    /// Number of slots in the capture ring
    pub slot_count: usize,
    /// Minimum distance, in slots, the reader keeps from the writer
    pub guard_slots: usize,
    pub chaining: Chaining,
    pub drift: DriftPolicy,
    pub strategy: FilterStrategy,
    pub filter: FilterDefaults,
}

impl Default for MicConfig {
    fn default() -> Self {
        Self {
            pins: PinConfig::default(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            sample_buffer_size: DEFAULT_BUFFER_SIZE,
            channels: Channels::Mono,
            decimation: Decimation::X64,
            slot_count: DEFAULT_SLOT_COUNT,
            guard_slots: 1,
            chaining: Chaining::Single,
            drift: DriftPolicy::ConsumerSlower,
            strategy: FilterStrategy::LookupTable,
            filter: FilterDefaults::default(),
        }
    }
}

impl MicConfig {
    pub const fn samples_per_ms(&self) -> usize {
        (self.sample_rate / 1000) as usize
    }

    /// Bytes of raw PDM in one slot, all channels included
    pub const fn slot_len(&self) -> usize {
        self.sample_buffer_size * self.decimation.bytes_per_sample() * self.channels.count()
    }

    /// Bytes of ring storage the configuration needs
    pub const fn storage_len(&self) -> usize {
        self.slot_len() * self.slot_count
    }

    /// Smallest ring that keeps both guard windows disjoint
    pub const fn min_slot_count(&self) -> usize {
        2 * self.guard_slots + 2
    }

    /// Filter parameters for one channel of this session
    ///
    /// The session de-interleaves channels before decoding, so each filter sees a contiguous
    /// stream.
    pub fn filter_config(&self) -> FilterConfig {
        FilterConfig {
            sample_rate: self.sample_rate,
            decimation: self.decimation,
            lp_hz: self.filter.lp_hz.unwrap_or(self.sample_rate / 2),
            hp_hz: self.filter.hp_hz,
            max_volume: self.filter.max_volume,
            gain: self.filter.gain,
            in_channels: 1,
            out_channels: 1,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.filter_config().validate()?;

        if self.sample_buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        let samples_per_ms = self.samples_per_ms();
        if self.sample_buffer_size % samples_per_ms != 0 {
            return Err(ConfigError::BufferNotMultipleOfMs {
                buffer_size: self.sample_buffer_size,
                samples_per_ms,
            });
        }
        if self.chaining == Chaining::Chained && self.guard_slots == 0 {
            return Err(ConfigError::ChainingNeedsGuard);
        }
        let min = self.min_slot_count();
        if self.slot_count < min {
            return Err(ConfigError::TooFewSlots { slots: self.slot_count, min });
        }
        Ok(())
    }
}
