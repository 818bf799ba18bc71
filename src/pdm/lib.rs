#![cfg_attr(not(feature="std"), no_std)]

//! PDM microphone capture and PDM to PCM conversion.
//!
//! A hardware transport fills fixed-size slots of a [`buffer::CaptureRing`] on its own clock. The
//! [`session::MicrophoneSession`] advances the producer cursor from the transport's completion
//! interrupt and, when the application calls `read()`, picks a safe slot, splits the packed
//! channels apart ([`demux`]) and runs each channel through a sinc³ decimator ([`cic`]).

pub mod buffer;
pub mod cic;
pub mod config;
pub mod demux;
pub mod dma;
#[cfg(feature="std")]
pub mod generation;
pub mod pdm_processing;
pub mod session;

pub use buffer::{CaptureRing, DriftCompensator, SlotStorage};
pub use cic::{CicFilter, FilterConfig};
pub use config::{Chaining, Channels, Decimation, DriftPolicy, FilterStrategy, MicConfig};
pub use dma::CaptureTransport;
pub use session::{Capture, MicrophoneSession, SessionReader};

/// Configuration problems, all detected before any capture starts
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("sample rate {sample_rate} Hz gives less than one sample per millisecond")]
    SampleRateTooLow { sample_rate: u32 },

    #[error("sample rate {sample_rate} Hz exceeds the supported maximum of {max} Hz")]
    SampleRateTooHigh { sample_rate: u32, max: u32 },

    #[error("sample buffer size must be non-zero")]
    ZeroBufferSize,

    #[error("sample buffer size {buffer_size} is not a multiple of {samples_per_ms} samples per millisecond")]
    BufferNotMultipleOfMs { buffer_size: usize, samples_per_ms: usize },

    #[error("{slots} capture slots configured, at least {min} required")]
    TooFewSlots { slots: usize, min: usize },

    #[error("chained transports need a guard window of at least one slot")]
    ChainingNeedsGuard,

    #[error("filter gain must be non-zero")]
    ZeroGain,

    #[error("filter max volume must be non-zero")]
    ZeroMaxVolume,

    #[error("filter channel stride must be non-zero")]
    ZeroStride,
}

/// Resources a session may fail to acquire
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Resource {
    #[error("capture ring needs {needed} bytes but only {available} are available")]
    Storage { needed: usize, available: usize },

    #[error("a {needed} byte slot does not fit the {available} byte de-interleave scratch")]
    Scratch { needed: usize, available: usize },

    #[error("no free transport channel")]
    TransportChannel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HardwareError {
    #[error("completion notification could not be installed")]
    Notification,

    #[error("transport could not be armed")]
    Arm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(Resource),

    #[error("hardware error: {0}")]
    Hardware(HardwareError),
}
