//! Sinc³ decimator turning a 1-bit PDM stream into 16-bit PCM
//!
//! The three-stage cascade is evaluated as a direct FIR: every output sample dots the three most
//! recent decimation windows against the three rows of the sinc³ kernel. A two entry pipeline
//! carries the partial products of the older windows, so each window is only read once. A one pole
//! high-pass removes the DC bias and a one pole low-pass trims what the cascade lets through, then
//! the result is scaled by a volume and saturated.

use crate::config::{Decimation, MAX_SAMPLE_RATE};
use crate::ConfigError;

/// Number of cascaded moving-average stages
pub const SINC_ORDER: usize = 3;
/// Largest supported decimation ratio
pub const MAX_DECIMATION: usize = 128;
/// Output saturates to +/- this value
pub const PCM_LIMIT: i64 = 32700;

/// Fraction bits carried by the IIR state below the integer sample grid
///
/// The arithmetic shifts in the one-pole sections round toward negative infinity, which without
/// extra resolution parks a decaying negative state a fraction of a full LSB below zero forever.
const FRAC_BITS: u32 = 8;

const TWO_PI: f64 = 2.0 * core::f64::consts::PI;

/// Parameters of one channel's decimator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterConfig {
    /// Output sample rate in Hz
    pub sample_rate: u32,
    pub decimation: Decimation,
    /// Low-pass cutoff; 0 disables the stage
    pub lp_hz: u32,
    /// High-pass cutoff; 0 disables the stage
    pub hp_hz: u32,
    pub max_volume: u8,
    pub gain: u8,
    /// Distance in bytes between consecutive bytes of this channel in the input
    pub in_channels: usize,
    /// Distance in samples between consecutive outputs of this channel
    pub out_channels: usize,
}

impl FilterConfig {
    pub const fn new(sample_rate: u32, decimation: Decimation) -> Self {
        Self {
            sample_rate,
            decimation,
            lp_hz: sample_rate / 2,
            hp_hz: 10,
            max_volume: 64,
            gain: 16,
            in_channels: 1,
            out_channels: 1,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate < 1000 {
            return Err(ConfigError::SampleRateTooLow { sample_rate: self.sample_rate });
        }
        if self.sample_rate > MAX_SAMPLE_RATE {
            return Err(ConfigError::SampleRateTooHigh { sample_rate: self.sample_rate, max: MAX_SAMPLE_RATE });
        }
        if self.gain == 0 {
            return Err(ConfigError::ZeroGain);
        }
        if self.max_volume == 0 {
            return Err(ConfigError::ZeroMaxVolume);
        }
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(ConfigError::ZeroStride);
        }
        Ok(())
    }

    pub const fn samples_per_ms(&self) -> usize {
        (self.sample_rate / 1000) as usize
    }

    /// Input bytes consumed per output sample, channel stride included
    pub const fn input_step(&self) -> usize {
        self.decimation.bytes_per_sample() * self.in_channels
    }
}

/// Per-byte weighted bit sums against one row of the sinc³ kernel
pub trait TapSum {
    /// Sum the coefficients of row `stage` selected by the set bits of one decimation window
    ///
    /// The window's bytes are `stride` apart in `window`, first bit in the MSB of each byte.
    fn tap(&self, window: &[u8], stride: usize, stage: usize) -> u32;
}

/// The sinc³ impulse response, split into one row per decimation window
#[derive(Clone, Debug)]
pub struct SincKernel {
    decimation: usize,
    coef: [[u32; MAX_DECIMATION]; SINC_ORDER],
    sum: u64,
}

fn convolve(signal: &[u32], kernel: &[u32], result: &mut [u32]) {
    debug_assert_eq!(result.len(), signal.len() + kernel.len() - 1);
    for (n, r) in result.iter_mut().enumerate() {
        let lo = n.saturating_sub(kernel.len() - 1);
        let hi = n.min(signal.len() - 1);
        *r = (lo..=hi).map(|k| signal[k] * kernel[n - k]).sum();
    }
}

impl SincKernel {
    pub fn new(decimation: Decimation) -> Self {
        let d = decimation.factor();

        let pulse = [1u32; MAX_DECIMATION];
        let mut sinc2 = [0u32; 2 * MAX_DECIMATION - 1];
        convolve(&pulse[..d], &pulse[..d], &mut sinc2[..2 * d - 1]);

        // One zero of padding on each side brings the length to exactly SINC_ORDER * d
        let mut sinc = [0u32; SINC_ORDER * MAX_DECIMATION];
        convolve(&sinc2[..2 * d - 1], &pulse[..d], &mut sinc[1..3 * d - 1]);

        let mut coef = [[0u32; MAX_DECIMATION]; SINC_ORDER];
        for (stage, row) in coef.iter_mut().enumerate() {
            row[..d].copy_from_slice(&sinc[stage * d..(stage + 1) * d]);
        }
        let sum: u64 = sinc[..SINC_ORDER * d].iter().map(|&c| c as u64).sum();

        Self { decimation: d, coef, sum }
    }

    pub fn decimation(&self) -> usize {
        self.decimation
    }

    pub fn row(&self, stage: usize) -> &[u32] {
        &self.coef[stage][..self.decimation]
    }

    /// Sum of all coefficients, the output of a window of all ones
    pub fn sum(&self) -> u64 {
        self.sum
    }
}

impl TapSum for SincKernel {
    fn tap(&self, window: &[u8], stride: usize, stage: usize) -> u32 {
        let coef = &self.coef[stage];
        let mut acc = 0u32;
        for byte in 0..self.decimation / 8 {
            let c = window[byte * stride] as u32;
            let base = byte * 8;
            for bit in 0..8 {
                acc += ((c >> (7 - bit)) & 1) * coef[base + bit];
            }
        }
        acc
    }
}

/// Precomputed tap sums for every value of every byte of a window
///
/// `[stage][byte position][byte value]`, 48 KiB at the largest decimation. A single table serves
/// every channel decoded with the same kernel.
#[derive(Clone)]
pub struct LookupTable {
    decimation: usize,
    table: [[[u32; 256]; MAX_DECIMATION / 8]; SINC_ORDER],
}

impl LookupTable {
    pub fn new(kernel: &SincKernel) -> Self {
        let mut lut = Self {
            decimation: kernel.decimation,
            table: [[[0; 256]; MAX_DECIMATION / 8]; SINC_ORDER],
        };
        lut.rebuild(kernel);
        lut
    }

    /// Refill the table in place for `kernel`
    pub fn rebuild(&mut self, kernel: &SincKernel) {
        self.decimation = kernel.decimation;
        for (stage, positions) in self.table.iter_mut().enumerate() {
            let row = &kernel.coef[stage];
            for (byte, entries) in positions.iter_mut().enumerate().take(kernel.decimation / 8) {
                for (value, entry) in entries.iter_mut().enumerate() {
                    *entry = (0..8)
                        .filter(|bit| value & (0x80usize >> *bit) != 0)
                        .map(|bit| row[byte * 8 + bit])
                        .sum();
                }
            }
        }
    }

    pub fn decimation(&self) -> usize {
        self.decimation
    }
}

impl TapSum for LookupTable {
    fn tap(&self, window: &[u8], stride: usize, stage: usize) -> u32 {
        let positions = &self.table[stage];
        (0..self.decimation / 8)
            .map(|byte| positions[byte][window[byte * stride] as usize])
            .sum()
    }
}

/// Divide rounding half away from zero
pub fn round_div(dividend: i64, divisor: i64) -> i64 {
    if dividend > 0 {
        (dividend + divisor / 2) / divisor
    } else {
        (dividend - divisor / 2) / divisor
    }
}

pub fn saturate(value: i64) -> i16 {
    value.clamp(-PCM_LIMIT, PCM_LIMIT) as i16
}

fn lp_alfa(sample_rate: u32, lp_hz: u32) -> i64 {
    if lp_hz == 0 {
        return 256;
    }
    let lp = lp_hz as f64;
    let alfa = lp * 256.0 / (lp + sample_rate as f64 / TWO_PI);
    (alfa as i64).min(256)
}

fn hp_alfa(sample_rate: u32, hp_hz: u32) -> i64 {
    if hp_hz == 0 {
        return 256;
    }
    let fs = sample_rate as f64;
    let alfa = fs * 256.0 / (TWO_PI * hp_hz as f64 + fs);
    (alfa as i64).min(256)
}

/// Derived constants, fixed between gain changes
#[derive(Clone, Copy, Debug)]
struct Scaling {
    lp_alfa: i64,
    hp_alfa: i64,
    sub_const: i64,
    div_const: i64,
}

impl Scaling {
    fn new(config: &FilterConfig, kernel: &SincKernel) -> Self {
        let sub_const = (kernel.sum() >> 1) as i64;
        Self {
            lp_alfa: lp_alfa(config.sample_rate, config.lp_hz),
            hp_alfa: hp_alfa(config.sample_rate, config.hp_hz),
            sub_const,
            div_const: div_const(sub_const, config.max_volume, config.gain),
        }
    }
}

fn div_const(sub_const: i64, max_volume: u8, gain: u8) -> i64 {
    (sub_const * max_volume as i64 / 32768 / gain.max(1) as i64).max(1)
}

/// State carried from one output sample to the next
#[derive(Clone, Copy, Debug, Default)]
struct History {
    coef: [i64; 2],
    old_out: i64,
    old_in: i64,
    old_z: i64,
}

impl History {
    fn run<T: TapSum + ?Sized>(
        &mut self,
        config: &FilterConfig,
        scaling: &Scaling,
        taps: &T,
        pdm: &[u8],
        out: &mut [i16],
        volume: u16,
    ) -> usize {
        let step = config.input_step();
        let stride = config.in_channels;
        // Bytes spanned by one window, from its first byte to its last
        let span = (config.decimation.bytes_per_sample() - 1) * stride + 1;
        let divisor = scaling.div_const << FRAC_BITS;

        let mut written = 0;
        for i in 0..config.samples_per_ms() {
            let start = i * step;
            let out_idx = i * config.out_channels;
            if start + span > pdm.len() || out_idx >= out.len() {
                break;
            }
            let window = &pdm[start..start + span];
            let z0 = taps.tap(window, stride, 0) as i64;
            let z1 = taps.tap(window, stride, 1) as i64;
            let z2 = taps.tap(window, stride, 2) as i64;

            let z = (self.coef[1] + z2 - scaling.sub_const) << FRAC_BITS;
            self.coef[1] = self.coef[0] + z1;
            self.coef[0] = z0;

            self.old_out = (scaling.hp_alfa * (self.old_out + z - self.old_in)) >> 8;
            self.old_in = z;
            self.old_z = ((256 - scaling.lp_alfa) * self.old_z + scaling.lp_alfa * self.old_out) >> 8;

            out[out_idx] = saturate(round_div(self.old_z * volume as i64, divisor));
            written += 1;
        }
        written
    }
}

/// Decimator for one channel
///
/// Not reentrant: one stream feeds one filter between resets.
#[derive(Clone, Debug)]
pub struct CicFilter {
    config: FilterConfig,
    kernel: SincKernel,
    scaling: Scaling,
    history: History,
}

impl CicFilter {
    pub fn new(config: FilterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let kernel = SincKernel::new(config.decimation);
        let scaling = Scaling::new(&config, &kernel);
        Ok(Self { config, kernel, scaling, history: History::default() })
    }

    /// Forget all past input
    pub fn reset(&mut self) {
        self.history = History::default();
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn kernel(&self) -> &SincKernel {
        &self.kernel
    }

    pub fn sub_const(&self) -> i64 {
        self.scaling.sub_const
    }

    pub fn div_const(&self) -> i64 {
        self.scaling.div_const
    }

    pub fn lp_alfa(&self) -> i64 {
        self.scaling.lp_alfa
    }

    pub fn hp_alfa(&self) -> i64 {
        self.scaling.hp_alfa
    }

    /// Takes effect from the next decoded sample; a gain of 0 is treated as 1
    pub fn set_gain(&mut self, gain: u8) {
        self.config.gain = gain.max(1);
        self.scaling.div_const = div_const(self.scaling.sub_const, self.config.max_volume, self.config.gain);
    }

    /// Takes effect from the next decoded sample; a max volume of 0 is treated as 1
    pub fn set_max_volume(&mut self, max_volume: u8) {
        self.config.max_volume = max_volume.max(1);
        self.scaling.div_const = div_const(self.scaling.sub_const, self.config.max_volume, self.config.gain);
    }

    /// Decode up to one millisecond of audio, testing each input bit against the kernel
    ///
    /// Stops early when `pdm` or `out` run short and returns the number of samples written.
    pub fn decode(&mut self, pdm: &[u8], out: &mut [i16], volume: u16) -> usize {
        let Self { config, kernel, scaling, history } = self;
        history.run(config, scaling, &*kernel, pdm, out, volume)
    }

    /// As [`CicFilter::decode`], with the taps summed by `taps`
    ///
    /// `taps` must have been built from a kernel of the same decimation.
    pub fn decode_with<T: TapSum + ?Sized>(&mut self, pdm: &[u8], out: &mut [i16], volume: u16, taps: &T) -> usize {
        self.history.run(&self.config, &self.scaling, taps, pdm, out, volume)
    }
}
