use heapless::Vec;

use crate::cic::{CicFilter, LookupTable};
use crate::config::{Channels, FilterStrategy, MicConfig, MAX_CHANNELS, MAX_SLOT_BYTES};
use crate::demux;
use crate::{Error, Resource};

pub trait PdmProcessor {
    /// Decode one raw slot into `out`, returning the samples written per channel
    fn process_pdm(&mut self, slot: &[u8], out: &mut [i16], n_requested: usize) -> usize;
}

/// How filters sum their taps, shared by every channel
pub enum Taps {
    Direct,
    Table(LookupTable),
}

/// PdmProcessing stores filter state for decimation of all channels of a session
pub struct PdmProcessing {
    channels: Channels,
    /// Samples per channel held by one slot
    buffer_size: usize,
    samples_per_ms: usize,
    /// Raw bytes of one channel per millisecond
    bytes_per_ms: usize,
    volume: u16,
    filters: Vec<CicFilter, MAX_CHANNELS>,
    taps: Taps,
    scratch: [u8; MAX_SLOT_BYTES],
}

impl PdmProcessing {
    pub fn new(config: &MicConfig) -> Result<Self, Error> {
        let slot_len = config.slot_len();
        if slot_len > MAX_SLOT_BYTES {
            return Err(Error::ResourceExhaustion(Resource::Scratch { needed: slot_len, available: MAX_SLOT_BYTES }));
        }

        let filter_config = config.filter_config();
        let mut filters = Vec::new();
        for _ in 0..config.channels.count() {
            filters.push(CicFilter::new(filter_config)?).ok();
        }
        let taps = match config.strategy {
            FilterStrategy::Direct => Taps::Direct,
            FilterStrategy::LookupTable => match filters.first() {
                Some(f) => Taps::Table(LookupTable::new(f.kernel())),
                None => Taps::Direct,
            },
        };

        let samples_per_ms = config.samples_per_ms();
        Ok(Self {
            channels: config.channels,
            buffer_size: config.sample_buffer_size,
            samples_per_ms,
            bytes_per_ms: samples_per_ms * config.decimation.bytes_per_sample(),
            volume: config.filter.max_volume as u16,
            filters,
            taps,
            scratch: [0; MAX_SLOT_BYTES],
        })
    }

    /// Clear the history of every channel
    pub fn reset(&mut self) {
        for f in self.filters.iter_mut() {
            f.reset();
        }
    }

    pub fn volume(&self) -> u16 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: u16) {
        self.volume = volume;
    }

    pub fn set_gain(&mut self, gain: u8) {
        for f in self.filters.iter_mut() {
            f.set_gain(gain);
        }
    }

    pub fn set_max_volume(&mut self, max_volume: u8) {
        for f in self.filters.iter_mut() {
            f.set_max_volume(max_volume);
        }
    }

    pub fn filter(&self, channel: usize) -> Option<&CicFilter> {
        self.filters.get(channel)
    }

    pub fn channels(&self) -> Channels {
        self.channels
    }
}

impl PdmProcessor for PdmProcessing {
    /// Output for channel `j` goes to `out[j * n_requested ..]`. The count is rounded down to whole
    /// milliseconds and capped at one slot. Nothing is written if `out` cannot hold
    /// `channels * n_requested` samples.
    fn process_pdm(&mut self, slot: &[u8], out: &mut [i16], n_requested: usize) -> usize {
        if out.len() < self.channels.count() * n_requested {
            return 0;
        }
        let n = (n_requested / self.samples_per_ms * self.samples_per_ms).min(self.buffer_size);
        if n == 0 {
            return 0;
        }

        let per_channel = demux::demultiplex(self.channels, slot, &mut self.scratch);
        for (ch, filter) in self.filters.iter_mut().enumerate() {
            let input = &self.scratch[ch * per_channel..(ch + 1) * per_channel];
            let output = &mut out[ch * n_requested..ch * n_requested + n];
            for (pdm, pcm) in input.chunks(self.bytes_per_ms).zip(output.chunks_mut(self.samples_per_ms)) {
                match &self.taps {
                    Taps::Direct => filter.decode(pdm, pcm, self.volume),
                    Taps::Table(lut) => filter.decode_with(pdm, pcm, self.volume, lut),
                };
            }
        }
        n
    }
}
