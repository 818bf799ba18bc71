//! Splitting of bit-interleaved PDM words into per-channel streams
//!
//! With N microphones on one data line the capture hardware shifts in one bit per microphone per
//! clock, so bit `k` of every N-bit group belongs to channel `k`. Words are read little-endian.

use crate::config::Channels;

/// Gather the even bits of a word into the low half
#[inline(always)]
fn morton_even(x: u32) -> u16 {
    let x = x & 0x5555_5555;
    let x = (x | (x >> 1)) & 0x3333_3333;
    let x = (x | (x >> 2)) & 0x0F0F_0F0F;
    let x = (x | (x >> 4)) & 0x00FF_00FF;
    ((x | (x >> 8)) & 0xFFFF) as u16
}

/// Gather every fourth bit of a word into the low byte
#[inline(always)]
fn morton_fourth(x: u32) -> u8 {
    let x = x & 0x1111_1111;
    let x = (x | (x >> 3)) & 0x0303_0303;
    let x = (x | (x >> 6)) & 0x000F_000F;
    ((x | (x >> 12)) & 0xFF) as u8
}

#[inline(always)]
fn spread_even(x: u16) -> u32 {
    let x = x as u32;
    let x = (x | (x << 8)) & 0x00FF_00FF;
    let x = (x | (x << 4)) & 0x0F0F_0F0F;
    let x = (x | (x << 2)) & 0x3333_3333;
    (x | (x << 1)) & 0x5555_5555
}

#[inline(always)]
fn spread_fourth(x: u8) -> u32 {
    let x = x as u32;
    let x = (x | (x << 12)) & 0x000F_000F;
    let x = (x | (x << 6)) & 0x0303_0303;
    (x | (x << 3)) & 0x1111_1111
}

/// Split a two channel word into (channel 0, channel 1)
pub fn deinterleave2(word: u32) -> (u16, u16) {
    (morton_even(word), morton_even(word >> 1))
}

pub fn deinterleave4(word: u32) -> [u8; 4] {
    [
        morton_fourth(word),
        morton_fourth(word >> 1),
        morton_fourth(word >> 2),
        morton_fourth(word >> 3),
    ]
}

pub fn interleave2(ch0: u16, ch1: u16) -> u32 {
    spread_even(ch0) | (spread_even(ch1) << 1)
}

pub fn interleave4(chans: [u8; 4]) -> u32 {
    spread_fourth(chans[0])
        | (spread_fourth(chans[1]) << 1)
        | (spread_fourth(chans[2]) << 2)
        | (spread_fourth(chans[3]) << 3)
}

/// Split `raw` into one contiguous stream per channel
///
/// Channel `j` lands in `scratch[j * len .. (j + 1) * len]`, where `len` is the returned per-channel
/// length. Only whole words are processed; anything that does not fit `scratch` is ignored.
pub fn demultiplex(channels: Channels, raw: &[u8], scratch: &mut [u8]) -> usize {
    let total = match channels {
        Channels::Mono => raw.len().min(scratch.len()),
        _ => raw.len().min(scratch.len()) & !3,
    };
    let raw = &raw[..total];
    let scratch = &mut scratch[..total];
    let per_channel = total / channels.count();

    match channels {
        Channels::Mono => scratch.copy_from_slice(raw),
        Channels::Stereo => {
            let (left, right) = scratch.split_at_mut(per_channel);
            for ((w, l), r) in raw.chunks_exact(4).zip(left.chunks_exact_mut(2)).zip(right.chunks_exact_mut(2)) {
                let (a, b) = deinterleave2(u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
                l.copy_from_slice(&a.to_le_bytes());
                r.copy_from_slice(&b.to_le_bytes());
            }
        }
        Channels::Quad => {
            for (i, w) in raw.chunks_exact(4).enumerate() {
                let bytes = deinterleave4(u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
                for (ch, b) in bytes.iter().enumerate() {
                    scratch[ch * per_channel + i] = *b;
                }
            }
        }
    }
    per_channel
}

/// Inverse of [`demultiplex`]: pack contiguous per-channel streams into interleaved words
///
/// Returns the number of bytes written to `raw`.
pub fn multiplex(channels: Channels, streams: &[u8], raw: &mut [u8]) -> usize {
    let total = match channels {
        Channels::Mono => streams.len().min(raw.len()),
        _ => streams.len().min(raw.len()) & !3,
    };
    let per_channel = streams.len() / channels.count();
    let raw = &mut raw[..total];

    match channels {
        Channels::Mono => raw.copy_from_slice(&streams[..total]),
        Channels::Stereo => {
            let (left, right) = streams.split_at(per_channel);
            for ((w, l), r) in raw.chunks_exact_mut(4).zip(left.chunks_exact(2)).zip(right.chunks_exact(2)) {
                let word = interleave2(u16::from_le_bytes([l[0], l[1]]), u16::from_le_bytes([r[0], r[1]]));
                w.copy_from_slice(&word.to_le_bytes());
            }
        }
        Channels::Quad => {
            for (i, w) in raw.chunks_exact_mut(4).enumerate() {
                let mut bytes = [0u8; 4];
                for (ch, b) in bytes.iter_mut().enumerate() {
                    *b = streams[ch * per_channel + i];
                }
                w.copy_from_slice(&interleave4(bytes).to_le_bytes());
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deinterleave2_bits() {
        // Channel 0 on even bits, all ones; channel 1 silent
        assert_eq!(deinterleave2(0x5555_5555), (0xFFFF, 0x0000));
        assert_eq!(deinterleave2(0xAAAA_AAAA), (0x0000, 0xFFFF));
        // bit 0 -> ch0 bit 0, bit 3 -> ch1 bit 1, bit 31 -> ch1 bit 15
        assert_eq!(deinterleave2(0x0000_0001), (0x0001, 0x0000));
        assert_eq!(deinterleave2(0x0000_0008), (0x0000, 0x0002));
        assert_eq!(deinterleave2(0x8000_0000), (0x0000, 0x8000));
    }

    #[test]
    fn test_deinterleave4_bits() {
        assert_eq!(deinterleave4(0x1111_1111), [0xFF, 0, 0, 0]);
        assert_eq!(deinterleave4(0x8888_8888), [0, 0, 0, 0xFF]);
        // bit 6 is channel 2, group 1
        assert_eq!(deinterleave4(0x0000_0040), [0, 0, 0x02, 0]);
        assert_eq!(deinterleave4(0xF000_0000), [0x80, 0x80, 0x80, 0x80]);
    }

    #[test]
    fn test_interleave_inverts_deinterleave() {
        for word in [0u32, 0xFFFF_FFFF, 0xDEAD_BEEF, 0x1234_5678, 0x8000_0001] {
            let (a, b) = deinterleave2(word);
            assert_eq!(interleave2(a, b), word);
            assert_eq!(interleave4(deinterleave4(word)), word);
        }
    }

    #[test]
    fn test_demultiplex_stereo_layout() {
        // Two words: ch0 all ones in the first, ch1 all ones in the second
        let raw = [0x55, 0x55, 0x55, 0x55, 0xAA, 0xAA, 0xAA, 0xAA];
        let mut scratch = [0u8; 8];
        let n = demultiplex(Channels::Stereo, &raw, &mut scratch);
        assert_eq!(n, 4);
        assert_eq!(scratch, [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF]);

        let mut packed = [0u8; 8];
        assert_eq!(multiplex(Channels::Stereo, &scratch, &mut packed), 8);
        assert_eq!(packed, raw);
    }

    #[test]
    fn test_demultiplex_quad_layout() {
        let streams = [
            0x01, 0x02, // ch0
            0x10, 0x20, // ch1
            0xAA, 0x55, // ch2
            0xFF, 0x00, // ch3
        ];
        let mut raw = [0u8; 8];
        multiplex(Channels::Quad, &streams, &mut raw);
        let mut scratch = [0u8; 8];
        assert_eq!(demultiplex(Channels::Quad, &raw, &mut scratch), 2);
        assert_eq!(scratch, streams);
    }

    #[test]
    fn test_demultiplex_mono_copies() {
        let raw = [1u8, 2, 3];
        let mut scratch = [0u8; 4];
        assert_eq!(demultiplex(Channels::Mono, &raw, &mut scratch), 3);
        assert_eq!(&scratch[..3], &raw);
    }
}
