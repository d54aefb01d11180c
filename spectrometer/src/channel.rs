//! Per-channel pixel range and sample decoding
//!
//! A sample reply carries a 6-byte header declaring the pixel range it
//! covers, the extra (dark) pixels, then one little-endian 16-bit sample per
//! pixel of the range. Raw values are always multiples of 4; the driver
//! reports them divided by 4.

use tracing::{debug, error};

use crate::config::IjkingTable;
use crate::error::{Result, SpectrometerError};
use crate::protocol::SAMPLE_HEADER_SIZE;

/// Pixel count reported by sensors that carry extra dark pixels.
pub const FULL_SENSOR_PIXELS: usize = 0x800;

/// Dark pixels carried by a full sensor.
pub const EXTRA_PIXELS: usize = 14;

/// Pixel counts shared by every channel of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelLayout {
    /// Usable pixels per channel
    pub pixel_count: usize,
    /// Extra (dark) pixels sent ahead of every sample block
    pub extra_pixels: usize,
}

impl PixelLayout {
    /// Layout for the pixel count found in the status blob.
    pub fn from_reported(reported: usize) -> Self {
        let extra_pixels = if reported == FULL_SENSOR_PIXELS {
            EXTRA_PIXELS
        } else {
            0
        };
        Self {
            pixel_count: reported - extra_pixels,
            extra_pixels,
        }
    }

    /// Pixel count as stored in the status blob.
    pub fn reported(&self) -> usize {
        self.pixel_count + self.extra_pixels
    }

    /// Check a `[min, max)` range before it is sent to the instrument.
    pub fn validate_range(&self, min: usize, max: usize) -> Result<()> {
        if min >= self.pixel_count {
            return Err(SpectrometerError::InvalidArgument(format!(
                "range minimum {} must be below pixel count {}",
                min, self.pixel_count
            )));
        }
        if max == 0 || max > self.pixel_count {
            return Err(SpectrometerError::InvalidArgument(format!(
                "range maximum {} must be in 1..={}",
                max, self.pixel_count
            )));
        }
        Ok(())
    }
}

/// Decoded samples of one channel, not yet applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBlock {
    pub channel: u8,
    pub min: usize,
    pub max: usize,
    pub extra: Vec<u16>,
    pub samples: Vec<u16>,
}

/// One optical channel of the instrument.
#[derive(Debug, Clone)]
pub struct Channel {
    id: u8,
    min: usize,
    max: usize,
    data_min: usize,
    data_max: usize,
    samples: Vec<u16>,
    extra: Vec<u16>,
    nonlinear: Vec<f32>,
    ijking: Option<IjkingTable>,
}

impl Channel {
    /// A disabled channel with zeroed buffers sized for `layout`.
    pub fn new(id: u8, layout: PixelLayout) -> Self {
        Self {
            id,
            min: 0,
            max: 0,
            data_min: 0,
            data_max: 0,
            samples: vec![0; layout.pixel_count],
            extra: vec![0; layout.extra_pixels],
            nonlinear: Vec::new(),
            ijking: None,
        }
    }

    /// Attach correction tables loaded from the device configuration.
    pub fn with_corrections(mut self, nonlinear: Vec<f32>, ijking: Option<IjkingTable>) -> Self {
        self.nonlinear = nonlinear;
        self.ijking = ijking;
        self
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// First pixel of the configured range.
    pub fn range_min(&self) -> usize {
        self.min
    }

    /// End of the configured range (exclusive).
    pub fn range_max(&self) -> usize {
        self.max
    }

    /// A channel with an empty range is skipped by measurements.
    pub fn is_active(&self) -> bool {
        self.max > self.min
    }

    /// Record a range the instrument has accepted.
    pub(crate) fn set_range(&mut self, min: usize, max: usize) {
        self.min = min;
        self.max = max;
    }

    /// Pixel range covered by the last decoded block.
    pub fn data_range(&self) -> std::ops::Range<usize> {
        self.data_min..self.data_max
    }

    /// Decoded value of pixel `i`, if it was part of the last read.
    pub fn sample(&self, i: usize) -> Option<u16> {
        if self.data_range().contains(&i) {
            self.samples.get(i).copied()
        } else {
            None
        }
    }

    /// Decoded value of extra pixel `i`.
    pub fn extra(&self, i: usize) -> Option<u16> {
        self.extra.get(i).copied()
    }

    /// Full sample buffer, one entry per usable pixel.
    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    /// Samples of the last decoded range.
    pub fn active_samples(&self) -> &[u16] {
        &self.samples[self.data_range()]
    }

    /// Extra (dark) pixel buffer.
    pub fn extra_samples(&self) -> &[u16] {
        &self.extra
    }

    /// Nonlinearity coefficients; empty or exactly eight.
    pub fn nonlinear(&self) -> &[f32] {
        &self.nonlinear
    }

    pub fn ijking(&self) -> Option<&IjkingTable> {
        self.ijking.as_ref()
    }

    /// Mean of the extra pixels, or `None` without extra pixels.
    pub fn dark_level(&self) -> Option<f64> {
        if self.extra.is_empty() {
            return None;
        }
        let sum: f64 = self.extra.iter().map(|&v| f64::from(v)).sum();
        Some(sum / self.extra.len() as f64)
    }

    /// Last decoded range with the dark level subtracted.
    pub fn dark_corrected(&self) -> Vec<f64> {
        let dark = self.dark_level().unwrap_or(0.0);
        self.active_samples()
            .iter()
            .map(|&v| f64::from(v) - dark)
            .collect()
    }

    /// Decode a sample reply against the configured range.
    ///
    /// Nothing is modified; apply the result with [`commit`](Self::commit).
    pub fn decode_sample_block(&self, reply: &[u8], layout: PixelLayout) -> Result<SampleBlock> {
        if reply.len() < SAMPLE_HEADER_SIZE {
            return Err(SpectrometerError::ShortReply {
                expected: SAMPLE_HEADER_SIZE,
                actual: reply.len(),
            });
        }

        let data_min = usize::from(u16::from_le_bytes([reply[2], reply[3]]));
        let data_max = usize::from(u16::from_le_bytes([reply[4], reply[5]])) + 1;
        if data_min != self.min || data_max != self.max {
            error!(
                "Channel {}: reply covers [{}, {}) but range is [{}, {})",
                self.id, data_min, data_max, self.min, self.max
            );
            return Err(SpectrometerError::RangeMismatch {
                min: self.min,
                max: self.max,
                data_min,
                data_max,
            });
        }

        let extra_start = SAMPLE_HEADER_SIZE;
        let range_start = extra_start + 2 * layout.extra_pixels;
        let expected = range_start + 2 * (self.max - self.min);
        if reply.len() < expected {
            error!(
                "Channel {}: sample reply has {} bytes, need {}",
                self.id,
                reply.len(),
                expected
            );
            return Err(SpectrometerError::ShortReply {
                expected,
                actual: reply.len(),
            });
        }
        if reply.len() > expected {
            debug!(
                "Channel {}: ignoring {} trailing bytes of sample reply",
                self.id,
                reply.len() - expected
            );
        }

        let extra = decode_samples(&reply[extra_start..range_start], 0)?;
        let samples = decode_samples(&reply[range_start..expected], self.min)?;

        Ok(SampleBlock {
            channel: self.id,
            min: self.min,
            max: self.max,
            extra,
            samples,
        })
    }

    /// Apply a block produced by [`decode_sample_block`](Self::decode_sample_block).
    pub fn commit(&mut self, block: SampleBlock) {
        self.samples[block.min..block.max].copy_from_slice(&block.samples);
        self.extra = block.extra;
        self.data_min = block.min;
        self.data_max = block.max;
    }
}

/// Decode little-endian raw samples, `first_index` naming the first pixel.
fn decode_samples(raw: &[u8], first_index: usize) -> Result<Vec<u16>> {
    raw.chunks_exact(2)
        .enumerate()
        .map(|(i, pair)| {
            let value = u16::from_le_bytes([pair[0], pair[1]]);
            if value & 3 != 0 {
                error!(
                    "Raw sample {:#06x} at pixel {} is not a multiple of 4",
                    value,
                    first_index + i
                );
                return Err(SpectrometerError::UnalignedSample {
                    index: first_index + i,
                    raw: value,
                });
            }
            Ok(value >> 2)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: PixelLayout = PixelLayout {
        pixel_count: 8,
        extra_pixels: 0,
    };

    fn full() -> PixelLayout {
        PixelLayout::from_reported(FULL_SENSOR_PIXELS)
    }

    fn reply(min: u16, max: u16, extra: &[u16], samples: &[u16]) -> Vec<u8> {
        let mut out = vec![0x83, 0];
        out.extend_from_slice(&min.to_le_bytes());
        out.extend_from_slice(&(max - 1).to_le_bytes());
        for v in extra.iter().chain(samples) {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_layout_from_reported() {
        let layout = full();
        assert_eq!(layout.pixel_count, 2034);
        assert_eq!(layout.extra_pixels, 14);
        assert_eq!(layout.reported(), 0x800);

        let small = PixelLayout::from_reported(8);
        assert_eq!(small, SMALL);
        assert_eq!(PixelLayout::from_reported(0x7FF).extra_pixels, 0);
    }

    #[test]
    fn test_validate_range() {
        assert!(SMALL.validate_range(0, 8).is_ok());
        assert!(SMALL.validate_range(7, 8).is_ok());
        assert!(SMALL.validate_range(8, 8).is_err());
        assert!(SMALL.validate_range(0, 0).is_err());
        assert!(SMALL.validate_range(0, 9).is_err());
    }

    #[test]
    fn test_decode_and_commit() {
        let mut channel = Channel::new(0, SMALL);
        channel.set_range(2, 5);
        let block = channel
            .decode_sample_block(&reply(2, 5, &[], &[4, 400, 0xFFFC]), SMALL)
            .unwrap();
        assert_eq!(block.samples, vec![1, 100, 0x3FFF]);
        // Decoding alone leaves the channel untouched
        assert_eq!(channel.sample(2), None);
        assert!(channel.samples().iter().all(|&v| v == 0));

        channel.commit(block);
        assert_eq!(channel.sample(2), Some(1));
        assert_eq!(channel.sample(4), Some(0x3FFF));
        assert_eq!(channel.sample(5), None);
        assert_eq!(channel.sample(1), None);
        assert_eq!(channel.active_samples(), &[1, 100, 0x3FFF]);
    }

    #[test]
    fn test_extra_pixels_precede_range() {
        let layout = full();
        let mut channel = Channel::new(1, layout);
        channel.set_range(0, 4);
        let extra: Vec<u16> = (0..14).map(|i| i * 4).collect();
        let block = channel
            .decode_sample_block(&reply(0, 4, &extra, &[8, 8, 8, 8]), layout)
            .unwrap();
        channel.commit(block);
        assert_eq!(channel.extra(13), Some(13));
        assert_eq!(channel.extra(14), None);
        assert_eq!(channel.active_samples(), &[2, 2, 2, 2]);
        approx::assert_relative_eq!(channel.dark_level().unwrap(), 6.5);
        assert_eq!(channel.dark_corrected(), vec![-4.5; 4]);
    }

    #[test]
    fn test_range_mismatch_leaves_buffers() {
        let mut channel = Channel::new(0, SMALL);
        channel.set_range(0, 4);
        let first = channel
            .decode_sample_block(&reply(0, 4, &[], &[4, 4, 4, 4]), SMALL)
            .unwrap();
        channel.commit(first);

        let err = channel
            .decode_sample_block(&reply(1, 4, &[], &[8, 8, 8]), SMALL)
            .unwrap_err();
        assert!(matches!(
            err,
            SpectrometerError::RangeMismatch {
                min: 0,
                max: 4,
                data_min: 1,
                data_max: 4
            }
        ));
        assert_eq!(channel.active_samples(), &[1, 1, 1, 1]);
    }

    #[test]
    fn test_unaligned_sample_rejected() {
        let mut channel = Channel::new(0, SMALL);
        channel.set_range(3, 6);
        for bad in [1u16, 2, 3, 0x0101] {
            let err = channel
                .decode_sample_block(&reply(3, 6, &[], &[4, bad, 4]), SMALL)
                .unwrap_err();
            match err {
                SpectrometerError::UnalignedSample { index, raw } => {
                    assert_eq!(index, 4);
                    assert_eq!(raw, bad);
                }
                other => panic!("unexpected error {:?}", other),
            }
        }
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut channel = Channel::new(0, SMALL);
        channel.set_range(0, 2);
        let mut data = reply(0, 2, &[], &[8, 12]);
        data.extend_from_slice(&[0x01, 0x00, 0xFF]);
        let block = channel.decode_sample_block(&data, SMALL).unwrap();
        assert_eq!(block.samples, vec![2, 3]);
    }

    #[test]
    fn test_short_reply_rejected() {
        let mut channel = Channel::new(0, SMALL);
        channel.set_range(0, 4);
        let mut data = reply(0, 4, &[], &[4, 4, 4, 4]);
        data.pop();
        assert!(matches!(
            channel.decode_sample_block(&data, SMALL),
            Err(SpectrometerError::ShortReply {
                expected: 14,
                actual: 13
            })
        ));
        assert!(channel.decode_sample_block(&[0x83, 0], SMALL).is_err());
    }

    #[test]
    fn test_new_channel_is_inactive() {
        let channel = Channel::new(2, full());
        assert!(!channel.is_active());
        assert_eq!(channel.samples().len(), 2034);
        assert_eq!(channel.extra_samples().len(), 14);
        assert_eq!(channel.dark_level(), Some(0.0));
        assert!(channel.active_samples().is_empty());
    }
}
