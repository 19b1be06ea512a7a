//! MTU Chunker
//!
//! Splits an ordered run of pixel updates into pixel frames that each fit in
//! one GATT write.

use crate::domain::models::PixelUpdate;
use crate::error::{ControllerError, Result};
use crate::infrastructure::bluetooth::protocol::{
    self, ATT_WRITE_OVERHEAD, BYTES_PER_PIXEL, PIXEL_FRAME_OVERHEAD,
};

/// Largest write the chunker may produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteLimit {
    /// Negotiated ATT MTU; the writable payload is `mtu - 3`
    ///
    /// A frame spends 4 of those bytes on header, command, frame number and
    /// checksum, so a chunk holds `(mtu - 3 - 4) / 5` pixels rather than
    /// `(mtu - 1) / 5`.
    Mtu(u16),
    /// No MTU exchange happened: use a fixed number of pixels per frame
    DefaultChunk(usize),
}

impl WriteLimit {
    pub fn from_mtu(mtu: Option<u16>, default_chunk_pixels: usize) -> Self {
        match mtu {
            Some(mtu) => WriteLimit::Mtu(mtu),
            None => WriteLimit::DefaultChunk(default_chunk_pixels),
        }
    }

    /// Pixels that fit in one frame
    pub fn pixels_per_chunk(&self) -> Result<usize> {
        let pixels = match *self {
            WriteLimit::Mtu(mtu) => (mtu as usize)
                .saturating_sub(ATT_WRITE_OVERHEAD + PIXEL_FRAME_OVERHEAD)
                / BYTES_PER_PIXEL,
            WriteLimit::DefaultChunk(pixels) => pixels,
        };
        if pixels == 0 {
            let min_mtu = (ATT_WRITE_OVERHEAD + PIXEL_FRAME_OVERHEAD + BYTES_PER_PIXEL) as i64;
            let value = match *self {
                WriteLimit::Mtu(mtu) => mtu as i64,
                WriteLimit::DefaultChunk(_) => 0,
            };
            return Err(ControllerError::out_of_range("write_limit", value, min_mtu, i64::MAX));
        }
        Ok(pixels)
    }

    /// Largest encoded pixel frame allowed under this limit
    pub fn max_frame_len(&self) -> Result<usize> {
        Ok(PIXEL_FRAME_OVERHEAD + self.pixels_per_chunk()? * BYTES_PER_PIXEL)
    }
}

/// Split `pixels` into consecutive slices of at most one frame each
pub fn chunk_pixels(pixels: &[PixelUpdate], limit: WriteLimit) -> Result<Vec<&[PixelUpdate]>> {
    let per_chunk = limit.pixels_per_chunk()?;
    Ok(pixels.chunks(per_chunk).collect())
}

/// Encode `pixels` as pixel frames tagged with `frame_number`
pub fn encode_chunks(
    frame_number: u8,
    pixels: &[PixelUpdate],
    pixel_count: u16,
    limit: WriteLimit,
) -> Result<Vec<Vec<u8>>> {
    protocol::check_indices(pixels, pixel_count)?;
    chunk_pixels(pixels, limit)?
        .into_iter()
        .map(|chunk| protocol::build_pixel_frame(frame_number, chunk, pixel_count))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Color;
    use crate::infrastructure::bluetooth::protocol::verify;

    fn fill(n: u16, color: Color) -> Vec<PixelUpdate> {
        (0..n).map(|i| (i, color)).collect()
    }

    fn decoded_indices(frame: &[u8]) -> Vec<u16> {
        frame[3..frame.len() - 1]
            .chunks(BYTES_PER_PIXEL)
            .map(|e| u16::from_le_bytes([e[0], e[1]]))
            .collect()
    }

    #[test]
    fn test_pixels_per_chunk() {
        assert_eq!(WriteLimit::Mtu(23).pixels_per_chunk().unwrap(), 3);
        assert_eq!(WriteLimit::Mtu(247).pixels_per_chunk().unwrap(), 48);
        assert_eq!(WriteLimit::Mtu(512).pixels_per_chunk().unwrap(), 101);
        assert_eq!(WriteLimit::DefaultChunk(85).pixels_per_chunk().unwrap(), 85);
        assert!(WriteLimit::Mtu(11).pixels_per_chunk().is_err());
        assert!(WriteLimit::DefaultChunk(0).pixels_per_chunk().is_err());
    }

    #[test]
    fn test_fill_partitions_every_pixel_once() {
        let limits = [
            WriteLimit::Mtu(23),
            WriteLimit::Mtu(185),
            WriteLimit::Mtu(247),
            WriteLimit::Mtu(512),
            WriteLimit::DefaultChunk(85),
        ];
        for n in [1u16, 85, 256, 900] {
            for limit in limits {
                let frames = encode_chunks(1, &fill(n, Color::RED), n, limit).unwrap();
                let max_len = limit.max_frame_len().unwrap();
                if let WriteLimit::Mtu(mtu) = limit {
                    assert!(max_len <= mtu as usize - ATT_WRITE_OVERHEAD);
                }

                let mut seen = Vec::new();
                for frame in &frames {
                    assert!(frame.len() <= max_len);
                    assert!(verify(frame));
                    seen.extend(decoded_indices(frame));
                }
                let expected: Vec<u16> = (0..n).collect();
                assert_eq!(seen, expected, "n={} limit={:?}", n, limit);
            }
        }
    }

    #[test]
    fn test_default_chunking_of_256_pixels() {
        let frames = encode_chunks(1, &fill(256, Color::RED), 256, WriteLimit::DefaultChunk(85)).unwrap();
        let sizes: Vec<usize> = frames.iter().map(|f| decoded_indices(f).len()).collect();
        assert_eq!(sizes, vec![85, 85, 85, 1]);
    }

    #[test]
    fn test_rejects_index_beyond_device() {
        let pixels = vec![(0, Color::RED), (300, Color::RED)];
        assert!(encode_chunks(1, &pixels, 256, WriteLimit::Mtu(247)).is_err());
    }
}
