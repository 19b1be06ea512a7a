use crate::domain::models::{Color, PixelUpdate};
use crate::error::Result;
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};

/// What happens when the frame number passes its limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FrameNumberOverflow {
    /// Start again at 1
    #[default]
    Wrap,
    /// Keep reusing the limit
    Hold,
}

/// 1-based counter tagging pixel batches
#[derive(Debug, Clone)]
pub struct FrameCounter {
    current: u8,
    limit: u8,
    overflow: FrameNumberOverflow,
}

impl FrameCounter {
    pub fn new(limit: u8, overflow: FrameNumberOverflow) -> Self {
        Self {
            current: 0,
            limit: limit.max(1),
            overflow,
        }
    }

    /// Number of the most recent batch, 0 before the first
    pub fn current(&self) -> u8 {
        self.current
    }

    pub fn next(&mut self) -> u8 {
        self.current = if self.current >= self.limit {
            match self.overflow {
                FrameNumberOverflow::Wrap => 1,
                FrameNumberOverflow::Hold => self.limit,
            }
        } else {
            self.current + 1
        };
        self.current
    }
}

/// Pixel state of one device: what we asked for and what the device confirmed
pub struct PixelFrameBuffer {
    desired: Vec<Color>,
    acknowledged: Vec<Option<Color>>,
    stale: bool,
}

impl PixelFrameBuffer {
    pub fn new(pixel_count: u16) -> Self {
        Self {
            desired: vec![Color::BLACK; pixel_count as usize],
            acknowledged: vec![None; pixel_count as usize],
            stale: false,
        }
    }

    pub fn pixel_count(&self) -> u16 {
        self.desired.len() as u16
    }

    pub fn get(&self, index: u16) -> Option<Color> {
        self.desired.get(index as usize).copied()
    }

    /// Change the device size; existing pixels keep their colors
    pub fn resize(&mut self, pixel_count: u16) {
        self.desired.resize(pixel_count as usize, Color::BLACK);
        self.acknowledged.resize(pixel_count as usize, None);
    }

    /// Overwrite every pixel, returning one batch over all indices in display order
    pub fn fill(&mut self, color: Color) -> Vec<PixelUpdate> {
        self.desired.fill(color);
        (0..self.pixel_count()).map(|i| (i, color)).collect()
    }

    /// Apply per-pixel updates, returning only those the device still needs
    ///
    /// `pending` holds pixels already queued but not yet written, in queue
    /// order. The device is compared as it will look once they land.
    /// Repeated indices collapse to the last color given, at the position of
    /// their first occurrence.
    pub fn apply(&mut self, updates: &[PixelUpdate], pending: &[PixelUpdate]) -> Result<Vec<PixelUpdate>> {
        protocol::check_indices(updates, self.pixel_count())?;

        let mut positions: Vec<Option<usize>> = vec![None; self.desired.len()];
        let mut ordered: Vec<PixelUpdate> = Vec::with_capacity(updates.len());
        for &(index, color) in updates {
            match positions[index as usize] {
                Some(at) => ordered[at].1 = color,
                None => {
                    positions[index as usize] = Some(ordered.len());
                    ordered.push((index, color));
                }
            }
        }

        let mut expected = self.acknowledged.clone();
        for &(index, color) in pending {
            if let Some(slot) = expected.get_mut(index as usize) {
                *slot = Some(color);
            }
        }

        let mut needed = Vec::with_capacity(ordered.len());
        for (index, color) in ordered {
            self.desired[index as usize] = color;
            if self.stale || expected[index as usize] != Some(color) {
                needed.push((index, color));
            }
        }
        Ok(needed)
    }

    /// Record that the device now shows these colors
    pub fn acknowledge(&mut self, updates: &[PixelUpdate]) {
        for &(index, color) in updates {
            if let Some(slot) = self.acknowledged.get_mut(index as usize) {
                *slot = Some(color);
            }
        }
    }

    /// All desired pixels in display order
    pub fn full_state(&self) -> Vec<PixelUpdate> {
        self.desired
            .iter()
            .enumerate()
            .map(|(i, c)| (i as u16, *c))
            .collect()
    }

    /// Forget what the device confirmed; used after the link drops
    pub fn mark_stale(&mut self) {
        self.stale = true;
        self.acknowledged.fill(None);
    }

    pub fn mark_fresh(&mut self) {
        self.stale = false;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_counter_wraps_to_one() {
        let mut counter = FrameCounter::new(3, FrameNumberOverflow::Wrap);
        let seq: Vec<u8> = (0..5).map(|_| counter.next()).collect();
        assert_eq!(seq, vec![1, 2, 3, 1, 2]);
    }

    #[test]
    fn test_frame_counter_holds_at_limit() {
        let mut counter = FrameCounter::new(2, FrameNumberOverflow::Hold);
        let seq: Vec<u8> = (0..4).map(|_| counter.next()).collect();
        assert_eq!(seq, vec![1, 2, 2, 2]);
    }

    #[test]
    fn test_frame_counter_full_range() {
        let mut counter = FrameCounter::new(255, FrameNumberOverflow::Wrap);
        for _ in 0..255 {
            counter.next();
        }
        assert_eq!(counter.current(), 255);
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn test_fill_covers_every_pixel() {
        let mut buffer = PixelFrameBuffer::new(256);
        let batch = buffer.fill(Color::RED);
        assert_eq!(batch.len(), 256);
        assert_eq!(batch.first(), Some(&(0, Color::RED)));
        assert_eq!(batch.last(), Some(&(255, Color::RED)));
        assert_eq!(buffer.get(100), Some(Color::RED));
    }

    #[test]
    fn test_apply_skips_confirmed_pixels() {
        let mut buffer = PixelFrameBuffer::new(16);
        let batch = buffer.fill(Color::RED);
        buffer.acknowledge(&batch);

        let needed = buffer
            .apply(&[(1, Color::RED), (2, Color::WHITE), (2, Color::BLACK), (3, Color::WHITE)], &[])
            .unwrap();
        assert_eq!(needed, vec![(2, Color::BLACK), (3, Color::WHITE)]);
        assert_eq!(buffer.get(2), Some(Color::BLACK));
    }

    #[test]
    fn test_apply_compares_against_queued_pixels() {
        let mut buffer = PixelFrameBuffer::new(8);
        let red = buffer.fill(Color::RED);
        buffer.acknowledge(&red);
        let white = buffer.fill(Color::WHITE);

        // White is still queued, so going back to red must be sent
        let needed = buffer.apply(&[(4, Color::RED), (5, Color::WHITE)], &white).unwrap();
        assert_eq!(needed, vec![(4, Color::RED)]);
        assert_eq!(buffer.get(4), Some(Color::RED));
        assert_eq!(buffer.get(5), Some(Color::WHITE));
    }

    #[test]
    fn test_apply_later_queued_pixels_win() {
        let mut buffer = PixelFrameBuffer::new(4);
        let pending = vec![(1, Color::WHITE), (1, Color::RED)];
        assert!(buffer.apply(&[(1, Color::RED)], &pending).unwrap().is_empty());
        assert_eq!(buffer.apply(&[(1, Color::WHITE)], &pending).unwrap(), vec![(1, Color::WHITE)]);
    }

    #[test]
    fn test_apply_rejects_bad_index() {
        let mut buffer = PixelFrameBuffer::new(16);
        assert!(buffer.apply(&[(16, Color::RED)], &[]).is_err());
        assert_eq!(buffer.get(0), Some(Color::BLACK));
    }

    #[test]
    fn test_stale_buffer_resends_everything() {
        let mut buffer = PixelFrameBuffer::new(4);
        let batch = buffer.fill(Color::WHITE);
        buffer.acknowledge(&batch);
        buffer.mark_stale();

        assert!(buffer.is_stale());
        assert_eq!(buffer.full_state(), batch);
        assert_eq!(buffer.apply(&[(0, Color::WHITE)], &[]).unwrap(), vec![(0, Color::WHITE)]);
    }

    #[test]
    fn test_resize_keeps_existing_pixels() {
        let mut buffer = PixelFrameBuffer::new(4);
        buffer.fill(Color::RED);
        buffer.resize(8);
        assert_eq!(buffer.pixel_count(), 8);
        assert_eq!(buffer.get(3), Some(Color::RED));
        assert_eq!(buffer.get(7), Some(Color::BLACK));
    }
}
