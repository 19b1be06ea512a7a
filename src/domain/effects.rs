//! Effect catalog
//!
//! Scenes run on the light itself and only need their id sent. Animations
//! are rendered here and streamed frame by frame as a dynamic picture.

use crate::domain::models::Color;

/// Produces the color of `index` in animation frame `frame`
pub type FrameGenerator = fn(frame: usize, frames: usize, index: usize, pixel_count: usize) -> Color;

#[derive(Debug, Clone, Copy)]
pub enum EffectKind {
    /// Built-in scene selected by id
    Scene { scene_id: u8 },
    /// Multi-frame pixel animation
    Animation {
        frames: usize,
        generator: FrameGenerator,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Effect {
    pub id: u8,
    pub name: &'static str,
    pub kind: EffectKind,
}

impl Effect {
    /// Render every frame of an animation; scenes have none
    pub fn render(&self, pixel_count: u16) -> Vec<Vec<Color>> {
        match self.kind {
            EffectKind::Scene { .. } => Vec::new(),
            EffectKind::Animation { frames, generator } => (0..frames)
                .map(|frame| {
                    (0..pixel_count as usize)
                        .map(|index| generator(frame, frames, index, pixel_count as usize))
                        .collect()
                })
                .collect(),
        }
    }
}

pub static EFFECTS: &[Effect] = &[
    Effect {
        id: 1,
        name: "colorful",
        kind: EffectKind::Scene { scene_id: 1 },
    },
    Effect {
        id: 2,
        name: "starry_sky",
        kind: EffectKind::Scene { scene_id: 2 },
    },
    Effect {
        id: 3,
        name: "aurora",
        kind: EffectKind::Scene { scene_id: 3 },
    },
    Effect {
        id: 4,
        name: "ocean",
        kind: EffectKind::Scene { scene_id: 4 },
    },
    Effect {
        id: 5,
        name: "fireworks",
        kind: EffectKind::Scene { scene_id: 5 },
    },
    Effect {
        id: 6,
        name: "candle",
        kind: EffectKind::Scene { scene_id: 6 },
    },
    Effect {
        id: 101,
        name: "rainbow",
        kind: EffectKind::Animation {
            frames: 12,
            generator: rainbow,
        },
    },
    Effect {
        id: 102,
        name: "chase",
        kind: EffectKind::Animation {
            frames: 8,
            generator: chase,
        },
    },
    Effect {
        id: 103,
        name: "breathing",
        kind: EffectKind::Animation {
            frames: 10,
            generator: breathing,
        },
    },
];

pub fn find_by_name(name: &str) -> Option<&'static Effect> {
    EFFECTS.iter().find(|e| e.name.eq_ignore_ascii_case(name))
}

pub fn find_by_id(id: u8) -> Option<&'static Effect> {
    EFFECTS.iter().find(|e| e.id == id)
}

fn rainbow(frame: usize, frames: usize, index: usize, pixel_count: usize) -> Color {
    let offset = frame as f32 / frames as f32 * 360.0;
    let hue = index as f32 / pixel_count.max(1) as f32 * 360.0 + offset;
    Color::from_hsv(hue, 1.0, 1.0)
}

fn chase(frame: usize, frames: usize, index: usize, _pixel_count: usize) -> Color {
    if index % frames == frame {
        Color::WHITE
    } else {
        Color::BLACK
    }
}

fn breathing(frame: usize, frames: usize, _index: usize, _pixel_count: usize) -> Color {
    // Triangle wave 0 -> 255 -> 0 across the loop
    let half = (frames / 2).max(1);
    let step = if frame <= half { frame } else { frames - frame };
    Color::RED.scaled((step * 255 / half).min(255) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_ids_and_names_unique() {
        let ids: HashSet<u8> = EFFECTS.iter().map(|e| e.id).collect();
        let names: HashSet<&str> = EFFECTS.iter().map(|e| e.name).collect();
        assert_eq!(ids.len(), EFFECTS.len());
        assert_eq!(names.len(), EFFECTS.len());
    }

    #[test]
    fn test_lookup() {
        assert_eq!(find_by_name("Rainbow").map(|e| e.id), Some(101));
        assert!(matches!(find_by_id(3).map(|e| e.kind), Some(EffectKind::Scene { scene_id: 3 })));
        assert!(find_by_name("none").is_none());
    }

    #[test]
    fn test_render_dimensions() {
        let effect = find_by_name("chase").unwrap();
        let frames = effect.render(20);
        assert_eq!(frames.len(), 8);
        assert!(frames.iter().all(|f| f.len() == 20));
        assert_eq!(frames[0][0], Color::WHITE);
        assert_eq!(frames[0][1], Color::BLACK);
        assert_eq!(frames[1][9], Color::WHITE);

        assert!(find_by_id(1).unwrap().render(20).is_empty());
    }

    #[test]
    fn test_breathing_peaks_mid_loop() {
        let frames = find_by_name("breathing").unwrap().render(1);
        assert_eq!(frames[0][0], Color::BLACK);
        assert_eq!(frames[5][0], Color::RED);
    }
}
