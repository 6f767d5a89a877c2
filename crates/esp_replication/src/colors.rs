//! Per-room player color assignment (spec §4.5, §9 "Open question: color
//! uniqueness under churn").
//!
//! The first [`PALETTE`] entries are the named colors from the original
//! grid game's player palette; rooms are capped at
//! [`Config::required_players`](crate::config::Config::required_players)
//! seats, so in practice the palette alone always suffices. If a room were
//! configured with more than [`PALETTE`]'s length of required players, color
//! assignment falls back to resampling in the 50..255-per-channel range the
//! spec describes, retrying on collision.

use rand::Rng;

/// Named player colors, in assignment-preference order.
pub const PALETTE: [(u8, u8, u8); 16] = [
    (255, 100, 100), // Red
    (100, 200, 100), // Green
    (100, 140, 255), // Blue
    (255, 220, 100), // Yellow
    (200, 100, 200), // Purple
    (100, 220, 220), // Cyan
    (255, 150, 50),  // Orange
    (180, 255, 180), // Light Green
    (180, 180, 255), // Light Blue
    (255, 200, 200), // Pink
    (200, 255, 200), // Mint
    (200, 200, 255), // Lavender
    (255, 255, 150), // Light Yellow
    (200, 150, 255), // Light Purple
    (150, 255, 255), // Light Cyan
    (255, 200, 150), // Peach
];

/// Picks a color not already present in `used`, preferring the lowest free
/// [`PALETTE`] index (a deterministic choice — spec §9 notes this is one of
/// two valid strategies) and falling back to random resampling in
/// `50..255` per channel if the palette is exhausted.
pub fn pick_color(used: &[(u8, u8, u8)], rng: &mut impl Rng) -> (u8, u8, u8) {
    if let Some(color) = PALETTE.iter().find(|c| !used.contains(c)) {
        return *color;
    }
    loop {
        let candidate = (
            rng.gen_range(50..=255),
            rng.gen_range(50..=255),
            rng.gen_range(50..=255),
        );
        if !used.contains(&candidate) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn first_assignment_takes_palette_head() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(pick_color(&[], &mut rng), PALETTE[0]);
    }

    #[test]
    fn skips_colors_already_in_use() {
        let mut rng = StdRng::seed_from_u64(1);
        let used = [PALETTE[0], PALETTE[1]];
        assert_eq!(pick_color(&used, &mut rng), PALETTE[2]);
    }

    #[test]
    fn falls_back_to_resampling_once_palette_exhausted() {
        let mut rng = StdRng::seed_from_u64(2);
        let used: Vec<_> = PALETTE.to_vec();
        let color = pick_color(&used, &mut rng);
        assert!(!used.contains(&color));
        assert!((50..=255).contains(&color.0));
    }
}
