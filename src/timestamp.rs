// This file is part of Moonfire Remux, a media container remuxing toolkit.
// Copyright (C) 2024 The Moonfire Remux Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Timestamp monotonization for push paths whose sources jump (stream
//! restarts, wall-clock steps). Deltas within the tolerance pass through;
//! anything larger collapses to a one-tick step.

/// Maximum tolerated jump between consecutive input timestamps, in the same
/// unit as the timestamps themselves (milliseconds on RTMP/FLV paths).
const MAX_DELTA: i64 = 1_000;

#[derive(Default)]
pub struct Adjuster {
    prev: Option<(i64, i64)>, // (last input, last output)
}

impl Adjuster {
    pub fn new() -> Self {
        Adjuster::default()
    }

    /// Returns the adjusted timestamp for `ts`, updating internal state.
    pub fn adjust(&mut self, ts: i64) -> i64 {
        let out = match self.prev {
            None => ts,
            Some((prev_in, prev_out)) => {
                let delta = ts - prev_in;
                if delta.abs() <= MAX_DELTA {
                    prev_out + delta
                } else {
                    prev_out + 1
                }
            }
        };
        self.prev = Some((ts, out));
        out
    }

    /// Forgets history; the next timestamp passes through unchanged.
    pub fn reset(&mut self) {
        self.prev = None;
    }
}

#[cfg(test)]
mod tests {
    use super::Adjuster;

    #[test]
    fn smooth_input_passes_through() {
        let mut a = Adjuster::new();
        for ts in [0, 40, 80, 120] {
            assert_eq!(a.adjust(ts), ts);
        }
    }

    #[test]
    fn jump_collapses_to_one_tick() {
        let mut a = Adjuster::new();
        let adjusted: Vec<i64> = [1000, 1040, 1080, 60000, 60040]
            .iter()
            .map(|&ts| a.adjust(ts))
            .collect();
        assert_eq!(adjusted, &[1000, 1040, 1080, 1081, 1121]);
    }

    #[test]
    fn backwards_jump() {
        let mut a = Adjuster::new();
        assert_eq!(a.adjust(5000), 5000);
        assert_eq!(a.adjust(100), 5001); // -4900 exceeds tolerance
        assert_eq!(a.adjust(140), 5041);
    }
}
