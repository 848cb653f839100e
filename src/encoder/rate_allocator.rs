//! Bitrate split across simulcast streams
//!
//! Streams are served lowest quality first. Each stream first receives its
//! minimum; the first stream whose minimum no longer fits is switched off
//! together with every higher-quality stream. What is left is handed out,
//! again lowest first, up to each stream's maximum. The total handed out
//! never exceeds the available bitrate.

use crate::config::SimulcastLayerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamAllocation {
    pub bitrate_bps: u32,
    pub active: bool,
}

pub struct SimulcastRateAllocator {
    /// Highest quality first, matching the layer configuration
    streams: Vec<SimulcastLayerConfig>,
}

impl SimulcastRateAllocator {
    pub fn new(streams: Vec<SimulcastLayerConfig>) -> Self {
        Self { streams }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Split `total_bps`, returned in layer order (highest quality first)
    pub fn allocate(&self, total_bps: u32) -> Vec<StreamAllocation> {
        let mut allocations = vec![StreamAllocation::default(); self.streams.len()];
        if total_bps == 0 {
            return allocations;
        }

        let mut remaining = total_bps;
        for index in (0..self.streams.len()).rev() {
            let min = self.streams[index].min_bitrate_bps;
            if remaining < min {
                break;
            }
            remaining -= min;
            allocations[index] = StreamAllocation {
                bitrate_bps: min,
                active: true,
            };
        }

        for index in (0..self.streams.len()).rev() {
            if remaining == 0 || !allocations[index].active {
                break;
            }
            let stream = &self.streams[index];
            let max = stream.max_bitrate_bps.max(stream.min_bitrate_bps);
            let extra = max.saturating_sub(allocations[index].bitrate_bps).min(remaining);
            allocations[index].bitrate_bps += extra;
            remaining -= extra;
        }

        allocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(scale: f32, min: u32, max: u32) -> SimulcastLayerConfig {
        SimulcastLayerConfig {
            scale,
            min_bitrate_bps: min,
            max_bitrate_bps: max,
        }
    }

    fn three_layers() -> SimulcastRateAllocator {
        SimulcastRateAllocator::new(vec![
            layer(1.0, 1_000_000, 5_000_000),
            layer(0.5, 300_000, 1_500_000),
            layer(0.25, 100_000, 400_000),
        ])
    }

    #[test]
    fn test_lowest_layer_served_first() {
        let alloc = three_layers().allocate(200_000);
        assert_eq!(
            alloc,
            vec![
                StreamAllocation::default(),
                StreamAllocation::default(),
                StreamAllocation {
                    bitrate_bps: 200_000,
                    active: true
                },
            ]
        );
    }

    #[test]
    fn test_middle_minimum_does_not_fit() {
        // 100k + 300k fit, 1M for the top layer does not
        let alloc = three_layers().allocate(900_000);
        assert!(!alloc[0].active);
        assert!(alloc[1].active && alloc[2].active);
        assert_eq!(alloc[2].bitrate_bps, 400_000);
        assert_eq!(alloc[1].bitrate_bps, 500_000);
    }

    #[test]
    fn test_everything_capped_at_max() {
        let alloc = three_layers().allocate(50_000_000);
        let bitrates: Vec<u32> = alloc.iter().map(|a| a.bitrate_bps).collect();
        assert_eq!(bitrates, vec![5_000_000, 1_500_000, 400_000]);
    }

    #[test]
    fn test_zero_total_disables_all() {
        assert!(three_layers().allocate(0).iter().all(|a| !a.active));
    }

    #[test]
    fn test_sum_bounded_and_minimums_honoured() {
        let allocator = three_layers();
        let layers = allocator.streams.clone();
        for total in (0..8_000_000u32).step_by(37_000) {
            let alloc = allocator.allocate(total);
            let sum: u64 = alloc.iter().map(|a| a.bitrate_bps as u64).sum();
            assert!(sum <= total as u64, "total {} allocated {}", total, sum);

            for (a, l) in alloc.iter().zip(&layers) {
                if a.active {
                    assert!(a.bitrate_bps >= l.min_bitrate_bps);
                } else {
                    assert_eq!(a.bitrate_bps, 0);
                }
            }
            // An active stream implies every lower-quality stream is active
            for i in 0..alloc.len() - 1 {
                if alloc[i].active {
                    assert!(alloc[i + 1].active);
                }
            }
        }
    }
}
