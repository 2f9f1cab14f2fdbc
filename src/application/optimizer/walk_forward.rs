//! Walk-forward segmentation: slides (train, embargo, oos) windows across a
//! bar series, purged so a segment's training window never overlaps its own
//! out-of-sample window.

use crate::domain::market::Bar;

#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub index: usize,
    pub train_start: usize,
    pub train_end: usize,
    pub oos_start: usize,
    pub oos_end: usize,
}

/// Computes how many bars a day spans at the given timeframe.
pub fn bars_per_day(timeframe_millis: i64) -> usize {
    (86_400_000 / timeframe_millis.max(1)).max(1) as usize
}

/// Builds up to `segments` walk-forward windows anchored at the end of
/// `bars`, walking backward so the most recent data always forms the final
/// segment's OOS window. Returns fewer than requested if history is short.
pub fn build_segments(
    bar_count: usize,
    timeframe_millis: i64,
    train_days: i64,
    oos_days: i64,
    embargo_days: i64,
    segments: usize,
) -> Vec<Segment> {
    let per_day = bars_per_day(timeframe_millis);
    let train_bars = (train_days as usize) * per_day;
    let oos_bars = (oos_days as usize) * per_day;
    let embargo_bars = (embargo_days as usize) * per_day;
    let stride = oos_bars.max(1);

    let mut out = Vec::new();
    if train_bars == 0 || oos_bars == 0 || bar_count < train_bars + embargo_bars + oos_bars {
        return out;
    }

    // Anchor the last segment's OOS window at the end of history, then walk
    // backward by `stride` for each earlier segment.
    for i in 0..segments {
        let oos_end = bar_count.saturating_sub(i * stride);
        if oos_end < oos_bars {
            break;
        }
        let oos_start = oos_end - oos_bars;
        let train_end = oos_start.saturating_sub(embargo_bars);
        if train_end < train_bars {
            break;
        }
        let train_start = train_end - train_bars;
        out.push(Segment {
            index: i,
            train_start,
            train_end,
            oos_start,
            oos_end,
        });
    }
    out.reverse();
    for (i, seg) in out.iter_mut().enumerate() {
        seg.index = i;
    }
    out
}

pub fn slice<'a>(bars: &'a [Bar], start: usize, end: usize) -> &'a [Bar] {
    &bars[start.min(bars.len())..end.min(bars.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_non_overlapping_segments() {
        let segments = build_segments(10_000, 3_600_000, 30, 10, 1, 3);
        assert!(!segments.is_empty());
        for seg in &segments {
            assert!(seg.train_end <= seg.oos_start);
            assert!(seg.train_start < seg.train_end);
            assert!(seg.oos_start < seg.oos_end);
        }
        for pair in segments.windows(2) {
            assert!(pair[0].oos_end <= pair[1].train_start + (pair[1].train_end - pair[1].train_start));
        }
    }

    #[test]
    fn insufficient_history_yields_no_segments() {
        let segments = build_segments(100, 3_600_000, 30, 10, 1, 3);
        assert!(segments.is_empty());
    }
}
