//! Chunk planning: split a resource into contiguous byte ranges

use crate::core::models::{ByteRange, ChunkRecord, ProbeResult};

/// Split `total_size` bytes into at most `thread_count` inclusive ranges of
/// `ceil(total_size / thread_count)` bytes, the last one clipped.
///
/// A resource at or below `min_chunk_size`, or a thread count of 1 or less,
/// gets one range spanning the whole resource. An empty resource gets no
/// ranges at all.
pub fn plan_chunks(total_size: u64, thread_count: usize, min_chunk_size: u64) -> Vec<ByteRange> {
    if total_size == 0 {
        return Vec::new();
    }

    if total_size <= min_chunk_size || thread_count <= 1 {
        return vec![ByteRange::new(0, total_size - 1)];
    }

    let threads = thread_count as u64;
    let chunk_size = total_size.div_ceil(threads);

    (0..threads)
        .map(|i| i * chunk_size)
        // 向上取整后尾部可能出现空区间，直接丢弃
        .take_while(|&start| start < total_size)
        .map(|start| ByteRange::new(start, (start + chunk_size - 1).min(total_size - 1)))
        .collect()
}

/// Chunk records for a probed resource.
///
/// Without range support the whole resource is fetched by a single stream.
/// An unknown length yields one open-ended chunk.
pub fn plan_for_probe(
    download_id: &str,
    probe: &ProbeResult,
    thread_count: usize,
    min_chunk_size: u64,
) -> Vec<ChunkRecord> {
    if probe.total_size == 0 {
        return vec![ChunkRecord::open_ended(download_id)];
    }

    let threads = if probe.supports_ranges { thread_count } else { 1 };
    plan_chunks(probe.total_size, threads, min_chunk_size)
        .into_iter()
        .enumerate()
        .map(|(index, range)| ChunkRecord::new(download_id, index, range))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(ranges: &[ByteRange], total_size: u64) {
        assert!(!ranges.is_empty());
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[ranges.len() - 1].end, total_size - 1);

        for window in ranges.windows(2) {
            assert_eq!(window[0].end + 1, window[1].start);
        }

        let covered: u64 = ranges.iter().map(ByteRange::len).sum();
        assert_eq!(covered, total_size);
    }

    #[test]
    fn test_four_way_split() {
        let ranges = plan_chunks(1000, 4, 0);
        assert_eq!(
            ranges,
            vec![
                ByteRange::new(0, 249),
                ByteRange::new(250, 499),
                ByteRange::new(500, 749),
                ByteRange::new(750, 999),
            ]
        );
    }

    #[test]
    fn test_last_range_clipped() {
        let ranges = plan_chunks(10, 4, 0);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[3], ByteRange::new(9, 9));
        assert_partition(&ranges, 10);
    }

    #[test]
    fn test_no_empty_trailing_ranges() {
        // 5 字节 4 线程：2,2,1，第四段为空
        let ranges = plan_chunks(5, 4, 0);
        assert_eq!(ranges.len(), 3);
        assert!(ranges.iter().all(|r| !r.is_empty()));
        assert_partition(&ranges, 5);
    }

    #[test]
    fn test_partition_for_many_inputs() {
        for total_size in [1u64, 2, 3, 7, 100, 999, 1000, 1001, 65_537] {
            for threads in 1..=16 {
                let ranges = plan_chunks(total_size, threads, 0);
                assert!(ranges.len() <= threads);
                assert_partition(&ranges, total_size);
            }
        }
    }

    #[test]
    fn test_small_resource_single_range() {
        let ranges = plan_chunks(512 * 1024, 8, 1024 * 1024);
        assert_eq!(ranges, vec![ByteRange::new(0, 512 * 1024 - 1)]);
    }

    #[test]
    fn test_single_thread_single_range() {
        let ranges = plan_chunks(10 * 1024 * 1024, 1, 1024 * 1024);
        assert_eq!(ranges.len(), 1);
    }

    #[test]
    fn test_empty_resource() {
        assert!(plan_chunks(0, 4, 0).is_empty());
    }

    #[test]
    fn test_probe_without_ranges_single_range() {
        let probe = ProbeResult {
            total_size: 10 * 1024 * 1024,
            content_type: None,
            supports_ranges: false,
        };
        let chunks = plan_for_probe("dl", &probe, 8, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].end, Some(10 * 1024 * 1024 - 1));

        let unknown = ProbeResult {
            total_size: 0,
            content_type: None,
            supports_ranges: true,
        };
        let chunks = plan_for_probe("dl", &unknown, 8, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].end, None);
    }

    #[test]
    fn test_probe_records_are_indexed() {
        let probe = ProbeResult {
            total_size: 1000,
            content_type: None,
            supports_ranges: true,
        };
        let chunks = plan_for_probe("dl", &probe, 4, 0);
        let indexes: Vec<usize> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
        assert!(chunks.iter().all(|c| c.download_id == "dl"));
    }
}
