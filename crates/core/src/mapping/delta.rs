// Position shift index for a modified block.
//
// Insertions become a monotone step function of cumulative shift keyed by
// offset. Deletions are merged into disjoint ranges where overlap adds
// lengths (concurrent deletes are stacked, not unioned). Both lookups are
// binary searches over sorted vectors.

use super::PositionDelta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeletedRange {
    pub start: usize,
    pub end: usize,
    /// Total deleted length of this range and every range before it.
    pub cumulative: usize,
}

impl DeletedRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DeltaIndex {
    /// `(offset, cumulative inserted length at offsets <= offset)`, ascending.
    shift_points: Vec<(usize, usize)>,
    deleted: Vec<DeletedRange>,
}

impl DeltaIndex {
    pub fn build(deltas: &[PositionDelta]) -> Self {
        let mut sorted: Vec<&PositionDelta> = deltas.iter().filter(|d| d.delta != 0).collect();
        sorted.sort_by_key(|d| (d.offset, d.delta));

        let mut shift_points: Vec<(usize, usize)> = Vec::new();
        let mut raw_deletes: Vec<(usize, usize)> = Vec::new();
        let mut inserted = 0usize;

        for delta in sorted {
            if delta.delta > 0 {
                inserted += delta.delta.unsigned_abs() as usize;
                match shift_points.last_mut() {
                    Some((offset, cumulative)) if *offset == delta.offset => *cumulative = inserted,
                    _ => shift_points.push((delta.offset, inserted)),
                }
            } else {
                raw_deletes.push((delta.offset, delta.delta.unsigned_abs() as usize));
            }
        }

        Self { shift_points, deleted: merge_deletions(raw_deletes) }
    }

    /// Map an old offset through the block's edits; `None` if it was deleted.
    pub fn map(&self, offset: usize) -> Option<usize> {
        if self.is_deleted(offset) {
            return None;
        }

        let removed = self.deleted_before(offset);
        let inserted = self.inserted_at_or_before(offset);
        Some(offset + inserted - removed)
    }

    pub fn is_deleted(&self, offset: usize) -> bool {
        let idx = self.deleted.partition_point(|range| range.start <= offset);
        idx > 0 && offset < self.deleted[idx - 1].end
    }

    /// Total length of deleted ranges that end at or before `offset`.
    pub fn deleted_before(&self, offset: usize) -> usize {
        let count = self.deleted.partition_point(|range| range.end <= offset);
        if count == 0 {
            0
        } else {
            self.deleted[count - 1].cumulative
        }
    }

    fn inserted_at_or_before(&self, offset: usize) -> usize {
        let count = self.shift_points.partition_point(|(point, _)| *point <= offset);
        if count == 0 {
            0
        } else {
            self.shift_points[count - 1].1
        }
    }

    /// Smallest offset touched by any edit.
    pub fn first_edit_offset(&self) -> Option<usize> {
        let first_insert = self.shift_points.first().map(|(offset, _)| *offset);
        let first_delete = self.deleted.first().map(|range| range.start);
        match (first_insert, first_delete) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn total_deleted(&self) -> usize {
        self.deleted.last().map(|range| range.cumulative).unwrap_or(0)
    }

    pub fn total_inserted(&self) -> usize {
        self.shift_points.last().map(|(_, cumulative)| *cumulative).unwrap_or(0)
    }

    pub fn deleted_ranges(&self) -> &[DeletedRange] {
        &self.deleted
    }
}

/// Merge `(start, len)` deletions. Overlapping or nested ranges stack: the
/// merged range keeps the earliest start and the sum of lengths.
fn merge_deletions(mut raw: Vec<(usize, usize)>) -> Vec<DeletedRange> {
    raw.sort_unstable();

    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(raw.len());
    for (start, len) in raw {
        match merged.last_mut() {
            Some((cur_start, cur_len)) if start < *cur_start + *cur_len => *cur_len += len,
            _ => merged.push((start, len)),
        }
    }

    let mut cumulative = 0usize;
    merged
        .into_iter()
        .map(|(start, len)| {
            cumulative += len;
            DeletedRange { start, end: start + len, cumulative }
        })
        .collect()
}
