//! Kernel-Variant Object Table
//!
//! Offsets of the 24-byte records embedded in the data buffer. The table
//! is appended in write order, which is usually ascending; it is sorted
//! lazily the first time a read or write needs to be checked against it.
//!
//! Overlap checks walk forward from a hint. Callers mostly consume a
//! parcel front to back, so each check touches only the objects between
//! the previous read and the current one.

use crate::arena::table_growth_target;
use crate::object::{FlatObject, ObjectKind, FLAT_OBJECT_SIZE};
use crate::{ParcelError, Result};

/// Tables up to this many entries are insertion sorted
const INSERTION_SORT_LIMIT: usize = 16;

pub(crate) struct KernelState {
    /// Byte offsets of recorded objects
    pub(crate) objects: Vec<u64>,
    /// Index where the next object search starts
    pub(crate) next_object_hint: usize,
    pub(crate) objects_sorted: bool,
    pub(crate) has_fds: bool,
    /// When false, `has_fds` is stale and the table must be rescanned
    pub(crate) fds_known: bool,
    /// Position of the work-source word of the interface header
    pub(crate) work_source_pos: Option<usize>,
}

impl KernelState {
    pub(crate) fn new() -> Self {
        Self {
            objects: Vec::new(),
            next_object_hint: 0,
            objects_sorted: false,
            has_fds: false,
            fds_known: true,
            work_source_pos: None,
        }
    }

    /// Whether one more offset fits without reallocating
    pub(crate) fn has_room(&self) -> bool {
        self.objects.len() < self.objects.capacity()
    }

    /// Grow the table so `extra` more offsets fit
    pub(crate) fn reserve(&mut self, extra: usize) -> Result<()> {
        let len = self.objects.len();
        if len + extra <= self.objects.capacity() {
            return Ok(());
        }
        let target = table_growth_target(len, extra)?;
        self.objects
            .try_reserve_exact(target - len)
            .map_err(|_| ParcelError::ResourceExhausted {
                requested: target * core::mem::size_of::<u64>(),
            })
    }

    /// Append an offset, dropping the sorted mark if it lands below the last
    pub(crate) fn push_object(&mut self, offset: u64) {
        if self.objects.last().is_some_and(|&last| offset < last) {
            self.objects_sorted = false;
        }
        self.objects.push(offset);
    }

    pub(crate) fn reset_search(&mut self) {
        self.next_object_hint = 0;
        self.objects_sorted = false;
    }

    /// Sort the table if it is not already known to be sorted
    pub(crate) fn ensure_sorted(&mut self) {
        if self.objects_sorted || self.objects.len() <= 1 {
            return;
        }
        if !self.objects.windows(2).all(|pair| pair[0] <= pair[1]) {
            sort_offsets(&mut self.objects);
            self.next_object_hint = 0;
        }
        self.objects_sorted = true;
    }

    /// Reject an access of `[pos, upper_bound)` that overlaps a record
    ///
    /// # Errors
    /// Returns `PermissionDenied` if any recorded object ends after `pos`
    /// and starts before `upper_bound`.
    pub(crate) fn validate(&mut self, pos: usize, upper_bound: usize, quiet: bool) -> Result<()> {
        self.ensure_sorted();

        let count = self.objects.len();
        let upper = upper_bound as u64;
        let mut next = self.next_object_hint;
        if next < count && upper > self.objects[next] {
            loop {
                let object = self.objects[next];
                if (pos as u64) < object + FLAT_OBJECT_SIZE as u64 {
                    if !quiet {
                        log::error!(
                            "Access [{}, {}) overlaps object at offset {}",
                            pos,
                            upper_bound,
                            object
                        );
                    }
                    return Err(ParcelError::PermissionDenied {
                        reason: "access overlaps an object record",
                    });
                }
                next += 1;
                if next >= count || upper <= self.objects[next] {
                    break;
                }
            }
            self.next_object_hint = next;
        }
        Ok(())
    }

    /// Locate a recorded object starting exactly at `pos`
    ///
    /// Searches forward from the hint, then backward, and moves the hint
    /// past the match.
    pub(crate) fn find_object(&mut self, pos: usize) -> Option<usize> {
        self.ensure_sorted();
        let count = self.objects.len();
        if count == 0 {
            return None;
        }
        let target = pos as u64;

        let mut index = self.next_object_hint;
        if index < count {
            while index < count - 1 && self.objects[index] < target {
                index += 1;
            }
        } else {
            index = count - 1;
        }
        if self.objects[index] != target {
            while index > 0 && self.objects[index] > target {
                index -= 1;
            }
        }
        if self.objects[index] == target {
            self.next_object_hint = index + 1;
            return Some(index);
        }
        None
    }

    /// Number of leading entries whose record ends at or before `desired`
    ///
    /// The table must be sorted.
    pub(crate) fn count_within(&self, desired: usize) -> usize {
        let mut kept = self.objects.len();
        while kept > 0 && self.objects[kept - 1] + FLAT_OBJECT_SIZE as u64 > desired as u64 {
            kept -= 1;
        }
        kept
    }

    /// Whether any descriptor record lies entirely in `[offset, offset + len)`
    pub(crate) fn has_fds_in_range(&self, data: &[u8], offset: usize, len: usize) -> bool {
        self.records_in_range(data, offset, len)
            .any(|obj| obj.kind == ObjectKind::Fd)
    }

    /// Whether any local or remote reference lies entirely in the range
    pub(crate) fn has_binders_in_range(&self, data: &[u8], offset: usize, len: usize) -> bool {
        self.records_in_range(data, offset, len)
            .any(|obj| matches!(obj.kind, ObjectKind::Binder | ObjectKind::Handle))
    }

    fn records_in_range<'a>(
        &'a self,
        data: &'a [u8],
        offset: usize,
        len: usize,
    ) -> impl Iterator<Item = FlatObject> + 'a {
        let start = offset as u64;
        let end = (offset + len) as u64;
        self.objects
            .iter()
            .filter(move |&&pos| pos >= start && pos + FLAT_OBJECT_SIZE as u64 <= end)
            .map(move |&pos| FlatObject::read_at(data, pos as usize))
    }

    /// Recompute the descriptor cache over the first `size` bytes
    pub(crate) fn scan_for_fds(&mut self, data: &[u8], size: usize) {
        self.has_fds = self.has_fds_in_range(data, 0, size);
        self.fds_known = true;
    }
}

fn sort_offsets(objects: &mut [u64]) {
    if objects.len() > INSERTION_SORT_LIMIT {
        objects.sort_unstable();
        return;
    }
    // Insertion sort: received tables are nearly always already ordered
    for i in 1..objects.len() {
        let value = objects[i];
        let mut j = i;
        while j > 0 && objects[j - 1] > value {
            objects[j] = objects[j - 1];
            j -= 1;
        }
        objects[j] = value;
    }
}
