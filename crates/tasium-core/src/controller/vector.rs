use super::frame::{sync_of, ControllerFrame, FrameMut, FrameRef};
use super::typeset::PortTypeSet;
use super::CONTROLLER_PAGE_SIZE;
use crate::error::InputError;

type Page = Box<[u8]>;

fn new_page() -> Page {
    vec![0u8; CONTROLLER_PAGE_SIZE].into_boxed_slice()
}

/// Append-only/indexable sequence of controller subframes, stored in
/// fixed-size pages so growth never moves existing records.
pub struct ControllerFrameVector {
    types: PortTypeSet,
    frame_size: usize,
    frames_per_page: usize,
    len: usize,
    pages: Vec<Page>,
}

impl ControllerFrameVector {
    pub fn new(types: &PortTypeSet) -> Self {
        let frame_size = types.size();
        Self {
            types: types.clone(),
            frame_size,
            frames_per_page: CONTROLLER_PAGE_SIZE / frame_size,
            len: 0,
            pages: Vec::new(),
        }
    }

    pub fn types(&self) -> &PortTypeSet {
        &self.types
    }

    /// Number of subframes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Record stride in bytes.
    pub fn stride(&self) -> usize {
        self.frame_size
    }

    pub fn frames_per_page(&self) -> usize {
        self.frames_per_page
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Drop all subframes, keeping the port type set.
    pub fn clear(&mut self) {
        self.len = 0;
        self.pages.clear();
    }

    #[inline]
    fn frame_bytes(&self, index: usize) -> &[u8] {
        let page = index / self.frames_per_page;
        let offset = self.frame_size * (index % self.frames_per_page);
        &self.pages[page][offset..offset + self.frame_size]
    }

    #[inline]
    fn frame_bytes_mut(&mut self, index: usize) -> &mut [u8] {
        let page = index / self.frames_per_page;
        let offset = self.frame_size * (index % self.frames_per_page);
        &mut self.pages[page][offset..offset + self.frame_size]
    }

    /// Read-only view of subframe `index`.
    ///
    /// # Panics
    /// Panics if `index >= len()`.
    pub fn frame(&self, index: usize) -> FrameRef<'_> {
        assert!(index < self.len, "subframe index {index} out of range");
        FrameRef {
            types: &self.types,
            data: self.frame_bytes(index),
        }
    }

    /// Mutable view of subframe `index`.
    ///
    /// # Panics
    /// Panics if `index >= len()`.
    pub fn frame_mut(&mut self, index: usize) -> FrameMut<'_> {
        assert!(index < self.len, "subframe index {index} out of range");
        let page = index / self.frames_per_page;
        let offset = self.frame_size * (index % self.frames_per_page);
        FrameMut {
            types: &self.types,
            data: &mut self.pages[page][offset..offset + self.frame_size],
        }
    }

    /// Append one subframe. The frame's port type set must match.
    pub fn append(&mut self, frame: &ControllerFrame) -> Result<(), InputError> {
        if *frame.port_types() != self.types {
            return Err(InputError::TypeMismatch);
        }
        if self.len % self.frames_per_page == 0 && self.len / self.frames_per_page == self.pages.len()
        {
            self.pages.push(new_page());
        }
        self.len += 1;
        self.frame_bytes_mut(self.len - 1).copy_from_slice(frame.bytes());
        Ok(())
    }

    /// Change the subframe count. Shrinking discards and zeroes the excess;
    /// growing adds all-zero (non-sync) subframes.
    pub fn resize(&mut self, new_len: usize) {
        if new_len == self.len {
            return;
        }
        if new_len == 0 {
            self.clear();
            return;
        }
        let pages_needed = new_len.div_ceil(self.frames_per_page);
        if new_len < self.len {
            self.pages.truncate(pages_needed);
            // Zero the retained tail so regrowth starts from blank frames.
            if new_len < pages_needed * self.frames_per_page {
                let offset = self.frame_size * (new_len % self.frames_per_page);
                self.pages[pages_needed - 1][offset..].fill(0);
            }
        } else {
            while self.pages.len() < pages_needed {
                self.pages.push(new_page());
            }
        }
        self.len = new_len;
    }

    /// Index of the next sync subframe strictly after `from`, or `len()` if
    /// there is none, or `from` itself when `from` is out of range.
    pub fn walk_sync(&self, from: usize) -> usize {
        self.walk_helper(from, true)
    }

    /// Number of subframes in the frame starting at sync subframe `from`.
    pub fn subframe_count(&self, from: usize) -> usize {
        self.walk_helper(from, false)
    }

    fn walk_helper(&self, from: usize, absolute: bool) -> usize {
        let mut ret = if absolute { from } else { 0 };
        if from >= self.len {
            return ret;
        }
        let mut index = from + 1;
        ret += 1;
        while index < self.len && !sync_of(self.frame_bytes(index)) {
            index += 1;
            ret += 1;
        }
        ret
    }

    /// Number of subframes with the sync flag set.
    pub fn count_frames(&self) -> usize {
        (0..self.len)
            .filter(|&i| sync_of(self.frame_bytes(i)))
            .count()
    }

    /// Dedicated blank frame of this vector's type with the given sync flag.
    pub fn blank_frame(&self, sync: bool) -> ControllerFrame {
        let mut f = ControllerFrame::blank(&self.types);
        f.set_sync(sync);
        f
    }

    /// Can a run captured against `self` resume against `other`?
    ///
    /// True iff the type sets are identical, every subframe before the
    /// in-progress frame `frame` matches byte-for-byte, and within that
    /// frame every control agrees over its first `polls[i]` reads.
    pub fn compatible(&self, other: &ControllerFrameVector, frame: u64, polls: &[u32]) -> bool {
        if self.types != other.types {
            return false;
        }
        if frame == 0 {
            return true;
        }
        // First subframe of the in-progress frame, by this vector's
        // structure.
        let mut start = 0usize;
        for _ in 1..frame {
            start += self.subframe_count(start);
        }
        if other.len < start {
            return false;
        }
        for i in 0..start {
            if self.frame_bytes(i) != other.frame_bytes(i) {
                return false;
            }
        }
        let changes_a = self.subframe_count(start);
        let changes_b = other.subframe_count(start);
        let indices = self.types.indices();
        for index in 0..indices {
            let p = polls.get(index as usize).copied().unwrap_or(0) & 0x7FFF_FFFF;
            // Reads stop changing once the poll index pins at the last
            // subframe, so only the distinguishable prefix needs checking.
            let horizon = (p as usize).min(changes_a.max(changes_b).max(1));
            for j in 0..horizon {
                let a = if changes_a == 0 {
                    0
                } else {
                    self.frame(start + j.min(changes_a - 1)).axis2(index)
                };
                let b = if changes_b == 0 {
                    0
                } else {
                    other.frame(start + j.min(changes_b - 1)).axis2(index)
                };
                if a != b {
                    return false;
                }
            }
        }
        true
    }
}

impl Clone for ControllerFrameVector {
    fn clone(&self) -> Self {
        Self {
            types: self.types.clone(),
            frame_size: self.frame_size,
            frames_per_page: self.frames_per_page,
            len: self.len,
            pages: self.pages.clone(),
        }
    }
}
