//! In-process memory layer used by tests and by single-host simulations.
//!
//! Every domain lives in the same process, so a "foreign mapping" is just a
//! second address pointing at the same [`SharedPage`].

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::{
    Access, DomainId, FrameId, HalError, MemoryLayer, PageView, SharedPage, VirtualAddress,
    PAGE_SIZE,
};

const VA_BASE: u64 = 0x4000_0000;

/// Simulated memory layer
pub struct SimMemory {
    inner: Mutex<SimState>,
}

struct SimState {
    /// Frames still available for allocation
    frames_left: usize,
    next_frame: u64,
    next_va: u64,
    frames: BTreeMap<FrameId, Arc<SharedPage>>,
    mappings: BTreeMap<VirtualAddress, SimMapping>,
}

struct SimMapping {
    frame: FrameId,
    access: Access,
    kind: MappingKind,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MappingKind {
    /// Base page of a local allocation spanning `pages` frames
    LocalBase { pages: usize },
    /// Non-base page of a local allocation
    LocalTail,
    Foreign,
}

impl SimMemory {
    /// Create a simulated memory layer with an effectively unlimited frame pool
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// Create a simulated memory layer holding at most `frames` pages
    pub fn with_capacity(frames: usize) -> Self {
        Self {
            inner: Mutex::new(SimState {
                frames_left: frames,
                next_frame: 1,
                next_va: VA_BASE,
                frames: BTreeMap::new(),
                mappings: BTreeMap::new(),
            }),
        }
    }

    /// Number of live foreign mappings of `frame`
    pub fn foreign_mapping_count(&self, frame: FrameId) -> usize {
        self.inner
            .lock()
            .mappings
            .values()
            .filter(|m| m.frame == frame && m.kind == MappingKind::Foreign)
            .count()
    }

    /// Number of frames currently allocated
    pub fn allocated_frames(&self) -> usize {
        self.inner.lock().frames.len()
    }
}

impl Default for SimMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimState {
    fn take_va(&mut self, pages: usize) -> VirtualAddress {
        let va = VirtualAddress(self.next_va);
        self.next_va += (pages * PAGE_SIZE) as u64;
        va
    }
}

impl MemoryLayer for SimMemory {
    fn alloc_contig_pages(&self, owner: DomainId, n: usize) -> Result<VirtualAddress, HalError> {
        if n == 0 {
            return Err(HalError::InvalidArgument);
        }
        let mut st = self.inner.lock();
        if st.frames_left < n {
            return Err(HalError::OutOfMemory);
        }
        st.frames_left -= n;

        let base = st.take_va(n);
        for i in 0..n {
            let frame = FrameId(st.next_frame);
            st.next_frame += 1;
            st.frames
                .insert(frame, Arc::new(SharedPage::new(frame, owner)));
            let kind = if i == 0 {
                MappingKind::LocalBase { pages: n }
            } else {
                MappingKind::LocalTail
            };
            st.mappings.insert(
                base.page_offset(i),
                SimMapping {
                    frame,
                    access: Access::ReadWrite,
                    kind,
                },
            );
        }
        trace!(domain = %owner, pages = n, va = base.0, "alloc_contig_pages");
        Ok(base)
    }

    fn free_pages(&self, va: VirtualAddress) -> Result<(), HalError> {
        let mut st = self.inner.lock();
        let pages = match st.mappings.get(&va).map(|m| m.kind) {
            Some(MappingKind::LocalBase { pages }) => pages,
            _ => return Err(HalError::NotMapped),
        };

        let frames: Vec<FrameId> = (0..pages)
            .filter_map(|i| st.mappings.get(&va.page_offset(i)).map(|m| m.frame))
            .collect();
        let busy = st
            .mappings
            .values()
            .any(|m| m.kind == MappingKind::Foreign && frames.contains(&m.frame));
        if busy {
            return Err(HalError::FrameBusy);
        }

        for i in 0..pages {
            st.mappings.remove(&va.page_offset(i));
        }
        for frame in &frames {
            st.frames.remove(frame);
        }
        st.frames_left = st.frames_left.saturating_add(frames.len());
        Ok(())
    }

    fn frame_of(&self, va: VirtualAddress) -> Result<FrameId, HalError> {
        self.inner
            .lock()
            .mappings
            .get(&va)
            .map(|m| m.frame)
            .ok_or(HalError::NotMapped)
    }

    fn map_foreign_page(
        &self,
        frame: FrameId,
        domain: DomainId,
        access: Access,
    ) -> Result<VirtualAddress, HalError> {
        let mut st = self.inner.lock();
        match st.frames.get(&frame) {
            Some(page) if page.owner() == domain => {}
            _ => return Err(HalError::FrameNotFound),
        }
        let va = st.take_va(1);
        st.mappings.insert(
            va,
            SimMapping {
                frame,
                access,
                kind: MappingKind::Foreign,
            },
        );
        trace!(domain = %domain, frame = frame.0, va = va.0, ?access, "map_foreign_page");
        Ok(va)
    }

    fn unmap(&self, va: VirtualAddress) -> Result<(), HalError> {
        let mut st = self.inner.lock();
        match st.mappings.get(&va) {
            Some(m) if m.kind == MappingKind::Foreign => {
                st.mappings.remove(&va);
                Ok(())
            }
            _ => Err(HalError::NotMapped),
        }
    }

    fn page(&self, va: VirtualAddress) -> Result<PageView, HalError> {
        let st = self.inner.lock();
        let mapping = st.mappings.get(&va).ok_or(HalError::NotMapped)?;
        let page = st
            .frames
            .get(&mapping.frame)
            .ok_or(HalError::FrameNotFound)?;
        Ok(PageView::new(page.clone(), mapping.access))
    }
}
