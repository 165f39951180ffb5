//! Hypervisor memory layer for the SOO inter-domain substrate
//!
//! This crate defines the [`MemoryLayer`] trait through which the grant table
//! and the vbus ring setup reach the hypervisor's page allocator and foreign
//! mapping facility. Everything above this crate is platform independent.
//!
//! # Implementations
//!
//! - **AVZ**: hypercalls into the hypervisor page tables (out of tree)
//! - **Sim**: [`sim::SimMemory`], an in-process model where every domain
//!   shares one address space and pages are plain byte buffers
//!
//! ```text
//!   grant table ──┐
//!                 ├──► MemoryLayer ──► alloc_contig_pages / map_foreign_page / unmap
//!   vbus ring  ───┘
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub mod sim;

pub use sim::SimMemory;

/// Size of one page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Domain identifier (0 is the Agency).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DomainId(pub u16);

impl DomainId {
    /// The Agency control domain.
    pub const AGENCY: DomainId = DomainId(0);
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical frame number of one page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameId(pub u64);

/// Virtual address of a page as seen by one domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    /// Address of the `index`-th page following this one.
    pub fn page_offset(self, index: usize) -> VirtualAddress {
        VirtualAddress(self.0 + (index * PAGE_SIZE) as u64)
    }
}

/// Access rights requested for a mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

impl Access {
    pub fn is_writable(self) -> bool {
        matches!(self, Access::ReadWrite)
    }
}

/// Memory layer trait
///
/// Implementations provide page allocation and foreign mapping for every
/// domain of the platform. All methods are non-blocking and may be called
/// from notification-delivery context.
pub trait MemoryLayer: Send + Sync + 'static {
    /// Allocate `n` physically contiguous pages owned by `owner`
    ///
    /// # Returns
    /// * `Ok(va)` - Address of the first page, the others follow at `PAGE_SIZE` strides
    /// * `Err(HalError::OutOfMemory)` - Not enough frames left
    /// * `Err(HalError::InvalidArgument)` - `n` is zero
    fn alloc_contig_pages(&self, owner: DomainId, n: usize) -> Result<VirtualAddress, HalError>;

    /// Release pages obtained from `alloc_contig_pages`
    ///
    /// # Returns
    /// * `Err(HalError::FrameBusy)` - A foreign mapping of one of the frames is still live
    /// * `Err(HalError::NotMapped)` - `va` is not the base of a local allocation
    fn free_pages(&self, va: VirtualAddress) -> Result<(), HalError>;

    /// Translate a locally allocated page address to its frame number
    fn frame_of(&self, va: VirtualAddress) -> Result<FrameId, HalError>;

    /// Map a frame owned by `domain` into the caller's address space
    ///
    /// # Arguments
    /// * `frame` - Frame to map
    /// * `domain` - Domain owning the frame
    /// * `access` - Requested rights
    ///
    /// # Returns
    /// * `Ok(va)` - Address of the new mapping
    /// * `Err(HalError::FrameNotFound)` - The frame does not exist or is not owned by `domain`
    fn map_foreign_page(
        &self,
        frame: FrameId,
        domain: DomainId,
        access: Access,
    ) -> Result<VirtualAddress, HalError>;

    /// Remove a mapping created by `map_foreign_page`
    fn unmap(&self, va: VirtualAddress) -> Result<(), HalError>;

    /// Access the page behind a local or foreign address
    fn page(&self, va: VirtualAddress) -> Result<PageView, HalError>;
}

/// Backing store of one physical page.
pub struct SharedPage {
    frame: FrameId,
    owner: DomainId,
    bytes: Mutex<Box<[u8; PAGE_SIZE]>>,
}

impl SharedPage {
    pub fn new(frame: FrameId, owner: DomainId) -> Self {
        Self {
            frame,
            owner,
            bytes: Mutex::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    pub fn frame(&self) -> FrameId {
        self.frame
    }

    pub fn owner(&self) -> DomainId {
        self.owner
    }
}

/// A page seen through one mapping, carrying that mapping's access rights.
#[derive(Clone)]
pub struct PageView {
    page: Arc<SharedPage>,
    access: Access,
}

impl PageView {
    pub fn new(page: Arc<SharedPage>, access: Access) -> Self {
        Self { page, access }
    }

    pub fn frame(&self) -> FrameId {
        self.page.frame
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), HalError> {
        let end = check_range(offset, buf.len())?;
        let bytes = self.page.bytes.lock();
        buf.copy_from_slice(&bytes[offset..end]);
        Ok(())
    }

    /// Copy `data` into the page at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), HalError> {
        if !self.access.is_writable() {
            return Err(HalError::AccessDenied);
        }
        let end = check_range(offset, data.len())?;
        let mut bytes = self.page.bytes.lock();
        bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, HalError> {
        let mut raw = [0u8; 4];
        self.read(offset, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), HalError> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Zero the whole page.
    pub fn clear(&self) -> Result<(), HalError> {
        if !self.access.is_writable() {
            return Err(HalError::AccessDenied);
        }
        self.page.bytes.lock().fill(0);
        Ok(())
    }
}

impl fmt::Debug for PageView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageView")
            .field("frame", &self.page.frame)
            .field("owner", &self.page.owner)
            .field("access", &self.access)
            .finish()
    }
}

fn check_range(offset: usize, len: usize) -> Result<usize, HalError> {
    match offset.checked_add(len) {
        Some(end) if end <= PAGE_SIZE => Ok(end),
        _ => Err(HalError::InvalidArgument),
    }
}

/// Memory layer errors
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HalError {
    /// Not enough memory available
    #[error("out of memory")]
    OutOfMemory,
    /// Frame does not exist or belongs to another domain
    #[error("frame not found")]
    FrameNotFound,
    /// Address is not mapped
    #[error("address not mapped")]
    NotMapped,
    /// Frame still has live foreign mappings
    #[error("frame still mapped by a foreign domain")]
    FrameBusy,
    /// Write through a read-only mapping
    #[error("access denied")]
    AccessDenied,
    /// Invalid argument
    #[error("invalid argument")]
    InvalidArgument,
}
