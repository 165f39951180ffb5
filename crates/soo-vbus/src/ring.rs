//! Shared request/response ring
//!
//! One granted page carries a producer/consumer ring. The frontend produces
//! requests and consumes responses; the backend does the opposite. A
//! response reuses the slot of the request it answers.
//!
//! ```text
//!   offset  0   req_prod     written by the frontend
//!           4   req_event    req_prod value at which the backend wants a notify
//!           8   rsp_prod     written by the backend
//!          12   rsp_event    rsp_prod value at which the frontend wants a notify
//!          64   slot[0..RING_SIZE], SLOT_SIZE bytes each: u32 length + payload
//! ```
//!
//! Indices are free-running u32 counters; a slot index is the counter
//! modulo `RING_SIZE`. Producers publish with `push_*_and_check_notify`,
//! which says whether the peer asked to be notified. Consumers that run out
//! of work call `final_check_for_*` before going idle so that a request
//! racing with the idle transition is not lost.

use soo_hal::{PageView, PAGE_SIZE};
use tracing::trace;

use crate::error::VbusError;

const REQ_PROD: usize = 0;
const REQ_EVENT: usize = 4;
const RSP_PROD: usize = 8;
const RSP_EVENT: usize = 12;

/// Bytes reserved for the shared indices at the start of the page.
pub const RING_HEADER: usize = 64;

/// Bytes per slot, length word included.
pub const SLOT_SIZE: usize = 64;

/// Number of slots; a power of two so that counters may wrap.
pub const RING_SIZE: u32 = 32;

/// Largest payload one slot holds.
pub const MAX_PAYLOAD: usize = SLOT_SIZE - 4;

const _: () = assert!(RING_SIZE.is_power_of_two());
const _: () = assert!(RING_HEADER + RING_SIZE as usize * SLOT_SIZE <= PAGE_SIZE);

fn slot_offset(index: u32) -> usize {
    RING_HEADER + (index % RING_SIZE) as usize * SLOT_SIZE
}

fn write_slot(page: &PageView, index: u32, payload: &[u8]) -> Result<(), VbusError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(VbusError::PayloadTooLarge { len: payload.len() });
    }
    let offset = slot_offset(index);
    page.write_u32(offset, payload.len() as u32)?;
    page.write(offset + 4, payload)?;
    Ok(())
}

fn read_slot(page: &PageView, index: u32) -> Result<Vec<u8>, VbusError> {
    let offset = slot_offset(index);
    let len = page.read_u32(offset)? as usize;
    if len > MAX_PAYLOAD {
        return Err(VbusError::RingCorrupted(format!(
            "slot {} claims {} bytes",
            index % RING_SIZE,
            len
        )));
    }
    let mut payload = vec![0u8; len];
    page.read(offset + 4, &mut payload)?;
    Ok(payload)
}

/// Publish `new` at `prod` and tell whether the consumer's event index was crossed
fn publish(page: &PageView, prod: usize, event: usize, new: u32) -> Result<bool, VbusError> {
    let old = page.read_u32(prod)?;
    page.write_u32(prod, new)?;
    let event = page.read_u32(event)?;
    Ok(new.wrapping_sub(event) < new.wrapping_sub(old))
}

fn unconsumed(page: &PageView, prod: usize, cons: u32) -> Result<u32, VbusError> {
    let prod = page.read_u32(prod)?;
    let pending = prod.wrapping_sub(cons);
    if pending > RING_SIZE {
        return Err(VbusError::RingCorrupted(format!(
            "producer {prod} is {pending} slots ahead of consumer {cons}"
        )));
    }
    Ok(pending)
}

// ============================================================================
// Frontend side
// ============================================================================

/// Request producer, response consumer
#[derive(Debug)]
pub struct FrontRing {
    page: PageView,
    req_prod_pvt: u32,
    rsp_cons: u32,
}

impl FrontRing {
    /// Reset the page to an empty ring and take the frontend end of it
    pub fn init(page: PageView) -> Result<Self, VbusError> {
        page.clear()?;
        page.write_u32(REQ_EVENT, 1)?;
        page.write_u32(RSP_EVENT, 1)?;
        Ok(Self {
            page,
            req_prod_pvt: 0,
            rsp_cons: 0,
        })
    }

    /// Slots available to new requests
    pub fn free_slots(&self) -> u32 {
        RING_SIZE - self.req_prod_pvt.wrapping_sub(self.rsp_cons)
    }

    pub fn is_full(&self) -> bool {
        self.free_slots() == 0
    }

    /// Queue a request privately; the backend sees it after the next push
    pub fn push_request(&mut self, payload: &[u8]) -> Result<(), VbusError> {
        if self.is_full() {
            return Err(VbusError::RingFull);
        }
        write_slot(&self.page, self.req_prod_pvt, payload)?;
        self.req_prod_pvt = self.req_prod_pvt.wrapping_add(1);
        Ok(())
    }

    /// Publish queued requests. True when the backend must be notified.
    pub fn push_requests_and_check_notify(&mut self) -> Result<bool, VbusError> {
        let notify = publish(&self.page, REQ_PROD, REQ_EVENT, self.req_prod_pvt)?;
        trace!(req_prod = self.req_prod_pvt, notify, "push requests");
        Ok(notify)
    }

    pub fn has_unconsumed_responses(&self) -> Result<bool, VbusError> {
        Ok(unconsumed(&self.page, RSP_PROD, self.rsp_cons)? > 0)
    }

    pub fn pop_response(&mut self) -> Result<Option<Vec<u8>>, VbusError> {
        if !self.has_unconsumed_responses()? {
            return Ok(None);
        }
        let payload = read_slot(&self.page, self.rsp_cons)?;
        self.rsp_cons = self.rsp_cons.wrapping_add(1);
        Ok(Some(payload))
    }

    /// Ask for a notify on the next response, then look once more
    pub fn final_check_for_responses(&mut self) -> Result<bool, VbusError> {
        if self.has_unconsumed_responses()? {
            return Ok(true);
        }
        self.page.write_u32(RSP_EVENT, self.rsp_cons.wrapping_add(1))?;
        self.has_unconsumed_responses()
    }
}

// ============================================================================
// Backend side
// ============================================================================

/// Request consumer, response producer
#[derive(Debug)]
pub struct BackRing {
    page: PageView,
    rsp_prod_pvt: u32,
    req_cons: u32,
}

impl BackRing {
    /// Take the backend end of a ring initialised by the frontend
    ///
    /// Picks up at the last published response, so attaching again after
    /// a reconnect does not replay answered requests.
    pub fn attach(page: PageView) -> Result<Self, VbusError> {
        let rsp_prod = page.read_u32(RSP_PROD)?;
        Ok(Self {
            page,
            rsp_prod_pvt: rsp_prod,
            req_cons: rsp_prod,
        })
    }

    pub fn has_unconsumed_requests(&self) -> Result<bool, VbusError> {
        Ok(unconsumed(&self.page, REQ_PROD, self.req_cons)? > 0)
    }

    pub fn pop_request(&mut self) -> Result<Option<Vec<u8>>, VbusError> {
        if !self.has_unconsumed_requests()? {
            return Ok(None);
        }
        let payload = read_slot(&self.page, self.req_cons)?;
        self.req_cons = self.req_cons.wrapping_add(1);
        Ok(Some(payload))
    }

    /// Queue a response into the slot of the oldest unanswered request
    pub fn push_response(&mut self, payload: &[u8]) -> Result<(), VbusError> {
        if self.rsp_prod_pvt == self.req_cons {
            return Err(VbusError::RingFull);
        }
        write_slot(&self.page, self.rsp_prod_pvt, payload)?;
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
        Ok(())
    }

    /// Publish queued responses. True when the frontend must be notified.
    pub fn push_responses_and_check_notify(&mut self) -> Result<bool, VbusError> {
        let notify = publish(&self.page, RSP_PROD, RSP_EVENT, self.rsp_prod_pvt)?;
        trace!(rsp_prod = self.rsp_prod_pvt, notify, "push responses");
        Ok(notify)
    }

    /// Ask for a notify on the next request, then look once more
    pub fn final_check_for_requests(&mut self) -> Result<bool, VbusError> {
        if self.has_unconsumed_requests()? {
            return Ok(true);
        }
        self.page.write_u32(REQ_EVENT, self.req_cons.wrapping_add(1))?;
        self.has_unconsumed_requests()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soo_hal::{Access, DomainId, MemoryLayer, SimMemory};

    fn rings() -> (FrontRing, BackRing) {
        let memory = SimMemory::new();
        let va = memory.alloc_contig_pages(DomainId(2), 1).unwrap();
        let page = memory.page(va).unwrap();
        let front = FrontRing::init(page.clone()).unwrap();
        let back = BackRing::attach(page).unwrap();
        (front, back)
    }

    #[test]
    fn test_request_response_round() {
        let (mut front, mut back) = rings();
        front.push_request(b"ping").unwrap();
        front.push_request(b"pong?").unwrap();
        assert!(front.push_requests_and_check_notify().unwrap());

        assert_eq!(back.pop_request().unwrap().as_deref(), Some(&b"ping"[..]));
        assert_eq!(back.pop_request().unwrap().as_deref(), Some(&b"pong?"[..]));
        assert_eq!(back.pop_request().unwrap(), None);

        back.push_response(b"1").unwrap();
        back.push_response(b"2").unwrap();
        assert_eq!(back.push_response(b"3"), Err(VbusError::RingFull));
        assert!(back.push_responses_and_check_notify().unwrap());

        assert_eq!(front.pop_response().unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(front.pop_response().unwrap().as_deref(), Some(&b"2"[..]));
        assert_eq!(front.pop_response().unwrap(), None);
        assert_eq!(front.free_slots(), RING_SIZE);
    }

    #[test]
    fn test_notify_suppressed_until_consumer_rearms() {
        let (mut front, mut back) = rings();
        front.push_request(b"a").unwrap();
        assert!(front.push_requests_and_check_notify().unwrap());
        // Backend has not re-armed yet
        front.push_request(b"b").unwrap();
        assert!(!front.push_requests_and_check_notify().unwrap());

        while back.pop_request().unwrap().is_some() {}
        assert!(!back.final_check_for_requests().unwrap());

        front.push_request(b"c").unwrap();
        assert!(front.push_requests_and_check_notify().unwrap());
        assert!(back.final_check_for_requests().unwrap());
    }

    #[test]
    fn test_full_ring_and_wrap() {
        let (mut front, mut back) = rings();
        for round in 0..3u8 {
            for i in 0..RING_SIZE {
                front.push_request(&[round, i as u8]).unwrap();
            }
            assert!(front.is_full());
            assert_eq!(front.push_request(b"x"), Err(VbusError::RingFull));
            front.push_requests_and_check_notify().unwrap();

            for i in 0..RING_SIZE {
                let req = back.pop_request().unwrap().unwrap();
                assert_eq!(req, vec![round, i as u8]);
                back.push_response(&req).unwrap();
            }
            back.push_responses_and_check_notify().unwrap();
            for _ in 0..RING_SIZE {
                assert!(front.pop_response().unwrap().is_some());
            }
            assert_eq!(front.free_slots(), RING_SIZE);
        }
    }

    #[test]
    fn test_payload_limit() {
        let (mut front, _back) = rings();
        let big = vec![0u8; MAX_PAYLOAD + 1];
        assert_eq!(
            front.push_request(&big),
            Err(VbusError::PayloadTooLarge { len: MAX_PAYLOAD + 1 })
        );
        front.push_request(&big[..MAX_PAYLOAD]).unwrap();
    }

    #[test]
    fn test_read_only_view_cannot_produce() {
        let memory = SimMemory::new();
        let va = memory.alloc_contig_pages(DomainId(2), 1).unwrap();
        let frame = memory.frame_of(va).unwrap();
        let foreign = memory
            .map_foreign_page(frame, DomainId(2), Access::ReadOnly)
            .unwrap();
        let _front = FrontRing::init(memory.page(va).unwrap()).unwrap();
        let mut back = BackRing::attach(memory.page(foreign).unwrap()).unwrap();
        assert!(back.pop_request().unwrap().is_none());
        assert!(matches!(
            back.final_check_for_requests(),
            Err(VbusError::Memory(soo_hal::HalError::AccessDenied))
        ));
    }

    #[test]
    fn test_corrupted_indices_detected() {
        let memory = SimMemory::new();
        let va = memory.alloc_contig_pages(DomainId(2), 1).unwrap();
        let page = memory.page(va).unwrap();
        let _front = FrontRing::init(page.clone()).unwrap();
        let mut back = BackRing::attach(page.clone()).unwrap();
        page.write_u32(REQ_PROD, RING_SIZE + 5).unwrap();
        assert!(matches!(back.pop_request(), Err(VbusError::RingCorrupted(_))));
    }
}
