//! Configuration-memory seam and the chunked transfer engine.
//!
//! The control pipe's buffer is much smaller than a typical PROM transfer,
//! so host-requested reads and writes are windowed into buffer-sized chunks.
//! Chunking is invisible to the host beyond per-chunk latency: the chunks of
//! one request cover the requested region exactly, in address order.

use crate::hal::Hal;

/// Addressed block access plus a sequential read cursor over the serial
/// configuration memory.
pub trait PromEngine {
    /// Open a sequential read session at `addr`.
    fn start_read(&mut self, addr: u16);

    /// Byte under the read cursor. Only valid inside a read session.
    fn peek_byte(&mut self) -> u8;

    /// Move the read cursor one byte forward.
    fn advance(&mut self);

    /// Close the sequential read session.
    fn stop_read(&mut self);

    /// Fill `buf` from `device` starting at `addr`.
    fn read_block(&mut self, device: u8, addr: u16, buf: &mut [u8]);

    /// Program `data` into `device` starting at `addr`.
    fn write_block(&mut self, device: u8, addr: u16, data: &[u8]);
}

/// Response buffers are scrubbed with this before a block read, so a short
/// write by the PROM driver can never leak stale endpoint bytes.
pub const SCRUB_BYTE: u8 = 0x23;

/// Stream `remaining` bytes of `device` starting at `address` to the host
/// in control-buffer-sized chunks.
pub fn stream_to_host(
    prom: &mut impl PromEngine,
    hal: &mut impl Hal,
    device: u8,
    mut address: u16,
    mut remaining: u16,
) {
    tracing::debug!("prom read: device {device}, {remaining} bytes from {address:#06x}");
    while remaining > 0 {
        hal.control_wait_free();
        let chunk = (remaining as usize).min(hal.control_capacity());
        let mut buf = vec![SCRUB_BYTE; chunk];
        prom.read_block(device, address, &mut buf);
        hal.control_commit_in(&buf);
        address = address.wrapping_add(chunk as u16);
        remaining -= chunk as u16;
    }
}

/// Accept `remaining` bytes from the host and program them into `device`
/// starting at `address`. Each chunk is sized by what the host actually
/// sent, which may be less than the buffer capacity.
pub fn accept_from_host(
    prom: &mut impl PromEngine,
    hal: &mut impl Hal,
    device: u8,
    mut address: u16,
    mut remaining: u16,
) {
    tracing::debug!("prom write: device {device}, {remaining} bytes at {address:#06x}");
    while remaining > 0 {
        let mut buf = vec![0u8; hal.control_capacity()];
        let got = hal.control_receive_out(&mut buf);
        prom.write_block(device, address, &buf[..got]);
        address = address.wrapping_add(got as u16);
        remaining = remaining.saturating_sub(got as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimHal, SimProm};

    #[test]
    fn read_chunks_cover_the_region_exactly() {
        for length in [1u16, 63, 64, 65, 128, 130, 513] {
            let mut prom = SimProm::new(2048);
            let mut hal = SimHal::new();
            let capacity = hal.control_capacity() as u16;

            stream_to_host(&mut prom, &mut hal, 0, 0x0100, length);

            let chunks = hal.control_in_chunks();
            assert_eq!(chunks.len(), length.div_ceil(capacity) as usize);
            let total: usize = chunks.iter().map(Vec::len).sum();
            assert_eq!(total, length as usize);

            let expected_last = match length % capacity {
                0 => capacity,
                rem => rem,
            };
            assert_eq!(chunks.last().unwrap().len(), expected_last as usize);

            // Every chunk but the last is a full buffer.
            for chunk in &chunks[..chunks.len() - 1] {
                assert_eq!(chunk.len(), capacity as usize);
            }
        }
    }

    #[test]
    fn read_blocks_are_issued_in_address_order() {
        let mut prom = SimProm::new(2048);
        let mut hal = SimHal::new();

        stream_to_host(&mut prom, &mut hal, 2, 0x0200, 130);

        assert_eq!(
            prom.block_reads(),
            &[(2, 0x0200, 64), (2, 0x0240, 64), (2, 0x0280, 2)]
        );
    }

    #[test]
    fn write_chunks_cover_the_region_exactly() {
        for length in [1u16, 64, 65, 200] {
            let mut prom = SimProm::new(2048);
            let mut hal = SimHal::new();
            let payload: Vec<u8> = (0..length).map(|i| i as u8).collect();
            hal.host_send(&payload);

            accept_from_host(&mut prom, &mut hal, 1, 0x0000, length);

            let writes = prom.block_writes();
            let total: usize = writes.iter().map(|(_, _, data)| data.len()).sum();
            assert_eq!(total, length as usize);
            assert_eq!(prom.contents(0x0000, length as usize), payload);
        }
    }

    #[test]
    fn read_response_is_scrubbed_when_the_driver_writes_short() {
        let mut prom = SimProm::new(16);
        prom.set_short_reads(true);
        let mut hal = SimHal::new();

        stream_to_host(&mut prom, &mut hal, 0, 0x0000, 8);

        let chunk = &hal.control_in_chunks()[0];
        assert!(chunk[4..].iter().all(|&b| b == SCRUB_BYTE));
    }
}
