//! Power-up boot: parse the self-describing image in configuration memory,
//! replay the captured JTAG configuration sequence, and stream the trailing
//! firmware blob into the bulk pipe — all before the host is listening.
//!
//! The image interleaves auxiliary programming records (target bitstream
//! blocks) with the real payload; the records are skipped, not transmitted,
//! until the sentinel record marks the end of the record stream.

use crate::hal::Hal;
use crate::jtag::JtagEngine;
use crate::prom::PromEngine;

/// First byte of a valid boot image.
pub const IMAGE_MAGIC: u8 = 0xC2;

/// VID/PID/DID identifier bytes plus the configuration byte.
const HEADER_BYTES: usize = 7;

/// Advances to step past the sentinel record: its length-low byte, two
/// address bytes and single data byte, landing on the byte after.
const SENTINEL_ADVANCES: usize = 5;

/// Run the autoboot sequence. Returns the diagnostic code produced by the
/// JTAG replay step, or zero when no image is present.
#[tracing::instrument(skip_all)]
pub fn run(hal: &mut impl Hal, jtag: &mut impl JtagEngine, prom: &mut impl PromEngine) -> u8 {
    prom.start_read(0x0000);

    if prom.peek_byte() != IMAGE_MAGIC {
        // No firmware image: the whole sequence is skipped and the device
        // starts in bare mode. Not an error any host ever sees.
        tracing::debug!("no boot image in configuration memory");
        prom.stop_read();
        return 0;
    }

    for _ in 0..HEADER_BYTES {
        prom.advance();
    }

    // Walk the record stream: big-endian length, then the payload with its
    // two address bytes riding along. A length-high byte with the top bit
    // set is the sentinel.
    prom.advance();
    let mut length_high = prom.peek_byte();
    while length_high & 0x80 == 0 {
        let mut block_size = (length_high as u16) << 8;
        prom.advance();
        block_size |= prom.peek_byte() as u16;
        block_size += 2;
        tracing::trace!("skipping {} byte record", block_size - 2);
        for _ in 0..block_size {
            prom.advance();
        }
        prom.advance();
        length_high = prom.peek_byte();
    }
    for _ in 0..SENTINEL_ADVANCES {
        prom.advance();
    }

    // Replay the captured JTAG configuration sequence with the pins driven,
    // recording its outcome for the status command.
    jtag.set_enabled(true);
    jtag.replay_init();
    let diagnostic = jtag.replay_run();
    jtag.set_enabled(false);
    if diagnostic != 0 {
        tracing::warn!(diagnostic, "JTAG replay reported a fault");
    }

    let mut firmware_len = (prom.peek_byte() as u16) << 8;
    prom.advance();
    firmware_len |= prom.peek_byte() as u16;
    prom.advance();
    if firmware_len != 0 {
        tracing::debug!(firmware_len, "streaming firmware to bulk pipe");
        stream_firmware(hal, prom, firmware_len as u32);
    }

    prom.stop_read();
    diagnostic
}

/// Push `remaining` bytes from the PROM read cursor into the bulk pipe in
/// packet-capacity chunks. The stream's automatic commit is suspended for
/// the burst: each packet is committed explicitly and any armed-but-unused
/// buffering is skipped, so no partial packet is left pending.
fn stream_firmware(hal: &mut impl Hal, prom: &mut impl PromEngine, mut remaining: u32) {
    while remaining > 0 {
        let chunk = remaining.min(hal.stream_capacity() as u32) as usize;

        hal.stream_wait_idle();
        hal.stream_begin_manual();

        let mut packet = vec![0u8; chunk];
        for byte in packet.iter_mut() {
            *byte = prom.peek_byte();
            prom.advance();
        }
        hal.stream_commit(&packet);
        hal.stream_skip_unused();
        remaining -= chunk as u32;

        hal.stream_end_manual();
    }
}
