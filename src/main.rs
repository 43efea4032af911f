#![recursion_limit = "256"] // required by bitfield!
#![deny(unused_must_use)]

use bridge::ports::MaskPort;
use bridge::{
    Bridge, BridgeConfig, Command, CMD_JTAG_CLOCK, CMD_JTAG_CLOCK_DATA, CMD_JTAG_CLOCK_FSM,
    CMD_MODE_STATUS, CMD_PORT_IO, CMD_READ_WRITE_EEPROM, MODE_JTAG,
};
use hal::Port;
use sim::{BootImage, SimHal, SimJtag, SimProm};

mod autoboot;
mod bridge;
mod hal;
mod jtag;
mod prom;
mod sim;

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();

    let mask_port = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<MaskPort>().map_err(|e| anyhow::anyhow!(e))?,
        None => MaskPort::PortD,
    };
    let config = BridgeConfig {
        mask_port,
        ..Default::default()
    };

    // Simulated configuration memory holding a boot image: one auxiliary
    // record plus a small firmware blob.
    let firmware: Vec<u8> = (0..600u16).map(|i| i as u8).collect();
    let image = BootImage::new().record(&[0x5A; 16]).firmware(&firmware).build();

    let mut dev = Bridge::new(SimHal::new(), SimJtag::new(), SimProm::with_image(&image), config);

    // Power-on pin state: all ports idle, the sense input pulled high.
    for port in [Port::A, Port::B, Port::C, Port::D] {
        dev.hal_mut().set_port_state(port, 0x00, 0x00);
    }
    dev.hal_mut().set_port_state(Port::A, 0x04, 0x00);

    dev.autoboot();
    tracing::info!(
        "autoboot: diagnostic {:#04x}, {} firmware packets streamed",
        dev.diagnostic(),
        dev.hal().stream_packets().len()
    );

    // Fetch the status record, decoding the request from its raw setup
    // packet as the transport would.
    let status_req = Command::parse(&[0xC0, CMD_MODE_STATUS, 0, 0, 0, 0, 16, 0])?;
    dev.handle_command(&status_req)?;
    if let Some(status) = dev.hal().control_in_chunks().last() {
        tracing::info!("status record: {:02x?}", status);
    }

    // Enable JTAG drive, walk the TAP into Shift-DR, then run a deferred
    // 64-bit shift from the idle loop.
    dev.handle_command(&Command::vendor_out(CMD_MODE_STATUS, MODE_JTAG, MODE_JTAG, 0))?;
    dev.hal_mut().host_send(&[0b001, 0x00, 0x00, 0x00, 3]);
    dev.handle_command(&Command::vendor_out(CMD_JTAG_CLOCK_FSM, 0, 0, 5))?;
    dev.hal_mut().host_send(&[0x40, 0x00, 0x00, 0x00, 0x01]);
    dev.handle_command(&Command::vendor_out(CMD_JTAG_CLOCK_DATA, 0, 0, 5))?;
    tracing::debug!(pending = dev.shift_pending(), "returning to the idle loop");
    while dev.idle_tick() {}
    dev.handle_command(&Command::vendor_out(CMD_JTAG_CLOCK, 1000, 0, 0))?;
    tracing::info!(
        "TAP at {:?} after {} idle clocks, executed shifts: {:?}",
        dev.jtag().tap_state(),
        dev.jtag().idle_clocks(),
        dev.jtag().executed_shifts()
    );

    // Masked port I/O: the reserved JTAG pins on port D ignore the request.
    dev.handle_command(&Command::vendor_in(CMD_PORT_IO, 0x00FF, 0x00FF, 2))?;
    if let Some(readback) = dev.hal().control_in_chunks().last() {
        tracing::info!("port readback [D, C]: {:02x?}", readback);
    }

    // Round-trip a blob over the EEPROM commands.
    dev.prom_mut().load(0x0400, b"bridge scratch data");
    dev.handle_command(&Command::vendor_in(CMD_READ_WRITE_EEPROM, 0x0400, 0x00, 19))?;
    if let Some(dump) = dev.hal().control_in_chunks().last() {
        tracing::info!("eeprom dump: {:02x?}", dump);
    }
    dev.hal_mut().host_send(&[0xA5; 32]);
    dev.handle_command(&Command::vendor_out(CMD_READ_WRITE_EEPROM, 0x0400, 0x00, 32))?;

    Ok(())
}
