//! Vendor-command protocol and the bridge device context.
//!
//! A control request either completes synchronously inside
//! [`Bridge::handle_command`], arms a deferred operation for the idle loop,
//! or is declined — in which case no response is produced and the transport
//! stalls the request.
pub mod ports;

use bitfield::bitfield;
use scroll::{Pread, LE};

use crate::autoboot;
use crate::hal::{Hal, Port};
use crate::jtag::{JtagEngine, PendingShift, ShiftOptions, ShiftScheduler};
use crate::prom::{self, PromEngine};
use ports::{MaskPort, PortRequest};

/// Set mode bits (OUT) or fetch the 16-byte status record (IN).
pub const CMD_MODE_STATUS: u8 = 0x80;
/// Arm a deferred shift of data through the JTAG chain.
pub const CMD_JTAG_CLOCK_DATA: u8 = 0x81;
/// Clock a TMS bit pattern to walk the TAP state machine.
pub const CMD_JTAG_CLOCK_FSM: u8 = 0x82;
/// Clock the TAP a number of times without changing state.
pub const CMD_JTAG_CLOCK: u8 = 0x83;
/// Apply masked port state and read back the resulting pin values.
pub const CMD_PORT_IO: u8 = 0x84;
/// Read or write a region of configuration memory.
pub const CMD_READ_WRITE_EEPROM: u8 = 0xA2;

/// Mode bit selecting whether the JTAG pins are driven.
pub const MODE_JTAG: u16 = 0x0001;

bitfield! {
    /// The bmRequestType byte of a setup packet.
    #[derive(Copy, Clone, Default, Eq, PartialEq)]
    pub struct SetupType(u8);
    impl Debug;
    pub is_device_to_host, set_is_device_to_host: 7;
    /// 0 = standard, 1 = class, 2 = vendor.
    pub u8, kind, set_kind: 6, 5;
    /// 0 = device, 1 = interface, 2 = endpoint.
    pub u8, recipient, set_recipient: 4, 0;
}

pub const KIND_VENDOR: u8 = 0x02;

/// One decoded control request. Ephemeral: lives for the duration of a
/// single control transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub request: u8,
    pub setup_type: SetupType,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl Command {
    /// Decode the 8-byte setup packet of a control request.
    pub fn parse(setup: &[u8]) -> Result<Self, CommandError> {
        Ok(Self {
            setup_type: SetupType(setup.pread::<u8>(0)?),
            request: setup.pread::<u8>(1)?,
            value: setup.pread_with::<u16>(2, LE)?,
            index: setup.pread_with::<u16>(4, LE)?,
            length: setup.pread_with::<u16>(6, LE)?,
        })
    }

    /// A device-to-host vendor request addressed to the device.
    pub fn vendor_in(request: u8, value: u16, index: u16, length: u16) -> Self {
        let mut setup_type = SetupType(0);
        setup_type.set_is_device_to_host(true);
        setup_type.set_kind(KIND_VENDOR);
        Self { request, setup_type, value, index, length }
    }

    /// A host-to-device vendor request addressed to the device.
    pub fn vendor_out(request: u8, value: u16, index: u16, length: u16) -> Self {
        let mut setup_type = SetupType(0);
        setup_type.set_kind(KIND_VENDOR);
        Self { request, setup_type, value, index, length }
    }

    fn is_vendor_in(&self) -> bool {
        self.setup_type.is_device_to_host()
            && self.setup_type.kind() == KIND_VENDOR
            && self.setup_type.recipient() == 0
    }

    fn is_vendor_out(&self) -> bool {
        !self.setup_type.is_device_to_host()
            && self.setup_type.kind() == KIND_VENDOR
            && self.setup_type.recipient() == 0
    }
}

/// Why a control request produced no response.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Opcode not recognized, or a recognized opcode paired with the wrong
    /// transfer direction or request type. The transport stalls the request.
    #[error("vendor request {request:#04x} with request type {setup_type:#04x} is not recognized")]
    Unsupported { request: u8, setup_type: u8 },
    /// A second clock-data request arrived while a shift was still pending.
    #[error("a JTAG shift operation is already in flight")]
    ShiftInProgress,
    /// Control payload shorter than the command's fixed layout.
    #[error("short control payload: {0}")]
    Payload(#[from] scroll::Error),
}

/// First four bytes of every status record.
pub const STATUS_MAGIC: [u8; 4] = *b"FXB2";

// Bulk endpoint pairs (out nibble, in nibble) advertised in the status
// record.
const EP_JTAG: u8 = 0x11;
const EP_FPGA_CONFIG: u8 = 0x26;

/// Compose the fixed 16-byte status record.
pub fn status_record(diagnostic: u8, sense: bool) -> [u8; 16] {
    let mut record = [0u8; 16];
    record[..4].copy_from_slice(&STATUS_MAGIC);
    record[4] = diagnostic;
    record[5] = if sense { 0 } else { 1 };
    record[6] = EP_JTAG;
    record[7] = EP_FPGA_CONFIG;
    record
}

/// Bridge configuration, resolved once at startup.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BridgeConfig {
    /// Port carrying the reserved JTAG pins, if any.
    pub mask_port: MaskPort,
    /// Bit positions of the reserved JTAG pins on that port.
    pub jtag_pins: u8,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mask_port: MaskPort::None,
            jtag_pins: 0x0F,
        }
    }
}

/// The bridge device: hardware collaborators plus all process-wide state.
///
/// Two call sites drive it, never concurrently: [`Bridge::handle_command`]
/// when a control request arrives, and [`Bridge::idle_tick`] in a tight loop
/// otherwise. [`Bridge::autoboot`] runs once before either.
pub struct Bridge<H, J, P> {
    hal: H,
    jtag: J,
    prom: P,
    config: BridgeConfig,
    shifter: ShiftScheduler,
    diagnostic: u8,
}

impl<H: Hal, J: JtagEngine, P: PromEngine> Bridge<H, J, P> {
    pub fn new(hal: H, jtag: J, prom: P, config: BridgeConfig) -> Self {
        tracing::debug!(?config, "bridge init");
        Self {
            hal,
            jtag,
            prom,
            config,
            shifter: ShiftScheduler::new(),
            diagnostic: 0,
        }
    }

    /// Parse and stream the boot image out of configuration memory, if one
    /// is present. Runs once at power-up, before any host interaction.
    pub fn autoboot(&mut self) {
        self.diagnostic = autoboot::run(&mut self.hal, &mut self.jtag, &mut self.prom);
    }

    /// Dispatch one decoded control request.
    #[tracing::instrument(skip(self))]
    pub fn handle_command(&mut self, cmd: &Command) -> Result<(), CommandError> {
        match cmd.request {
            CMD_MODE_STATUS if cmd.is_vendor_out() => {
                self.set_mode(cmd.value, cmd.index);
                Ok(())
            }
            CMD_MODE_STATUS if cmd.is_vendor_in() => {
                self.send_status();
                Ok(())
            }
            CMD_JTAG_CLOCK_DATA if cmd.is_vendor_out() => self.arm_shift(),
            CMD_JTAG_CLOCK_FSM if cmd.is_vendor_out() => self.clock_fsm(),
            CMD_JTAG_CLOCK if cmd.is_vendor_out() => {
                let count = (cmd.index as u32) << 16 | cmd.value as u32;
                self.jtag.clock_idle(count);
                Ok(())
            }
            CMD_PORT_IO if cmd.is_vendor_in() => {
                self.port_io(cmd.value, cmd.index);
                Ok(())
            }
            CMD_READ_WRITE_EEPROM if cmd.is_vendor_in() => {
                prom::stream_to_host(&mut self.prom, &mut self.hal, cmd.index as u8, cmd.value, cmd.length);
                Ok(())
            }
            CMD_READ_WRITE_EEPROM if cmd.is_vendor_out() => {
                prom::accept_from_host(&mut self.prom, &mut self.hal, cmd.index as u8, cmd.value, cmd.length);
                Ok(())
            }
            _ => Err(CommandError::Unsupported {
                request: cmd.request,
                setup_type: cmd.setup_type.0,
            }),
        }
    }

    /// Run at most one pending deferred operation. Returns whether anything
    /// was serviced.
    pub fn idle_tick(&mut self) -> bool {
        self.shifter.service(&mut self.jtag)
    }

    fn set_mode(&mut self, bits: u16, mask: u16) {
        if mask & MODE_JTAG != 0 {
            // When in JTAG mode the JTAG lines are driven; tristate otherwise.
            let enable = bits & MODE_JTAG != 0;
            tracing::debug!(enable, "setting JTAG drive");
            self.jtag.set_enabled(enable);
        }
    }

    fn send_status(&mut self) {
        self.hal.control_wait_free();
        let record = status_record(self.diagnostic, self.hal.sense());
        self.hal.control_commit_in(&record);
    }

    fn receive_control_payload(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; self.hal.control_capacity()];
        let got = self.hal.control_receive_out(&mut buf);
        buf.truncate(got);
        buf
    }

    fn arm_shift(&mut self) -> Result<(), CommandError> {
        let payload = self.receive_control_payload();
        let bit_count = payload.pread_with::<u32>(0, LE)?;
        let options = ShiftOptions(payload.pread::<u8>(4)?);
        self.shifter.arm(PendingShift { bit_count, options })
        // The shift itself continues from idle_tick().
    }

    fn clock_fsm(&mut self) -> Result<(), CommandError> {
        let payload = self.receive_control_payload();
        let pattern = payload.pread_with::<u32>(0, LE)?;
        let transition_count = payload.pread::<u8>(4)?;
        self.jtag.clock_fsm(pattern, transition_count);
        Ok(())
    }

    fn port_io(&mut self, value: u16, index: u16) {
        let mut req = PortRequest {
            pd_pins: value as u8,
            pc_pins: (value >> 8) as u8,
            pd_dir: index as u8,
            pc_dir: (index >> 8) as u8,
        };
        self.config.mask_port.protect(&mut req, &self.hal, self.config.jtag_pins);

        self.hal.set_dir(Port::D, req.pd_dir);
        self.hal.set_dir(Port::C, req.pc_dir);
        self.hal.set_pins(Port::D, req.pd_pins);
        self.hal.set_pins(Port::C, req.pc_pins);

        self.hal.control_wait_free();
        let readback = [self.hal.pins(Port::D), self.hal.pins(Port::C)];
        self.hal.control_commit_in(&readback);
    }

    /// Diagnostic code recorded by the autoboot replay step.
    pub fn diagnostic(&self) -> u8 {
        self.diagnostic
    }

    /// Whether a deferred shift is waiting for the idle loop.
    pub fn shift_pending(&self) -> bool {
        self.shifter.is_pending()
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn jtag(&self) -> &J {
        &self.jtag
    }

    pub fn prom_mut(&mut self) -> &mut P {
        &mut self.prom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimHal, SimJtag, SimProm, TapState};

    fn bridge() -> Bridge<SimHal, SimJtag, SimProm> {
        bridge_with(BridgeConfig::default())
    }

    fn bridge_with(config: BridgeConfig) -> Bridge<SimHal, SimJtag, SimProm> {
        Bridge::new(SimHal::new(), SimJtag::new(), SimProm::new(4096), config)
    }

    #[test]
    fn setup_packet_decodes() {
        let cmd = Command::parse(&[0x40, 0x81, 0x34, 0x12, 0x78, 0x56, 0x05, 0x00]).unwrap();
        assert_eq!(cmd.request, CMD_JTAG_CLOCK_DATA);
        assert!(!cmd.setup_type.is_device_to_host());
        assert_eq!(cmd.setup_type.kind(), KIND_VENDOR);
        assert_eq!(cmd.value, 0x1234);
        assert_eq!(cmd.index, 0x5678);
        assert_eq!(cmd.length, 5);

        let cmd = Command::parse(&[0xC0, 0x80, 0, 0, 0, 0, 16, 0]).unwrap();
        assert_eq!(cmd, Command::vendor_in(CMD_MODE_STATUS, 0, 0, 16));
    }

    #[test]
    fn unknown_opcode_is_unsupported() {
        let mut dev = bridge();
        let err = dev.handle_command(&Command::vendor_out(0x42, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, CommandError::Unsupported { request: 0x42, .. }));
    }

    #[test]
    fn recognized_opcode_with_wrong_direction_is_unsupported() {
        let mut dev = bridge();
        // Clock-data is host-to-device only.
        let err = dev
            .handle_command(&Command::vendor_in(CMD_JTAG_CLOCK_DATA, 0, 0, 5))
            .unwrap_err();
        assert!(matches!(err, CommandError::Unsupported { .. }));
        assert!(!dev.shift_pending());
    }

    #[test]
    fn non_vendor_request_falls_through() {
        let mut dev = bridge();
        let mut cmd = Command::vendor_in(CMD_MODE_STATUS, 0, 0, 16);
        cmd.setup_type.set_kind(0); // standard request
        assert!(dev.handle_command(&cmd).is_err());
        assert!(dev.hal().control_in_chunks().is_empty());
    }

    #[test]
    fn status_record_magic_is_stable() {
        let mut dev = bridge();
        for _ in 0..3 {
            dev.handle_command(&Command::vendor_in(CMD_MODE_STATUS, 0, 0, 16)).unwrap();
        }
        for chunk in dev.hal().control_in_chunks() {
            assert_eq!(chunk.len(), 16);
            assert_eq!(&chunk[..4], b"FXB2");
            assert_eq!(&chunk[8..], &[0u8; 8]);
        }
    }

    #[test]
    fn status_flags_invert_the_sense_pin() {
        assert_eq!(status_record(0, true)[5], 0);
        assert_eq!(status_record(0, false)[5], 1);
        assert_eq!(status_record(0xAB, true)[4], 0xAB);
    }

    #[test]
    fn mode_command_toggles_jtag_drive_only_when_masked() {
        let mut dev = bridge();

        dev.handle_command(&Command::vendor_out(CMD_MODE_STATUS, MODE_JTAG, MODE_JTAG, 0)).unwrap();
        assert!(dev.jtag().enabled());

        // Mask bit clear: the mode bit is ignored.
        dev.handle_command(&Command::vendor_out(CMD_MODE_STATUS, 0, 0, 0)).unwrap();
        assert!(dev.jtag().enabled());

        dev.handle_command(&Command::vendor_out(CMD_MODE_STATUS, 0, MODE_JTAG, 0)).unwrap();
        assert!(!dev.jtag().enabled());
    }

    #[test]
    fn clock_data_defers_and_idle_tick_executes() {
        let mut dev = bridge();
        dev.hal_mut().host_send(&[0x00, 0x04, 0x00, 0x00, 0x01]);

        dev.handle_command(&Command::vendor_out(CMD_JTAG_CLOCK_DATA, 0, 0, 5)).unwrap();
        assert!(dev.shift_pending());
        assert!(dev.jtag().executed_shifts().is_empty());

        assert!(dev.idle_tick());
        assert!(!dev.shift_pending());
        let (bits, options) = dev.jtag().executed_shifts()[0];
        assert_eq!(bits, 0x0400);
        assert!(options.is_response_needed());
        assert!(!options.is_send_ones());

        // Idle loop with nothing pending is a no-op.
        assert!(!dev.idle_tick());
    }

    #[test]
    fn second_clock_data_while_pending_is_rejected() {
        let mut dev = bridge();
        dev.hal_mut().host_send(&[0x08, 0x00, 0x00, 0x00, 0x00]);
        dev.handle_command(&Command::vendor_out(CMD_JTAG_CLOCK_DATA, 0, 0, 5)).unwrap();

        dev.hal_mut().host_send(&[0xFF, 0x00, 0x00, 0x00, 0x00]);
        let err = dev
            .handle_command(&Command::vendor_out(CMD_JTAG_CLOCK_DATA, 0, 0, 5))
            .unwrap_err();
        assert!(matches!(err, CommandError::ShiftInProgress));

        // The in-flight operation's parameters survive.
        dev.idle_tick();
        assert_eq!(dev.jtag().executed_shifts()[0].0, 8);
    }

    #[test]
    fn clock_fsm_runs_synchronously_and_arms_nothing() {
        let mut dev = bridge();
        dev.hal_mut().host_send(&[0x01, 0x00, 0x00, 0x00, 0x01]);

        dev.handle_command(&Command::vendor_out(CMD_JTAG_CLOCK_FSM, 0, 0, 5)).unwrap();

        assert_eq!(dev.jtag().fsm_transitions(), 1);
        // One TMS=1 from Run-Test/Idle selects the DR column.
        assert_eq!(dev.jtag().tap_state(), TapState::SelectDr);
        assert!(!dev.shift_pending());
    }

    #[test]
    fn clock_count_is_carried_in_the_setup_packet() {
        let mut dev = bridge();
        dev.handle_command(&Command::vendor_out(CMD_JTAG_CLOCK, 0x5678, 0x1234, 0)).unwrap();
        assert_eq!(dev.jtag().idle_clocks(), 0x1234_5678);
    }

    #[test]
    fn short_clock_data_payload_is_an_error() {
        let mut dev = bridge();
        dev.hal_mut().host_send(&[0x01, 0x02]);
        let err = dev
            .handle_command(&Command::vendor_out(CMD_JTAG_CLOCK_DATA, 0, 0, 5))
            .unwrap_err();
        assert!(matches!(err, CommandError::Payload(_)));
        assert!(!dev.shift_pending());
    }

    #[test]
    fn port_io_applies_masked_state_and_echoes_readback() {
        let mut dev = bridge_with(BridgeConfig {
            mask_port: MaskPort::PortD,
            jtag_pins: 0x0F,
        });
        dev.hal_mut().set_port_state(Port::D, 0x05, 0x0A);

        // value = {pc_pins, pd_pins}, index = {pc_dir, pd_dir}.
        dev.handle_command(&Command::vendor_in(CMD_PORT_IO, 0x33FF, 0x77FF, 2)).unwrap();

        // Port D reserved nibble kept its hardware state.
        assert_eq!(dev.hal().pins(Port::D), 0xF5);
        assert_eq!(dev.hal().dir(Port::D), 0xFA);
        // Port C applied verbatim.
        assert_eq!(dev.hal().pins(Port::C), 0x33);
        assert_eq!(dev.hal().dir(Port::C), 0x77);

        let chunks = dev.hal().control_in_chunks();
        assert_eq!(chunks.last().unwrap(), &[0xF5, 0x33]);
    }

    #[test]
    fn eeprom_read_streams_through_the_dispatcher() {
        let mut dev = bridge();
        let image: Vec<u8> = (0..200u16).map(|i| i as u8).collect();
        dev.prom_mut().load(0x0300, &image);

        dev.handle_command(&Command::vendor_in(CMD_READ_WRITE_EEPROM, 0x0300, 0x01, 200)).unwrap();

        let chunks = dev.hal().control_in_chunks();
        assert_eq!(chunks.len(), 4);
        let streamed: Vec<u8> = chunks.iter().flatten().copied().collect();
        assert_eq!(streamed, image);
    }

    #[test]
    fn eeprom_write_programs_through_the_dispatcher() {
        let mut dev = bridge();
        let payload: Vec<u8> = (0..100u16).map(|i| (i as u8) ^ 0x5A).collect();
        dev.hal_mut().host_send(&payload);

        dev.handle_command(&Command::vendor_out(CMD_READ_WRITE_EEPROM, 0x0040, 0x00, 100)).unwrap();

        assert_eq!(dev.prom_mut().contents(0x0040, 100), payload);
    }
}
