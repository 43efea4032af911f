//! In-memory hardware collaborators: a recording HAL, a soft JTAG engine
//! with a real TAP state machine, and a RAM-backed configuration memory.
//!
//! These let the whole control plane run on a workstation — `main.rs` drives
//! a demo session through them, and the tests assert against what they
//! record.

use std::collections::VecDeque;

use bitvec::prelude::*;

use crate::autoboot::IMAGE_MAGIC;
use crate::hal::{Hal, Port};
use crate::jtag::{JtagEngine, ShiftOptions};
use crate::prom::PromEngine;

const CONTROL_CAPACITY: usize = 64;
const STREAM_CAPACITY: usize = 512;

/// Sense input on port A, reported (inverted) in the status record.
const SENSE_PIN: u8 = 0x04;

#[derive(Debug, Default, Clone, Copy)]
struct SimPort {
    pins: u8,
    dir: u8,
}

/// Recording HAL: every committed control chunk and bulk packet is kept for
/// inspection, host OUT data is scripted ahead of time.
#[derive(Debug, Default)]
pub struct SimHal {
    control_in: Vec<Vec<u8>>,
    control_out: VecDeque<u8>,
    stream_packets: Vec<Vec<u8>>,
    stream_manual_bursts: u32,
    stream_skips: u32,
    stream_manual: bool,
    ports: [SimPort; 4],
}

impl SimHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes the host will send on the control pipe's OUT data stage.
    pub fn host_send(&mut self, data: &[u8]) {
        self.control_out.extend(data);
    }

    /// Chunks committed on the control IN pipe, in order.
    pub fn control_in_chunks(&self) -> &[Vec<u8>] {
        &self.control_in
    }

    /// Packets committed on the bulk stream, in order.
    pub fn stream_packets(&self) -> &[Vec<u8>] {
        &self.stream_packets
    }

    /// Force a port's pin and direction state, as if set by the hardware.
    pub fn set_port_state(&mut self, port: Port, pins: u8, dir: u8) {
        self.ports[port_index(port)] = SimPort { pins, dir };
    }
}

// Inspection helpers for the test suites.
#[allow(dead_code)]
impl SimHal {
    pub fn stream_manual_bursts(&self) -> u32 {
        self.stream_manual_bursts
    }

    pub fn stream_skips(&self) -> u32 {
        self.stream_skips
    }

    pub fn stream_in_manual(&self) -> bool {
        self.stream_manual
    }
}

fn port_index(port: Port) -> usize {
    match port {
        Port::A => 0,
        Port::B => 1,
        Port::C => 2,
        Port::D => 3,
    }
}

impl Hal for SimHal {
    fn control_capacity(&self) -> usize {
        CONTROL_CAPACITY
    }

    fn control_wait_free(&mut self) {
        // The simulated endpoint is never busy.
    }

    fn control_commit_in(&mut self, data: &[u8]) {
        assert!(data.len() <= CONTROL_CAPACITY);
        self.control_in.push(data.to_vec());
    }

    fn control_receive_out(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.control_out.len()).min(CONTROL_CAPACITY);
        for slot in buf[..n].iter_mut() {
            *slot = self.control_out.pop_front().unwrap();
        }
        n
    }

    fn stream_capacity(&self) -> usize {
        STREAM_CAPACITY
    }

    fn stream_wait_idle(&mut self) {}

    fn stream_begin_manual(&mut self) {
        self.stream_manual = true;
        self.stream_manual_bursts += 1;
    }

    fn stream_commit(&mut self, data: &[u8]) {
        assert!(data.len() <= STREAM_CAPACITY);
        assert!(self.stream_manual, "stream commit outside a manual burst");
        self.stream_packets.push(data.to_vec());
    }

    fn stream_skip_unused(&mut self) {
        self.stream_skips += 1;
    }

    fn stream_end_manual(&mut self) {
        self.stream_manual = false;
    }

    fn pins(&self, port: Port) -> u8 {
        self.ports[port_index(port)].pins
    }

    fn set_pins(&mut self, port: Port, value: u8) {
        self.ports[port_index(port)].pins = value;
    }

    fn dir(&self, port: Port) -> u8 {
        self.ports[port_index(port)].dir
    }

    fn set_dir(&mut self, port: Port, value: u8) {
        self.ports[port_index(port)].dir = value;
    }

    fn sense(&self) -> bool {
        self.pins(Port::A) & SENSE_PIN != 0
    }
}

/// The sixteen TAP controller states, advanced one TMS bit at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapState {
    Reset,
    Idle,
    SelectDr,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIr,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
}

impl TapState {
    /// Next state after one TCK with TMS at `tms`.
    pub fn step(self, tms: bool) -> TapState {
        use TapState::*;
        match (self, tms) {
            (Reset, false) => Idle,
            (Reset, true) => Reset,
            (Idle, false) => Idle,
            (Idle, true) => SelectDr,
            (SelectDr, false) => CaptureDr,
            (SelectDr, true) => SelectIr,
            (CaptureDr, false) => ShiftDr,
            (CaptureDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (Exit1Dr, false) => PauseDr,
            (Exit1Dr, true) => UpdateDr,
            (PauseDr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (Exit2Dr, false) => ShiftDr,
            (Exit2Dr, true) => UpdateDr,
            (UpdateDr, false) => Idle,
            (UpdateDr, true) => SelectDr,
            (SelectIr, false) => CaptureIr,
            (SelectIr, true) => Reset,
            (CaptureIr, false) => ShiftIr,
            (CaptureIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (Exit1Ir, false) => PauseIr,
            (Exit1Ir, true) => UpdateIr,
            (PauseIr, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (Exit2Ir, false) => ShiftIr,
            (Exit2Ir, true) => UpdateIr,
            (UpdateIr, false) => Idle,
            (UpdateIr, true) => SelectIr,
        }
    }
}

/// Soft JTAG engine: tracks TAP state, counts clocks and records executed
/// shifts. The bring-up below it is assumed to leave the TAP in
/// Run-Test/Idle.
#[derive(Debug)]
pub struct SimJtag {
    enabled: bool,
    tap: TapState,
    fsm_transitions: u32,
    idle_clocks: u64,
    staged: Option<(u32, ShiftOptions)>,
    executed: Vec<(u32, ShiftOptions)>,
    replay_result: u8,
    replay_runs: u32,
    replay_initialized: bool,
    replay_ran_with_drive: bool,
}

impl SimJtag {
    pub fn new() -> Self {
        Self {
            enabled: false,
            tap: TapState::Idle,
            fsm_transitions: 0,
            idle_clocks: 0,
            staged: None,
            executed: Vec::new(),
            replay_result: 0,
            replay_runs: 0,
            replay_initialized: false,
            replay_ran_with_drive: false,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn tap_state(&self) -> TapState {
        self.tap
    }

    pub fn idle_clocks(&self) -> u64 {
        self.idle_clocks
    }

    /// Shifts run to completion, as `(bit_count, options)` pairs.
    pub fn executed_shifts(&self) -> &[(u32, ShiftOptions)] {
        &self.executed
    }
}

// Inspection helpers for the test suites.
#[allow(dead_code)]
impl SimJtag {
    pub fn fsm_transitions(&self) -> u32 {
        self.fsm_transitions
    }

    pub fn set_replay_result(&mut self, result: u8) {
        self.replay_result = result;
    }

    pub fn replay_runs(&self) -> u32 {
        self.replay_runs
    }

    pub fn replay_ran_with_drive(&self) -> bool {
        self.replay_ran_with_drive
    }
}

impl Default for SimJtag {
    fn default() -> Self {
        Self::new()
    }
}

impl JtagEngine for SimJtag {
    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn begin_shift(&mut self, bit_count: u32, options: ShiftOptions) {
        self.staged = Some((bit_count, options));
    }

    fn execute_shift(&mut self) {
        if let Some(op) = self.staged.take() {
            self.executed.push(op);
        }
    }

    fn clock_fsm(&mut self, pattern: u32, transition_count: u8) {
        let count = (transition_count as usize).min(32);
        for tms in pattern.view_bits::<Lsb0>()[..count].iter().by_vals() {
            self.tap = self.tap.step(tms);
            self.fsm_transitions += 1;
        }
    }

    fn clock_idle(&mut self, count: u32) {
        self.idle_clocks += count as u64;
    }

    fn replay_init(&mut self) {
        self.replay_initialized = true;
    }

    fn replay_run(&mut self) -> u8 {
        assert!(self.replay_initialized, "replay run without init");
        self.replay_runs += 1;
        self.replay_ran_with_drive = self.enabled;
        self.replay_result
    }
}

/// RAM-backed configuration memory with a sequential read cursor and a
/// record of every block access.
#[derive(Debug)]
pub struct SimProm {
    mem: Vec<u8>,
    cursor: usize,
    reading: bool,
    short_reads: bool,
    block_reads: Vec<(u8, u16, usize)>,
    block_writes: Vec<(u8, u16, Vec<u8>)>,
}

impl SimProm {
    /// Blank (erased) memory of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self::with_image(&vec![0xFF; size])
    }

    /// Memory preloaded with `image` at address zero.
    pub fn with_image(image: &[u8]) -> Self {
        Self {
            mem: image.to_vec(),
            cursor: 0,
            reading: false,
            short_reads: false,
            block_reads: Vec::new(),
            block_writes: Vec::new(),
        }
    }

    pub fn load(&mut self, addr: u16, data: &[u8]) {
        let addr = addr as usize;
        if self.mem.len() < addr + data.len() {
            self.mem.resize(addr + data.len(), 0xFF);
        }
        self.mem[addr..addr + data.len()].copy_from_slice(data);
    }
}

// Inspection helpers for the test suites.
#[allow(dead_code)]
impl SimProm {
    pub fn contents(&self, addr: u16, len: usize) -> Vec<u8> {
        self.mem[addr as usize..addr as usize + len].to_vec()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn read_session_open(&self) -> bool {
        self.reading
    }

    /// Make `read_block` fill only half of each buffer, emulating a short
    /// driver write.
    pub fn set_short_reads(&mut self, short: bool) {
        self.short_reads = short;
    }

    /// Block reads issued, as `(device, address, length)`.
    pub fn block_reads(&self) -> &[(u8, u16, usize)] {
        &self.block_reads
    }

    /// Block writes issued, as `(device, address, data)`.
    pub fn block_writes(&self) -> &[(u8, u16, Vec<u8>)] {
        &self.block_writes
    }
}

impl PromEngine for SimProm {
    fn start_read(&mut self, addr: u16) {
        self.cursor = addr as usize;
        self.reading = true;
    }

    fn peek_byte(&mut self) -> u8 {
        assert!(self.reading, "peek outside a read session");
        self.mem.get(self.cursor).copied().unwrap_or(0xFF)
    }

    fn advance(&mut self) {
        assert!(self.reading, "advance outside a read session");
        self.cursor += 1;
    }

    fn stop_read(&mut self) {
        self.reading = false;
    }

    fn read_block(&mut self, device: u8, addr: u16, buf: &mut [u8]) {
        self.block_reads.push((device, addr, buf.len()));
        let n = if self.short_reads { buf.len() / 2 } else { buf.len() };
        let addr = addr as usize;
        for (i, slot) in buf[..n].iter_mut().enumerate() {
            *slot = self.mem.get(addr + i).copied().unwrap_or(0xFF);
        }
    }

    fn write_block(&mut self, device: u8, addr: u16, data: &[u8]) {
        self.block_writes.push((device, addr, data.to_vec()));
        self.load(addr, data);
    }
}

/// Builder for boot images in the configuration-memory layout: magic,
/// identifier header, length-delimited records, sentinel, firmware blob.
#[derive(Debug)]
pub struct BootImage {
    vid: u16,
    pid: u16,
    did: u16,
    config: u8,
    records: Vec<Vec<u8>>,
    firmware: Vec<u8>,
}

impl BootImage {
    pub fn new() -> Self {
        Self {
            vid: 0x04B4,
            pid: 0x8613,
            did: 0x0001,
            config: 0x04,
            records: Vec::new(),
            firmware: Vec::new(),
        }
    }

    /// Append an auxiliary record with the given payload bytes.
    pub fn record(mut self, data: &[u8]) -> Self {
        assert!(data.len() < 0x8000, "record length would collide with the sentinel bit");
        self.records.push(data.to_vec());
        self
    }

    /// Set the trailing firmware blob.
    pub fn firmware(mut self, data: &[u8]) -> Self {
        self.firmware = data.to_vec();
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![IMAGE_MAGIC];
        image.extend_from_slice(&self.vid.to_le_bytes());
        image.extend_from_slice(&self.pid.to_le_bytes());
        image.extend_from_slice(&self.did.to_le_bytes());
        image.push(self.config);

        for record in &self.records {
            let len = record.len() as u16;
            image.extend_from_slice(&len.to_be_bytes());
            // Two target-address bytes ride along with each record.
            image.extend_from_slice(&[0xE6, 0x00]);
            image.extend_from_slice(record);
        }

        // Sentinel record: length with the top bit set, address, one data
        // byte.
        image.extend_from_slice(&[0x80, 0x01, 0xE6, 0x00, 0x00]);

        image.extend_from_slice(&(self.firmware.len() as u16).to_be_bytes());
        image.extend_from_slice(&self.firmware);
        image
    }
}

impl Default for BootImage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_tms_ones_reset_the_tap_from_anywhere() {
        for start in [
            TapState::Idle,
            TapState::ShiftDr,
            TapState::PauseIr,
            TapState::UpdateDr,
            TapState::Exit2Ir,
        ] {
            let mut state = start;
            for _ in 0..5 {
                state = state.step(true);
            }
            assert_eq!(state, TapState::Reset);
        }
    }

    #[test]
    fn tap_walks_into_shift_dr() {
        let mut jtag = SimJtag::new();
        // TMS 1,0,0 from Run-Test/Idle.
        jtag.clock_fsm(0b001, 3);
        assert_eq!(jtag.tap_state(), TapState::ShiftDr);
        assert_eq!(jtag.fsm_transitions(), 3);
    }

    #[test]
    fn record_layout_matches_the_skip_arithmetic() {
        let image = BootImage::new().record(&[0xAA; 3]).build();
        // magic + 7 header bytes, then the record: length 3 big-endian.
        assert_eq!(image[0], IMAGE_MAGIC);
        assert_eq!(&image[8..10], &[0x00, 0x03]);
        // 2 address bytes + 3 payload bytes, then the sentinel.
        assert_eq!(image[15] & 0x80, 0x80);
    }

    #[test]
    fn prom_cursor_survives_block_access() {
        let mut prom = SimProm::with_image(&[1, 2, 3, 4]);
        prom.start_read(1);
        assert_eq!(prom.peek_byte(), 2);
        prom.advance();
        assert_eq!(prom.peek_byte(), 3);
        prom.stop_read();
        assert!(!prom.read_session_open());
    }
}
