//! JTAG engine seam and the one-slot continuation engine for deferred
//! shifts.

use bitfield::bitfield;

use crate::bridge::CommandError;

bitfield! {
    /// Option byte carried in a clock-data request.
    #[derive(Copy, Clone, Default, Eq, PartialEq)]
    pub struct ShiftOptions(u8);
    impl Debug;
    /// Shifted-out bits are captured and returned on the bulk IN pipe.
    pub is_response_needed, set_is_response_needed: 0;
    /// Drive constant ones on TDI instead of consuming bulk OUT data.
    pub is_send_ones, set_is_send_ones: 1;
}

/// Bit-level JTAG primitives, implemented by the pin-banging backend.
///
/// `begin_shift`/`execute_shift` split a shift into an arm step and an
/// execution step so the dispatcher can return from the control transaction
/// before the (potentially long) bulk exchange runs. Execution moves shift
/// data through the bulk pipes owned by the backend; from the caller's
/// perspective it is one atomic step.
pub trait JtagEngine {
    /// Drive or tristate the JTAG pins.
    fn set_enabled(&mut self, enabled: bool);

    /// Latch the parameters of the next shift operation.
    fn begin_shift(&mut self, bit_count: u32, options: ShiftOptions);

    /// Run the latched shift to completion.
    fn execute_shift(&mut self);

    /// Clock up to 32 TMS bits LSB-first to walk the TAP state machine.
    fn clock_fsm(&mut self, pattern: u32, transition_count: u8);

    /// Clock the TAP `count` times without changing state.
    fn clock_idle(&mut self, count: u32);

    /// Prepare the captured configuration-vector player for a run.
    fn replay_init(&mut self);

    /// Play the captured configuration vectors to completion, returning an
    /// opaque outcome code (zero = success).
    fn replay_run(&mut self) -> u8;
}

/// Parameters of a shift that has been accepted but not yet executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingShift {
    pub bit_count: u32,
    pub options: ShiftOptions,
}

/// One-slot scheduler for deferred shift operations.
///
/// The dispatcher arms the slot synchronously inside the control
/// transaction; the idle loop drains it. At most one operation is in flight
/// device-wide, and a second arm while the slot is occupied is rejected
/// without touching the in-flight parameters.
#[derive(Debug, Default)]
pub struct ShiftScheduler {
    slot: Option<PendingShift>,
}

impl ShiftScheduler {
    pub fn new() -> Self {
        Self { slot: None }
    }

    /// Arm a shift for later execution.
    pub fn arm(&mut self, op: PendingShift) -> Result<(), CommandError> {
        if self.slot.is_some() {
            return Err(CommandError::ShiftInProgress);
        }
        tracing::debug!("arming shift: {} bits, options {:?}", op.bit_count, op.options);
        self.slot = Some(op);
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.slot.is_some()
    }

    /// Run the pending shift, if any, to completion. Returns whether an
    /// operation was serviced.
    pub fn service(&mut self, jtag: &mut impl JtagEngine) -> bool {
        let Some(op) = self.slot.take() else {
            return false;
        };
        tracing::trace!("executing deferred shift: {} bits", op.bit_count);
        jtag.begin_shift(op.bit_count, op.options);
        jtag.execute_shift();
        true
    }
}
