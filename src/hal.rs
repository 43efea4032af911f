//! The hardware seam: endpoint buffers, busy flags and raw pin access.
//!
//! Everything below this trait is peripheral bring-up and electrical
//! configuration, which the control plane never touches directly. Waits are
//! spins inside the implementation; there is no scheduler to suspend into.

/// General-purpose I/O port identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    A,
    B,
    C,
    D,
}

/// Access to the endpoint buffers and port pins of the bridge hardware.
///
/// The control pipe carries one setup transaction's data stage at a time,
/// bounded by [`Hal::control_capacity`]. The bulk stream is the packetized
/// IN path used for autoboot firmware streaming; it normally commits packets
/// automatically, but a caller may take manual ownership of packet
/// boundaries for a burst.
pub trait Hal {
    /// Largest chunk the control pipe can carry in one transaction.
    fn control_capacity(&self) -> usize;

    /// Spin until the control endpoint buffer is released by the hardware.
    fn control_wait_free(&mut self);

    /// Commit `data` as one IN transaction on the control pipe.
    fn control_commit_in(&mut self, data: &[u8]);

    /// Arm the control endpoint for OUT data, spin until a chunk arrives,
    /// copy it into `buf` and return its length. The chunk may be shorter
    /// than `buf` if the host sent fewer bytes.
    fn control_receive_out(&mut self, buf: &mut [u8]) -> usize;

    /// Largest packet the bulk stream can carry.
    fn stream_capacity(&self) -> usize;

    /// Spin until the bulk stream FIFO has drained.
    fn stream_wait_idle(&mut self);

    /// Suspend automatic packet commit; the caller owns packet boundaries
    /// until [`Hal::stream_end_manual`].
    fn stream_begin_manual(&mut self);

    /// Commit `data` as one bulk packet.
    fn stream_commit(&mut self, data: &[u8]);

    /// Discard any armed-but-uncommitted stream buffers.
    fn stream_skip_unused(&mut self);

    /// Restore automatic packet commit.
    fn stream_end_manual(&mut self);

    /// Current pin state of `port`.
    fn pins(&self, port: Port) -> u8;

    /// Drive the output latch of `port`.
    fn set_pins(&mut self, port: Port, value: u8);

    /// Current direction register of `port` (1 = output).
    fn dir(&self, port: Port) -> u8;

    /// Set the direction register of `port`.
    fn set_dir(&mut self, port: Port, value: u8);

    /// State of the hardware sense pin reported (inverted) in the status
    /// record's flags byte.
    fn sense(&self) -> bool;
}
