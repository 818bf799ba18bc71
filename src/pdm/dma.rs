//! Seam between a session and the hardware that fills its capture slots
//!
//! On the RP2040 this is a PIO state machine clocking the microphone and one or two DMA channels
//! moving its FIFO into memory. The session only needs the operations below; the integrator wires
//! the DMA completion interrupt to [`crate::session::Capture::on_slot_complete`].

use crate::Error;

/// Most transfers that can be chained to fill a ring
pub const MAX_TRANSPORTS: usize = 2;

pub trait CaptureTransport {
    /// Acquire `channels` transfer channels, releasing any partial claim on failure
    fn claim(&mut self, channels: usize) -> Result<(), Error>;

    /// Give back everything acquired by `claim`
    fn release(&mut self);

    /// Install the completion notification
    fn listen(&self) -> Result<(), Error>;

    fn unlisten(&self);

    /// Begin filling `slot` on transfer `channel`
    ///
    /// The memory stays valid and untouched by the session until the transfer's completion is
    /// reported, or until `disarm`.
    fn arm(&self, channel: usize, slot: *mut [u8]) -> Result<(), Error>;

    /// Abort all transfers in flight
    fn disarm(&self);
}
