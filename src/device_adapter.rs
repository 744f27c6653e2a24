//! Thin shim that lets [`CommProtocol`](crate::protocol::CommProtocol) drive
//! a [`CommTransceiver`] without either owning the other, breaking the
//! protocol/transceiver/device reference cycle the same way the original's
//! device-adapter translation unit does.

use std::sync::Arc;

use crate::device::RadioDevice;
use crate::err::ProtocolError;
use crate::transceiver::{CommTransceiver, ReceiveCallback, TRANSMIT_FLAG_BLOCK, TRANSMIT_FLAG_SET_RECEIVE_ACTIVE};

pub const WRITE_PACKET_FLAG_SET_RECEIVE_ACTIVE: u8 = 0x01;

/// The protocol-facing surface a transport must provide. `CommProtocol` is
/// generic over this trait rather than over `CommTransceiver` directly so
/// that tests can substitute a narrower fake without spinning up the full
/// threaded transceiver.
pub trait ProtocolDevice: Send + Sync {
    fn max_packet_length(&self) -> u32;
    fn write_packet(&self, payload: &[u8], flags: u8) -> Result<u32, ProtocolError>;
    fn set_receive_active(&self, active: bool);
    fn set_receive_callback(&self, callback: Option<ReceiveCallback>);
}

pub struct TransceiverDeviceAdapter<D: RadioDevice + 'static> {
    transceiver: Arc<CommTransceiver<D>>,
}

impl<D: RadioDevice + 'static> TransceiverDeviceAdapter<D> {
    pub fn new(transceiver: Arc<CommTransceiver<D>>) -> Self {
        TransceiverDeviceAdapter { transceiver }
    }
}

impl<D: RadioDevice + 'static> ProtocolDevice for TransceiverDeviceAdapter<D> {
    fn max_packet_length(&self) -> u32 {
        self.transceiver.max_packet_length()
    }

    fn write_packet(&self, payload: &[u8], protocol_flags: u8) -> Result<u32, ProtocolError> {
        let mut flags = TRANSMIT_FLAG_BLOCK;
        if protocol_flags & WRITE_PACKET_FLAG_SET_RECEIVE_ACTIVE != 0 {
            flags |= TRANSMIT_FLAG_SET_RECEIVE_ACTIVE;
        }
        self.transceiver.transmit(payload, flags)
    }

    fn set_receive_active(&self, active: bool) {
        self.transceiver.set_receive_active(active);
    }

    fn set_receive_callback(&self, callback: Option<ReceiveCallback>) {
        self.transceiver.set_receive_callback(callback);
    }
}
