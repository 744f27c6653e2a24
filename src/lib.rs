//! Reliable, multiplexed, stream-oriented packet protocol for a half-duplex
//! packet radio link, as used by a tracker node and its gateway.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ert_comm::device::LoopbackDevice;
//! use ert_comm::device_adapter::{ProtocolDevice, TransceiverDeviceAdapter};
//! use ert_comm::protocol::{CommProtocol, ProtocolConfig};
//! use ert_comm::transceiver::{CommTransceiver, TransceiverConfig};
//!
//! let device = LoopbackDevice::new(255);
//! let transceiver = Arc::new(CommTransceiver::start(device, TransceiverConfig::default(), None));
//! let adapter: Arc<dyn ProtocolDevice> = Arc::new(TransceiverDeviceAdapter::new(transceiver));
//! let protocol = CommProtocol::new(adapter, ProtocolConfig::default());
//!
//! let stream = protocol.transmit_stream_open(1, true).unwrap();
//! protocol.transmit_stream_write(stream, b"telemetry frame").unwrap();
//! protocol.transmit_stream_close(stream, false).unwrap();
//! ```

pub mod buffer_pool;
pub mod device;
pub mod device_adapter;
pub mod err;
pub mod helpers;
pub mod packet;
pub mod pipe;
pub mod protocol;
pub mod ring_buffer;
pub mod transceiver;

pub use err::{DeviceError, ProtocolError};
