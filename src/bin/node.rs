//! Demo tracker-node binary: opens an acknowledged stream on port 1 and
//! sends a handful of telemetry frames over a loopback radio, since no real
//! driver is wired up here. Swap `LoopbackDevice` for a real `RadioDevice`
//! implementation to run against hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ert_comm::device::LoopbackDevice;
use ert_comm::device_adapter::{ProtocolDevice, TransceiverDeviceAdapter};
use ert_comm::helpers::transmit_buffer;
use ert_comm::protocol::{CommProtocol, ProtocolConfig};
use ert_comm::transceiver::{CommTransceiver, TransceiverConfig};

const TELEMETRY_PORT: u8 = 1;

fn main() {
    env_logger::init();

    let device = LoopbackDevice::new(255);
    let transceiver = Arc::new(CommTransceiver::start(device, TransceiverConfig::default(), None));
    let adapter: Arc<dyn ProtocolDevice> = Arc::new(TransceiverDeviceAdapter::new(transceiver));
    let protocol = CommProtocol::new(adapter, ProtocolConfig::default());

    let running = AtomicBool::new(true);
    for frame in 0..5u32 {
        let payload = format!("telemetry frame {frame}");
        if let Err(err) = transmit_buffer(&protocol, TELEMETRY_PORT, true, payload.as_bytes()) {
            log::error!("failed to transmit frame {frame}: {err}");
        }
    }
    running.store(false, Ordering::Release);

    protocol.stop();
}
