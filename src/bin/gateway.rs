//! Demo gateway binary: stays in passive receive mode and prints the status
//! of every stream it sees, driven by a loopback radio in absence of real
//! hardware here.

use std::sync::Arc;
use std::time::Duration;

use ert_comm::device::LoopbackDevice;
use ert_comm::device_adapter::{ProtocolDevice, TransceiverDeviceAdapter};
use ert_comm::protocol::{CommProtocol, ProtocolConfig};
use ert_comm::transceiver::{CommTransceiver, TransceiverConfig};

fn main() {
    env_logger::init();

    let device = LoopbackDevice::new(255);
    let transceiver = Arc::new(CommTransceiver::start(device, TransceiverConfig::default(), None));
    let adapter: Arc<dyn ProtocolDevice> = Arc::new(TransceiverDeviceAdapter::new(transceiver));
    let protocol = CommProtocol::new(adapter, ProtocolConfig::default());

    for _ in 0..10 {
        std::thread::sleep(Duration::from_secs(1));
        let status = protocol.status();
        log::info!(
            "received {} packets ({} bytes), {} duplicates",
            status.received_packet_count,
            status.received_byte_count,
            status.duplicate_packet_count
        );
        for stream in protocol.active_streams() {
            log::info!("stream port={} id={} transferred={}", stream.port, stream.stream_id, stream.transferred_byte_count);
        }
    }

    protocol.stop();
}
