//! Owns a single [`RadioDevice`] and multiplexes access to it across a
//! maintenance thread, a transmit-dispatch thread and a receive-dispatch
//! thread, the same three-thread split as the original system.
//!
//! The original's transmit path hands off to the device driver's own
//! completion-interrupt thread via a `transmit_wait_queue`/
//! `transmit_result_queue` pair, purely to bridge an asynchronous hardware
//! callback back into the dispatch thread. [`RadioDevice::transmit`] here is
//! synchronous (it returns the transmitted length or an error directly), so
//! that hand-off has no Rust counterpart — the dispatch thread gets its
//! result from the call itself. The queue-and-callback structure around the
//! *receive* path, and the maintenance thread's mode-change responsibilities,
//! are unchanged.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::device::{DeviceStatus, RadioDevice};
use crate::err::{DeviceError, ProtocolError};
use crate::pipe::Pipe;

#[derive(Debug, Clone, Copy)]
pub struct TransceiverConfig {
    pub transmit_buffer_length_packets: usize,
    pub receive_buffer_length_packets: usize,
    pub transmit_timeout_milliseconds: u64,
    pub poll_interval_milliseconds: u64,
    /// 0 disables the cutoff, matching the original.
    pub maximum_receive_time_milliseconds: u64,
}

impl Default for TransceiverConfig {
    fn default() -> Self {
        TransceiverConfig {
            transmit_buffer_length_packets: 16,
            receive_buffer_length_packets: 64,
            transmit_timeout_milliseconds: 5_000,
            poll_interval_milliseconds: 200,
            maximum_receive_time_milliseconds: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransceiverStatus {
    pub transmitted_packet_count: u64,
    pub transmitted_byte_count: u64,
    pub received_packet_count: u64,
    pub received_byte_count: u64,
    pub invalid_received_packet_count: u64,
}

pub const TRANSMIT_FLAG_BLOCK: u8 = 0x01;
pub const TRANSMIT_FLAG_SET_RECEIVE_ACTIVE: u8 = 0x02;

struct TransmitRequest {
    payload: Vec<u8>,
    flags: u8,
    result: Arc<(Mutex<Option<Result<u32, DeviceError>>>, Condvar)>,
}

pub type ReceiveCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

struct Shared<D: RadioDevice> {
    device: Mutex<D>,
    status: Mutex<TransceiverStatus>,
    receive_active: Mutex<bool>,
    receive_mode_started_at: Mutex<Option<Instant>>,
    running: Mutex<bool>,
    event: Condvar,
    config: TransceiverConfig,
    receive_callback: Mutex<Option<ReceiveCallback>>,
}

/// A running transceiver: spawns its background threads on construction and
/// joins them on `stop`/`Drop`.
pub struct CommTransceiver<D: RadioDevice + 'static> {
    shared: Arc<Shared<D>>,
    transmit_queue: Arc<Pipe<TransmitRequest>>,
    maintenance_thread: Option<JoinHandle<()>>,
    transmit_thread: Option<JoinHandle<()>>,
    receive_thread: Option<JoinHandle<()>>,
}

impl<D: RadioDevice + 'static> CommTransceiver<D> {
    pub fn start(device: D, config: TransceiverConfig, receive_callback: Option<ReceiveCallback>) -> Self {
        let shared = Arc::new(Shared {
            device: Mutex::new(device),
            status: Mutex::new(TransceiverStatus::default()),
            receive_active: Mutex::new(false),
            receive_mode_started_at: Mutex::new(None),
            running: Mutex::new(true),
            event: Condvar::new(),
            config,
            receive_callback: Mutex::new(receive_callback),
        });

        let transmit_queue = Pipe::new(config.transmit_buffer_length_packets);

        let maintenance_thread = {
            let shared = shared.clone();
            thread::spawn(move || maintenance_routine(shared))
        };

        let transmit_thread = {
            let shared = shared.clone();
            let queue = transmit_queue.clone();
            thread::spawn(move || transmit_dispatch_routine(shared, queue))
        };

        let receive_thread = {
            let shared = shared.clone();
            thread::spawn(move || receive_dispatch_routine(shared))
        };

        CommTransceiver {
            shared,
            transmit_queue,
            maintenance_thread: Some(maintenance_thread),
            transmit_thread: Some(transmit_thread),
            receive_thread: Some(receive_thread),
        }
    }

    pub fn max_packet_length(&self) -> u32 {
        self.shared.device.lock().unwrap().max_packet_length()
    }

    pub fn set_receive_active(&self, active: bool) {
        *self.shared.receive_active.lock().unwrap() = active;
        self.shared.event.notify_all();
    }

    pub fn set_receive_callback(&self, callback: Option<ReceiveCallback>) {
        *self.shared.receive_callback.lock().unwrap() = callback;
    }

    pub fn status(&self) -> TransceiverStatus {
        *self.shared.status.lock().unwrap()
    }

    pub fn device_status(&self) -> DeviceStatus {
        self.shared.device.lock().unwrap().get_status()
    }

    /// Queues `payload` for transmission. Blocks until the device has
    /// accepted it (or failed) when `flags` includes
    /// [`TRANSMIT_FLAG_BLOCK`], matching the original's default behavior for
    /// protocol-layer transmits.
    pub fn transmit(&self, payload: &[u8], flags: u8) -> Result<u32, ProtocolError> {
        let blocking = flags & TRANSMIT_FLAG_BLOCK != 0;
        let result = Arc::new((Mutex::new(None), Condvar::new()));
        let request = TransmitRequest {
            payload: payload.to_vec(),
            flags,
            result: result.clone(),
        };

        if !self.transmit_queue.push(request) {
            return Err(ProtocolError::PipeClosed);
        }

        if !blocking {
            return Ok(payload.len() as u32);
        }

        let (lock, cvar) = &*result;
        let mut guard = lock.lock().unwrap();
        let timeout = Duration::from_millis(self.shared.config.transmit_timeout_milliseconds);
        loop {
            if let Some(outcome) = guard.take() {
                return outcome.map_err(ProtocolError::Radio);
            }
            let (g, wait_result) = cvar.wait_timeout(guard, timeout).unwrap();
            guard = g;
            if wait_result.timed_out() && guard.is_none() {
                return Err(ProtocolError::Timeout);
            }
        }
    }

    pub fn stop(&mut self) {
        *self.shared.running.lock().unwrap() = false;
        self.shared.event.notify_all();
        self.transmit_queue.close();
        if let Some(handle) = self.maintenance_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.transmit_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.receive_thread.take() {
            let _ = handle.join();
        }
    }
}

impl<D: RadioDevice + 'static> Drop for CommTransceiver<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn maintenance_routine<D: RadioDevice>(shared: Arc<Shared<D>>) {
    let poll_interval = Duration::from_millis(shared.config.poll_interval_milliseconds);
    while *shared.running.lock().unwrap() {
        let receive_active = *shared.receive_active.lock().unwrap();
        if receive_active {
            let mut started = shared.receive_mode_started_at.lock().unwrap();
            if started.is_none() {
                let mut device = shared.device.lock().unwrap();
                if let Err(err) = device.start_receive(true) {
                    warn!("failed to enter continuous receive mode: {err}");
                } else {
                    *started = Some(Instant::now());
                }
            }
        } else {
            let mut started = shared.receive_mode_started_at.lock().unwrap();
            if started.is_some() {
                let mut device = shared.device.lock().unwrap();
                if let Err(err) = device.standby() {
                    warn!("failed to return device to standby: {err}");
                }
                *started = None;
            }
        }

        let guard = shared.running.lock().unwrap();
        let _ = shared.event.wait_timeout(guard, poll_interval).unwrap();
    }
}

fn transmit_dispatch_routine<D: RadioDevice>(shared: Arc<Shared<D>>, queue: Arc<Pipe<TransmitRequest>>) {
    while *shared.running.lock().unwrap() {
        service_receive_active(&shared);

        let request = match queue.pop_timed(Duration::from_millis(shared.config.poll_interval_milliseconds)) {
            Some(request) => request,
            None => continue,
        };

        let outcome = {
            let mut device = shared.device.lock().unwrap();
            device.transmit(&request.payload)
        };

        match &outcome {
            Ok(len) => {
                debug!("transmitted {len} bytes");
                let mut status = shared.status.lock().unwrap();
                status.transmitted_packet_count += 1;
                status.transmitted_byte_count += *len as u64;
                if request.flags & TRANSMIT_FLAG_SET_RECEIVE_ACTIVE != 0 {
                    drop(status);
                    *shared.receive_active.lock().unwrap() = true;
                    shared.event.notify_all();
                }
            }
            Err(err) => error!("transmit failed: {err}"),
        }

        let (lock, cvar) = &*request.result;
        *lock.lock().unwrap() = Some(outcome);
        cvar.notify_all();
    }
}

fn service_receive_active<D: RadioDevice>(shared: &Arc<Shared<D>>) {
    if !*shared.receive_active.lock().unwrap() {
        return;
    }
    if shared.config.maximum_receive_time_milliseconds == 0 {
        return;
    }
    let started = *shared.receive_mode_started_at.lock().unwrap();
    if let Some(started) = started {
        let max = Duration::from_millis(shared.config.maximum_receive_time_milliseconds);
        if started.elapsed() >= max {
            *shared.receive_active.lock().unwrap() = false;
            shared.event.notify_all();
        }
    }
}

fn receive_dispatch_routine<D: RadioDevice>(shared: Arc<Shared<D>>) {
    let max_len = shared.device.lock().unwrap().max_packet_length() as usize;
    let mut buf = vec![0u8; max_len];
    while *shared.running.lock().unwrap() {
        let result = {
            let mut device = shared.device.lock().unwrap();
            device.receive(&mut buf)
        };
        match result {
            Ok(len) => {
                let mut status = shared.status.lock().unwrap();
                status.received_packet_count += 1;
                status.received_byte_count += len as u64;
                drop(status);
                if let Some(callback) = shared.receive_callback.lock().unwrap().clone() {
                    callback(&buf[..len as usize]);
                }
            }
            Err(DeviceError::Timeout) => {
                thread::sleep(Duration::from_millis(shared.config.poll_interval_milliseconds));
            }
            Err(err) => {
                let mut status = shared.status.lock().unwrap();
                status.invalid_received_packet_count += 1;
                drop(status);
                warn!("discarding invalid receive: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LoopbackDevice;
    use std::sync::mpsc;

    #[test]
    fn transmit_blocks_until_device_accepts() {
        let device = LoopbackDevice::new(256);
        let transceiver = CommTransceiver::start(device, TransceiverConfig::default(), None);
        let result = transceiver.transmit(b"hello", TRANSMIT_FLAG_BLOCK).unwrap();
        assert_eq!(result, 5);
    }

    #[test]
    fn receive_callback_fires_for_looped_packet() {
        let device = LoopbackDevice::new(256);
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let callback: ReceiveCallback = Arc::new(move |data: &[u8]| {
            let _ = tx.send(data.to_vec());
        });
        let transceiver = CommTransceiver::start(device, TransceiverConfig::default(), Some(callback));
        transceiver.transmit(b"ping", TRANSMIT_FLAG_BLOCK).unwrap();
        let received = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received, b"ping");
    }
}
