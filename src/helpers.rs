//! Convenience wrappers for whole-buffer and whole-file transfers on top of
//! [`CommProtocol`](crate::protocol::CommProtocol), with the same retry
//! policy as the original helpers translation unit.

use std::fs::File;
use std::io::{Read, Write};
use std::time::Duration;

use log::warn;

use crate::err::ProtocolError;
use crate::protocol::{CommProtocol, StreamHandle};

const TRANSMIT_RETRY_COUNT: u32 = 3;
const TRANSMIT_RETRY_DELAY: Duration = Duration::from_millis(2_000);
const STREAM_READ_TIMEOUT: Duration = Duration::from_millis(5_000);
const FILE_TRANSMIT_BUFFER_LENGTH: usize = 1024;
const STREAM_FILE_DATA_BUFFER_LENGTH: usize = 16_384;

/// Retries `transmit_stream_write` up to [`TRANSMIT_RETRY_COUNT`] times,
/// pausing [`TRANSMIT_RETRY_DELAY`] between attempts on a
/// [`ProtocolError::NoBuffers`] ("retry later") result.
fn write_with_retry(protocol: &CommProtocol, handle: StreamHandle, data: &[u8]) -> Result<usize, ProtocolError> {
    let mut attempt = 0;
    loop {
        match protocol.transmit_stream_write(handle, data) {
            Err(ProtocolError::NoBuffers) if attempt < TRANSMIT_RETRY_COUNT => {
                attempt += 1;
                std::thread::sleep(TRANSMIT_RETRY_DELAY);
            }
            other => return other,
        }
    }
}

fn close_with_retry(protocol: &CommProtocol, handle: StreamHandle, force: bool) -> Result<(), ProtocolError> {
    let mut attempt = 0;
    loop {
        match protocol.transmit_stream_close(handle, force) {
            Err(ProtocolError::NoBuffers) if attempt < TRANSMIT_RETRY_COUNT => {
                attempt += 1;
                std::thread::sleep(TRANSMIT_RETRY_DELAY);
            }
            other => return other,
        }
    }
}

/// Opens a stream, writes the whole buffer, and closes it, force-closing on
/// any failure so a half-sent stream never lingers in the transmit pool.
pub fn transmit_buffer(protocol: &CommProtocol, port: u8, enable_acks: bool, data: &[u8]) -> Result<(), ProtocolError> {
    let handle = protocol.transmit_stream_open(port, enable_acks)?;
    match write_with_retry(protocol, handle, data) {
        Ok(_) => close_with_retry(protocol, handle, false),
        Err(err) => {
            warn!("transmit_buffer failed, force-closing stream: {err}");
            let _ = protocol.transmit_stream_close(handle, true);
            Err(err)
        }
    }
}

/// Transmits a file's contents followed by an optional trailing in-memory
/// buffer on the same stream, then closes it. `running` lets a caller abort
/// an in-progress transfer between chunks.
pub fn transmit_file_and_buffer(
    protocol: &CommProtocol,
    port: u8,
    enable_acks: bool,
    filename: &str,
    trailing: Option<&[u8]>,
    running: &std::sync::atomic::AtomicBool,
) -> Result<(), ProtocolError> {
    use std::sync::atomic::Ordering;

    let handle = protocol.transmit_stream_open(port, enable_acks)?;

    let result = (|| -> Result<(), ProtocolError> {
        let mut file = File::open(filename).map_err(|_| ProtocolError::InvalidPacket("file not found"))?;
        let mut buf = [0u8; FILE_TRANSMIT_BUFFER_LENGTH];
        loop {
            if !running.load(Ordering::Acquire) {
                break;
            }
            let n = file.read(&mut buf).map_err(|_| ProtocolError::InvalidPacket("file read error"))?;
            if n == 0 {
                break;
            }
            write_with_retry(protocol, handle, &buf[..n])?;
        }
        if let Some(tail) = trailing {
            write_with_retry(protocol, handle, tail)?;
        }
        Ok(())
    })();

    match result {
        Ok(()) => close_with_retry(protocol, handle, false),
        Err(err) => {
            warn!("transmit_file_and_buffer failed, force-closing stream: {err}");
            let _ = protocol.transmit_stream_close(handle, true);
            Err(err)
        }
    }
}

pub fn transmit_file(
    protocol: &CommProtocol,
    port: u8,
    enable_acks: bool,
    filename: &str,
    running: &std::sync::atomic::AtomicBool,
) -> Result<(), ProtocolError> {
    transmit_file_and_buffer(protocol, port, enable_acks, filename, None, running)
}

/// Reads a receive stream to completion, retrying indefinitely on a read
/// timeout as long as `running` stays true, accumulating into a growable
/// buffer.
pub fn receive_buffer(
    protocol: &CommProtocol,
    handle: StreamHandle,
    running: &std::sync::atomic::AtomicBool,
) -> Result<Vec<u8>, ProtocolError> {
    use std::sync::atomic::Ordering;

    let mut out = Vec::new();
    let mut chunk = [0u8; STREAM_FILE_DATA_BUFFER_LENGTH];
    loop {
        match protocol.receive_stream_read(handle, &mut chunk, STREAM_READ_TIMEOUT) {
            Ok(0) => break,
            Ok(n) => {
                out.extend_from_slice(&chunk[..n]);
            }
            Err(ProtocolError::Timeout) if running.load(Ordering::Acquire) => {
                continue;
            }
            Err(err) => {
                protocol.receive_stream_close(handle);
                return Err(err);
            }
        }
    }
    protocol.receive_stream_close(handle);
    Ok(out)
}

/// Like [`receive_buffer`] but streams each chunk straight to `filename`,
/// deleting the (empty) output file if nothing was ever received and
/// `delete_empty` is set.
pub fn receive_file(
    protocol: &CommProtocol,
    handle: StreamHandle,
    filename: &str,
    delete_empty: bool,
    running: &std::sync::atomic::AtomicBool,
) -> Result<u64, ProtocolError> {
    use std::sync::atomic::Ordering;

    let mut file = File::create(filename).map_err(|_| ProtocolError::InvalidPacket("could not create output file"))?;
    let mut chunk = [0u8; STREAM_FILE_DATA_BUFFER_LENGTH];
    let mut total: u64 = 0;

    loop {
        match protocol.receive_stream_read(handle, &mut chunk, STREAM_READ_TIMEOUT) {
            Ok(0) => break,
            Ok(n) => {
                file.write_all(&chunk[..n])
                    .map_err(|_| ProtocolError::InvalidPacket("output file write error"))?;
                total += n as u64;
            }
            Err(ProtocolError::Timeout) if running.load(Ordering::Acquire) => {
                continue;
            }
            Err(err) => {
                protocol.receive_stream_close(handle);
                return Err(err);
            }
        }
    }
    protocol.receive_stream_close(handle);

    if total == 0 && delete_empty {
        drop(file);
        let _ = std::fs::remove_file(filename);
    }

    Ok(total)
}
