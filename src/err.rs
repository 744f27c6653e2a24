#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("radio device i/o error: {0}")]
    Io(String),

    #[error("radio device operation timed out")]
    Timeout,

    #[error("invalid packet length: {0}")]
    InvalidLength(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("no transmit/receive streams available")]
    NoStreamsAvailable,

    #[error("no buffers available, retry later")]
    NoBuffers,

    #[error("operation timed out")]
    Timeout,

    #[error("stream {0}/{1} has failed")]
    StreamFailed(u8, u8),

    #[error("radio error: {0}")]
    Radio(#[from] DeviceError),

    #[error("pipe closed")]
    PipeClosed,

    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),

    #[error("port {0} already in use")]
    PortInUse(u8),
}
