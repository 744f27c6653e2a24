use std::time::Instant;

use crate::packet::sequence_is_after;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    Transmit,
    Receive,
}

/// One packet's worth of payload kept around so it can be resent if an
/// acknowledgement doesn't arrive in time. Indexed by sequence number modulo
/// the history slab's capacity, same as the original's array-based history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub sequence_number: u8,
    pub flags: u8,
    pub data: Vec<u8>,
}

/// Snapshot of a stream's state, returned by `CommProtocol::stream_info`.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub role: StreamRole,
    pub port: u8,
    pub stream_id: u8,
    pub acks_enabled: bool,
    pub start_of_stream: bool,
    pub end_of_stream: bool,
    pub end_of_stream_pending: bool,
    pub close_pending: bool,
    pub failed: bool,
    pub current_sequence_number: u8,
    pub last_acknowledged_sequence_number: u8,
    pub last_transferred_sequence_number: u8,
    pub transferred_packet_count: u64,
    pub transferred_byte_count: u64,
    pub duplicate_packet_count: u64,
    pub retransmitted_packet_count: u64,
    pub ack_rerequest_count: u32,
    pub end_of_stream_ack_rerequest_count: u32,
    pub received_packet_sequence_number_error_count: u64,
}

pub struct TransmitStream {
    pub used: bool,
    pub port: u8,
    pub stream_id: u8,
    pub acks_enabled: bool,
    pub start_of_stream_sent: bool,
    pub end_of_stream_pending: bool,
    pub end_of_stream: bool,
    pub close_pending: bool,
    pub failed: bool,
    pub current_sequence_number: u8,
    pub last_acknowledged_sequence_number: u8,
    pub last_transferred_sequence_number: u8,
    pub history: Vec<HistoryEntry>,
    pub transferred_packet_count: u64,
    pub transferred_byte_count: u64,
    pub retransmitted_packet_count: u64,
    pub ack_rerequest_count: u32,
    pub end_of_stream_ack_rerequest_count: u32,
    pub last_activity: Instant,
    pub ack_deadline: Option<Instant>,
}

impl TransmitStream {
    pub fn free() -> Self {
        TransmitStream {
            used: false,
            port: 0,
            stream_id: 0,
            acks_enabled: false,
            start_of_stream_sent: false,
            end_of_stream_pending: false,
            end_of_stream: false,
            close_pending: false,
            failed: false,
            current_sequence_number: 0,
            last_acknowledged_sequence_number: 0,
            last_transferred_sequence_number: 0,
            history: Vec::new(),
            transferred_packet_count: 0,
            transferred_byte_count: 0,
            retransmitted_packet_count: 0,
            ack_rerequest_count: 0,
            end_of_stream_ack_rerequest_count: 0,
            last_activity: Instant::now(),
            ack_deadline: None,
        }
    }

    pub fn reset(&mut self, port: u8, stream_id: u8, acks_enabled: bool) {
        let fresh = TransmitStream {
            used: true,
            port,
            stream_id,
            acks_enabled,
            last_activity: Instant::now(),
            ..TransmitStream::free()
        };
        *self = fresh;
    }

    /// True once every packet up to `current_sequence_number` has been
    /// acknowledged (i.e. the history slab is empty).
    pub fn is_fully_acknowledged(&self) -> bool {
        self.history.is_empty()
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            role: StreamRole::Transmit,
            port: self.port,
            stream_id: self.stream_id,
            acks_enabled: self.acks_enabled,
            start_of_stream: self.start_of_stream_sent,
            end_of_stream: self.end_of_stream,
            end_of_stream_pending: self.end_of_stream_pending,
            close_pending: self.close_pending,
            failed: self.failed,
            current_sequence_number: self.current_sequence_number,
            last_acknowledged_sequence_number: self.last_acknowledged_sequence_number,
            last_transferred_sequence_number: self.last_transferred_sequence_number,
            transferred_packet_count: self.transferred_packet_count,
            transferred_byte_count: self.transferred_byte_count,
            duplicate_packet_count: 0,
            retransmitted_packet_count: self.retransmitted_packet_count,
            ack_rerequest_count: self.ack_rerequest_count,
            end_of_stream_ack_rerequest_count: self.end_of_stream_ack_rerequest_count,
            received_packet_sequence_number_error_count: 0,
        }
    }
}

pub struct ReceiveStream {
    pub used: bool,
    pub port: u8,
    pub stream_id: u8,
    pub acks_enabled: bool,
    pub start_of_stream: bool,
    pub end_of_stream: bool,
    pub failed: bool,
    pub expected_sequence_number: u8,
    pub last_acked_sequence_number: u8,
    pub pending_acks: Vec<u8>,
    pub buffer: std::collections::VecDeque<u8>,
    pub reordered: std::collections::BTreeMap<u8, (u8, Vec<u8>)>,
    pub transferred_packet_count: u64,
    pub transferred_byte_count: u64,
    pub duplicate_packet_count: u64,
    pub received_packet_sequence_number_error_count: u64,
    pub last_activity: Instant,
}

impl ReceiveStream {
    pub fn free() -> Self {
        ReceiveStream {
            used: false,
            port: 0,
            stream_id: 0,
            acks_enabled: false,
            start_of_stream: false,
            end_of_stream: false,
            failed: false,
            expected_sequence_number: 0,
            last_acked_sequence_number: 0,
            pending_acks: Vec::new(),
            buffer: std::collections::VecDeque::new(),
            reordered: std::collections::BTreeMap::new(),
            transferred_packet_count: 0,
            transferred_byte_count: 0,
            duplicate_packet_count: 0,
            received_packet_sequence_number_error_count: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn reset(&mut self, port: u8, stream_id: u8, acks_enabled: bool, start_sequence: u8) {
        let fresh = ReceiveStream {
            used: true,
            port,
            stream_id,
            acks_enabled,
            expected_sequence_number: start_sequence,
            last_activity: Instant::now(),
            ..ReceiveStream::free()
        };
        *self = fresh;
    }

    /// Classifies an incoming packet's sequence number against what this
    /// stream expects next.
    pub fn classify(&self, sequence_number: u8) -> PacketOrder {
        if sequence_number == self.expected_sequence_number {
            PacketOrder::Expected
        } else if sequence_is_after(self.expected_sequence_number, sequence_number) {
            PacketOrder::Duplicate
        } else {
            PacketOrder::OutOfOrder
        }
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            role: StreamRole::Receive,
            port: self.port,
            stream_id: self.stream_id,
            acks_enabled: self.acks_enabled,
            start_of_stream: self.start_of_stream,
            end_of_stream: self.end_of_stream,
            end_of_stream_pending: false,
            close_pending: false,
            failed: self.failed,
            current_sequence_number: self.expected_sequence_number,
            last_acknowledged_sequence_number: self.expected_sequence_number.wrapping_sub(1),
            last_transferred_sequence_number: self.expected_sequence_number,
            transferred_packet_count: self.transferred_packet_count,
            transferred_byte_count: self.transferred_byte_count,
            duplicate_packet_count: self.duplicate_packet_count,
            retransmitted_packet_count: 0,
            ack_rerequest_count: 0,
            end_of_stream_ack_rerequest_count: 0,
            received_packet_sequence_number_error_count: self.received_packet_sequence_number_error_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOrder {
    Expected,
    Duplicate,
    OutOfOrder,
}
