//! Asynchronous transfer objects
//!
//! A [`Transfer`] is a single-owner value. Submitting it hands ownership to
//! the transport, and the transport hands it back exactly once, either in
//! the completion callback or inside a [`SubmitError`](crate::SubmitError).
//! Dropping a transfer releases its buffer. There is no other way to free
//! one, so a transfer can never be released twice or while in flight.

use byteorder::{ByteOrder, LittleEndian};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Size of the setup packet at the head of every control transfer buffer
pub const CONTROL_SETUP_SIZE: usize = 8;

/// bmRequestType direction bit: device to host
pub const ENDPOINT_IN: u8 = 0x80;

/// Standard GET_DESCRIPTOR request
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

/// String descriptor type
pub const DESCRIPTOR_TYPE_STRING: u8 = 0x03;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a transfer, unique for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl TransferId {
    fn next() -> Self {
        TransferId(NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Terminal status delivered with every completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferStatus::Completed => "completed",
            TransferStatus::Error => "error",
            TransferStatus::TimedOut => "timed out",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Stall => "stall",
            TransferStatus::NoDevice => "no device",
            TransferStatus::Overflow => "overflow",
        };
        f.write_str(name)
    }
}

/// Completion callback, invoked exactly once per successful submission
pub type CompletionFn = Box<dyn FnOnce(Transfer, TransferStatus) + Send + 'static>;

/// Transfer kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Control transfer on endpoint 0; the buffer starts with the setup packet
    Control,
    /// Bulk transfer on the given endpoint address
    Bulk { endpoint: u8 },
}

/// Control request setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    /// GET_DESCRIPTOR(STRING, `index`) in language `lang_id`
    ///
    /// Index 0 returns the list of language IDs the device supports.
    pub fn get_string_descriptor(index: u8, lang_id: u16, length: u16) -> Self {
        Self {
            request_type: ENDPOINT_IN,
            request: REQUEST_GET_DESCRIPTOR,
            value: ((DESCRIPTOR_TYPE_STRING as u16) << 8) | index as u16,
            index: lang_id,
            length,
        }
    }

    /// Encode as the 8-byte wire format (multi-byte fields little-endian)
    pub fn encode(&self) -> [u8; CONTROL_SETUP_SIZE] {
        let mut raw = [0u8; CONTROL_SETUP_SIZE];
        raw[0] = self.request_type;
        raw[1] = self.request;
        LittleEndian::write_u16(&mut raw[2..4], self.value);
        LittleEndian::write_u16(&mut raw[4..6], self.index);
        LittleEndian::write_u16(&mut raw[6..8], self.length);
        raw
    }

    /// Decode a setup packet from the head of a buffer
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < CONTROL_SETUP_SIZE {
            return None;
        }
        Some(Self {
            request_type: raw[0],
            request: raw[1],
            value: LittleEndian::read_u16(&raw[2..4]),
            index: LittleEndian::read_u16(&raw[4..6]),
            length: LittleEndian::read_u16(&raw[6..8]),
        })
    }
}

/// One asynchronous control or bulk operation
#[derive(Debug)]
pub struct Transfer {
    id: TransferId,
    kind: TransferKind,
    buffer: Vec<u8>,
    actual_length: usize,
    timeout: Option<Duration>,
}

impl Transfer {
    /// Control transfer with room for `setup.length` bytes of data
    pub fn control(setup: ControlSetup, timeout: Option<Duration>) -> Self {
        let mut transfer = Self {
            id: TransferId::next(),
            kind: TransferKind::Control,
            buffer: Vec::new(),
            actual_length: 0,
            timeout,
        };
        transfer.set_control_setup(setup);
        transfer
    }

    /// Bulk IN transfer with a zeroed buffer of `capacity` bytes
    pub fn bulk(endpoint: u8, capacity: usize, timeout: Option<Duration>) -> Self {
        Self {
            id: TransferId::next(),
            kind: TransferKind::Bulk { endpoint },
            buffer: vec![0u8; capacity],
            actual_length: 0,
            timeout,
        }
    }

    /// Bulk OUT transfer carrying `data`
    pub fn bulk_out(endpoint: u8, data: Vec<u8>, timeout: Option<Duration>) -> Self {
        Self {
            id: TransferId::next(),
            kind: TransferKind::Bulk { endpoint },
            buffer: data,
            actual_length: 0,
            timeout,
        }
    }

    /// Rewrite the setup packet, resizing the buffer for the new request
    ///
    /// Used to reuse one control transfer for a chain of requests.
    pub fn set_control_setup(&mut self, setup: ControlSetup) {
        self.kind = TransferKind::Control;
        self.buffer
            .resize(CONTROL_SETUP_SIZE + setup.length as usize, 0);
        self.buffer[..CONTROL_SETUP_SIZE].copy_from_slice(&setup.encode());
        self.buffer[CONTROL_SETUP_SIZE..].fill(0);
        self.actual_length = 0;
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    /// `None` means the transfer never times out
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Setup packet of a control transfer
    pub fn control_setup(&self) -> Option<ControlSetup> {
        match self.kind {
            TransferKind::Control => ControlSetup::decode(&self.buffer),
            TransferKind::Bulk { .. } => None,
        }
    }

    /// The whole buffer, including the setup packet for control transfers
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Mutable view of the whole buffer (backends fill it on completion)
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Bytes actually transferred, excluding the setup packet
    pub fn actual_length(&self) -> usize {
        self.actual_length
    }

    /// Record the completed length, clamped to the data area
    pub fn set_actual_length(&mut self, len: usize) {
        self.actual_length = len.min(self.data_capacity());
    }

    /// Bytes available for data, excluding the setup packet
    pub fn data_capacity(&self) -> usize {
        match self.kind {
            TransferKind::Control => self.buffer.len().saturating_sub(CONTROL_SETUP_SIZE),
            TransferKind::Bulk { .. } => self.buffer.len(),
        }
    }

    /// Data received (or sent) by the last completion
    pub fn data(&self) -> &[u8] {
        match self.kind {
            TransferKind::Control => {
                &self.buffer[CONTROL_SETUP_SIZE..CONTROL_SETUP_SIZE + self.actual_length]
            }
            TransferKind::Bulk { .. } => &self.buffer[..self.actual_length],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_packet_layout() {
        let setup = ControlSetup::get_string_descriptor(0, 0, 1024);
        let raw = setup.encode();

        assert_eq!(raw[0], 0x80); // device-to-host
        assert_eq!(raw[1], 0x06); // GET_DESCRIPTOR
        assert_eq!(raw[2], 0x00); // string index
        assert_eq!(raw[3], 0x03); // descriptor type STRING
        assert_eq!(raw[6], 0x00); // wLength low
        assert_eq!(raw[7], 0x04); // wLength high

        assert_eq!(ControlSetup::decode(&raw), Some(setup));
        assert_eq!(ControlSetup::decode(&raw[..7]), None);
    }

    #[test]
    fn test_control_transfer_reuse_keeps_identity() {
        let mut transfer = Transfer::control(
            ControlSetup::get_string_descriptor(0, 0, 1024),
            Some(Duration::from_millis(1000)),
        );
        let id = transfer.id();
        assert_eq!(transfer.buffer().len(), CONTROL_SETUP_SIZE + 1024);

        transfer.buffer_mut()[CONTROL_SETUP_SIZE] = 4;
        transfer.set_actual_length(4);
        assert_eq!(transfer.data().len(), 4);

        transfer.set_control_setup(ControlSetup::get_string_descriptor(3, 0x0409, 1024));
        assert_eq!(transfer.id(), id);
        assert_eq!(transfer.actual_length(), 0);
        assert_eq!(transfer.buffer()[CONTROL_SETUP_SIZE], 0);

        let setup = transfer.control_setup().unwrap();
        assert_eq!(setup.value & 0xff, 3);
        assert_eq!(setup.index, 0x0409);
    }

    #[test]
    fn test_actual_length_is_clamped() {
        let mut transfer = Transfer::bulk(0x81, 16, None);
        transfer.set_actual_length(64);
        assert_eq!(transfer.actual_length(), 16);
        assert!(transfer.control_setup().is_none());
    }

    #[test]
    fn test_transfer_ids_are_unique() {
        let a = Transfer::bulk(0x81, 1, None);
        let b = Transfer::bulk(0x81, 1, None);
        assert_ne!(a.id(), b.id());
    }
}
