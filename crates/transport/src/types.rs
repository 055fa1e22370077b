//! USB descriptor and device type definitions
//!
//! Plain value copies of the descriptors a backend reads from the bus. The
//! device manager only ever inspects these, so backends convert their native
//! descriptor views into these types once per query.

/// Bus position of a device: (bus number, device address)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub bus: u8,
    pub address: u8,
}

impl DeviceKey {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.bus, self.address)
    }
}

/// Negotiated link speed class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSpeed {
    /// Speed could not be determined
    Unknown,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

/// Endpoint direction, taken from bit 7 of the endpoint address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in an endpoint address
    pub fn of_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Endpoint transfer type (bits 0..1 of bmAttributes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Copy of the standard device descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
    pub num_configurations: u8,
    /// String descriptor index of the serial number (0 = none)
    pub serial_number_index: u8,
}

/// Copy of one endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub kind: EndpointKind,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    pub fn direction(&self) -> Direction {
        Direction::of_address(self.address)
    }
}

/// Copy of the first alternate setting of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Copy of a configuration descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDescriptor {
    /// bConfigurationValue
    pub number: u8,
    pub interfaces: Vec<InterfaceDescriptor>,
}
