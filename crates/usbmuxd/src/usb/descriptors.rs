//! Descriptor inspection
//!
//! Pure functions over descriptor copies: picking the usbmux interface,
//! mapping the link speed, and decoding the serial string descriptor.

use crate::usb::{INTERFACE_CLASS, INTERFACE_ENDPOINTS, INTERFACE_PROTOCOL, INTERFACE_SUBCLASS};
use tracing::{info, warn};
use transport::{
    ConfigDescriptor, DeviceKey, Direction, EndpointKind, InterfaceDescriptor, LinkSpeed,
};

/// Capacity of the serial buffer, including the terminating NUL
pub const SERIAL_CAPACITY: usize = 256;

/// Position of the hyphen in a reformatted 24-character serial
const UDID_HYPHEN_AT: usize = 8;

/// Length of a legacy serial that gets a hyphen inserted
const UDID_LEGACY_LEN: usize = 24;

/// The usbmux interface and its endpoint pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedInterface {
    pub interface: u8,
    pub ep_in: u8,
    pub ep_out: u8,
}

/// Find the first usbmux interface with a usable bulk endpoint pair
///
/// Interfaces with the right class but the wrong endpoint layout are
/// reported and skipped.
pub fn select_interface(config: &ConfigDescriptor, key: DeviceKey) -> Option<SelectedInterface> {
    config
        .interfaces
        .iter()
        .filter(|intf| {
            (intf.class_code, intf.sub_class_code, intf.protocol_code)
                == (INTERFACE_CLASS, INTERFACE_SUBCLASS, INTERFACE_PROTOCOL)
        })
        .find_map(|intf| check_endpoints(intf, key))
}

fn check_endpoints(intf: &InterfaceDescriptor, key: DeviceKey) -> Option<SelectedInterface> {
    if intf.endpoints.len() != INTERFACE_ENDPOINTS {
        warn!(
            "Endpoint count mismatch for interface {} of device {}: {}",
            intf.number,
            key,
            intf.endpoints.len()
        );
        return None;
    }

    let (first, second) = (&intf.endpoints[0], &intf.endpoints[1]);
    if first.kind != EndpointKind::Bulk || second.kind != EndpointKind::Bulk {
        warn!(
            "Non-bulk endpoints on interface {} of device {}",
            intf.number, key
        );
        return None;
    }

    match (first.direction(), second.direction()) {
        (Direction::Out, Direction::In) => {
            info!(
                "Found interface {} with endpoints {:02x}/{:02x} for device {}",
                intf.number, first.address, second.address, key
            );
            Some(SelectedInterface {
                interface: intf.number,
                ep_in: second.address,
                ep_out: first.address,
            })
        }
        (Direction::In, Direction::Out) => {
            warn!(
                "Found interface {} with swapped endpoints {:02x}/{:02x} for device {}",
                intf.number, second.address, first.address, key
            );
            Some(SelectedInterface {
                interface: intf.number,
                ep_in: first.address,
                ep_out: second.address,
            })
        }
        _ => {
            warn!(
                "Endpoint type mismatch for interface {} of device {}",
                intf.number, key
            );
            None
        }
    }
}

/// Nominal bit rate of a link speed class
pub fn speed_bps(speed: LinkSpeed) -> u64 {
    match speed {
        LinkSpeed::Low => 1_500_000,
        LinkSpeed::Full => 12_000_000,
        LinkSpeed::Super => 5_000_000_000,
        LinkSpeed::High | LinkSpeed::Unknown | LinkSpeed::SuperPlus => 480_000_000,
    }
}

/// Decoded device serial (UDID)
///
/// Stored in a fixed NUL-terminated buffer. Only ASCII is kept: any code
/// unit outside 0x01..0x80 becomes `'?'`.
#[derive(Clone, PartialEq, Eq)]
pub struct SerialNumber {
    buf: [u8; SERIAL_CAPACITY],
    len: usize,
}

impl SerialNumber {
    pub fn empty() -> Self {
        Self {
            buf: [0; SERIAL_CAPACITY],
            len: 0,
        }
    }

    /// Decode a UTF-16LE string descriptor (bLength, bDescriptorType, units)
    ///
    /// A zero code unit ends the string. Legacy 24-character serials get a
    /// hyphen after the eighth character.
    pub fn from_descriptor(desc: &[u8]) -> Self {
        let mut serial = Self::empty();
        let Some(&declared) = desc.first() else {
            return serial;
        };
        let end = (declared as usize).min(desc.len());

        let mut si = 2;
        while si < end && serial.len < SERIAL_CAPACITY - 1 {
            let lo = desc[si];
            let hi = desc.get(si + 1).copied().unwrap_or(0);
            if lo & 0x80 != 0 || hi != 0 {
                serial.push(b'?');
            } else if lo == 0 {
                break;
            } else {
                serial.push(lo);
            }
            si += 2;
        }

        if serial.len == UDID_LEGACY_LEN {
            serial
                .buf
                .copy_within(UDID_HYPHEN_AT..UDID_LEGACY_LEN, UDID_HYPHEN_AT + 1);
            serial.buf[UDID_HYPHEN_AT] = b'-';
            serial.len += 1;
            serial.buf[serial.len] = 0;
        }
        serial
    }

    fn push(&mut self, byte: u8) {
        self.buf[self.len] = byte;
        self.len += 1;
        self.buf[self.len] = 0;
    }

    pub fn as_str(&self) -> &str {
        // only ASCII and '?' are ever stored
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or_default()
    }

    /// The buffer up to and including the terminating NUL
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.buf[..=self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for SerialNumber {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for SerialNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SerialNumber({:?})", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{create_mock_interface, create_mock_string_descriptor};
    use transport::EndpointDescriptor;

    const KEY: DeviceKey = DeviceKey { bus: 1, address: 4 };

    fn usbmux_interface(number: u8, endpoints: &[u8]) -> InterfaceDescriptor {
        create_mock_interface(
            number,
            (INTERFACE_CLASS, INTERFACE_SUBCLASS, INTERFACE_PROTOCOL),
            endpoints,
        )
    }

    fn config(interfaces: Vec<InterfaceDescriptor>) -> ConfigDescriptor {
        ConfigDescriptor {
            number: 4,
            interfaces,
        }
    }

    fn serial_of(text: &str) -> SerialNumber {
        let units: Vec<u16> = text.encode_utf16().collect();
        SerialNumber::from_descriptor(&create_mock_string_descriptor(&units))
    }

    #[test]
    fn test_select_out_in_order() {
        let selected = select_interface(&config(vec![usbmux_interface(1, &[0x02, 0x81])]), KEY);
        assert_eq!(
            selected,
            Some(SelectedInterface {
                interface: 1,
                ep_in: 0x81,
                ep_out: 0x02,
            })
        );
    }

    #[test]
    fn test_select_swapped_order() {
        let selected = select_interface(&config(vec![usbmux_interface(2, &[0x85, 0x04])]), KEY);
        assert_eq!(
            selected,
            Some(SelectedInterface {
                interface: 2,
                ep_in: 0x85,
                ep_out: 0x04,
            })
        );
    }

    #[test]
    fn test_same_direction_rejected_and_scan_continues() {
        let interfaces = vec![
            usbmux_interface(0, &[0x81, 0x82]),
            usbmux_interface(1, &[0x01, 0x02]),
            usbmux_interface(2, &[0x03]),
            usbmux_interface(3, &[0x04, 0x83]),
        ];
        let selected = select_interface(&config(interfaces), KEY).unwrap();
        assert_eq!(selected.interface, 3);
    }

    #[test]
    fn test_wrong_class_or_kind_ignored() {
        let mut interrupt = usbmux_interface(1, &[0x02, 0x81]);
        interrupt.endpoints[1] = EndpointDescriptor {
            address: 0x81,
            kind: EndpointKind::Interrupt,
            max_packet_size: 64,
        };
        let interfaces = vec![
            create_mock_interface(0, (0x06, 0x01, 0x01), &[0x02, 0x81]),
            create_mock_interface(1, (0xff, 0xfe, 0x01), &[0x02, 0x81]),
            interrupt,
        ];
        assert_eq!(select_interface(&config(interfaces), KEY), None);
        assert_eq!(select_interface(&config(Vec::new()), KEY), None);
    }

    #[test]
    fn test_speed_table() {
        assert_eq!(speed_bps(LinkSpeed::Low), 1_500_000);
        assert_eq!(speed_bps(LinkSpeed::Full), 12_000_000);
        assert_eq!(speed_bps(LinkSpeed::High), 480_000_000);
        assert_eq!(speed_bps(LinkSpeed::Super), 5_000_000_000);
        assert_eq!(speed_bps(LinkSpeed::SuperPlus), 480_000_000);
        assert_eq!(speed_bps(LinkSpeed::Unknown), 480_000_000);
    }

    #[test]
    fn test_serial_legacy_udid_gets_hyphen() {
        let serial = serial_of("00008030001A35E22EF8802E");
        assert_eq!(serial.as_str(), "00008030-001A35E22EF8802E");
        assert_eq!(serial.len(), 25);
        assert_eq!(serial.as_bytes_with_nul().last(), Some(&0));
    }

    #[test]
    fn test_serial_40_chars_unchanged() {
        let udid = "a".repeat(40);
        assert_eq!(serial_of(&udid).as_str(), udid);
        assert_eq!(serial_of("abc").as_str(), "abc");
    }

    #[test]
    fn test_serial_non_ascii_replaced() {
        let units = [0x41, 0x00e9, 0x0142, 0x0080, 0x42];
        let serial = SerialNumber::from_descriptor(&create_mock_string_descriptor(&units));
        assert_eq!(serial.as_str(), "A???B");
    }

    #[test]
    fn test_serial_stops_at_zero_unit() {
        let units = [0x41, 0x42, 0x00, 0x43];
        let serial = SerialNumber::from_descriptor(&create_mock_string_descriptor(&units));
        assert_eq!(serial.as_str(), "AB");
    }

    #[test]
    fn test_serial_respects_declared_length() {
        let mut desc = create_mock_string_descriptor(&[0x41, 0x42, 0x43]);
        desc[0] = 6;
        assert_eq!(SerialNumber::from_descriptor(&desc).as_str(), "AB");

        // declared longer than the payload actually received
        desc[0] = 200;
        desc.truncate(5);
        assert_eq!(SerialNumber::from_descriptor(&desc).as_str(), "AB");
    }

    #[test]
    fn test_serial_never_overflows() {
        let mut desc = vec![0xffu8, 0x03];
        desc.extend(std::iter::repeat_n([0x41u8, 0x00], 600).flatten());
        let serial = SerialNumber::from_descriptor(&desc);
        assert_eq!(serial.len(), 127);

        assert!(SerialNumber::from_descriptor(&[]).is_empty());
        assert!(SerialNumber::from_descriptor(&[2, 0x03]).is_empty());
    }
}
