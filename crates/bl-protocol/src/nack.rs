//! NACK bitmask returned by the bootloader and its message table.

use bitflags::bitflags;

bitflags! {
    /// Failure flags set by the device in a reply's `error` byte.
    ///
    /// Declaration order is bit order; [`error_strings`] relies on it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Nack: u8 {
        const INVALID_COMMAND = 1 << 0;
        const INVALID_KEY = 1 << 1;
        const INVALID_ADDRESS = 1 << 2;
        const INVALID_LENGTH = 1 << 3;
        const INVALID_DATA = 1 << 4;
        const INVALID_CRC = 1 << 5;
        const OPERATION_FAILURE = 1 << 6;
    }
}

const MESSAGES: [(Nack, &str); 7] = [
    (Nack::INVALID_COMMAND, "Invalid command"),
    (Nack::INVALID_KEY, "Invalid key"),
    (Nack::INVALID_ADDRESS, "Invalid address"),
    (Nack::INVALID_LENGTH, "Invalid length"),
    (Nack::INVALID_DATA, "Invalid data"),
    (Nack::INVALID_CRC, "Invalid CRC"),
    (Nack::OPERATION_FAILURE, "Operation failure"),
];

impl Nack {
    /// Human-readable message for a single flag.
    pub fn message(self) -> Option<&'static str> {
        MESSAGES
            .iter()
            .find(|(flag, _)| *flag == self)
            .map(|(_, message)| *message)
    }
}

/// Expands a raw error byte into messages, lowest bit first.
///
/// Bit 7 has no meaning on the device and is ignored. A zero byte yields an
/// empty list.
pub fn error_strings(bitmask: u8) -> Vec<String> {
    Nack::from_bits_truncate(bitmask)
        .iter()
        .filter_map(Nack::message)
        .map(str::to_string)
        .collect()
}
