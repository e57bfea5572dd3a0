//! Wire-level constants and enums shared by the codec and the connection.

/// Worst-case frame header: 2 fixed bytes + 8 extended-length bytes +
/// 4 mask-key bytes.
pub const MAX_HEADER_SIZE: usize = 14;

/// Control frames carry at most this many payload bytes (RFC 6455 §5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcode. Values `3..=7` and `11..=15` are reserved and never
/// constructed; [`Opcode::from_u4`] rejects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0,
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl Opcode {
    /// Decodes the low 4 bits of the first header byte.
    pub fn from_u4(value: u8) -> Option<Self> {
        match value {
            0 => Some(Opcode::Continuation),
            1 => Some(Opcode::Text),
            2 => Some(Opcode::Binary),
            8 => Some(Opcode::Close),
            9 => Some(Opcode::Ping),
            10 => Some(Opcode::Pong),
            _ => None,
        }
    }

    #[inline]
    pub fn is_control(self) -> bool {
        self as u8 >= 8
    }

    #[inline]
    pub fn is_data(self) -> bool {
        !self.is_control()
    }
}

/// Well-known close status codes (RFC 6455 §7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    GoingAway = 1001,
    ProtocolError = 1002,
    UnsupportedData = 1003,
    InvalidPayload = 1007,
    PolicyViolation = 1008,
    MessageTooBig = 1009,
    MandatoryExtension = 1010,
    InternalError = 1011,
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        code as u16
    }
}

/// Whether `code` may appear in a Close frame on the wire.
///
/// 1004 is reserved; 1005, 1006 and 1015 are status-reporting values that
/// must never be sent; 3000–3999 are registry codes and 4000–4999 private.
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_decoding() {
        assert_eq!(Opcode::from_u4(0), Some(Opcode::Continuation));
        assert_eq!(Opcode::from_u4(1), Some(Opcode::Text));
        assert_eq!(Opcode::from_u4(2), Some(Opcode::Binary));
        assert_eq!(Opcode::from_u4(8), Some(Opcode::Close));
        assert_eq!(Opcode::from_u4(9), Some(Opcode::Ping));
        assert_eq!(Opcode::from_u4(10), Some(Opcode::Pong));
        for reserved in (3..=7).chain(11..=15) {
            assert_eq!(Opcode::from_u4(reserved), None, "opcode {reserved}");
        }
    }

    #[test]
    fn control_vs_data() {
        assert!(Opcode::Close.is_control());
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Pong.is_control());
        assert!(Opcode::Continuation.is_data());
        assert!(Opcode::Text.is_data());
        assert!(Opcode::Binary.is_data());
    }

    #[test]
    fn close_code_legality() {
        for code in [1000, 1001, 1002, 1003, 1007, 1008, 1011, 3000, 3999, 4000, 4999] {
            assert!(is_valid_close_code(code), "{code} should be legal");
        }
        for code in [0, 999, 1004, 1005, 1006, 1012, 1015, 1016, 2999, 5000, u16::MAX] {
            assert!(!is_valid_close_code(code), "{code} should be illegal");
        }
    }

    #[test]
    fn close_code_values() {
        assert_eq!(u16::from(CloseCode::Normal), 1000);
        assert_eq!(u16::from(CloseCode::ProtocolError), 1002);
        assert_eq!(u16::from(CloseCode::MessageTooBig), 1009);
        assert!(is_valid_close_code(CloseCode::InternalError.into()));
    }
}
