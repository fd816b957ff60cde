//! The 2-byte control notification codec.
//!
//! Every notification carries an address-or-type byte followed by a block
//! index. Normal endpoint addresses occupy `0..=0xFB`; the reserved high
//! values select the control messages:
//!
//! - `addr, index`: data for the endpoint at `addr`, payload in the
//!   receiver's RX region starting at block `index`.
//! - `0xFE, index`: the TX block run at `index` is no longer needed by the
//!   remote and can be freed.
//! - `0xFD, index`: handshake offer. The RX block holds the sender's local
//!   endpoint address followed by the zero-terminated endpoint name.
//! - `0xFC, index`: acknowledgement that a previously sent offer buffer in
//!   the TX region may be freed. The freed buffer still carries the local
//!   address whose remote binding just completed.

use shm_notify::Message;

use crate::Error;

/// Endpoint address marking an invalid or empty entry.
pub(crate) const ADDR_INVALID: u8 = 0xFF;

/// Message type releasing a data buffer.
pub(crate) const MSG_RELEASE_DATA: u8 = 0xFE;

/// Message type carrying an endpoint handshake offer.
pub(crate) const MSG_BOUND: u8 = 0xFD;

/// Message type releasing a handshake offer buffer.
pub(crate) const MSG_RELEASE_BOUND: u8 = 0xFC;

/// Highest valid endpoint address.
pub(crate) const ADDR_MAX: u8 = 0xFB;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Control {
    Data { addr: u8, block: u8 },
    ReleaseData { block: u8 },
    Bound { block: u8 },
    ReleaseBound { block: u8 },
}

impl Control {
    pub fn decode(msg: Message) -> Result<Control, Error> {
        let [addr_or_type, block] = msg;
        match addr_or_type {
            MSG_RELEASE_DATA => Ok(Control::ReleaseData { block }),
            MSG_BOUND => Ok(Control::Bound { block }),
            MSG_RELEASE_BOUND => Ok(Control::ReleaseBound { block }),
            addr if addr <= ADDR_MAX => Ok(Control::Data { addr, block }),
            _ => Err(Error::Corrupted),
        }
    }

    pub fn encode(self) -> Message {
        match self {
            Control::Data { addr, block } => [addr, block],
            Control::ReleaseData { block } => [MSG_RELEASE_DATA, block],
            Control::Bound { block } => [MSG_BOUND, block],
            Control::ReleaseBound { block } => [MSG_RELEASE_BOUND, block],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_all_kinds() {
        assert_eq!(
            Control::decode([0x00, 7]),
            Ok(Control::Data { addr: 0, block: 7 })
        );
        assert_eq!(
            Control::decode([ADDR_MAX, 1]),
            Ok(Control::Data { addr: ADDR_MAX, block: 1 })
        );
        assert_eq!(Control::decode([0xFE, 3]), Ok(Control::ReleaseData { block: 3 }));
        assert_eq!(Control::decode([0xFD, 2]), Ok(Control::Bound { block: 2 }));
        assert_eq!(Control::decode([0xFC, 9]), Ok(Control::ReleaseBound { block: 9 }));
    }

    #[test]
    fn invalid_address_is_rejected() {
        assert_eq!(Control::decode([ADDR_INVALID, 0]), Err(Error::Corrupted));
    }

    #[test]
    fn encode_is_the_inverse() {
        for msg in [[0x05, 0x11], [0xFE, 0], [0xFD, 0xFF], [0xFC, 0x80]] {
            assert_eq!(Control::decode(msg).unwrap().encode(), msg);
        }
    }
}
