use bytes::{Buf, BufMut, Bytes};

use crate::error::ProtocolError;
use crate::util::safe_converter::PrecheckedCast;


macro_rules! checked_get_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> Result<$ty, ProtocolError> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(ProtocolError::Truncated);
            }
            Ok(self.$getter())
        }
    }
}

/// Bounds-checked reading for packet decoding: the plain [Buf] getters panic on underflow, and
///  datagrams from the network must never be able to do that.
pub trait BufExt: Buf {
    checked_get_impl!(checked_get_u8, u8, get_u8);
    checked_get_impl!(checked_get_u16, u16, get_u16);
    checked_get_impl!(checked_get_u32, u32, get_u32);
    checked_get_impl!(checked_get_u128, u128, get_u128);
    checked_get_impl!(checked_get_i64, i64, get_i64);

    /// a UTF-8 string with a u16 length prefix
    fn checked_get_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.checked_get_u16()? as usize;
        if self.remaining() < len {
            return Err(ProtocolError::Truncated);
        }
        let raw = self.copy_to_bytes(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::InvalidGroupName)
    }

    /// a byte sequence with a u32 length prefix
    fn checked_get_payload(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.checked_get_u32()? as usize;
        if self.remaining() < len {
            return Err(ProtocolError::Truncated);
        }
        Ok(self.copy_to_bytes(len))
    }
}

pub trait BufMutExt: BufMut {
    /// NB: callers ensure that the string is shorter than 64k
    fn put_string(&mut self, s: &str) {
        self.put_u16(s.len().prechecked_cast());
        self.put_slice(s.as_bytes());
    }

    /// NB: callers ensure that the payload is shorter than 4G
    fn put_payload(&mut self, payload: &[u8]) {
        self.put_u32(payload.len().prechecked_cast());
        self.put_slice(payload);
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
