use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes};

macro_rules! try_get_impl {
    ($try_getter:ident, $ty:ty, $getter:ident) => {
        fn $try_getter(&mut self) -> Result<$ty, FrameError> {
            if self.remaining() < size_of::<$ty>() {
                return Err(FrameError::Incomplete);
            }
            Ok(self.$getter())
        }
    };
}

/// Checked big-endian reads over a `Buf`, yielding `FrameError::Incomplete` on underflow
///  instead of panicking. All RSocket fields are fixed-width big-endian.
pub trait TryBuf: Buf {
    try_get_impl!(try_get_u8, u8, get_u8);
    try_get_impl!(try_get_u16, u16, get_u16);
    try_get_impl!(try_get_u32, u32, get_u32);
    try_get_impl!(try_get_u64, u64, get_u64);

    /// 24-bit big-endian unsigned read (metadata length prefixes).
    fn try_get_u24(&mut self) -> Result<u32, FrameError> {
        if self.remaining() < 3 {
            return Err(FrameError::Incomplete);
        }
        Ok(self.get_uint(3) as u32)
    }
}

impl<T: Buf> TryBuf for T {}

/// The checked counterpart for slicing payload bytes out of a decoded frame body.
///
/// NB: `Bytes::copy_to_bytes` is a cheap refcounted slice, so decoded frames share the
///  receive buffer instead of copying per field.
pub fn try_get_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes, FrameError> {
    if buf.remaining() < len {
        return Err(FrameError::Incomplete);
    }
    Ok(buf.copy_to_bytes(len))
}

pub trait BufMutExt: BufMut {
    /// 24-bit big-endian unsigned write. The value must fit in 24 bits.
    fn put_u24(&mut self, value: u32) {
        debug_assert!(value <= 0x00ff_ffff);
        self.put_uint(value as u64, 3);
    }
}

impl<T: BufMut> BufMutExt for T {}
