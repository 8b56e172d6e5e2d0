//! Utility functions and types.

use std::{
    io,
    io::{BufRead, Read, Seek, SeekFrom},
    ops::{Div, Rem},
};

/// A buffered reader limited to a byte range of the underlying stream.
///
/// Positions reported by [`Seek`] are relative to the start of the window. Reads stop at the
/// end of the window.
#[derive(Clone)]
pub struct WindowedReader<T>
where T: BufRead + Seek
{
    base: T,
    begin: u64,
    end: u64,
    pos: u64,
}

impl<T> WindowedReader<T>
where T: BufRead + Seek
{
    /// Creates a window of `size` bytes at `offset`, seeking the underlying stream to its
    /// start.
    pub fn new(mut base: T, offset: u64, size: u64) -> io::Result<Self> {
        base.seek(SeekFrom::Start(offset))?;
        Ok(Self { base, begin: offset, end: offset + size, pos: offset })
    }

    /// The length of the window.
    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 { self.end - self.begin }

    /// Bytes left before the end of the window.
    #[inline]
    pub fn remaining(&self) -> u64 { self.end.saturating_sub(self.pos) }
}

impl<T> BufRead for WindowedReader<T>
where T: BufRead + Seek
{
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(&[]);
        }
        let buf = self.base.fill_buf()?;
        let len = buf.len().min(remaining.try_into().unwrap_or(usize::MAX));
        Ok(&buf[..len])
    }

    #[inline]
    fn consume(&mut self, amt: usize) {
        self.base.consume(amt);
        self.pos += amt as u64;
    }
}

impl<T> Read for WindowedReader<T>
where T: BufRead + Seek
{
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let buf = self.fill_buf()?;
        let len = buf.len().min(out.len());
        out[..len].copy_from_slice(&buf[..len]);
        self.consume(len);
        Ok(len)
    }
}

impl<T> Seek for WindowedReader<T>
where T: BufRead + Seek
{
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => self.begin.saturating_add(p),
            SeekFrom::End(p) => self.end.saturating_add_signed(p),
            SeekFrom::Current(p) => self.pos.saturating_add_signed(p),
        }
        .clamp(self.begin, self.end);
        self.pos = self.base.seek(SeekFrom::Start(target))?;
        Ok(self.pos - self.begin)
    }

    #[inline]
    fn stream_position(&mut self) -> io::Result<u64> { Ok(self.pos - self.begin) }
}

#[inline(always)]
pub(crate) fn div_rem<T>(x: T, y: T) -> (T, T)
where T: Div<Output = T> + Rem<Output = T> + Copy {
    (x / y, x % y)
}

/// Power-of-two alignment.
pub(crate) trait Align {
    fn align_up(self, align: Self) -> Self;
}

macro_rules! impl_align {
    ($($ty:ident),*) => {$(
        impl Align for $ty {
            #[inline(always)]
            fn align_up(self, align: Self) -> Self { (self + (align - 1)) & !(align - 1) }
        }
    )*};
}

impl_align!(u32, u64, usize);

/// Creates a fixed-size array reference from a slice.
macro_rules! array_ref {
    ($slice:expr, $offset:expr, $size:expr) => {{
        #[inline(always)]
        fn to_array<T>(slice: &[T]) -> &[T; $size] {
            unsafe { &*(slice as *const [T] as *const [T; $size]) }
        }
        to_array(&$slice[$offset..$offset + $size])
    }};
}
pub(crate) use array_ref;

/// Compile-time assertion.
macro_rules! static_assert {
    ($condition:expr) => {
        const _: () = core::assert!($condition);
    };
}
pub(crate) use static_assert;

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_windowed_reader() {
        let data = (0u8..100).collect::<Vec<_>>();
        let mut reader = WindowedReader::new(Cursor::new(data), 10, 20).unwrap();
        assert_eq!(reader.len(), 20);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, (10u8..30).collect::<Vec<_>>());
        assert_eq!(reader.seek(SeekFrom::Start(5)).unwrap(), 5);
        assert_eq!(reader.remaining(), 15);
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 15);
        assert_eq!(reader.seek(SeekFrom::End(10)).unwrap(), 20);
    }

    #[test]
    fn test_align() {
        assert_eq!(2049u64.align_up(2048), 4096);
        assert_eq!(4096usize.align_up(2048), 4096);
        assert_eq!(div_rem(4100u64, 2048), (2, 4));
    }
}
