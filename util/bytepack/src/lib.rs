#![deny(unused_must_use)]
#![warn(clippy::pedantic)]
#![warn(missing_docs, missing_debug_implementations, unreachable_pub)]
#![allow(clippy::module_name_repetitions)]
#![deny(unsafe_code)]
//! Tools for packing and parsing big-endian bytestreams.
//!
//! Types implement [`ToBytestream`] and [`FromBytestream`] to describe their
//! wire representation. Streams are written through [`BytestreamWriter`]
//! (backed by a `Vec<u8>`) and read through [`BytestreamReader`] (a cursor
//! over a byte slice), both of which interoperate with the `byteorder`
//! extension traits re-exported from this crate.

use std::io::{self, Read, Write};


pub use byteorder::*;

/// A trait for types with a bytestream representation.
///
/// If the type also implements [`FromBytestream`], parsing is expected to be
/// the inverse of serialization.
pub trait ToBytestream {
    /// The type of errors that can occur during serialization.
    type Error;

    /// Appends a serialized representation of `self` to a bytestream writer.
    ///
    /// # Errors
    ///
    /// Fails if the writer cannot hold the bytestream, or if an encoding
    /// invariant of `self` does not hold.
    fn to_bytestream(&self, stream: &mut BytestreamWriter) -> Result<(), Self::Error>;

    /// Serializes `self` into a standalone bytevector.
    ///
    /// # Errors
    ///
    /// See [`ToBytestream::to_bytestream`].
    fn to_vec(&self) -> Result<Vec<u8>, Self::Error> {
        let mut vec = Vec::new();
        let mut stream = BytestreamWriter { buf: &mut vec };
        self.to_bytestream(&mut stream)?;
        Ok(vec)
    }

    /// Serializes `self`, appending the bytestream to an existing vector.
    ///
    /// # Errors
    ///
    /// See [`ToBytestream::to_bytestream`]. On failure, a prefix of the
    /// bytestream may have already been appended to `buf`.
    fn append_to_vec(&self, buf: &mut Vec<u8>) -> Result<(), Self::Error> {
        let mut stream = BytestreamWriter { buf };
        self.to_bytestream(&mut stream)?;
        Ok(())
    }
}

/// A writable bytestream backed by a bytevector.
#[derive(Debug)]
pub struct BytestreamWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl BytestreamWriter<'_> {
    /// Indicates whether the output stream is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }
}

impl Write for BytestreamWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.buf.flush()
    }
}

/// A trait for types that can be parsed from a bytestream.
pub trait FromBytestream: Sized {
    /// The type of errors that can occur during parsing.
    type Error;

    /// Parses an instance of `Self` from a bytestream.
    ///
    /// Parsers need not consume the full stream; trailing bytes remain
    /// readable for the caller.
    ///
    /// # Errors
    ///
    /// Returns a parser-defined error if the bytestream is malformed.
    fn from_bytestream(stream: &mut BytestreamReader) -> Result<Self, Self::Error>;

    /// Parses an instance of `Self` from a slice, discarding trailing bytes.
    ///
    /// # Errors
    ///
    /// See [`FromBytestream::from_bytestream`].
    fn from_slice(slice: &[u8]) -> Result<Self, Self::Error> {
        let mut reader = BytestreamReader { offset: 0, slice };
        Self::from_bytestream(&mut reader)
    }

    /// Parses an instance of `Self` from a slice, advancing the slice over
    /// the consumed bytes on success. On error the slice is left untouched.
    ///
    /// # Errors
    ///
    /// See [`FromBytestream::from_bytestream`].
    fn read_from_slice(slice: &mut &[u8]) -> Result<Self, Self::Error> {
        let mut reader = BytestreamReader { offset: 0, slice };
        let object = Self::from_bytestream(&mut reader)?;
        *slice = reader.remaining();
        Ok(object)
    }
}

/// A readable bytestream over a byte slice, with substream extraction.
#[derive(Debug)]
pub struct BytestreamReader<'a> {
    offset: usize,
    slice: &'a [u8],
}

impl<'a> BytestreamReader<'a> {
    #[inline]
    fn remaining(&self) -> &'a [u8] {
        &self.slice[self.offset..]
    }

    /// Extracts a substream of exactly `n` bytes, advancing `self` past it.
    ///
    /// # Errors
    ///
    /// Fails if fewer than `n` bytes remain.
    pub fn extract(&mut self, n: usize) -> io::Result<BytestreamReader<'_>> {
        if self.remaining().len() < n {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "invalid substream length",
            ));
        }
        let stream = BytestreamReader {
            offset: 0,
            slice: &self.remaining()[..n],
        };
        self.offset += n;
        Ok(stream)
    }

    /// The number of not-yet-consumed bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.remaining().len()
    }

    /// Indicates whether the bytestream is fully consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining().is_empty()
    }
}

impl Read for BytestreamReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let min = buf.len().min(self.remaining().len());
        buf[..min].copy_from_slice(&self.remaining()[..min]);
        self.offset += min;
        Ok(min)
    }
}

macro_rules! impl_number {
    ($($t:ty, $fn_read:ident, $fn_write:ident);+) => {
        $(
            impl FromBytestream for $t {
                type Error = io::Error;
                fn from_bytestream(bytestream: &mut BytestreamReader) -> Result<Self, Self::Error> {
                    bytestream.$fn_read::<BE>()
                }
            }
        )*
        $(
            impl ToBytestream for $t {
                type Error = io::Error;
                fn to_bytestream(&self, bytestream: &mut BytestreamWriter) -> Result<(), Self::Error> {
                    bytestream.$fn_write::<BE>(*self)
                }
            }
        )*
    };
}

impl_number!(
    u16, read_u16, write_u16;
    u32, read_u32, write_u32;
    u64, read_u64, write_u64
);

impl ToBytestream for [u8] {
    type Error = io::Error;
    fn to_bytestream(&self, stream: &mut BytestreamWriter) -> Result<(), Self::Error> {
        stream.write_all(self)
    }
}

impl ToBytestream for Vec<u8> {
    type Error = io::Error;
    fn to_bytestream(&self, stream: &mut BytestreamWriter) -> Result<(), Self::Error> {
        stream.write_all(self)
    }
}
