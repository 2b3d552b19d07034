//! Fixed-layout binary frames exchanged with a yLink.
//!
//! A frame is a 1-byte opcode followed by fields at fixed offsets, the last
//! of which may run to the end of the buffer. Multi-byte integers are
//! little-endian.

pub mod message;

use bytes::{BufMut, BytesMut};
use thiserror::Error;

pub use message::{
    Chunk, Disconnect, FirmwarePacket, FirmwareUpdateRequest, Message, Sealed, StartFirmwareUpload,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty frame")]
    Empty,

    #[error("Expected opcode {expected:#04x}, got {actual:#04x}")]
    WrongOpcode { expected: u8, actual: u8 },

    #[error("Unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("Frame truncated: field `{field}` needs {needed} bytes, frame has {actual}")]
    Truncated {
        field: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("Payload of {0} bytes does not fit a 1-byte size field")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    U32,
    Bytes,
    /// Runs to the end of the frame.
    Rest,
}

/// One entry of a message layout: where a field sits and how wide it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub length: usize,
    pub kind: FieldKind,
}

impl Field {
    pub const fn u8(name: &'static str, offset: usize) -> Self {
        Field {
            name,
            offset,
            length: 1,
            kind: FieldKind::U8,
        }
    }

    pub const fn u32(name: &'static str, offset: usize) -> Self {
        Field {
            name,
            offset,
            length: 4,
            kind: FieldKind::U32,
        }
    }

    pub const fn bytes(name: &'static str, offset: usize, length: usize) -> Self {
        Field {
            name,
            offset,
            length,
            kind: FieldKind::Bytes,
        }
    }

    pub const fn rest(name: &'static str, offset: usize) -> Self {
        Field {
            name,
            offset,
            length: 0,
            kind: FieldKind::Rest,
        }
    }

    pub const fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// Every frame starts with this.
pub const OPCODE: Field = Field::u8("opcode", 0);

/// Reads fields out of a frame by their declared offsets.
pub struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    /// Fails with `WrongOpcode` when the frame is not of the expected type.
    pub fn new(buf: &'a [u8], opcode: u8) -> Result<Self, CodecError> {
        match buf.first() {
            None => Err(CodecError::Empty),
            Some(&actual) if actual != opcode => Err(CodecError::WrongOpcode {
                expected: opcode,
                actual,
            }),
            Some(_) => Ok(FieldReader { buf }),
        }
    }

    fn slice(&self, field: &Field) -> Result<&'a [u8], CodecError> {
        self.buf
            .get(field.offset..field.end())
            .ok_or(CodecError::Truncated {
                field: field.name,
                needed: field.end(),
                actual: self.buf.len(),
            })
    }

    pub fn u8(&self, field: &Field) -> Result<u8, CodecError> {
        Ok(self.slice(field)?[0])
    }

    pub fn u32(&self, field: &Field) -> Result<u32, CodecError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.slice(field)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn array<const N: usize>(&self, field: &Field) -> Result<[u8; N], CodecError> {
        let mut raw = [0u8; N];
        raw.copy_from_slice(self.slice(&Field { length: N, ..*field })?);
        Ok(raw)
    }

    pub fn rest(&self, field: &Field) -> Result<&'a [u8], CodecError> {
        self.buf.get(field.offset..).ok_or(CodecError::Truncated {
            field: field.name,
            needed: field.offset,
            actual: self.buf.len(),
        })
    }

    /// A trailing field whose length was announced by an earlier size field.
    pub fn sized(&self, field: &Field, size: usize) -> Result<&'a [u8], CodecError> {
        self.slice(&Field {
            length: size,
            ..*field
        })
    }
}

/// Builds a frame field by field, in layout order.
pub struct FieldWriter {
    buf: BytesMut,
}

impl FieldWriter {
    pub fn new(opcode: u8) -> Self {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(opcode);
        FieldWriter { buf }
    }

    fn at(&self, field: &Field) {
        debug_assert_eq!(
            self.buf.len(),
            field.offset,
            "field `{}` written out of order",
            field.name
        );
    }

    pub fn put_u8(&mut self, field: &Field, value: u8) -> &mut Self {
        self.at(field);
        self.buf.put_u8(value);
        self
    }

    pub fn put_u32(&mut self, field: &Field, value: u32) -> &mut Self {
        self.at(field);
        self.buf.put_u32_le(value);
        self
    }

    pub fn put_slice(&mut self, field: &Field, value: &[u8]) -> &mut Self {
        self.at(field);
        self.buf.put_slice(value);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}
