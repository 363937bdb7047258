use std::{
    fmt::Display,
    io::{Error, ErrorKind, Read, Write},
};

use bytepack::{
    BytestreamReader, BytestreamWriter, FromBytestream, ReadBytesExt, ToBytestream, WriteBytesExt,
    BE,
};

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Largest datagram (header plus payload) the transport will emit or accept.
pub const MAX_PACKET: usize = 65535;

const FLAG_CTL: u8 = 0x02;
const FLAG_RST: u8 = 0x04;

/// Control opcode of [`ControlMessage::Connect`].
pub const CTL_CONNECT: u8 = 0;

/// Option kind: end of the option list.
pub const OPT_EOL: u8 = 0;
/// Option kind: no-op filler.
pub const OPT_NOOP: u8 = 1;
/// Option kind: maximum segment size.
pub const OPT_MSS: u8 = 2;
/// Option kind: window scale shift.
pub const OPT_WND_SCALE: u8 = 3;

/// A transport packet assosciated with one conversation between two peers.
///
/// The acknowledgment number always carries the sender's next expected
/// receive sequence, and the window field carries the sender's receive
/// window, right-shifted by its advertised scale factor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub conv: u32,
    pub seq_no: u32,
    pub ack_no: u32,
    pub flags: Flags,
    pub window: u16,
    /// Sender clock (ms) at the time this packet was built.
    pub tsval: u32,
    /// Echo of the most recently observed peer timestamp.
    pub tsecr: u32,

    pub content: Vec<u8>,
}

/// Flags of a [`Packet`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags {
    /// The payload is a control message, not stream data.
    pub ctl: bool,
    /// The sender has reset the connection.
    pub rst: bool,
}

impl Packet {
    #[must_use]
    pub fn new(conv: u32, seq_no: u32, ack_no: u32, window: u16, content: Vec<u8>) -> Packet {
        Packet {
            conv,
            seq_no,
            ack_no,
            flags: Flags::new(),
            window,
            tsval: 0,
            tsecr: 0,
            content,
        }
    }

    /// The number of stream bytes this packet occupies.
    #[must_use]
    pub fn seg_len(&self) -> u32 {
        self.content.len() as u32
    }
}

impl Flags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ctl(mut self, value: bool) -> Self {
        self.ctl = value;
        self
    }

    #[must_use]
    pub fn rst(mut self, value: bool) -> Self {
        self.rst = value;
        self
    }
}

impl Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ctl {
            write!(f, "CTL")?;
        }
        if self.rst {
            write!(f, "RST")?;
        }
        Ok(())
    }
}

impl ToBytestream for Packet {
    type Error = Error;
    fn to_bytestream(&self, stream: &mut BytestreamWriter) -> Result<(), Self::Error> {
        stream.write_u32::<BE>(self.conv)?;
        stream.write_u32::<BE>(self.seq_no)?;
        stream.write_u32::<BE>(self.ack_no)?;

        stream.write_u8(0)?;
        self.flags.to_bytestream(stream)?;
        stream.write_u16::<BE>(self.window)?;

        stream.write_u32::<BE>(self.tsval)?;
        stream.write_u32::<BE>(self.tsecr)?;

        stream.write_all(&self.content)?;
        Ok(())
    }
}

impl FromBytestream for Packet {
    type Error = Error;
    fn from_bytestream(stream: &mut BytestreamReader) -> Result<Self, Self::Error> {
        let conv = stream.read_u32::<BE>()?;
        let seq_no = stream.read_u32::<BE>()?;
        let ack_no = stream.read_u32::<BE>()?;

        let _reserved = stream.read_u8()?;
        let flags = Flags::from_bytestream(stream)?;
        let window = stream.read_u16::<BE>()?;

        let tsval = stream.read_u32::<BE>()?;
        let tsecr = stream.read_u32::<BE>()?;

        let mut content = Vec::new();
        stream.read_to_end(&mut content)?;

        Ok(Packet {
            conv,
            seq_no,
            ack_no,
            flags,
            window,
            tsval,
            tsecr,
            content,
        })
    }
}

impl ToBytestream for Flags {
    type Error = Error;
    fn to_bytestream(&self, stream: &mut BytestreamWriter) -> Result<(), Self::Error> {
        let mut byte = 0u8;
        if self.ctl {
            byte |= FLAG_CTL;
        }
        if self.rst {
            byte |= FLAG_RST;
        }
        stream.write_u8(byte)
    }
}

impl FromBytestream for Flags {
    type Error = Error;
    fn from_bytestream(stream: &mut BytestreamReader) -> Result<Self, Self::Error> {
        let byte = stream.read_u8()?;
        Ok(Flags {
            ctl: byte & FLAG_CTL != 0,
            rst: byte & FLAG_RST != 0,
        })
    }
}

/// Payload of a control (CTL) segment: an opcode, then opcode-defined data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Connection setup, carrying a TCP-style option list.
    Connect(Vec<ConnectOption>),
}

/// Options of a [`ControlMessage::Connect`].
///
/// Each option is a kind byte; all kinds except end-of-list and no-op are
/// followed by a length byte counting only the option data (the window
/// scale option goes on the wire as `3, 1, shift`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOption {
    EndOfList,
    NoOperation,
    MaximumSegmentSize(u16),
    WindowScale(u8),
    Unknown { kind: u8, data: Vec<u8> },
}

impl ToBytestream for ControlMessage {
    type Error = Error;
    fn to_bytestream(&self, stream: &mut BytestreamWriter) -> Result<(), Self::Error> {
        match self {
            Self::Connect(options) => {
                stream.write_u8(CTL_CONNECT)?;
                for option in options {
                    option.to_bytestream(stream)?;
                }
                Ok(())
            }
        }
    }
}

impl FromBytestream for ControlMessage {
    type Error = Error;
    fn from_bytestream(stream: &mut BytestreamReader) -> Result<Self, Self::Error> {
        let opcode = stream.read_u8()?;
        match opcode {
            CTL_CONNECT => {
                let mut options = Vec::new();
                while !stream.is_empty() {
                    let Ok(option) = ConnectOption::from_bytestream(stream) else {
                        // A truncated trailing option ends the list; options
                        // parsed up to this point remain in effect.
                        break;
                    };
                    let done = option == ConnectOption::EndOfList;
                    options.push(option);
                    if done {
                        break;
                    }
                }
                Ok(Self::Connect(options))
            }
            _ => Err(Error::new(
                ErrorKind::InvalidData,
                format!("unknown control code: {opcode}"),
            )),
        }
    }
}

impl ToBytestream for ConnectOption {
    type Error = Error;
    fn to_bytestream(&self, stream: &mut BytestreamWriter) -> Result<(), Self::Error> {
        match self {
            Self::EndOfList => stream.write_u8(OPT_EOL),
            Self::NoOperation => stream.write_u8(OPT_NOOP),
            Self::MaximumSegmentSize(mss) => {
                stream.write_u8(OPT_MSS)?;
                stream.write_u8(2)?;
                stream.write_u16::<BE>(*mss)
            }
            Self::WindowScale(shift) => {
                stream.write_u8(OPT_WND_SCALE)?;
                stream.write_u8(1)?;
                stream.write_u8(*shift)
            }
            Self::Unknown { kind, data } => {
                stream.write_u8(*kind)?;
                stream.write_u8(u8::try_from(data.len()).map_err(|_| {
                    Error::new(ErrorKind::InvalidInput, "option data exceeds u8 length")
                })?)?;
                stream.write_all(data)
            }
        }
    }
}

impl FromBytestream for ConnectOption {
    type Error = Error;
    fn from_bytestream(stream: &mut BytestreamReader) -> Result<Self, Self::Error> {
        let kind = stream.read_u8()?;
        if kind == OPT_EOL {
            return Ok(Self::EndOfList);
        }
        if kind == OPT_NOOP {
            return Ok(Self::NoOperation);
        }

        let len = stream.read_u8()?;
        let mut substream = stream.extract(len as usize)?;

        match (kind, len) {
            (OPT_MSS, 2) => Ok(Self::MaximumSegmentSize(substream.read_u16::<BE>()?)),
            (OPT_WND_SCALE, 1) => Ok(Self::WindowScale(substream.read_u8()?)),
            _ => {
                let mut data = Vec::new();
                substream.read_to_end(&mut data)?;
                Ok(Self::Unknown { kind, data })
            }
        }
    }
}

impl ConnectOption {
    /// The wire kind byte of this option.
    #[must_use]
    pub fn kind(&self) -> u8 {
        match self {
            Self::EndOfList => OPT_EOL,
            Self::NoOperation => OPT_NOOP,
            Self::MaximumSegmentSize(_) => OPT_MSS,
            Self::WindowScale(_) => OPT_WND_SCALE,
            Self::Unknown { kind, .. } => *kind,
        }
    }
}
