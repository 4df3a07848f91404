//! # CA Wire Codec
//!
//! Frame (de)serialization for EPICS Channel Access v4.13, per spec.md
//! §4.1. This module owns the 16/24-byte header layout, the command table,
//! the DBR type-code registry (`ValueKind` × `MetaKind` -> wire type), and
//! payload padding. It intentionally knows nothing about sockets or I/O-IDs
//! — those live in `transport` and `iomux`.

pub mod value;
pub mod wire;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

pub use value::{
    AlarmSeverity, AlarmStatus, Bundle, DisplayLimits, MetaKind, Metadata, ScalarValue, Value,
    ValueKind, MAX_ENUM_STATES, MAX_STRING_SIZE,
};

/// Threshold at which a frame must use the extended 24-byte header
/// (spec.md §4.1: "count >= 0xFFFF or size >= 0xFFFF").
pub const EXTENDED_HEADER_THRESHOLD: u32 = 0xFFFF;

/// CA commands this core must produce/consume (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Version = 0,
    EventAdd = 1,
    EventCancel = 2,
    Read = 3,
    Write = 4,
    Search = 6,
    EventsOff = 8,
    EventsOn = 9,
    ReadSync = 11,
    ReadNotify = 15,
    CreateChannel = 18,
    WriteNotify = 19,
    ClientName = 20,
    HostName = 21,
    AccessRights = 22,
    Echo = 23,
    CreateChFail = 26,
    ServerDisconn = 27,
}

impl Command {
    pub fn from_u16(code: u16) -> Option<Command> {
        use Command::*;
        Some(match code {
            0 => Version,
            1 => EventAdd,
            2 => EventCancel,
            3 => Read,
            4 => Write,
            6 => Search,
            8 => EventsOff,
            9 => EventsOn,
            11 => ReadSync,
            15 => ReadNotify,
            18 => CreateChannel,
            19 => WriteNotify,
            20 => ClientName,
            21 => HostName,
            22 => AccessRights,
            23 => Echo,
            26 => CreateChFail,
            27 => ServerDisconn,
            _ => return None,
        })
    }
}

/// A decoded (or about-to-be-encoded) frame header, normalized regardless
/// of whether it arrived in standard or extended form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: u16,
    pub payload_size: u32,
    pub data_type: u16,
    pub data_count: u32,
    pub parameter1: u32,
    pub parameter2: u32,
}

impl Header {
    pub fn needs_extended_form(&self) -> bool {
        self.payload_size >= EXTENDED_HEADER_THRESHOLD || self.data_count >= EXTENDED_HEADER_THRESHOLD
    }

    /// Write this header, choosing standard (16 byte) or extended (24 byte)
    /// form automatically.
    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        if self.needs_extended_form() {
            w.write_u16::<BigEndian>(self.command)?;
            w.write_u16::<BigEndian>(0xFFFF)?;
            w.write_u16::<BigEndian>(self.data_type)?;
            w.write_u16::<BigEndian>(0xFFFF)?;
            w.write_u32::<BigEndian>(self.parameter1)?;
            w.write_u32::<BigEndian>(self.parameter2)?;
            w.write_u32::<BigEndian>(self.payload_size)?;
            w.write_u32::<BigEndian>(self.data_count)?;
        } else {
            w.write_u16::<BigEndian>(self.command)?;
            w.write_u16::<BigEndian>(self.payload_size as u16)?;
            w.write_u16::<BigEndian>(self.data_type)?;
            w.write_u16::<BigEndian>(self.data_count as u16)?;
            w.write_u32::<BigEndian>(self.parameter1)?;
            w.write_u32::<BigEndian>(self.parameter2)?;
        }
        Ok(())
    }

    /// Read the first 16 bytes of a header, returning whether an extended
    /// 8-byte trailer must also be read (when `payload_size`/`data_count`
    /// read as `0xFFFF`).
    pub fn decode_standard<R: Read>(r: &mut R) -> io::Result<(Header, bool)> {
        let command = r.read_u16::<BigEndian>()?;
        let payload_size = r.read_u16::<BigEndian>()?;
        let data_type = r.read_u16::<BigEndian>()?;
        let data_count = r.read_u16::<BigEndian>()?;
        let parameter1 = r.read_u32::<BigEndian>()?;
        let parameter2 = r.read_u32::<BigEndian>()?;

        let extended = payload_size == 0xFFFF && data_count == 0xFFFF;
        Ok((
            Header {
                command,
                payload_size: payload_size as u32,
                data_type,
                data_count: data_count as u32,
                parameter1,
                parameter2,
            },
            extended,
        ))
    }

    /// Read the trailing 8 bytes of an extended header and fold them into
    /// `header`, replacing `parameter1`/`parameter2`/counts as spec.md §4.1
    /// describes (parameter1/parameter2 hold the real value already, the
    /// extended trailer carries the widened payload_size/data_count).
    pub fn decode_extended_tail<R: Read>(r: &mut R, header: &mut Header) -> io::Result<()> {
        let payload_size = r.read_u32::<BigEndian>()?;
        let data_count = r.read_u32::<BigEndian>()?;
        header.payload_size = payload_size;
        header.data_count = data_count;
        Ok(())
    }
}

/// Round a payload length up to the next multiple of 8, per spec.md §4.1
/// ("Payloads are padded to 8-byte multiples").
pub fn padded_len(len: usize) -> usize {
    (len + 7) & !7
}

/// The DBR wire type code for a given (value kind, metadata kind) pair,
/// following CA's own DBR_* numbering (spec.md §3's TypeSupport registry,
/// keyed by (valueKind, metaKind)).
pub fn dbr_type_code(value: ValueKind, meta: MetaKind) -> u16 {
    let base = match value {
        ValueKind::String => 0,
        ValueKind::Short => 1,
        ValueKind::Float => 2,
        ValueKind::Int => 5,
        ValueKind::Double => 6,
        ValueKind::Byte => 4,
    };
    // Enum metadata uses the DBR_*_ENUM column (offset 3) regardless of the
    // channel's native scalar kind; this core always requests GraphicEnum
    // against a Short-native enum channel.
    let (family_base, offset) = match meta {
        MetaKind::Plain => (base, 0),
        MetaKind::Alarm => (7, sts_offset(value)),
        MetaKind::Timestamped => (14, sts_offset(value)),
        MetaKind::Graphic => (21, sts_offset(value)),
        MetaKind::Control => (28, sts_offset(value)),
        MetaKind::GraphicEnum => (21, 3),
    };
    if meta == MetaKind::Plain {
        family_base as u16
    } else {
        (family_base + offset) as u16
    }
}

/// Offset within a STS/TIME/GR/CTRL family for a given value kind, matching
/// CA's fixed column order: string, int(short), float, enum, char, long,
/// double.
fn sts_offset(value: ValueKind) -> i32 {
    match value {
        ValueKind::String => 0,
        ValueKind::Short => 1,
        ValueKind::Float => 2,
        ValueKind::Byte => 4,
        ValueKind::Int => 5,
        ValueKind::Double => 6,
    }
}

/// Inverse of `dbr_type_code`: recover the value kind and metadata kind
/// from a wire type code, used when decoding a response whose declared
/// type we did not ourselves choose (e.g. a server's native type report).
pub fn decode_dbr_type(code: u16) -> Option<(ValueKind, MetaKind)> {
    let code = code as i32;
    if code == 0 {
        return Some((ValueKind::String, MetaKind::Plain));
    }
    let plain = [
        (1, ValueKind::Short),
        (2, ValueKind::Float),
        (4, ValueKind::Byte),
        (5, ValueKind::Int),
        (6, ValueKind::Double),
    ];
    for (c, k) in plain {
        if code == c {
            return Some((k, MetaKind::Plain));
        }
    }
    let families = [
        (7, MetaKind::Alarm),
        (14, MetaKind::Timestamped),
        (21, MetaKind::Graphic),
        (28, MetaKind::Control),
    ];
    for (base, meta) in families {
        let offset = code - base;
        if (0..=6).contains(&offset) {
            let kind = match offset {
                0 => ValueKind::String,
                1 => ValueKind::Short,
                2 => ValueKind::Float,
                3 => return Some((ValueKind::Short, MetaKind::GraphicEnum)),
                4 => ValueKind::Byte,
                5 => ValueKind::Int,
                6 => ValueKind::Double,
                _ => unreachable!(),
            };
            return Some((kind, meta));
        }
    }
    None
}
