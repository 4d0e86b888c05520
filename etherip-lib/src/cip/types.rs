#![forbid(unsafe_code)]

//! Abbreviated CIP data types as they appear in ReadData/WriteData payloads.

use std::fmt;

use crate::codec::Reader;
use crate::error::{EipError, Result};

/// Elementary types a ControlLogix tag read can return. The abbreviated type
/// code is the first word of every ReadData response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipType {
    Bool,
    Sint,
    Int,
    Dint,
    Real,
    Bits,
}

impl CipType {
    pub fn from_abbreviated(code: u16) -> Option<Self> {
        match code {
            0x00C1 => Some(Self::Bool),
            0x00C2 => Some(Self::Sint),
            0x00C3 => Some(Self::Int),
            0x00C4 => Some(Self::Dint),
            0x00CA => Some(Self::Real),
            0x00D3 => Some(Self::Bits),
            _ => None,
        }
    }

    pub fn abbreviated(self) -> u16 {
        match self {
            Self::Bool => 0x00C1,
            Self::Sint => 0x00C2,
            Self::Int => 0x00C3,
            Self::Dint => 0x00C4,
            Self::Real => 0x00CA,
            Self::Bits => 0x00D3,
        }
    }

    /// Bytes per element on the wire.
    pub fn size(self) -> usize {
        match self {
            Self::Bool | Self::Sint => 1,
            Self::Int => 2,
            Self::Dint | Self::Real | Self::Bits => 4,
        }
    }
}

impl fmt::Display for CipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "BOOL",
            Self::Sint => "SINT",
            Self::Int => "INT",
            Self::Dint => "DINT",
            Self::Real => "REAL",
            Self::Bits => "BITS",
        };
        f.write_str(name)
    }
}

/// One decoded element of a typed payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CipValue {
    Bool(bool),
    Sint(i8),
    Int(i16),
    Dint(i32),
    Real(f32),
    Bits(u32),
}

impl fmt::Display for CipValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", u8::from(*v)),
            Self::Sint(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Dint(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::Bits(v) => write!(f, "0x{v:08X}"),
        }
    }
}

/// A typed CIP payload: abbreviated type word followed by raw elements.
/// This is exactly the layout cached in each tag's value buffer.
#[derive(Debug, Clone, Copy)]
pub struct TypedData<'a> {
    pub ty: CipType,
    pub raw: &'a [u8],
}

impl<'a> TypedData<'a> {
    /// Parse `abbreviated_type(2 LE) | value_bytes`.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let code = r.get_u16()?;
        let ty = CipType::from_abbreviated(code)
            .ok_or_else(|| EipError::Type(format!("unknown CIP type 0x{code:04X}")))?;
        Ok(Self { ty, raw: r.rest() })
    }

    pub fn element_count(&self) -> usize {
        self.raw.len() / self.ty.size()
    }

    /// Decode element `idx`, skipping `idx * size(type)` bytes.
    pub fn element(&self, idx: usize) -> Result<CipValue> {
        let size = self.ty.size();
        let mut r = Reader::new(self.raw);
        r.skip(idx * size).map_err(|_| {
            EipError::Type(format!("element {idx} beyond {} data bytes", self.raw.len()))
        })?;
        Ok(match self.ty {
            CipType::Bool => CipValue::Bool(r.get_u8()? != 0),
            CipType::Sint => CipValue::Sint(r.get_u8()? as i8),
            CipType::Int => CipValue::Int(r.get_u16()? as i16),
            CipType::Dint => CipValue::Dint(r.get_u32()? as i32),
            CipType::Real => CipValue::Real(r.get_f32()?),
            CipType::Bits => CipValue::Bits(r.get_u32()?),
        })
    }
}

/// Encode one element from its text form, for the ad-hoc write tool.
pub fn encode_value(ty: CipType, text: &str) -> Result<Vec<u8>> {
    let bad = |t: &str| EipError::Type(format!("'{text}' is not a valid {t}"));
    Ok(match ty {
        CipType::Bool => vec![u8::from(text.parse::<i64>().map_err(|_| bad("BOOL"))? != 0)],
        CipType::Sint => text
            .parse::<i8>()
            .map_err(|_| bad("SINT"))?
            .to_le_bytes()
            .to_vec(),
        CipType::Int => text
            .parse::<i16>()
            .map_err(|_| bad("INT"))?
            .to_le_bytes()
            .to_vec(),
        CipType::Dint => text
            .parse::<i32>()
            .map_err(|_| bad("DINT"))?
            .to_le_bytes()
            .to_vec(),
        CipType::Real => text
            .parse::<f32>()
            .map_err(|_| bad("REAL"))?
            .to_le_bytes()
            .to_vec(),
        CipType::Bits => parse_bits(text).ok_or_else(|| bad("BITS"))?.to_le_bytes().to_vec(),
    })
}

fn parse_bits(text: &str) -> Option<u32> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}
