//! The data-driven payload type system.
//!
//! Event payload schemas are discovered at parse time from metadata
//! records, not compiled in.  A schema is a tree of [`MetadataType`]
//! values; decoding walks the tree against a cursor into the payload.
//!
//! RelLoc and DataLoc exist so a fixed-size event header can carry
//! variable-size trailing data: instead of forcing consumers to scan,
//! the payload embeds a 4-byte descriptor whose high 16 bits are the
//! byte length of the referenced region and whose low 16 bits are its
//! offset — relative to the position just past the descriptor for
//! RelLoc, absolute from the payload start for DataLoc.  Both are only
//! legal over fixed-size element types; that restriction is enforced
//! when the schema is resolved, never deferred to decode time.

use serde::Serialize;
use uuid::Uuid;

use crate::codec::SliceCursor;
use crate::error::{Result, TraceError};

// Wire type codes.
const TYPE_OBJECT: u8 = 1;
const TYPE_BOOLEAN: u8 = 3;
const TYPE_UTF16_CHAR: u8 = 4;
const TYPE_INT8: u8 = 5;
const TYPE_UINT8: u8 = 6;
const TYPE_INT16: u8 = 7;
const TYPE_UINT16: u8 = 8;
const TYPE_INT32: u8 = 9;
const TYPE_UINT32: u8 = 10;
const TYPE_INT64: u8 = 11;
const TYPE_UINT64: u8 = 12;
const TYPE_FLOAT32: u8 = 13;
const TYPE_FLOAT64: u8 = 14;
const TYPE_UTF8_CHAR: u8 = 15;
const TYPE_GUID: u8 = 17;
const TYPE_ARRAY: u8 = 19;
const TYPE_FIXED_ARRAY: u8 = 20;
const TYPE_REL_LOC: u8 = 21;
const TYPE_DATA_LOC: u8 = 22;
const TYPE_VARINT: u8 = 32;
const TYPE_VARUINT: u8 = 33;

/// Caps schema nesting; a hostile stream must not be able to recurse
/// the decoder off the stack.
const MAX_TYPE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PrimitiveKind {
    Boolean,
    Utf16Char,
    Utf8Char,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    Guid,
    VarInt,
    VarUInt,
}

impl PrimitiveKind {
    /// Encoded width in bytes, or `None` for variable-width kinds.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            PrimitiveKind::Boolean => Some(4), // legacy quirk: 4-byte bool
            PrimitiveKind::Utf16Char => Some(2),
            PrimitiveKind::Utf8Char => Some(1),
            PrimitiveKind::Int8 | PrimitiveKind::UInt8 => Some(1),
            PrimitiveKind::Int16 | PrimitiveKind::UInt16 => Some(2),
            PrimitiveKind::Int32 | PrimitiveKind::UInt32 => Some(4),
            PrimitiveKind::Int64 | PrimitiveKind::UInt64 => Some(8),
            PrimitiveKind::Float32 => Some(4),
            PrimitiveKind::Float64 => Some(8),
            PrimitiveKind::Guid => Some(16),
            PrimitiveKind::VarInt | PrimitiveKind::VarUInt => None,
        }
    }
}

/// A parameter's declared binary shape: a closed, recursive variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MetadataType {
    Primitive(PrimitiveKind),
    /// 2-byte element count prefix, then that many elements.
    Array(Box<MetadataType>),
    /// Exactly `n` elements, no count prefix.
    FixedLengthArray(u16, Box<MetadataType>),
    /// Named fields decoded in declared order.
    Object(Vec<(String, MetadataType)>),
    /// Region located relative to the position after its descriptor.
    RelLoc(Box<MetadataType>),
    /// Region located absolute from the payload start.
    DataLoc(Box<MetadataType>),
}

impl MetadataType {
    /// Total encoded width in bytes if this type is fixed-size.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            MetadataType::Primitive(kind) => kind.fixed_size(),
            MetadataType::Array(_) => None,
            MetadataType::FixedLengthArray(n, elem) => {
                elem.fixed_size().map(|s| s * *n as usize)
            }
            MetadataType::Object(fields) => {
                let mut total = 0usize;
                for (_, ty) in fields {
                    total += ty.fixed_size()?;
                }
                Some(total)
            }
            MetadataType::RelLoc(_) | MetadataType::DataLoc(_) => None,
        }
    }

    /// Construct a RelLoc type, rejecting variable-size elements.
    pub fn rel_loc(elem: MetadataType) -> Result<Self> {
        Self::require_fixed(&elem, "RelLoc")?;
        Ok(MetadataType::RelLoc(Box::new(elem)))
    }

    /// Construct a DataLoc type, rejecting variable-size elements.
    pub fn data_loc(elem: MetadataType) -> Result<Self> {
        Self::require_fixed(&elem, "DataLoc")?;
        Ok(MetadataType::DataLoc(Box::new(elem)))
    }

    fn require_fixed(elem: &MetadataType, ctx: &str) -> Result<()> {
        if elem.fixed_size().is_none() {
            return Err(TraceError::protocol(format!(
                "{ctx} over a variable-size element type"
            )));
        }
        Ok(())
    }

    /// Parse one type encoding from a parameter descriptor.
    ///
    /// Illegal RelLoc/DataLoc element shapes fail here, at schema
    /// resolution, so a bad schema can never silently misparse a
    /// payload later.
    pub fn parse(cur: &mut SliceCursor<'_>) -> Result<Self> {
        Self::parse_at_depth(cur, 0)
    }

    fn parse_at_depth(cur: &mut SliceCursor<'_>, depth: usize) -> Result<Self> {
        if depth > MAX_TYPE_DEPTH {
            return Err(TraceError::corrupt("type nesting too deep"));
        }
        let code = cur.u8()?;
        let ty = match code {
            TYPE_BOOLEAN => MetadataType::Primitive(PrimitiveKind::Boolean),
            TYPE_UTF16_CHAR => MetadataType::Primitive(PrimitiveKind::Utf16Char),
            TYPE_UTF8_CHAR => MetadataType::Primitive(PrimitiveKind::Utf8Char),
            TYPE_INT8 => MetadataType::Primitive(PrimitiveKind::Int8),
            TYPE_UINT8 => MetadataType::Primitive(PrimitiveKind::UInt8),
            TYPE_INT16 => MetadataType::Primitive(PrimitiveKind::Int16),
            TYPE_UINT16 => MetadataType::Primitive(PrimitiveKind::UInt16),
            TYPE_INT32 => MetadataType::Primitive(PrimitiveKind::Int32),
            TYPE_UINT32 => MetadataType::Primitive(PrimitiveKind::UInt32),
            TYPE_INT64 => MetadataType::Primitive(PrimitiveKind::Int64),
            TYPE_UINT64 => MetadataType::Primitive(PrimitiveKind::UInt64),
            TYPE_FLOAT32 => MetadataType::Primitive(PrimitiveKind::Float32),
            TYPE_FLOAT64 => MetadataType::Primitive(PrimitiveKind::Float64),
            TYPE_GUID => MetadataType::Primitive(PrimitiveKind::Guid),
            TYPE_VARINT => MetadataType::Primitive(PrimitiveKind::VarInt),
            TYPE_VARUINT => MetadataType::Primitive(PrimitiveKind::VarUInt),
            TYPE_OBJECT => {
                let count = cur.varuint()? as usize;
                let mut fields = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let name = cur.utf16_string()?;
                    let ty = Self::parse_at_depth(cur, depth + 1)?;
                    fields.push((name, ty));
                }
                MetadataType::Object(fields)
            }
            TYPE_ARRAY => {
                let elem = Self::parse_at_depth(cur, depth + 1)?;
                MetadataType::Array(Box::new(elem))
            }
            TYPE_FIXED_ARRAY => {
                let count = cur.varuint()?;
                let count = u16::try_from(count)
                    .map_err(|_| TraceError::corrupt("fixed array count exceeds u16"))?;
                let elem = Self::parse_at_depth(cur, depth + 1)?;
                MetadataType::FixedLengthArray(count, Box::new(elem))
            }
            TYPE_REL_LOC => Self::rel_loc(Self::parse_at_depth(cur, depth + 1)?)?,
            TYPE_DATA_LOC => Self::data_loc(Self::parse_at_depth(cur, depth + 1)?)?,
            other => {
                return Err(TraceError::corrupt(format!("unknown type code {other}")))
            }
        };
        Ok(ty)
    }
}

/// A decoded payload value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Char(char),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Guid(Uuid),
    /// Arrays of UTF-8/UTF-16 code units collapse to a string rather
    /// than a char vector.
    String(String),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
}

/// Recursively decode one value of type `ty` from the cursor.
///
/// The cursor spans the whole payload so RelLoc/DataLoc regions can be
/// addressed; sequential fields consume from the front as usual.
pub fn decode_value(cur: &mut SliceCursor<'_>, ty: &MetadataType) -> Result<Value> {
    match ty {
        MetadataType::Primitive(kind) => decode_primitive(cur, *kind),
        MetadataType::Array(elem) => {
            let count = cur.u16()? as usize;
            decode_elements(cur, elem, count)
        }
        MetadataType::FixedLengthArray(count, elem) => {
            decode_elements(cur, elem, *count as usize)
        }
        MetadataType::Object(fields) => {
            let mut out = Vec::with_capacity(fields.len());
            for (name, field_ty) in fields {
                out.push((name.clone(), decode_value(cur, field_ty)?));
            }
            Ok(Value::Object(out))
        }
        MetadataType::RelLoc(elem) => {
            let descriptor = cur.u32()?;
            let base = cur.pos(); // offset counts from just past the descriptor
            decode_located(cur, elem, descriptor, base)
        }
        MetadataType::DataLoc(elem) => {
            let descriptor = cur.u32()?;
            decode_located(cur, elem, descriptor, 0)
        }
    }
}

fn decode_primitive(cur: &mut SliceCursor<'_>, kind: PrimitiveKind) -> Result<Value> {
    Ok(match kind {
        PrimitiveKind::Boolean => Value::Bool(cur.bool32()?),
        PrimitiveKind::Utf16Char => {
            let unit = cur.u16()?;
            Value::Char(char::from_u32(unit as u32).unwrap_or('\u{FFFD}'))
        }
        PrimitiveKind::Utf8Char => Value::Char(cur.u8()? as char),
        PrimitiveKind::Int8 => Value::Int8(cur.i8()?),
        PrimitiveKind::UInt8 => Value::UInt8(cur.u8()?),
        PrimitiveKind::Int16 => Value::Int16(cur.i16()?),
        PrimitiveKind::UInt16 => Value::UInt16(cur.u16()?),
        PrimitiveKind::Int32 => Value::Int32(cur.i32()?),
        PrimitiveKind::UInt32 => Value::UInt32(cur.u32()?),
        PrimitiveKind::Int64 => Value::Int64(cur.i64()?),
        PrimitiveKind::UInt64 => Value::UInt64(cur.u64()?),
        PrimitiveKind::Float32 => Value::Float32(cur.f32()?),
        PrimitiveKind::Float64 => Value::Float64(cur.f64()?),
        PrimitiveKind::Guid => Value::Guid(cur.guid()?),
        PrimitiveKind::VarInt => Value::Int64(cur.varint()?),
        PrimitiveKind::VarUInt => Value::UInt64(cur.varuint()?),
    })
}

fn decode_elements(
    cur: &mut SliceCursor<'_>,
    elem: &MetadataType,
    count: usize,
) -> Result<Value> {
    // Code-unit arrays collapse to strings.
    match elem {
        MetadataType::Primitive(PrimitiveKind::Utf16Char) => {
            let mut units = Vec::with_capacity(count);
            for _ in 0..count {
                units.push(cur.u16()?);
            }
            Ok(Value::String(String::from_utf16_lossy(&units)))
        }
        MetadataType::Primitive(PrimitiveKind::Utf8Char) => {
            let raw = cur.bytes(count)?;
            Ok(Value::String(String::from_utf8_lossy(raw).into_owned()))
        }
        _ => {
            let mut out = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                out.push(decode_value(cur, elem)?);
            }
            Ok(Value::Array(out))
        }
    }
}

fn decode_located(
    cur: &SliceCursor<'_>,
    elem: &MetadataType,
    descriptor: u32,
    base: usize,
) -> Result<Value> {
    let region_len = (descriptor >> 16) as usize;
    let region_off = (descriptor & 0xFFFF) as usize;

    let elem_size = elem.fixed_size().ok_or_else(|| {
        // Unreachable through `parse`; guards hand-built schemas.
        TraceError::protocol("location over a variable-size element type")
    })?;
    if elem_size == 0 || region_len % elem_size != 0 {
        return Err(TraceError::corrupt(format!(
            "location region length {region_len} not a multiple of element size {elem_size}"
        )));
    }

    let mut region = cur.window(base + region_off, region_len)?;
    let value = decode_elements(&mut region, elem, region_len / elem_size)?;
    if !region.is_empty() {
        return Err(TraceError::corrupt("location region not fully consumed"));
    }
    Ok(value)
}
