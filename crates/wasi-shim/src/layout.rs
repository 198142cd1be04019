//! Field-list descriptions of fixed-size records.
//!
//! A `StructLayout` is an ordered list of named primitive fields with computed
//! byte offsets.  It can read and write a record at any address of a
//! `MemoryHandler`, and is used to decode records for tracing and to check the
//! typed records in `abi` against their field lists.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use crate::{engines::common::HostCallError, memory::MemoryHandler};
use err_derive::Error;
use serde::{Deserialize, Serialize};
use std::{convert::TryInto, fmt, str::FromStr};

////////////////////////////////////////////////////////////////////////////////
// Errors.
////////////////////////////////////////////////////////////////////////////////

/// Failures of the struct codec.  None of these is ever recovered by
/// reinterpreting data: the operation fails closed.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error(display = "LayoutError: unsupported primitive type '{}'.", _0)]
    UnsupportedPrimitive(String),
    #[error(display = "LayoutError: no field named '{}'.", _0)]
    UnknownField(String),
    #[error(
        display = "LayoutError: field '{}' is declared {:?} but got a {:?} value.",
        field,
        expected,
        found
    )]
    TypeMismatch {
        field: String,
        expected: Primitive,
        found: Primitive,
    },
    #[error(display = "LayoutError: expected {} values, got {}.", expected, found)]
    ArityMismatch { expected: usize, found: usize },
    #[error(display = "LayoutError: expected {} bytes, got {}.", expected, found)]
    SizeMismatch { expected: u32, found: usize },
    #[error(display = "LayoutError: memory access failed: {}.", _0)]
    Memory(HostCallError),
}

impl From<HostCallError> for LayoutError {
    fn from(error: HostCallError) -> Self {
        LayoutError::Memory(error)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Primitives and values.
////////////////////////////////////////////////////////////////////////////////

/// The primitive little-endian numeric types a field may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Primitive {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl Primitive {
    /// Width of the primitive in bytes, which is also its natural alignment.
    #[inline]
    pub const fn size(self) -> u32 {
        match self {
            Primitive::U8 | Primitive::I8 => 1,
            Primitive::U16 | Primitive::I16 => 2,
            Primitive::U32 | Primitive::I32 => 4,
            Primitive::U64 | Primitive::I64 => 8,
        }
    }
}

/// Accepts the Rust spellings (`u8` .. `i64`) and the `DataView` accessor
/// spellings (`Uint8` .. `BigInt64`).
impl FromStr for Primitive {
    type Err = LayoutError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "u8" | "Uint8" => Ok(Primitive::U8),
            "u16" | "Uint16" => Ok(Primitive::U16),
            "u32" | "Uint32" => Ok(Primitive::U32),
            "u64" | "BigUint64" => Ok(Primitive::U64),
            "i8" | "Int8" => Ok(Primitive::I8),
            "i16" | "Int16" => Ok(Primitive::I16),
            "i32" | "Int32" => Ok(Primitive::I32),
            "i64" | "BigInt64" => Ok(Primitive::I64),
            otherwise => Err(LayoutError::UnsupportedPrimitive(otherwise.to_string())),
        }
    }
}

/// A field value tagged with its primitive type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
}

impl Value {
    pub fn primitive(&self) -> Primitive {
        match self {
            Value::U8(_) => Primitive::U8,
            Value::U16(_) => Primitive::U16,
            Value::U32(_) => Primitive::U32,
            Value::U64(_) => Primitive::U64,
            Value::I8(_) => Primitive::I8,
            Value::I16(_) => Primitive::I16,
            Value::I32(_) => Primitive::I32,
            Value::I64(_) => Primitive::I64,
        }
    }

    fn to_le_bytes(self) -> Vec<u8> {
        match self {
            Value::U8(v) => v.to_le_bytes().to_vec(),
            Value::U16(v) => v.to_le_bytes().to_vec(),
            Value::U32(v) => v.to_le_bytes().to_vec(),
            Value::U64(v) => v.to_le_bytes().to_vec(),
            Value::I8(v) => v.to_le_bytes().to_vec(),
            Value::I16(v) => v.to_le_bytes().to_vec(),
            Value::I32(v) => v.to_le_bytes().to_vec(),
            Value::I64(v) => v.to_le_bytes().to_vec(),
        }
    }

    /// `bytes` must be exactly `primitive.size()` long.
    fn from_le_bytes(primitive: Primitive, bytes: &[u8]) -> Result<Self, LayoutError> {
        let mismatch = || LayoutError::SizeMismatch {
            expected: primitive.size(),
            found: bytes.len(),
        };
        Ok(match primitive {
            Primitive::U8 => Value::U8(u8::from_le_bytes(bytes.try_into().map_err(|_| mismatch())?)),
            Primitive::U16 => {
                Value::U16(u16::from_le_bytes(bytes.try_into().map_err(|_| mismatch())?))
            }
            Primitive::U32 => {
                Value::U32(u32::from_le_bytes(bytes.try_into().map_err(|_| mismatch())?))
            }
            Primitive::U64 => {
                Value::U64(u64::from_le_bytes(bytes.try_into().map_err(|_| mismatch())?))
            }
            Primitive::I8 => Value::I8(i8::from_le_bytes(bytes.try_into().map_err(|_| mismatch())?)),
            Primitive::I16 => {
                Value::I16(i16::from_le_bytes(bytes.try_into().map_err(|_| mismatch())?))
            }
            Primitive::I32 => {
                Value::I32(i32::from_le_bytes(bytes.try_into().map_err(|_| mismatch())?))
            }
            Primitive::I64 => {
                Value::I64(i64::from_le_bytes(bytes.try_into().map_err(|_| mismatch())?))
            }
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::I8(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Layouts.
////////////////////////////////////////////////////////////////////////////////

/// How offsets are assigned to fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packing {
    /// Each offset is the running sum of the sizes of the fields before it.
    Packed,
    /// Each field is aligned to its own size and the record is padded to its
    /// largest alignment, as a C compiler lays it out.
    Aligned,
}

/// A field of a `StructLayout`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub primitive: Primitive,
    pub offset: u32,
}

/// An ordered list of fields with computed offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    fields: Vec<Field>,
    size: u32,
}

#[inline]
fn align_up(offset: u32, alignment: u32) -> u32 {
    (offset + alignment - 1) / alignment * alignment
}

impl StructLayout {
    pub fn new(fields: &[(&str, Primitive)], packing: Packing) -> Self {
        let mut offset = 0;
        let mut max_align = 1;
        let fields = fields
            .iter()
            .map(|(name, primitive)| {
                if packing == Packing::Aligned {
                    offset = align_up(offset, primitive.size());
                    max_align = max_align.max(primitive.size());
                }
                let field = Field {
                    name: name.to_string(),
                    primitive: *primitive,
                    offset,
                };
                offset += primitive.size();
                field
            })
            .collect();
        StructLayout {
            fields,
            size: align_up(offset, max_align),
        }
    }

    #[inline]
    pub fn packed(fields: &[(&str, Primitive)]) -> Self {
        Self::new(fields, Packing::Packed)
    }

    #[inline]
    pub fn aligned(fields: &[(&str, Primitive)]) -> Self {
        Self::new(fields, Packing::Aligned)
    }

    /// Builds a layout from `(field name, primitive name)` pairs.  Fails on the
    /// first primitive name that is not recognised.
    pub fn parse(fields: &[(&str, &str)], packing: Packing) -> Result<Self, LayoutError> {
        let typed = fields
            .iter()
            .map(|(name, primitive)| Ok((*name, primitive.parse::<Primitive>()?)))
            .collect::<Result<Vec<_>, LayoutError>>()?;
        Ok(Self::new(&typed, packing))
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Result<&Field, LayoutError> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| LayoutError::UnknownField(name.to_string()))
    }

    pub fn offset_of(&self, name: &str) -> Option<u32> {
        self.field(name).ok().map(|f| f.offset)
    }

    /// Writes `values`, one per field in declaration order, at `address`.
    /// Padding bytes are left untouched.
    pub fn encode<T: MemoryHandler>(
        &self,
        memory: &mut T,
        address: u32,
        values: &[Value],
    ) -> Result<(), LayoutError> {
        if values.len() != self.fields.len() {
            return Err(LayoutError::ArityMismatch {
                expected: self.fields.len(),
                found: values.len(),
            });
        }
        // Check every value before touching memory.
        for (field, value) in self.fields.iter().zip(values) {
            Self::check_type(field, value)?;
        }
        for (field, value) in self.fields.iter().zip(values) {
            memory.write_buffer(address.wrapping_add(field.offset), &value.to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads every field of a record at `address`.
    pub fn decode<T: MemoryHandler>(
        &self,
        memory: &T,
        address: u32,
    ) -> Result<Vec<Value>, LayoutError> {
        let bytes = memory.get_slice(address, self.size)?;
        self.decode_from(bytes)
    }

    /// Reads every field of a record from its raw bytes.
    pub fn decode_from(&self, bytes: &[u8]) -> Result<Vec<Value>, LayoutError> {
        if bytes.len() != self.size as usize {
            return Err(LayoutError::SizeMismatch {
                expected: self.size,
                found: bytes.len(),
            });
        }
        self.fields
            .iter()
            .map(|field| {
                let start = field.offset as usize;
                let end = start + field.primitive.size() as usize;
                Value::from_le_bytes(field.primitive, &bytes[start..end])
            })
            .collect()
    }

    pub fn read_field<T: MemoryHandler>(
        &self,
        memory: &T,
        address: u32,
        name: &str,
    ) -> Result<Value, LayoutError> {
        let field = self.field(name)?;
        let bytes = memory.get_slice(address.wrapping_add(field.offset), field.primitive.size())?;
        Value::from_le_bytes(field.primitive, bytes)
    }

    pub fn write_field<T: MemoryHandler>(
        &self,
        memory: &mut T,
        address: u32,
        name: &str,
        value: Value,
    ) -> Result<(), LayoutError> {
        let field = self.field(name)?;
        Self::check_type(field, &value)?;
        memory.write_buffer(address.wrapping_add(field.offset), &value.to_le_bytes())?;
        Ok(())
    }

    fn check_type(field: &Field, value: &Value) -> Result<(), LayoutError> {
        if field.primitive != value.primitive() {
            return Err(LayoutError::TypeMismatch {
                field: field.name.clone(),
                expected: field.primitive,
                found: value.primitive(),
            });
        }
        Ok(())
    }
}
