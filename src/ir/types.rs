//! The kernel value/type system.
//!
//! Types are interned in a per-module [`TypeTable`]; a [`TypeId`] is only
//! meaningful with respect to the table that issued it and equality of ids
//! is equality of types.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A primitive scalar kind.
///
/// `Bool` is the single-bit predicate type produced by comparisons; it is
/// never addressable on its own and occupies one byte when spilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F16,
    BF16,
    F32,
    F64,
    Bool,
}

impl ScalarKind {
    /// Size of one element in bytes.
    pub fn size(self) -> u64 {
        match self {
            ScalarKind::I8 | ScalarKind::U8 | ScalarKind::Bool => 1,
            ScalarKind::I16 | ScalarKind::U16 | ScalarKind::F16 | ScalarKind::BF16 => 2,
            ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 4,
            ScalarKind::I64 | ScalarKind::U64 | ScalarKind::F64 => 8,
        }
    }

    /// Natural alignment in bytes (equal to the size for every scalar).
    pub fn align(self) -> u64 {
        self.size()
    }

    /// Width in bits.
    pub fn bits(self) -> u32 {
        match self {
            ScalarKind::Bool => 1,
            _ => self.size() as u32 * 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            ScalarKind::F16 | ScalarKind::BF16 | ScalarKind::F32 | ScalarKind::F64
        )
    }

    pub fn is_int(self) -> bool {
        !self.is_float() && self != ScalarKind::Bool
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ScalarKind::I8 | ScalarKind::I16 | ScalarKind::I32 | ScalarKind::I64
        )
    }

    /// Short lowercase name used in emitted source and diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::I8 => "i8",
            ScalarKind::I16 => "i16",
            ScalarKind::I32 => "i32",
            ScalarKind::I64 => "i64",
            ScalarKind::U8 => "u8",
            ScalarKind::U16 => "u16",
            ScalarKind::U32 => "u32",
            ScalarKind::U64 => "u64",
            ScalarKind::F16 => "f16",
            ScalarKind::BF16 => "bf16",
            ScalarKind::F32 => "f32",
            ScalarKind::F64 => "f64",
            ScalarKind::Bool => "bool",
        }
    }

    fn tag(self) -> u8 {
        match self {
            ScalarKind::I8 => 0,
            ScalarKind::I16 => 1,
            ScalarKind::I32 => 2,
            ScalarKind::I64 => 3,
            ScalarKind::U8 => 4,
            ScalarKind::U16 => 5,
            ScalarKind::U32 => 6,
            ScalarKind::U64 => 7,
            ScalarKind::F16 => 8,
            ScalarKind::BF16 => 9,
            ScalarKind::F32 => 10,
            ScalarKind::F64 => 11,
            ScalarKind::Bool => 12,
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The memory region a pointer refers to.
///
/// Every pointer value carries its space. `Generic` is the unqualified
/// state; the address-space inference pass refines it to a concrete space
/// wherever propagation from an allocation site succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrSpace {
    Generic,
    Global,
    Shared,
    Constant,
    Local,
}

impl AddrSpace {
    pub fn name(self) -> &'static str {
        match self {
            AddrSpace::Generic => "generic",
            AddrSpace::Global => "global",
            AddrSpace::Shared => "shared",
            AddrSpace::Constant => "constant",
            AddrSpace::Local => "local",
        }
    }

    pub fn is_concrete(self) -> bool {
        self != AddrSpace::Generic
    }

    fn tag(self) -> u8 {
        match self {
            AddrSpace::Generic => 0,
            AddrSpace::Global => 1,
            AddrSpace::Shared => 2,
            AddrSpace::Constant => 3,
            AddrSpace::Local => 4,
        }
    }
}

impl fmt::Display for AddrSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifier of an interned type. Equality is type equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub(crate) u32);

impl TypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ty{}", self.0)
    }
}

/// The structural description of a type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// The absence of a value (function return only).
    Void,
    Scalar(ScalarKind),
    Pointer { pointee: TypeId, space: AddrSpace },
    Array { elem: TypeId, len: u64 },
    Struct { fields: Vec<TypeId> },
    Vector { elem: ScalarKind, width: u8 },
    /// An opaque device-side handle (e.g. a texture or queue object).
    OpaqueHandle,
}

/// Per-module intern table for types.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    kinds: Vec<TypeKind>,
    lookup: HashMap<TypeKind, TypeId>,
}

impl TypeTable {
    pub fn new() -> TypeTable {
        TypeTable::default()
    }

    /// Interns `kind`, returning the existing id when an identical type was
    /// interned before.
    pub fn intern(&mut self, kind: TypeKind) -> TypeId {
        if let Some(&id) = self.lookup.get(&kind) {
            return id;
        }
        let id = TypeId(self.kinds.len() as u32);
        self.kinds.push(kind.clone());
        self.lookup.insert(kind, id);
        id
    }

    pub fn kind(&self, id: TypeId) -> &TypeKind {
        &self.kinds[id.index()]
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn void(&mut self) -> TypeId {
        self.intern(TypeKind::Void)
    }

    pub fn scalar(&mut self, kind: ScalarKind) -> TypeId {
        self.intern(TypeKind::Scalar(kind))
    }

    pub fn pointer(&mut self, pointee: TypeId, space: AddrSpace) -> TypeId {
        self.intern(TypeKind::Pointer { pointee, space })
    }

    pub fn vector(&mut self, elem: ScalarKind, width: u8) -> TypeId {
        self.intern(TypeKind::Vector { elem, width })
    }

    pub fn array(&mut self, elem: TypeId, len: u64) -> TypeId {
        self.intern(TypeKind::Array { elem, len })
    }

    pub fn structure(&mut self, fields: Vec<TypeId>) -> TypeId {
        self.intern(TypeKind::Struct { fields })
    }

    /// Re-interns a pointer type with a refined address space. Panics if
    /// `ptr` is not a pointer; callers have already matched on the kind.
    pub fn with_space(&mut self, ptr: TypeId, space: AddrSpace) -> TypeId {
        let pointee = match *self.kind(ptr) {
            TypeKind::Pointer { pointee, .. } => pointee,
            ref other => panic!("with_space: not a pointer type: {:?}", other),
        };
        self.pointer(pointee, space)
    }

    /// Returns the scalar kind of `id` if it is a scalar type.
    pub fn scalar_kind(&self, id: TypeId) -> Option<ScalarKind> {
        match *self.kind(id) {
            TypeKind::Scalar(kind) => Some(kind),
            _ => None,
        }
    }

    /// Returns the address space of `id` if it is a pointer type.
    pub fn pointer_space(&self, id: TypeId) -> Option<AddrSpace> {
        match *self.kind(id) {
            TypeKind::Pointer { space, .. } => Some(space),
            _ => None,
        }
    }

    /// Returns the pointee of `id` if it is a pointer type.
    pub fn pointee(&self, id: TypeId) -> Option<TypeId> {
        match *self.kind(id) {
            TypeKind::Pointer { pointee, .. } => Some(pointee),
            _ => None,
        }
    }

    /// Size of a value of type `id` in bytes. Pointers are 8 bytes on
    /// every supported target.
    pub fn size_of(&self, id: TypeId) -> u64 {
        match *self.kind(id) {
            TypeKind::Void => 0,
            TypeKind::Scalar(kind) => kind.size(),
            TypeKind::Pointer { .. } | TypeKind::OpaqueHandle => 8,
            TypeKind::Array { elem, len } => self.size_of(elem) * len,
            TypeKind::Struct { ref fields } => {
                let mut size = 0u64;
                let mut align = 1u64;
                for &field in fields {
                    let fa = self.align_of(field);
                    align = align.max(fa);
                    size = round_up(size, fa) + self.size_of(field);
                }
                round_up(size, align)
            }
            TypeKind::Vector { elem, width } => elem.size() * width as u64,
        }
    }

    /// Alignment of a value of type `id` in bytes.
    pub fn align_of(&self, id: TypeId) -> u64 {
        match *self.kind(id) {
            TypeKind::Void => 1,
            TypeKind::Scalar(kind) => kind.align(),
            TypeKind::Pointer { .. } | TypeKind::OpaqueHandle => 8,
            TypeKind::Array { elem, .. } => self.align_of(elem),
            TypeKind::Struct { ref fields } => {
                fields.iter().map(|&f| self.align_of(f)).max().unwrap_or(1)
            }
            TypeKind::Vector { elem, width } => (elem.size() * width as u64).next_power_of_two(),
        }
    }

    /// Byte offset of struct field `idx`.
    pub fn field_offset(&self, strct: TypeId, idx: u32) -> u64 {
        let fields = match *self.kind(strct) {
            TypeKind::Struct { ref fields } => fields.clone(),
            ref other => panic!("field_offset: not a struct type: {:?}", other),
        };
        let mut offset = 0u64;
        for (i, &field) in fields.iter().enumerate() {
            offset = round_up(offset, self.align_of(field));
            if i as u32 == idx {
                return offset;
            }
            offset += self.size_of(field);
        }
        panic!("field_offset: index {} out of range", idx);
    }

    /// Appends a deterministic encoding of the whole table for content
    /// fingerprinting.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.kinds.len() as u32).to_le_bytes());
        for kind in &self.kinds {
            match *kind {
                TypeKind::Void => out.push(0),
                TypeKind::Scalar(k) => {
                    out.push(1);
                    out.push(k.tag());
                }
                TypeKind::Pointer { pointee, space } => {
                    out.push(2);
                    out.extend_from_slice(&pointee.0.to_le_bytes());
                    out.push(space.tag());
                }
                TypeKind::Array { elem, len } => {
                    out.push(3);
                    out.extend_from_slice(&elem.0.to_le_bytes());
                    out.extend_from_slice(&len.to_le_bytes());
                }
                TypeKind::Struct { ref fields } => {
                    out.push(4);
                    out.extend_from_slice(&(fields.len() as u32).to_le_bytes());
                    for f in fields {
                        out.extend_from_slice(&f.0.to_le_bytes());
                    }
                }
                TypeKind::Vector { elem, width } => {
                    out.push(5);
                    out.push(elem.tag());
                    out.push(width);
                }
                TypeKind::OpaqueHandle => out.push(6),
            }
        }
    }
}

fn round_up(val: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two() || align == 1);
    (val + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_identity() {
        let mut table = TypeTable::new();
        let a = table.scalar(ScalarKind::F32);
        let b = table.scalar(ScalarKind::F32);
        let c = table.scalar(ScalarKind::F64);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let pa = table.pointer(a, AddrSpace::Global);
        let pb = table.pointer(b, AddrSpace::Global);
        let pg = table.pointer(a, AddrSpace::Generic);
        assert_eq!(pa, pb);
        assert_ne!(pa, pg);
        assert_eq!(table.with_space(pg, AddrSpace::Global), pa);
    }

    #[test]
    fn struct_layout() {
        let mut table = TypeTable::new();
        let i8t = table.scalar(ScalarKind::I8);
        let i32t = table.scalar(ScalarKind::I32);
        let st = table.structure(vec![i8t, i32t, i8t]);
        // i8 @0, pad, i32 @4, i8 @8, pad to 12.
        assert_eq!(table.field_offset(st, 0), 0);
        assert_eq!(table.field_offset(st, 1), 4);
        assert_eq!(table.field_offset(st, 2), 8);
        assert_eq!(table.size_of(st), 12);
        assert_eq!(table.align_of(st), 4);
    }
}
