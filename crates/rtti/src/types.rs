//! Type descriptors.
//!
//! A [`TypeDef`] describes one value shape out of a closed variant set. The
//! serialization engine dispatches on the variant; new kinds of types are
//! added here, not by subclassing. User-defined types plug in through
//! [`CustomTypeDef`], a record of callbacks.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::class::ClassDef;
use crate::strings::StringId;

/// Fixed-layout fundamental types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimpleKind {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    String,
}

impl SimpleKind {
    pub fn name(&self) -> &'static str {
        match self {
            SimpleKind::Bool => "bool",
            SimpleKind::I8 => "i8",
            SimpleKind::I16 => "i16",
            SimpleKind::I32 => "i32",
            SimpleKind::I64 => "i64",
            SimpleKind::U8 => "u8",
            SimpleKind::U16 => "u16",
            SimpleKind::U32 => "u32",
            SimpleKind::U64 => "u64",
            SimpleKind::F32 => "f32",
            SimpleKind::F64 => "f64",
            SimpleKind::String => "string",
        }
    }

    pub fn from_name(name: &str) -> Option<SimpleKind> {
        Some(match name {
            "bool" => SimpleKind::Bool,
            "i8" => SimpleKind::I8,
            "i16" => SimpleKind::I16,
            "i32" => SimpleKind::I32,
            "i64" => SimpleKind::I64,
            "u8" => SimpleKind::U8,
            "u16" => SimpleKind::U16,
            "u32" => SimpleKind::U32,
            "u64" => SimpleKind::U64,
            "f32" => SimpleKind::F32,
            "f64" => SimpleKind::F64,
            "string" => SimpleKind::String,
            _ => return None,
        })
    }
}

/// A named enumeration over an `i64` storage.
#[derive(Debug)]
pub struct EnumDef {
    pub name: StringId,
    pub options: Vec<(StringId, i64)>,
}

impl EnumDef {
    pub fn new(name: &str, options: &[(&str, i64)]) -> Arc<EnumDef> {
        Arc::new(EnumDef {
            name: StringId::intern(name),
            options: options
                .iter()
                .map(|(n, v)| (StringId::intern(n), *v))
                .collect(),
        })
    }

    pub fn find_name(&self, value: i64) -> Option<StringId> {
        self.options
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(n, _)| *n)
    }

    pub fn find_value(&self, name: StringId) -> Option<i64> {
        self.options
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }

    pub fn default_value(&self) -> i64 {
        self.options.first().map(|(_, v)| *v).unwrap_or(0)
    }
}

/// A set of named single-bit flags over a `u64` storage. Bits without a
/// name are still representable; they print and parse as their bit index.
#[derive(Debug)]
pub struct BitfieldDef {
    pub name: StringId,
    flags: Vec<Option<StringId>>,
}

impl BitfieldDef {
    pub fn new(name: &str, flags: &[(&str, u8)]) -> Arc<BitfieldDef> {
        let mut slots = vec![None; 64];
        for (flag_name, bit) in flags {
            slots[*bit as usize] = Some(StringId::intern(flag_name));
        }
        Arc::new(BitfieldDef {
            name: StringId::intern(name),
            flags: slots,
        })
    }

    pub fn flag_name(&self, bit: u8) -> Option<StringId> {
        self.flags.get(bit as usize).copied().flatten()
    }

    pub fn find_flag(&self, name: StringId) -> Option<u8> {
        self.flags
            .iter()
            .position(|slot| *slot == Some(name))
            .map(|bit| bit as u8)
    }
}

/// Type-erased storage for user-defined simple types.
pub type CustomValue = Arc<dyn Any + Send + Sync>;

/// A user-supplied type: a record of callbacks instead of a trait object,
/// so scripted runtimes can assemble these at runtime.
pub struct CustomTypeDef {
    pub name: StringId,
    pub make_default: Box<dyn Fn() -> CustomValue + Send + Sync>,
    pub equals: Box<dyn Fn(&CustomValue, &CustomValue) -> bool + Send + Sync>,
    pub write_binary: Box<dyn Fn(&CustomValue) -> Vec<u8> + Send + Sync>,
    pub read_binary: Box<dyn Fn(&[u8]) -> Option<CustomValue> + Send + Sync>,
    pub write_text: Box<dyn Fn(&CustomValue) -> String + Send + Sync>,
    pub read_text: Box<dyn Fn(&str) -> Option<CustomValue> + Send + Sync>,
}

impl fmt::Debug for CustomTypeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CustomTypeDef({})", self.name)
    }
}

/// One value shape. The set is closed; serialization dispatches on it.
#[derive(Clone, Debug)]
pub enum TypeDef {
    Simple(SimpleKind),
    Enum(Arc<EnumDef>),
    Bitfield(Arc<BitfieldDef>),
    /// Ordered collection; `capacity` bounds fixed-capacity arrays.
    Array {
        element: Arc<TypeDef>,
        capacity: Option<u32>,
    },
    /// Inline compound value (not a pointer).
    Class(Arc<ClassDef>),
    /// Handle to a class in the registry.
    ClassRef,
    /// Owning pointer; forces serialization of its target.
    StrongHandle(StringId),
    /// Observing pointer; serialized by index only when the target is
    /// independently reachable.
    WeakHandle(StringId),
    /// Resource handle: inlined object or external id + class.
    ResourceRef(StringId),
    Buffer,
    AsyncBuffer,
    /// Erased type + value pair.
    Variant,
    Custom(Arc<CustomTypeDef>),
}

impl TypeDef {
    pub fn array_of(element: TypeDef) -> TypeDef {
        TypeDef::Array {
            element: Arc::new(element),
            capacity: None,
        }
    }

    pub fn static_array_of(element: TypeDef, capacity: u32) -> TypeDef {
        TypeDef::Array {
            element: Arc::new(element),
            capacity: Some(capacity),
        }
    }

    /// Canonical type name; this is what the type tables store.
    pub fn name(&self) -> StringId {
        match self {
            TypeDef::Simple(kind) => StringId::intern(kind.name()),
            TypeDef::Enum(def) => def.name,
            TypeDef::Bitfield(def) => def.name,
            TypeDef::Array { element, capacity } => match capacity {
                Some(n) => StringId::intern(&format!("array<{},{n}>", element.name())),
                None => StringId::intern(&format!("array<{}>", element.name())),
            },
            TypeDef::Class(def) => def.name,
            TypeDef::ClassRef => StringId::intern("classref"),
            TypeDef::StrongHandle(class) => StringId::intern(&format!("ptr<{class}>")),
            TypeDef::WeakHandle(class) => StringId::intern(&format!("weak<{class}>")),
            TypeDef::ResourceRef(class) => StringId::intern(&format!("ref<{class}>")),
            TypeDef::Buffer => StringId::intern("buffer"),
            TypeDef::AsyncBuffer => StringId::intern("asyncbuffer"),
            TypeDef::Variant => StringId::intern("variant"),
            TypeDef::Custom(def) => def.name,
        }
    }
}

impl PartialEq for TypeDef {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl Eq for TypeDef {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_lookup() {
        let def = EnumDef::new("test.Color", &[("Red", 0), ("Green", 1), ("Blue", 4)]);
        assert_eq!(def.find_name(4), Some(StringId::intern("Blue")));
        assert_eq!(def.find_name(2), None);
        assert_eq!(def.find_value(StringId::intern("Green")), Some(1));
        assert_eq!(def.default_value(), 0);
    }

    #[test]
    fn test_bitfield_lookup() {
        let def = BitfieldDef::new("test.Flags", &[("First", 0), ("Third", 2)]);
        assert_eq!(def.flag_name(0), Some(StringId::intern("First")));
        assert_eq!(def.flag_name(1), None);
        assert_eq!(def.find_flag(StringId::intern("Third")), Some(2));
    }

    #[test]
    fn test_canonical_names() {
        assert_eq!(TypeDef::Simple(SimpleKind::F32).name().as_str(), "f32");
        assert_eq!(
            TypeDef::array_of(TypeDef::Simple(SimpleKind::U8)).name().as_str(),
            "array<u8>"
        );
        assert_eq!(
            TypeDef::static_array_of(TypeDef::Simple(SimpleKind::F32), 4)
                .name()
                .as_str(),
            "array<f32,4>"
        );
        assert_eq!(
            TypeDef::StrongHandle(StringId::intern("test.Node")).name().as_str(),
            "ptr<test.Node>"
        );
        assert_eq!(
            TypeDef::array_of(TypeDef::array_of(TypeDef::Simple(SimpleKind::I32)))
                .name()
                .as_str(),
            "array<array<i32>>"
        );
    }

    #[test]
    fn test_type_equality_by_name() {
        let a = TypeDef::array_of(TypeDef::Simple(SimpleKind::U8));
        let b = TypeDef::array_of(TypeDef::Simple(SimpleKind::U8));
        assert_eq!(a, b);
        assert_ne!(a, TypeDef::Simple(SimpleKind::U8));
    }
}
