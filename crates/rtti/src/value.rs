//! Dynamically typed values.
//!
//! A [`Value`] carries the runtime state described by a [`TypeDef`]. The
//! serialization engine walks type descriptors and reads or writes the
//! matching value variant; nothing outside this pair knows the layout.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use membuf::{AsyncBufferRef, Buffer};

use crate::class::ClassDef;
use crate::object::{objects_deep_eq_inner, ObjectRef, ObjectWeak};
use crate::resource::{ResourceKey, ResourcePromiseRef};
use crate::strings::StringId;
use crate::types::{CustomTypeDef, CustomValue, SimpleKind, TypeDef};

/// Inline compound value: a class layout stored by value, not by pointer.
#[derive(Clone, Debug)]
pub struct StructValue {
    pub class: Arc<ClassDef>,
    pub fields: Vec<Value>,
}

impl StructValue {
    pub fn of(class: &Arc<ClassDef>) -> StructValue {
        StructValue {
            class: Arc::clone(class),
            fields: class
                .properties()
                .iter()
                .map(|prop| prop.default_value())
                .collect(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        let name = StringId::find(name)?;
        let (index, _) = self.class.find_property(name)?;
        self.fields.get(index)
    }

    pub fn set_field(&mut self, name: &str, value: Value) -> &mut StructValue {
        if let Some((index, _)) = self.class.find_property(StringId::intern(name)) {
            self.fields[index] = value;
        }
        self
    }
}

/// The three states of a resource reference.
#[derive(Clone)]
pub enum ResourceRefValue {
    None,
    /// Reference by id + class; resolution goes through a promise.
    External {
        key: ResourceKey,
        promise: Option<ResourcePromiseRef>,
    },
    /// The resource object itself travels with the file.
    Inlined(ObjectRef),
}

impl ResourceRefValue {
    pub fn external(key: ResourceKey) -> ResourceRefValue {
        ResourceRefValue::External { key, promise: None }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ResourceRefValue::None)
    }
}

impl fmt::Debug for ResourceRefValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceRefValue::None => write!(f, "ResourceRef(none)"),
            ResourceRefValue::External { key, .. } => {
                write!(f, "ResourceRef({} {})", key.class, key.id)
            }
            ResourceRefValue::Inlined(_) => write!(f, "ResourceRef(inlined)"),
        }
    }
}

/// One runtime value.
#[derive(Clone)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    /// Numeric enum storage; names resolve through the `EnumDef`.
    Enum(i64),
    /// Raw bit storage; names resolve through the `BitfieldDef`.
    Bitfield(u64),
    Array(Vec<Value>),
    Struct(StructValue),
    ClassRef(Option<StringId>),
    Object(Option<ObjectRef>),
    Weak(ObjectWeak),
    Resource(ResourceRefValue),
    Buffer(Buffer),
    AsyncBuffer(Option<AsyncBufferRef>),
    Variant(Option<Box<(TypeDef, Value)>>),
    Custom(Arc<CustomTypeDef>, CustomValue),
}

impl Value {
    pub fn object(object: &ObjectRef) -> Value {
        Value::Object(Some(Arc::clone(object)))
    }

    pub fn weak(object: &ObjectRef) -> Value {
        Value::Weak(ObjectWeak::from_ref(object))
    }

    pub fn variant(ty: TypeDef, value: Value) -> Value {
        Value::Variant(Some(Box::new((ty, value))))
    }

    /// Short tag used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Str(_) => "string",
            Value::Enum(_) => "enum",
            Value::Bitfield(_) => "bitfield",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::ClassRef(_) => "classref",
            Value::Object(_) => "object",
            Value::Weak(_) => "weak",
            Value::Resource(_) => "resource",
            Value::Buffer(_) => "buffer",
            Value::AsyncBuffer(_) => "asyncbuffer",
            Value::Variant(_) => "variant",
            Value::Custom(..) => "custom",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::I8(v) => write!(f, "{v}i8"),
            Value::I16(v) => write!(f, "{v}i16"),
            Value::I32(v) => write!(f, "{v}i32"),
            Value::I64(v) => write!(f, "{v}i64"),
            Value::U8(v) => write!(f, "{v}u8"),
            Value::U16(v) => write!(f, "{v}u16"),
            Value::U32(v) => write!(f, "{v}u32"),
            Value::U64(v) => write!(f, "{v}u64"),
            Value::F32(v) => write!(f, "{v}f32"),
            Value::F64(v) => write!(f, "{v}f64"),
            Value::Str(v) => write!(f, "{v:?}"),
            Value::Enum(v) => write!(f, "enum({v})"),
            Value::Bitfield(v) => write!(f, "bitfield({v:#x})"),
            Value::Array(v) => f.debug_list().entries(v.iter()).finish(),
            Value::Struct(v) => write!(f, "struct({})", v.class.name),
            Value::ClassRef(v) => write!(f, "classref({v:?})"),
            Value::Object(Some(_)) => write!(f, "object(set)"),
            Value::Object(None) => write!(f, "object(null)"),
            Value::Weak(w) => write!(f, "{w:?}"),
            Value::Resource(r) => write!(f, "{r:?}"),
            Value::Buffer(b) => write!(f, "{b:?}"),
            Value::AsyncBuffer(Some(b)) => write!(f, "asyncbuffer(crc {:#x})", b.crc()),
            Value::AsyncBuffer(None) => write!(f, "asyncbuffer(null)"),
            Value::Variant(Some(v)) => write!(f, "variant({})", v.0.name()),
            Value::Variant(None) => write!(f, "variant(empty)"),
            Value::Custom(def, _) => write!(f, "custom({})", def.name),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        let mut visited = HashSet::new();
        values_deep_eq(self, other, &mut visited)
    }
}

/// Structural value equality with cycle protection for object handles.
/// Floats compare bit-exact so equality survives text round-trips.
pub(crate) fn values_deep_eq(
    a: &Value,
    b: &Value,
    visited: &mut HashSet<(u64, u64)>,
) -> bool {
    use Value::*;
    match (a, b) {
        (Bool(x), Bool(y)) => x == y,
        (I8(x), I8(y)) => x == y,
        (I16(x), I16(y)) => x == y,
        (I32(x), I32(y)) => x == y,
        (I64(x), I64(y)) => x == y,
        (U8(x), U8(y)) => x == y,
        (U16(x), U16(y)) => x == y,
        (U32(x), U32(y)) => x == y,
        (U64(x), U64(y)) => x == y,
        (F32(x), F32(y)) => x.to_bits() == y.to_bits(),
        (F64(x), F64(y)) => x.to_bits() == y.to_bits(),
        (Str(x), Str(y)) => x == y,
        (Enum(x), Enum(y)) => x == y,
        (Bitfield(x), Bitfield(y)) => x == y,
        (Array(x), Array(y)) => {
            x.len() == y.len()
                && x.iter().zip(y.iter()).all(|(va, vb)| values_deep_eq(va, vb, visited))
        }
        (Struct(x), Struct(y)) => {
            x.class.name == y.class.name
                && x.fields.len() == y.fields.len()
                && x.fields
                    .iter()
                    .zip(y.fields.iter())
                    .all(|(va, vb)| values_deep_eq(va, vb, visited))
        }
        (ClassRef(x), ClassRef(y)) => x == y,
        (Object(None), Object(None)) => true,
        (Object(Some(x)), Object(Some(y))) => objects_deep_eq_inner(x, y, visited),
        (Weak(x), Weak(y)) => match (x.upgrade(), y.upgrade()) {
            (None, None) => true,
            (Some(ox), Some(oy)) => objects_deep_eq_inner(&ox, &oy, visited),
            _ => false,
        },
        (Resource(x), Resource(y)) => match (x, y) {
            (ResourceRefValue::None, ResourceRefValue::None) => true,
            (
                ResourceRefValue::External { key: ka, .. },
                ResourceRefValue::External { key: kb, .. },
            ) => ka == kb,
            (ResourceRefValue::Inlined(ox), ResourceRefValue::Inlined(oy)) => {
                objects_deep_eq_inner(ox, oy, visited)
            }
            _ => false,
        },
        (Buffer(x), Buffer(y)) => x == y,
        (AsyncBuffer(None), AsyncBuffer(None)) => true,
        (AsyncBuffer(Some(x)), AsyncBuffer(Some(y))) => x.crc() == y.crc(),
        (Variant(None), Variant(None)) => true,
        (Variant(Some(x)), Variant(Some(y))) => {
            x.0.name() == y.0.name() && values_deep_eq(&x.1, &y.1, visited)
        }
        (Custom(da, va), Custom(db, vb)) => da.name == db.name && (da.equals)(va, vb),
        _ => false,
    }
}

impl TypeDef {
    /// The zero/empty value of this type; what freshly constructed slots
    /// hold and what default-suppression compares against.
    pub fn default_value(&self) -> Value {
        match self {
            TypeDef::Simple(kind) => match kind {
                SimpleKind::Bool => Value::Bool(false),
                SimpleKind::I8 => Value::I8(0),
                SimpleKind::I16 => Value::I16(0),
                SimpleKind::I32 => Value::I32(0),
                SimpleKind::I64 => Value::I64(0),
                SimpleKind::U8 => Value::U8(0),
                SimpleKind::U16 => Value::U16(0),
                SimpleKind::U32 => Value::U32(0),
                SimpleKind::U64 => Value::U64(0),
                SimpleKind::F32 => Value::F32(0.0),
                SimpleKind::F64 => Value::F64(0.0),
                SimpleKind::String => Value::Str(String::new()),
            },
            TypeDef::Enum(def) => Value::Enum(def.default_value()),
            TypeDef::Bitfield(_) => Value::Bitfield(0),
            TypeDef::Array { .. } => Value::Array(Vec::new()),
            TypeDef::Class(def) => Value::Struct(StructValue::of(def)),
            TypeDef::ClassRef => Value::ClassRef(None),
            TypeDef::StrongHandle(_) => Value::Object(None),
            TypeDef::WeakHandle(_) => Value::Weak(ObjectWeak::new()),
            TypeDef::ResourceRef(_) => Value::Resource(ResourceRefValue::None),
            TypeDef::Buffer => Value::Buffer(Buffer::new()),
            TypeDef::AsyncBuffer => Value::AsyncBuffer(None),
            TypeDef::Variant => Value::Variant(None),
            TypeDef::Custom(def) => Value::Custom(Arc::clone(def), (def.make_default)()),
        }
    }

    /// Light shape check: does `value` belong to this type's variant?
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (TypeDef::Simple(SimpleKind::Bool), Value::Bool(_))
                | (TypeDef::Simple(SimpleKind::I8), Value::I8(_))
                | (TypeDef::Simple(SimpleKind::I16), Value::I16(_))
                | (TypeDef::Simple(SimpleKind::I32), Value::I32(_))
                | (TypeDef::Simple(SimpleKind::I64), Value::I64(_))
                | (TypeDef::Simple(SimpleKind::U8), Value::U8(_))
                | (TypeDef::Simple(SimpleKind::U16), Value::U16(_))
                | (TypeDef::Simple(SimpleKind::U32), Value::U32(_))
                | (TypeDef::Simple(SimpleKind::U64), Value::U64(_))
                | (TypeDef::Simple(SimpleKind::F32), Value::F32(_))
                | (TypeDef::Simple(SimpleKind::F64), Value::F64(_))
                | (TypeDef::Simple(SimpleKind::String), Value::Str(_))
                | (TypeDef::Enum(_), Value::Enum(_))
                | (TypeDef::Bitfield(_), Value::Bitfield(_))
                | (TypeDef::Array { .. }, Value::Array(_))
                | (TypeDef::Class(_), Value::Struct(_))
                | (TypeDef::ClassRef, Value::ClassRef(_))
                | (TypeDef::StrongHandle(_), Value::Object(_))
                | (TypeDef::WeakHandle(_), Value::Weak(_))
                | (TypeDef::ResourceRef(_), Value::Resource(_))
                | (TypeDef::Buffer, Value::Buffer(_))
                | (TypeDef::AsyncBuffer, Value::AsyncBuffer(_))
                | (TypeDef::Variant, Value::Variant(_))
                | (TypeDef::Custom(_), Value::Custom(..))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassDef, PropertyDef};
    use crate::object::Object;

    #[test]
    fn test_float_equality_is_bitwise()  {
        assert_eq!(Value::F32(1.5), Value::F32(1.5));
        assert_ne!(Value::F32(0.0), Value::F32(-0.0));
        // NaN payloads survive comparison
        assert_eq!(Value::F64(f64::NAN), Value::F64(f64::NAN));
    }

    #[test]
    fn test_defaults_match_types() {
        let ty = TypeDef::array_of(TypeDef::Simple(SimpleKind::U8));
        let value = ty.default_value();
        assert!(ty.accepts(&value));
        assert_eq!(value, Value::Array(Vec::new()));
    }

    #[test]
    fn test_struct_defaults() {
        let cls = ClassDef::build("test.ValueStruct")
            .prop(PropertyDef::new("x", TypeDef::Simple(SimpleKind::F32)))
            .prop(
                PropertyDef::new("n", TypeDef::Simple(SimpleKind::I32))
                    .with_default(Value::I32(5)),
            )
            .finish();
        let value = TypeDef::Class(Arc::clone(&cls)).default_value();
        match &value {
            Value::Struct(s) => {
                assert_eq!(s.field("x"), Some(&Value::F32(0.0)));
                assert_eq!(s.field("n"), Some(&Value::I32(5)));
            }
            other => panic!("expected struct, got {other:?}"),
        }
    }

    #[test]
    fn test_shared_handle_equality() {
        let cls = ClassDef::build("test.ValueHandle")
            .prop(PropertyDef::new("v", TypeDef::Simple(SimpleKind::I32)))
            .finish();
        let obj = Object::create(&cls).unwrap();
        let a = Value::object(&obj);
        let b = Value::object(&obj);
        assert_eq!(a, b);

        let other = Object::create(&cls).unwrap();
        other.write().unwrap().set("v", Value::I32(9)).unwrap();
        assert_ne!(a, Value::object(&other));
    }

    #[test]
    fn test_dead_weak_handles_compare_equal() {
        let a = Value::Weak(ObjectWeak::new());
        let b = Value::Weak(ObjectWeak::new());
        assert_eq!(a, b);
    }
}
