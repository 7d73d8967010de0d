//! Shared fixtures: a small reflected schema and save/load helpers.

#![allow(dead_code)]

use std::sync::Arc;

use rtti::{
    BitfieldDef, ClassDef, EnumDef, ObjectRef, PropertyDef, SimpleKind, StringId, TypeDef,
    TypeRegistry,
};
use serial::{
    load_object, save_object, ObjectLoadingContext, ObjectSavingContext, SerializationFormat,
};

pub fn vector3_class() -> Arc<ClassDef> {
    ClassDef::build("test.Vector3")
        .prop(PropertyDef::new("x", TypeDef::Simple(SimpleKind::F32)))
        .prop(PropertyDef::new("y", TypeDef::Simple(SimpleKind::F32)))
        .prop(PropertyDef::new("z", TypeDef::Simple(SimpleKind::F32)))
        .finish()
}

pub fn box_class(vector3: &Arc<ClassDef>) -> Arc<ClassDef> {
    ClassDef::build("test.Box")
        .prop(PropertyDef::new("min", TypeDef::Class(Arc::clone(vector3))))
        .prop(PropertyDef::new("max", TypeDef::Class(Arc::clone(vector3))))
        .finish()
}

pub fn color_enum() -> Arc<EnumDef> {
    EnumDef::new("test.Color", &[("Red", 0), ("Green", 1), ("Blue", 2)])
}

pub fn flags_bitfield() -> Arc<BitfieldDef> {
    BitfieldDef::new("test.Flags", &[("First", 0), ("Second", 1), ("Third", 2)])
}

pub fn resource_class() -> Arc<ClassDef> {
    ClassDef::build("test.TestResource")
        .resource()
        .prop(PropertyDef::new("value", TypeDef::Simple(SimpleKind::I32)))
        .finish()
}

/// The kitchen-sink entity most graph tests use.
pub fn entity_class() -> Arc<ClassDef> {
    ClassDef::build("test.Entity")
        .prop(PropertyDef::new("name", TypeDef::Simple(SimpleKind::String)))
        .prop(PropertyDef::new("simple", TypeDef::Simple(SimpleKind::I32)))
        .prop(PropertyDef::new(
            "children",
            TypeDef::array_of(TypeDef::StrongHandle(StringId::intern("test.Entity"))),
        ))
        .prop(PropertyDef::new(
            "buddy",
            TypeDef::WeakHandle(StringId::intern("test.Entity")),
        ))
        .finish()
}

/// Registry with the whole fixture schema registered.
pub fn test_registry() -> Arc<TypeRegistry> {
    let registry = TypeRegistry::new();
    let vector3 = vector3_class();
    registry.register_class(Arc::clone(&vector3)).unwrap();
    registry.register_class(box_class(&vector3)).unwrap();
    registry.register_enum(color_enum()).unwrap();
    registry.register_bitfield(flags_bitfield()).unwrap();
    registry.register_class(resource_class()).unwrap();
    registry.register_class(entity_class()).unwrap();
    registry
}

pub fn save_binary_bytes(registry: &Arc<TypeRegistry>, object: &ObjectRef) -> Vec<u8> {
    let mut ctx = ObjectSavingContext::new(registry);
    save_object(SerializationFormat::Binary, &mut ctx, object)
        .expect("save failed")
        .to_vec()
}

pub fn load_binary_bytes(registry: &Arc<TypeRegistry>, data: &[u8]) -> ObjectRef {
    let mut ctx = ObjectLoadingContext::new(registry);
    load_object(SerializationFormat::Binary, &mut ctx, data).expect("load failed")
}

pub fn roundtrip_binary(registry: &Arc<TypeRegistry>, object: &ObjectRef) -> ObjectRef {
    let bytes = save_binary_bytes(registry, object);
    load_binary_bytes(registry, &bytes)
}
