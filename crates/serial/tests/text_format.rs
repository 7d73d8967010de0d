//! XML and JSON rendering, including the literal formats callers rely on.

mod common;

use std::sync::Arc;

use common::*;
use membuf::Buffer;
use rtti::{
    objects_deep_eq, ClassDef, Object, PropertyDef, ResourceId, ResourceKey, ResourceRefValue,
    SimpleKind, StringId, StructValue, TypeDef, TypeRegistry, Value,
};
use serial::{
    load_object, load_value, save_object, save_value, CollectingErrorReporter,
    ObjectLoadingContext, ObjectSavingContext, PrintFlags, ReportedError, SerializationFormat,
};

fn xml_ctx(registry: &Arc<TypeRegistry>) -> ObjectSavingContext {
    let mut ctx = ObjectSavingContext::new(registry);
    ctx.print_flags = PrintFlags {
        no_header: true,
        indent: false,
    };
    ctx
}

fn vector3_value(registry: &Arc<TypeRegistry>, x: f32, y: f32, z: f32) -> (TypeDef, Value) {
    let cls = registry.find_class(StringId::intern("test.Vector3")).unwrap();
    let mut value = StructValue::of(&cls);
    value
        .set_field("x", Value::F32(x))
        .set_field("y", Value::F32(y))
        .set_field("z", Value::F32(z));
    (TypeDef::Class(cls), Value::Struct(value))
}

#[test]
fn test_vector3_xml_literal() {
    let registry = test_registry();
    let (ty, value) = vector3_value(&registry, 1.0, 2.0, 3.0);

    let mut ctx = xml_ctx(&registry);
    let text = save_value(SerializationFormat::Xml, &mut ctx, &ty, &value).unwrap();
    assert_eq!(&text[..], b"<data><x>1</x><y>2</y><z>3</z></data>" as &[u8]);

    let mut lctx = ObjectLoadingContext::new(&registry);
    let loaded = load_value(&mut lctx, std::str::from_utf8(&text).unwrap(), &ty).unwrap();
    assert_eq!(loaded, value);
}

#[test]
fn test_box_xml_literal() {
    let registry = test_registry();
    let vector3 = registry.find_class(StringId::intern("test.Vector3")).unwrap();
    let box_cls = registry.find_class(StringId::intern("test.Box")).unwrap();

    let mut min = StructValue::of(&vector3);
    min.set_field("x", Value::F32(-1.0))
        .set_field("y", Value::F32(-2.0))
        .set_field("z", Value::F32(-3.0));
    let mut max = StructValue::of(&vector3);
    max.set_field("x", Value::F32(1.0))
        .set_field("y", Value::F32(2.0))
        .set_field("z", Value::F32(3.0));
    let mut box_value = StructValue::of(&box_cls);
    box_value
        .set_field("min", Value::Struct(min))
        .set_field("max", Value::Struct(max));
    let ty = TypeDef::Class(box_cls);
    let value = Value::Struct(box_value);

    let mut ctx = xml_ctx(&registry);
    let text = save_value(SerializationFormat::Xml, &mut ctx, &ty, &value).unwrap();
    assert_eq!(
        std::str::from_utf8(&text).unwrap(),
        "<data><min><x>-1</x><y>-2</y><z>-3</z></min>\
         <max><x>1</x><y>2</y><z>3</z></max></data>"
    );

    let mut lctx = ObjectLoadingContext::new(&registry);
    let loaded = load_value(&mut lctx, std::str::from_utf8(&text).unwrap(), &ty).unwrap();
    assert_eq!(loaded, value);
}

#[test]
fn test_shared_object_xml_ids() {
    let registry = test_registry();
    let cls = registry.find_class(StringId::intern("test.Entity")).unwrap();

    let shared = Object::create(&cls).unwrap();
    shared.write().unwrap().set("simple", Value::I32(42)).unwrap();
    let root = Object::create(&cls).unwrap();
    root.write()
        .unwrap()
        .set(
            "children",
            Value::Array(vec![Value::object(&shared), Value::object(&shared)]),
        )
        .unwrap();

    let mut ctx = xml_ctx(&registry);
    ctx.root_node_name = Some("data".to_string());
    let text = save_object(SerializationFormat::Xml, &mut ctx, &root).unwrap();
    let text = std::str::from_utf8(&text).unwrap().to_string();

    // the shared child is defined once and referenced once
    assert_eq!(text.matches("id=\"1\"").count(), 1);
    assert_eq!(text.matches("refId=\"1\"").count(), 1);
    assert_eq!(text.matches("<simple>42</simple>").count(), 1);

    let mut lctx = ObjectLoadingContext::new(&registry);
    let loaded = load_object(SerializationFormat::Xml, &mut lctx, text.as_bytes()).unwrap();
    assert!(objects_deep_eq(&root, &loaded));

    let guard = loaded.read().unwrap();
    match guard.get("children").unwrap() {
        Value::Array(items) => match (&items[0], &items[1]) {
            (Value::Object(Some(a)), Value::Object(Some(b))) => {
                assert!(Arc::ptr_eq(a, b));
            }
            other => panic!("unexpected {other:?}"),
        },
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_external_resource_xml_literal() {
    let registry = test_registry();
    let id = ResourceId::parse("{01020304-0506-0708-0910-111213141516}").unwrap();
    let key = ResourceKey::new(id, StringId::intern("test.TestResource"));
    let ty = TypeDef::ResourceRef(StringId::intern("test.TestResource"));
    let value = Value::Resource(ResourceRefValue::external(key));

    let mut ctx = xml_ctx(&registry);
    let text = save_value(SerializationFormat::Xml, &mut ctx, &ty, &value).unwrap();
    assert_eq!(
        std::str::from_utf8(&text).unwrap(),
        "<data class=\"test.TestResource\" guid=\"{01020304-0506-0708-0910-111213141516}\"/>"
    );

    let mut lctx = ObjectLoadingContext::new(&registry);
    lctx.collect_promises = true;
    let loaded = load_value(&mut lctx, std::str::from_utf8(&text).unwrap(), &ty).unwrap();
    match &loaded {
        Value::Resource(ResourceRefValue::External { key: loaded_key, promise }) => {
            assert_eq!(*loaded_key, key);
            let promise = promise.as_ref().expect("promise must be created");
            assert!(!promise.fulfilled());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(lctx.resource_promises.len(), 1);
}

#[test]
fn test_unowned_resource_promise_fulfills_to_null() {
    let registry = test_registry();
    let id = ResourceId::generate();
    let key = ResourceKey::new(id, StringId::intern("test.TestResource"));
    let ty = TypeDef::ResourceRef(StringId::intern("test.TestResource"));
    let value = Value::Resource(ResourceRefValue::external(key));

    let mut ctx = xml_ctx(&registry);
    let text = save_value(SerializationFormat::Xml, &mut ctx, &ty, &value).unwrap();

    let mut lctx = ObjectLoadingContext::new(&registry);
    let loaded = load_value(&mut lctx, std::str::from_utf8(&text).unwrap(), &ty).unwrap();
    match &loaded {
        Value::Resource(ResourceRefValue::External { promise, .. }) => {
            let promise = promise.as_ref().unwrap();
            assert!(promise.fulfilled());
            assert!(promise.peek().is_none());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_buffer_xml_base64_literal() {
    let registry = test_registry();
    let ty = TypeDef::Buffer;
    let value = Value::Buffer(Buffer::from_slice(b"abc"));

    let mut ctx = xml_ctx(&registry);
    let text = save_value(SerializationFormat::Xml, &mut ctx, &ty, &value).unwrap();
    assert_eq!(std::str::from_utf8(&text).unwrap(), "<data>YWJj</data>");

    let mut lctx = ObjectLoadingContext::new(&registry);
    let loaded = load_value(&mut lctx, "<data>YWJj</data>", &ty).unwrap();
    assert_eq!(loaded, value);
}

#[test]
fn test_bitfield_xml_text_and_unknown_flag() {
    let registry = test_registry();
    let ty = TypeDef::Bitfield(flags_bitfield());

    // First | Third
    let mut ctx = xml_ctx(&registry);
    let text = save_value(SerializationFormat::Xml, &mut ctx, &ty, &Value::Bitfield(0b101)).unwrap();
    assert_eq!(std::str::from_utf8(&text).unwrap(), "<data>First;Third</data>");

    let mut lctx = ObjectLoadingContext::new(&registry);
    let loaded = load_value(&mut lctx, "<data>First;Third</data>", &ty).unwrap();
    assert_eq!(loaded, Value::Bitfield(0b101));

    // an unnamed flag at bit 5 survives as the literal number
    let with_unknown = Value::Bitfield(0b101 | (1 << 5));
    let mut ctx = xml_ctx(&registry);
    let text = save_value(SerializationFormat::Xml, &mut ctx, &ty, &with_unknown).unwrap();
    assert_eq!(
        std::str::from_utf8(&text).unwrap(),
        "<data>First;Third;5</data>"
    );

    let mut lctx = ObjectLoadingContext::new(&registry);
    let reloaded = load_value(&mut lctx, std::str::from_utf8(&text).unwrap(), &ty).unwrap();
    assert_eq!(reloaded, with_unknown);
}

#[test]
fn test_enum_xml_with_numeric_fallback() {
    let registry = test_registry();
    let ty = TypeDef::Enum(color_enum());

    let mut ctx = xml_ctx(&registry);
    let text = save_value(SerializationFormat::Xml, &mut ctx, &ty, &Value::Enum(1)).unwrap();
    assert_eq!(std::str::from_utf8(&text).unwrap(), "<data>Green</data>");

    let mut lctx = ObjectLoadingContext::new(&registry);
    assert_eq!(
        load_value(&mut lctx, "<data>Green</data>", &ty).unwrap(),
        Value::Enum(1)
    );
    // a retired option round-trips as its number
    assert_eq!(
        load_value(&mut lctx, "<data>7</data>", &ty).unwrap(),
        Value::Enum(7)
    );
    assert_eq!(
        load_value(&mut lctx, "<data>  Blue  </data>", &ty).unwrap(),
        Value::Enum(2)
    );
}

#[test]
fn test_float_text_precision() {
    let registry = test_registry();

    for bits in [
        0x3DCC_CCCDu32, // 0.1f32
        0x0000_0001,    // smallest subnormal
        0x7F7F_FFFF,    // f32::MAX
        0x8000_0000,    // -0.0
        0x4049_0FDB,    // pi
    ] {
        let value = Value::F32(f32::from_bits(bits));
        let ty = TypeDef::Simple(SimpleKind::F32);
        let mut ctx = xml_ctx(&registry);
        let text = save_value(SerializationFormat::Xml, &mut ctx, &ty, &value).unwrap();
        let mut lctx = ObjectLoadingContext::new(&registry);
        let loaded = load_value(&mut lctx, std::str::from_utf8(&text).unwrap(), &ty).unwrap();
        match loaded {
            Value::F32(loaded) => assert_eq!(loaded.to_bits(), bits),
            other => panic!("unexpected {other:?}"),
        }
    }

    for bits in [
        0x3FB9_9999_9999_999Au64, // 0.1f64
        0x0000_0000_0000_0001,    // smallest subnormal
        0x7FEF_FFFF_FFFF_FFFF,    // f64::MAX
        0x4009_21FB_5444_2D18,    // pi
    ] {
        let value = Value::F64(f64::from_bits(bits));
        let ty = TypeDef::Simple(SimpleKind::F64);
        let mut ctx = xml_ctx(&registry);
        let text = save_value(SerializationFormat::Xml, &mut ctx, &ty, &value).unwrap();
        let mut lctx = ObjectLoadingContext::new(&registry);
        let loaded = load_value(&mut lctx, std::str::from_utf8(&text).unwrap(), &ty).unwrap();
        match loaded {
            Value::F64(loaded) => assert_eq!(loaded.to_bits(), bits),
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn test_fixed_array_overflow_reports_and_clamps() {
    let registry = test_registry();
    let ty = TypeDef::static_array_of(TypeDef::Simple(SimpleKind::I32), 2);

    let reporter = Arc::new(CollectingErrorReporter::new());
    let mut lctx = ObjectLoadingContext::new(&registry);
    lctx.reporter = reporter.clone();

    let loaded = load_value(
        &mut lctx,
        "<data><element>1</element><element>2</element><element>3</element></data>",
        &ty,
    )
    .unwrap();
    assert_eq!(loaded, Value::Array(vec![Value::I32(1), Value::I32(2)]));
    assert!(reporter
        .errors()
        .iter()
        .any(|e| matches!(e, ReportedError::ArrayOverflow { count: 3, capacity: 2 })));
}

#[test]
fn test_unknown_class_in_xml_is_reported_and_null() {
    let registry = test_registry();
    let ty = TypeDef::StrongHandle(StringId::intern("test.Entity"));

    let reporter = Arc::new(CollectingErrorReporter::new());
    let mut lctx = ObjectLoadingContext::new(&registry);
    lctx.reporter = reporter.clone();

    let loaded = load_value(&mut lctx, "<data class=\"test.Vanished\"/>", &ty).unwrap();
    assert_eq!(loaded, Value::Object(None));
    assert!(reporter
        .errors()
        .iter()
        .any(|e| matches!(e, ReportedError::TypeMissing { .. })));
}

#[test]
fn test_undefined_ref_id_is_reported() {
    let registry = test_registry();
    let ty = TypeDef::StrongHandle(StringId::intern("test.Entity"));

    let reporter = Arc::new(CollectingErrorReporter::new());
    let mut lctx = ObjectLoadingContext::new(&registry);
    lctx.reporter = reporter.clone();

    let loaded = load_value(&mut lctx, "<data refId=\"9\"/>", &ty).unwrap();
    assert_eq!(loaded, Value::Object(None));
    assert!(reporter
        .errors()
        .iter()
        .any(|e| matches!(e, ReportedError::Text { .. })));
}

#[test]
fn test_bad_guid_is_reported() {
    let registry = test_registry();
    let ty = TypeDef::ResourceRef(StringId::intern("test.TestResource"));

    let reporter = Arc::new(CollectingErrorReporter::new());
    let mut lctx = ObjectLoadingContext::new(&registry);
    lctx.reporter = reporter.clone();

    let loaded = load_value(
        &mut lctx,
        "<data class=\"test.TestResource\" guid=\"not-a-guid\"/>",
        &ty,
    )
    .unwrap();
    assert_eq!(loaded, Value::Resource(ResourceRefValue::None));
    assert!(reporter
        .errors()
        .iter()
        .any(|e| matches!(e, ReportedError::GuidParseFailure { .. })));
}

#[test]
fn test_inlined_resource_xml() {
    let registry = test_registry();
    let res_cls = registry
        .find_class(StringId::intern("test.TestResource"))
        .unwrap();
    let resource = Object::create(&res_cls).unwrap();
    resource.write().unwrap().set("value", Value::I32(11)).unwrap();

    let ty = TypeDef::ResourceRef(StringId::intern("test.TestResource"));
    let value = Value::Resource(ResourceRefValue::Inlined(resource));

    let mut ctx = xml_ctx(&registry);
    let text = save_value(SerializationFormat::Xml, &mut ctx, &ty, &value).unwrap();
    let text = std::str::from_utf8(&text).unwrap().to_string();
    // class without guid means the object is inlined
    assert!(text.contains("class=\"test.TestResource\""));
    assert!(!text.contains("guid"));
    assert!(text.contains("<value>11</value>"));

    let mut lctx = ObjectLoadingContext::new(&registry);
    let loaded = load_value(&mut lctx, &text, &ty).unwrap();
    assert_eq!(loaded, value);
}

#[test]
fn test_xml_object_roundtrip_with_header() {
    let registry = test_registry();
    let cls = registry.find_class(StringId::intern("test.Entity")).unwrap();
    let obj = Object::create(&cls).unwrap();
    obj.write().unwrap().set("name", Value::Str("thing".into())).unwrap();

    // defaults: header on, no indentation
    let mut ctx = ObjectSavingContext::new(&registry);
    let text = save_object(SerializationFormat::Xml, &mut ctx, &obj).unwrap();
    let text = std::str::from_utf8(&text).unwrap();
    assert!(text.starts_with("<?xml"));

    let mut lctx = ObjectLoadingContext::new(&registry);
    let loaded = load_object(SerializationFormat::Xml, &mut lctx, text.as_bytes()).unwrap();
    assert!(objects_deep_eq(&obj, &loaded));
}

#[test]
fn test_json_writer_output() {
    let registry = test_registry();
    let cls = registry.find_class(StringId::intern("test.Entity")).unwrap();

    let child = Object::create(&cls).unwrap();
    child.write().unwrap().set("simple", Value::I32(3)).unwrap();
    let root = Object::create(&cls).unwrap();
    {
        let mut guard = root.write().unwrap();
        guard.set("name", Value::Str("root".into())).unwrap();
        guard
            .set(
                "children",
                Value::Array(vec![Value::object(&child), Value::object(&child)]),
            )
            .unwrap();
    }

    let mut ctx = ObjectSavingContext::new(&registry);
    let text = save_object(SerializationFormat::Json, &mut ctx, &root).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&text).unwrap();

    assert_eq!(json["class"], "test.Entity");
    assert_eq!(json["name"], "root");
    let children = json["children"].as_array().unwrap();
    assert_eq!(children[0]["id"], 1);
    assert_eq!(children[0]["simple"], "3");
    assert_eq!(children[1]["refId"], 1);
}

#[test]
fn test_json_has_no_reader() {
    let registry = test_registry();
    let mut lctx = ObjectLoadingContext::new(&registry);
    assert!(load_object(SerializationFormat::Json, &mut lctx, b"{}").is_err());
}
