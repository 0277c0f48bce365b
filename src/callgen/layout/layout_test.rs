use std::sync::Arc;

use crate::compiler::{LowerConfig, Target, WordSize};
use crate::errors::LowerErrorKind;
use crate::idents::IdentPool;
use crate::layout::*;
use crate::types::*;

fn cache_for(target: Target) -> LayoutCache {
    LayoutCache::new(&LowerConfig::for_target(target))
}

#[test]
fn struct_layout_1() {
    let mut l = Layout::ZERO;
    assert_eq!(l.append_to_aggregate(Layout::from_scalar_bytes(8)), 0);
    assert_eq!(l.size, 8);
    assert_eq!(l.append_to_aggregate(Layout::from_scalar_bytes(1)), 8);
    assert_eq!(l.size, 9);
    assert_eq!(l.align, 8);
    assert_eq!(l.stride(), 16);
    assert_eq!(l.append_to_aggregate(Layout::from_scalar_bytes(4)), 12);
    assert_eq!(l.size, 16);
    assert_eq!(l.stride(), 16);
}

#[test]
fn add_zero_no_change() {
    let mut l = Layout::ZERO;
    l.append_to_aggregate(Layout::from_scalar_bytes(4));
    let offset = l.append_to_aggregate(Layout::ZERO);
    assert_eq!(offset, 4);
    assert_eq!(l.size, 4);
    assert_eq!(l.align, 4);
}

#[test]
fn eightbyte_padding() {
    let l = Layout { size: 12, align: 4 };
    assert_eq!(l.eightbyte_padded(), Layout { size: 16, align: 8 });
}

#[test]
fn scalars_explode_to_one_slot() {
    let types = Types::make();
    let cache = cache_for(Target::LinuxIntel64);
    for (type_id, scalar) in [
        (BOOL_TYPE_ID, ScalarType::I8),
        (U16_TYPE_ID, ScalarType::I16),
        (I32_TYPE_ID, ScalarType::I32),
        (I64_TYPE_ID, ScalarType::I64),
        (F32_TYPE_ID, ScalarType::F32),
        (POINTER_TYPE_ID, ScalarType::Pointer),
    ] {
        let layout = cache.classify(&types, type_id).unwrap();
        assert_eq!(layout.is_single_scalar(), Some(scalar));
        assert!(!layout.indirect_required);
        assert!(layout.is_trivial());
    }
    let unit = cache.classify(&types, UNIT_TYPE_ID).unwrap();
    assert_eq!(unit.explosion_arity(), 0);
    assert_eq!(unit.layout.size, 0);
}

#[test]
fn struct_explosion_concatenates_fields() {
    let types = Types::make();
    let cache = cache_for(Target::LinuxIntel64);
    let inner = types.add_struct([I8_TYPE_ID, I32_TYPE_ID]);
    let outer = types.add_struct([inner, F64_TYPE_ID, BOOL_TYPE_ID]);
    let layout = cache.classify(&types, outer).unwrap();
    let scalars: Vec<ScalarType> = layout.scalars().collect();
    assert_eq!(scalars, vec![ScalarType::I8, ScalarType::I32, ScalarType::F64, ScalarType::I8]);
    let offsets: Vec<u32> = layout.slots.iter().map(|s| s.offset).collect();
    assert_eq!(offsets, vec![0, 4, 8, 16]);
    assert_eq!(layout.layout, Layout { size: 17, align: 8 });
    assert!(!layout.indirect_required);
}

#[test]
fn arrays_repeat_their_element() {
    let types = Types::make();
    let cache = cache_for(Target::LinuxIntel64);
    let arr = types.add_array(I32_TYPE_ID, 3);
    let layout = cache.classify(&types, arr).unwrap();
    assert_eq!(layout.explosion_arity(), 3);
    assert_eq!(layout.layout.size, 12);

    let empty = types.add_array(I64_TYPE_ID, 0);
    let layout = cache.classify(&types, empty).unwrap();
    assert_eq!(layout.explosion_arity(), 0);
    assert_eq!(layout.layout.align, 8);
}

#[test]
fn indirect_threshold_by_arity_and_size() {
    let types = Types::make();
    let cache = cache_for(Target::LinuxIntel64);
    let four = types.add_struct([I64_TYPE_ID; 4]);
    let five = types.add_struct([I8_TYPE_ID; 5]);
    let one_wide = types.add_struct([types.add_array(I8_TYPE_ID, 0), I64_TYPE_ID]);
    assert!(!cache.classify(&types, four).unwrap().indirect_required);
    assert!(cache.classify(&types, five).unwrap().indirect_required);
    assert!(!cache.classify(&types, one_wide).unwrap().indirect_required);

    // Four i64s are 32 bytes: more than four words on wasm32
    let wasm = cache_for(Target::Wasm32);
    assert!(wasm.classify(&types, four).unwrap().indirect_required);
    let two = types.add_struct([I64_TYPE_ID; 2]);
    assert!(!wasm.classify(&types, two).unwrap().indirect_required);
}

#[test]
fn max_direct_scalars_is_configurable() {
    let types = Types::make();
    let mut config = LowerConfig::for_target(Target::MacOsArm64);
    config.max_direct_scalars = 1;
    let cache = LayoutCache::new(&config);
    let pair = types.add_struct([I32_TYPE_ID, I32_TYPE_ID]);
    assert!(cache.classify(&types, pair).unwrap().indirect_required);
    assert!(!cache.classify(&types, I64_TYPE_ID).unwrap().indirect_required);
}

#[test]
fn function_values_count_their_context() {
    let types = Types::make();
    let cache = cache_for(Target::LinuxIntel64);
    let native = types.add_function([I64_TYPE_ID], I64_TYPE_ID, CallConv::Native);
    let layout = cache.classify(&types, native).unwrap();
    assert_eq!(layout.scalars().collect::<Vec<_>>(), vec![ScalarType::Pointer; 2]);
    assert_eq!(layout.refcounted.as_slice(), &[1]);

    let foreign = types.add_function([I64_TYPE_ID], I64_TYPE_ID, CallConv::Foreign);
    let layout = cache.classify(&types, foreign).unwrap();
    assert_eq!(layout.explosion_arity(), 1);
    assert_eq!(layout.refcounted.as_slice(), &[0]);

    let holder = types.add_struct([I64_TYPE_ID, native, foreign]);
    let layout = cache.classify(&types, holder).unwrap();
    assert_eq!(layout.refcounted.as_slice(), &[2, 3]);
}

#[test]
fn classification_is_cached_and_deterministic() {
    let types = Types::make();
    let cache = cache_for(Target::LinuxIntel64);
    let s = types.add_struct([I64_TYPE_ID, F32_TYPE_ID]);
    let first = cache.classify(&types, s).unwrap();
    let second = cache.classify(&types, s).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.len(), 1);

    let fresh = cache_for(Target::LinuxIntel64);
    assert_eq!(*fresh.classify(&types, s).unwrap(), *first);
}

#[test]
fn concurrent_classification_agrees() {
    let types = Types::make();
    let cache = cache_for(Target::LinuxIntel64);
    let s = types.add_struct([I64_TYPE_ID, I8_TYPE_ID, F64_TYPE_ID]);
    let results: Vec<Arc<TypeLayout>> = std::thread::scope(|scope| {
        let handles: Vec<_> =
            (0..4).map(|_| scope.spawn(|| cache.classify(&types, s).unwrap())).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for r in results.iter() {
        assert_eq!(**r, *results[0]);
    }
    assert_eq!(cache.len(), 1);
}

#[test]
fn unresolved_type_param_is_a_layout_error() {
    let types = Types::make();
    let mut idents = IdentPool::make();
    let t = types.add_type_param(idents.intern("T"));
    let cache = cache_for(Target::LinuxIntel64);
    let err = cache.classify(&types, t).unwrap_err();
    assert_eq!(err.kind, LowerErrorKind::Layout);

    let wrapped = types.add_struct([I64_TYPE_ID, t]);
    assert_eq!(cache.classify(&types, wrapped).unwrap_err().kind, LowerErrorKind::Layout);

    let subs = Substitutions::from_pairs([(idents.intern("T"), I32_TYPE_ID)]);
    let resolved = types.substitute(wrapped, &subs);
    assert_eq!(cache.classify(&types, resolved).unwrap().explosion_arity(), 2);
}

#[test]
fn heap_objects_put_payload_after_header() {
    let (object, offset) = heap_object_layout(WordSize::W64, Layout::from_scalar_bytes(8));
    assert_eq!(offset, 16);
    assert_eq!(object.size, 24);
    let (object, offset) = heap_object_layout(WordSize::W32, Layout::from_scalar_bytes(4));
    assert_eq!(offset, 12);
    assert_eq!(object.size, 16);
    assert_eq!(HEAP_REFCOUNT_OFFSET, 0);
    assert_eq!(HEAP_DESTROY_OFFSET, 8);
}

#[test]
fn oversized_types_are_layout_errors() {
    let types = Types::make();
    let cache = cache_for(Target::LinuxIntel64);
    for oversized in [
        types.add_array(I64_TYPE_ID, 1 << 30),
        types.add_array(U8_TYPE_ID, 600_000_000),
        types.add_array(I64_TYPE_ID, u32::MAX),
        types.add_array(types.add_array(U8_TYPE_ID, 1 << 16), 1 << 16),
    ] {
        assert_eq!(cache.classify(&types, oversized).unwrap_err().kind, LowerErrorKind::Layout);
    }

    // Each half fits, together they do not
    let half = types.add_array(U8_TYPE_ID, MAX_EXPLOSION_ARITY as u32);
    assert_eq!(cache.classify(&types, half).unwrap().explosion_arity(), MAX_EXPLOSION_ARITY);
    let both = types.add_struct([half, U8_TYPE_ID]);
    assert_eq!(cache.classify(&types, both).unwrap_err().kind, LowerErrorKind::Layout);

    let zero_sized = types.add_array(UNIT_TYPE_ID, u32::MAX);
    let layout = cache.classify(&types, zero_sized).unwrap();
    assert_eq!(layout.layout.size, 0);
    assert_eq!(layout.explosion_arity(), 0);
}

#[test]
fn checked_append_reports_overflow() {
    let mut l = Layout { size: u32::MAX - 2, align: 1 };
    assert_eq!(l.checked_append_to_aggregate(Layout::from_scalar_bytes(8)), None);
    let mut l = Layout::ZERO;
    assert_eq!(l.checked_append_to_aggregate(Layout::from_scalar_bytes(4)), Some(0));
    assert_eq!(l.checked_append_to_aggregate(Layout::from_scalar_bytes(8)), Some(8));
    assert_eq!(l, Layout { size: 16, align: 8 });
    assert_eq!(checked_align_to(u32::MAX, 8), None);
}
