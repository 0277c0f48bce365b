use std::sync::Arc;

use crate::abi::*;
use crate::compiler::{LowerConfig, Target};
use crate::layout::Layout;
use crate::lower::LowerCaches;
use crate::types::*;

fn setup(target: Target) -> (Types, LowerCaches) {
    (Types::make(), LowerCaches::new(&LowerConfig::for_target(target)))
}

fn foreign_arg(target: Target, fields: &[TypeId]) -> ArgPlan {
    let (types, caches) = setup(target);
    let s = types.add_struct(fields.iter().copied());
    let classifier = AbiClassifier::new(&types, &caches, target);
    let abi = classifier.classify_signature(CallConv::Foreign, &[s], UNIT_TYPE_ID, false).unwrap();
    abi.params[0].plan.clone()
}

fn foreign_result(target: Target, fields: &[TypeId]) -> ResultPlan {
    let (types, caches) = setup(target);
    let s = types.add_struct(fields.iter().copied());
    let classifier = AbiClassifier::new(&types, &caches, target);
    classifier.classify_signature(CallConv::Foreign, &[], s, false).unwrap().result.clone()
}

#[test]
fn eightbyte_class_combine() {
    use EightbyteClass::*;
    assert_eq!(Initial.combine(Float), Float);
    assert_eq!(Float.combine(Float), Float);
    assert_eq!(Float.combine(Int), Int);
    assert_eq!(Int.combine(Float), Int);
    assert_eq!(Initial.combine(Initial), Initial);
}

#[test]
fn amd64_classifies_each_eightbyte() {
    let t = Target::LinuxIntel64;
    assert_eq!(
        foreign_arg(t, &[I64_TYPE_ID, F64_TYPE_ID]),
        ArgPlan::Coerced { scalars: smallvec::smallvec![ScalarType::I64, ScalarType::F64] }
    );
    assert_eq!(
        foreign_arg(t, &[F32_TYPE_ID, F32_TYPE_ID, I32_TYPE_ID]),
        ArgPlan::Coerced { scalars: smallvec::smallvec![ScalarType::F64, ScalarType::I32] }
    );
    assert_eq!(
        foreign_result(t, &[F64_TYPE_ID, F32_TYPE_ID]),
        ResultPlan::Coerced { scalars: smallvec::smallvec![ScalarType::F64, ScalarType::F32] }
    );
    assert_eq!(
        foreign_arg(t, &[I8_TYPE_ID, I8_TYPE_ID, I8_TYPE_ID]),
        ArgPlan::Coerced { scalars: smallvec::smallvec![ScalarType::I32] }
    );
}

#[test]
fn arm64_uses_integer_pairs() {
    let t = Target::MacOsArm64;
    assert_eq!(
        foreign_arg(t, &[I64_TYPE_ID, F64_TYPE_ID]),
        ArgPlan::Coerced { scalars: smallvec::smallvec![ScalarType::I64, ScalarType::I64] }
    );
    // Arguments widen to a full register; results keep their exact width
    assert_eq!(
        foreign_arg(t, &[I8_TYPE_ID, I8_TYPE_ID, I8_TYPE_ID]),
        ArgPlan::Coerced { scalars: smallvec::smallvec![ScalarType::I64] }
    );
    assert_eq!(
        foreign_result(t, &[I8_TYPE_ID, I8_TYPE_ID, I8_TYPE_ID]),
        ResultPlan::Coerced { scalars: smallvec::smallvec![ScalarType::I32] }
    );
}

#[test]
fn single_scalar_structs_are_direct() {
    for target in Target::ALL {
        assert_eq!(foreign_arg(target, &[I64_TYPE_ID]), ArgPlan::Direct);
        assert_eq!(foreign_arg(target, &[F32_TYPE_ID]), ArgPlan::Direct);
        assert_eq!(foreign_result(target, &[I16_TYPE_ID]), ResultPlan::Direct);
    }
}

#[test]
fn large_foreign_aggregates_go_through_memory() {
    let big = [I64_TYPE_ID; 6];
    let layout = Layout { size: 48, align: 8 };
    assert_eq!(foreign_arg(Target::LinuxIntel64, &big), ArgPlan::Byval { layout });
    assert_eq!(foreign_arg(Target::MacOsArm64, &big), ArgPlan::IndirectCopy { layout });
    assert_eq!(foreign_arg(Target::Wasm32, &big), ArgPlan::IndirectCopy { layout });
    for target in Target::ALL {
        assert_eq!(foreign_result(target, &big), ResultPlan::Indirect { layout });
    }
}

#[test]
fn foreign_signature_attributes() {
    let (types, caches) = setup(Target::LinuxIntel64);
    let big = types.add_struct([I64_TYPE_ID; 6]);
    let classifier = AbiClassifier::new(&types, &caches, Target::LinuxIntel64);
    let abi = classifier.classify_signature(CallConv::Foreign, &[big], big, false).unwrap();
    assert!(abi.has_sret());
    assert_eq!(abi.context_index(), None);
    assert_eq!(abi.lowered.params.as_slice(), &[ScalarType::Pointer, ScalarType::Pointer]);
    assert!(abi.lowered.results.is_empty());
    assert!(abi.lowered.attrs.contains(&AbiAttribute::IndirectResult { align: 8 }));
    assert!(abi.lowered.attrs.contains(&AbiAttribute::Byval { index: 1, align: 8 }));
    assert_eq!(abi.params[0].physical_start, 1);

    let (types, caches) = setup(Target::MacOsArm64);
    let big = types.add_struct([I64_TYPE_ID; 6]);
    let classifier = AbiClassifier::new(&types, &caches, Target::MacOsArm64);
    let abi = classifier.classify_signature(CallConv::Foreign, &[big], big, false).unwrap();
    assert!(abi.lowered.attrs.has_indirect_result());
    assert_eq!(abi.lowered.attrs.iter().count(), 1);
}

#[test]
fn attribute_set_is_idempotent() {
    let mut attrs = AbiAttributeSet::default();
    attrs.add_indirect_return_attributes(8);
    attrs.add_byval_argument_attributes(2, 16);
    let once = attrs.clone();
    attrs.add_indirect_return_attributes(8);
    attrs.add_byval_argument_attributes(2, 16);
    assert_eq!(attrs, once);
    assert_eq!(attrs.iter().count(), 2);
    assert_eq!(attrs.to_string(), "sret(align 8) byval(2, align 16)");
}

#[test]
fn wide_native_arguments_travel_in_memory() {
    let (types, caches) = setup(Target::LinuxIntel64);
    let big = types.add_struct([I64_TYPE_ID; 6]);
    let pair = types.add_struct([I64_TYPE_ID, I64_TYPE_ID]);
    let classifier = AbiClassifier::new(&types, &caches, Target::LinuxIntel64);
    let abi = classifier.classify_signature(CallConv::Native, &[big, pair], big, true).unwrap();
    let copy = Layout { size: 48, align: 8 };
    assert_eq!(abi.params[0].plan, ArgPlan::IndirectCopy { layout: copy });
    assert_eq!(abi.params[0].physical_count(), 1);
    assert_eq!(abi.params[1].plan, ArgPlan::Direct);
    assert_eq!(abi.params[1].physical_count(), 2);
    assert!(abi.has_sret());
    // sret, copy address, pair, context
    assert_eq!(
        abi.lowered.params.as_slice(),
        &[
            ScalarType::Pointer,
            ScalarType::Pointer,
            ScalarType::I64,
            ScalarType::I64,
            ScalarType::Pointer
        ]
    );
    assert_eq!(abi.context_index(), Some(4));
    assert_eq!(abi.params[0].physical_start, 1);
    assert_eq!(abi.params[1].physical_start, 2);
    // Native copies are never marked byval
    assert!(!abi.lowered.attrs.iter().any(|a| matches!(a, AbiAttribute::Byval { .. })));
}

#[test]
fn sret_exactly_when_the_layout_is_indirect() {
    for target in Target::ALL {
        let (types, caches) = setup(target);
        let shapes = [
            types.add_struct([U8_TYPE_ID; 5]),
            types.add_struct([I64_TYPE_ID; 3]),
            types.add_struct([I64_TYPE_ID; 2]),
            types.add_struct([I32_TYPE_ID, F32_TYPE_ID]),
            types.add_struct([I64_TYPE_ID; 6]),
            types.add_array(U16_TYPE_ID, 9),
            I64_TYPE_ID,
            UNIT_TYPE_ID,
        ];
        let classifier = AbiClassifier::new(&types, &caches, target);
        for shape in shapes {
            let layout = classifier.classify(shape).unwrap();
            for conv in [CallConv::Native, CallConv::Foreign] {
                let abi = classifier.classify_signature(conv, &[shape], shape, false).unwrap();
                let indirect = layout.indirect_required_for(conv);
                assert_eq!(abi.has_sret(), indirect, "{target:?} {conv} {shape}");
                let in_memory = matches!(
                    abi.params[0].plan,
                    ArgPlan::Byval { .. } | ArgPlan::IndirectCopy { .. }
                );
                assert_eq!(in_memory, indirect, "{target:?} {conv} {shape}");
                if indirect {
                    assert!(abi.lowered.results.is_empty());
                }
            }
            // The pre-emission queries agree with the foreign plans
            let foreign = classifier.classify_signature(CallConv::Foreign, &[shape], shape, false);
            let foreign = foreign.unwrap();
            assert_eq!(
                classifier.requires_external_indirect_result(shape).unwrap().is_some(),
                foreign.has_sret()
            );
            assert_eq!(
                classifier.requires_external_byval_argument(shape).unwrap().is_some(),
                layout.foreign_indirect_required
            );
            // Whatever is indirect natively is indirect for foreign calls too
            assert!(!layout.indirect_required || layout.foreign_indirect_required);
        }
    }
}

#[test]
fn many_small_fields_are_indirect_under_both_conventions() {
    let (types, caches) = setup(Target::LinuxIntel64);
    let five_bytes = types.add_struct([U8_TYPE_ID; 5]);
    let classifier = AbiClassifier::new(&types, &caches, Target::LinuxIntel64);
    assert!(classifier.classify(five_bytes).unwrap().indirect_required);
    let layout = Layout { size: 5, align: 1 };
    let fields = [U8_TYPE_ID; 5];
    assert_eq!(foreign_result(Target::LinuxIntel64, &fields), ResultPlan::Indirect { layout });
    assert_eq!(foreign_arg(Target::LinuxIntel64, &fields), ArgPlan::Byval { layout });
    assert_eq!(foreign_arg(Target::MacOsArm64, &fields), ArgPlan::IndirectCopy { layout });

    // Three words stay in registers natively but exceed two eightbytes for foreign calls
    let three = types.add_struct([I64_TYPE_ID; 3]);
    let layout = classifier.classify(three).unwrap();
    assert!(!layout.indirect_required);
    assert!(layout.foreign_indirect_required);
    let native = classifier.classify_signature(CallConv::Native, &[], three, false).unwrap();
    assert_eq!(native.result, ResultPlan::Direct);
}

#[test]
fn unit_results_have_no_scalars() {
    let (types, caches) = setup(Target::Wasm32);
    let classifier = AbiClassifier::new(&types, &caches, Target::Wasm32);
    let abi = classifier.classify_signature(CallConv::Native, &[], UNIT_TYPE_ID, true).unwrap();
    assert_eq!(abi.result, ResultPlan::Direct);
    assert!(abi.lowered.results.is_empty());
    assert_eq!(abi.lowered.params.as_slice(), &[ScalarType::Pointer]);
}

#[test]
fn signatures_are_cached() {
    let (types, caches) = setup(Target::LinuxIntel64);
    let pair = types.add_struct([I64_TYPE_ID, I64_TYPE_ID]);
    let classifier = AbiClassifier::new(&types, &caches, Target::LinuxIntel64);
    let a = classifier.classify_signature(CallConv::Foreign, &[pair], pair, false).unwrap();
    let b = classifier.classify_signature(CallConv::Foreign, &[pair], pair, false).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(caches.signatures.len(), 1);
}

#[test]
fn function_types_by_convention() {
    let (types, caches) = setup(Target::LinuxIntel64);
    let native = types.add_function([I64_TYPE_ID, F64_TYPE_ID], I64_TYPE_ID, CallConv::Native);
    let block = types.add_function([I64_TYPE_ID], I64_TYPE_ID, CallConv::Foreign);
    let classifier = AbiClassifier::new(&types, &caches, Target::LinuxIntel64);

    assert!(!classifier.is_foreign_representation(native));
    assert!(classifier.is_foreign_representation(block));
    assert!(!classifier.is_foreign_representation(I64_TYPE_ID));

    let abi = classifier.classify_function_type(native).unwrap();
    assert!(abi.has_context);
    assert_eq!(
        abi.lowered.params.as_slice(),
        &[ScalarType::I64, ScalarType::F64, ScalarType::Pointer]
    );

    let abi = classifier.classify_function_type(block).unwrap();
    assert!(!abi.has_context);
    assert_eq!(abi.params[0].type_id, block);
    assert_eq!(abi.lowered.params.as_slice(), &[ScalarType::Pointer, ScalarType::I64]);

    assert!(classifier.classify_function_type(I64_TYPE_ID).is_err());
}

#[test]
fn external_memory_queries() {
    let (types, caches) = setup(Target::MacOsArm64);
    let big = types.add_struct([I64_TYPE_ID; 3]);
    let small = types.add_struct([I64_TYPE_ID; 2]);
    let classifier = AbiClassifier::new(&types, &caches, Target::MacOsArm64);
    let layout = Layout { size: 24, align: 8 };
    assert_eq!(classifier.requires_external_indirect_result(big).unwrap(), Some(layout));
    assert_eq!(classifier.requires_external_byval_argument(big).unwrap(), Some(layout));
    assert_eq!(classifier.requires_external_indirect_result(small).unwrap(), None);
    assert_eq!(classifier.requires_external_byval_argument(small).unwrap(), None);
    assert_eq!(classifier.requires_external_byval_argument(I64_TYPE_ID).unwrap(), None);
}
