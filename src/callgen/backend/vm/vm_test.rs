use crate::abi::AbiAttributeSet;
use crate::backend::ir::IrModule;
use crate::backend::vm::*;
use crate::compiler::WordSize;
use crate::emit::{BinaryOp, Callee, CodeEmitter, LoweredSignature};
use crate::layout::{Layout, heap_object_layout};
use crate::types::{CallConv, ScalarType};

fn sig(params: &[ScalarType], results: &[ScalarType]) -> LoweredSignature {
    LoweredSignature {
        params: params.iter().copied().collect(),
        results: results.iter().copied().collect(),
        conv: CallConv::Native,
        attrs: AbiAttributeSet::default(),
    }
}

fn binary_module(op: BinaryOp, scalar: ScalarType) -> IrModule {
    let mut m = IrModule::make("test", WordSize::W64);
    let f = m.declare_function("f", &sig(&[scalar, scalar], &[op.result_scalar(scalar)]));
    let params = m.begin_body(f);
    let result = m.binary(op, params[0], params[1]);
    m.ret(&[result]);
    m
}

fn run_binary(op: BinaryOp, scalar: ScalarType, l: u64, r: u64) -> u64 {
    let m = binary_module(op, scalar);
    let mut vm = Vm::make(&m);
    vm.call_symbol("f", &[l, r]).unwrap()[0]
}

#[test]
fn integer_arithmetic_wraps_at_scalar_width() {
    assert_eq!(run_binary(BinaryOp::Add, ScalarType::I8, 200, 100), 44);
    assert_eq!(run_binary(BinaryOp::Sub, ScalarType::I16, 0, 1), 0xFFFF);
    assert_eq!(run_binary(BinaryOp::Mul, ScalarType::I64, 6, 7), 42);
    let minus_twelve = (-12i32) as u32 as u64;
    assert_eq!(run_binary(BinaryOp::SDiv, ScalarType::I32, minus_twelve, 4), 0xFFFF_FFFD);
    assert_eq!(run_binary(BinaryOp::SRem, ScalarType::I64, 17, 5), 2);
    assert_eq!(run_binary(BinaryOp::Shl, ScalarType::I8, 1, 9), 2);
    assert_eq!(run_binary(BinaryOp::LShr, ScalarType::I64, 0x80, 4), 0x8);
    assert_eq!(run_binary(BinaryOp::Xor, ScalarType::I64, 0b1100, 0b1010), 0b0110);
}

#[test]
fn division_by_zero_is_zero() {
    assert_eq!(run_binary(BinaryOp::SDiv, ScalarType::I64, 9, 0), 0);
    assert_eq!(run_binary(BinaryOp::SRem, ScalarType::I64, 9, 0), 0);
}

#[test]
fn comparisons_are_signed() {
    assert_eq!(run_binary(BinaryOp::CmpSlt, ScalarType::I8, 0xFF, 1), 1);
    assert_eq!(run_binary(BinaryOp::CmpSle, ScalarType::I64, 3, 3), 1);
    assert_eq!(run_binary(BinaryOp::CmpEq, ScalarType::I32, 3, 4), 0);
    assert_eq!(run_binary(BinaryOp::CmpNe, ScalarType::I32, 3, 4), 1);
}

#[test]
fn float_arithmetic() {
    let r = run_binary(BinaryOp::FMul, ScalarType::F64, 1.5f64.to_bits(), 4.0f64.to_bits());
    assert_eq!(f64::from_bits(r), 6.0);
    let r = run_binary(
        BinaryOp::FAdd,
        ScalarType::F32,
        0.25f32.to_bits() as u64,
        0.5f32.to_bits() as u64,
    );
    assert_eq!(f32::from_bits(r as u32), 0.75);
}

#[test]
fn memory_reads_truncate_to_scalar_width() {
    let m = IrModule::make("test", WordSize::W64);
    let mut vm = Vm::make(&m);
    vm.write(64, ScalarType::I16, 0x12345).unwrap();
    assert_eq!(vm.read(64, ScalarType::I16).unwrap(), 0x2345);
    assert_eq!(vm.read(64, ScalarType::I8).unwrap(), 0x45);
    assert_eq!(vm.read(0, ScalarType::I8), Err(VmError::OutOfBounds(0)));

    let m = IrModule::make("test", WordSize::W32);
    let mut vm = Vm::make(&m);
    vm.write(64, ScalarType::Pointer, 0xAABB_CCDD_EEFF).unwrap();
    assert_eq!(vm.read(64, ScalarType::Pointer).unwrap(), 0xCCDD_EEFF);
}

#[test]
fn stack_temporaries_and_memcpy() {
    let mut m = IrModule::make("test", WordSize::W64);
    let f = m.declare_function("f", &sig(&[ScalarType::I64], &[ScalarType::I64]));
    let params = m.begin_body(f);
    let a = m.alloca(Layout { size: 16, align: 8 });
    let b = m.alloca(Layout { size: 16, align: 8 });
    m.store(params[0], a.ptr, 8);
    m.memcpy(b.ptr, a.ptr, 16);
    let second = m.offset_address(b.ptr, 8);
    let loaded = m.load(ScalarType::I64, second, 0);
    m.ret(&[loaded]);

    let mut vm = Vm::make(&m);
    assert_eq!(vm.call_symbol("f", &[99]).unwrap().as_slice(), &[99]);
}

#[test]
fn indirect_calls_go_through_tagged_pointers() {
    let mut m = IrModule::make("test", WordSize::W64);
    let double = m.declare_function("double", &sig(&[ScalarType::I64], &[ScalarType::I64]));
    let params = m.begin_body(double);
    let sum = m.binary(BinaryOp::Add, params[0], params[0]);
    m.ret(&[sum]);

    let apply_sig = sig(&[ScalarType::Pointer, ScalarType::I64], &[ScalarType::I64]);
    let apply = m.declare_function("apply", &apply_sig);
    let params = m.begin_body(apply);
    let callee_sig = sig(&[ScalarType::I64], &[ScalarType::I64]);
    let results = m.call(Callee::Indirect(params[0]), &callee_sig, &[params[1]]);
    m.ret(&results);

    let mut vm = Vm::make(&m);
    let pointer = Vm::function_pointer(double);
    assert_ne!(pointer & FUNCTION_POINTER_TAG, 0);
    assert_eq!(vm.call_symbol("apply", &[pointer, 21]).unwrap()[0], 42);
    assert_eq!(vm.call_symbol("apply", &[0, 21]), Err(VmError::NullCall));
    assert_eq!(vm.call_symbol("apply", &[64, 21]), Err(VmError::NotAFunction(64)));
}

#[test]
fn call_errors() {
    let mut m = IrModule::make("test", WordSize::W64);
    m.declare_function("extern_only", &sig(&[], &[]));
    let f = m.declare_function("f", &sig(&[ScalarType::I64], &[]));
    m.begin_body(f);
    m.ret(&[]);

    let mut vm = Vm::make(&m);
    assert_eq!(vm.call_symbol("nope", &[]), Err(VmError::UnknownSymbol("nope".to_string())));
    assert_eq!(
        vm.call_symbol("extern_only", &[]),
        Err(VmError::MissingBody("extern_only".to_string()))
    );
    assert_eq!(
        vm.call_symbol("f", &[]),
        Err(VmError::ArgumentCount { symbol: "f".to_string(), expected: 1, actual: 0 })
    );
    assert!(vm.call_symbol("f", &[1]).unwrap().is_empty());
}

#[test]
fn unbounded_recursion_overflows() {
    let mut m = IrModule::make("test", WordSize::W64);
    let f = m.declare_function("f", &sig(&[], &[]));
    m.begin_body(f);
    m.call(Callee::Direct(f), &sig(&[], &[]), &[]);
    m.ret(&[]);
    let mut vm = Vm::make(&m);
    assert_eq!(vm.call_symbol("f", &[]), Err(VmError::StackOverflow));
}

#[test]
fn refcounts_follow_retain_and_release() {
    let mut m = IrModule::make("test", WordSize::W64);
    let alloc = m.declare_function("alloc", &sig(&[], &[ScalarType::Pointer]));
    m.begin_body(alloc);
    let (object, _) = heap_object_layout(WordSize::W64, Layout::from_scalar_bytes(8));
    let ptr = m.heap_alloc(object, None);
    m.ret(&[ptr]);

    let mut vm = Vm::make(&m);
    let ptr = vm.call_symbol("alloc", &[]).unwrap()[0];
    assert_eq!(vm.live_objects(), 1);
    assert_eq!(vm.refcount(ptr), Some(1));
    vm.retain(ptr).unwrap();
    assert_eq!(vm.refcount(ptr), Some(2));
    vm.release(ptr).unwrap();
    vm.release(ptr).unwrap();
    assert_eq!(vm.refcount(ptr), None);
    assert_eq!(vm.live_objects(), 0);
    assert_eq!(vm.release(ptr), Err(VmError::UseAfterFree(ptr)));
    // Null is ignored
    vm.retain(0).unwrap();
    vm.release(0).unwrap();
}

#[test]
fn destroy_functions_release_what_objects_hold() {
    let mut m = IrModule::make("test", WordSize::W64);
    let (object, payload_offset) =
        heap_object_layout(WordSize::W64, Layout::from_scalar_bytes(8));

    let destroy = m.declare_function("destroy_outer", &LoweredSignature::destroy_fn());
    let params = m.begin_body(destroy);
    let inner = m.load(ScalarType::Pointer, params[0], payload_offset);
    m.release(inner);
    m.ret(&[]);

    let f = m.declare_function("f", &sig(&[], &[ScalarType::I64]));
    m.begin_body(f);
    let inner = m.heap_alloc(object, None);
    let outer = m.heap_alloc(object, Some(destroy));
    m.store(inner, outer, payload_offset);
    m.retain(outer);
    m.release(outer);
    m.release(outer);
    let seven = m.const_int(ScalarType::I64, 7);
    m.ret(&[seven]);

    let mut vm = Vm::make(&m);
    assert_eq!(vm.call_symbol("f", &[]).unwrap()[0], 7);
    assert_eq!(vm.live_objects(), 0);
}
