// Copyright (c) 2025 knix
// All rights reserved.

//! The low-level code-emission interface call lowering drives. A backend owns the
//! instruction stream; lowering only ever sees opaque values and entry points.

use std::fmt::{Display, Formatter};

use itertools::Itertools;

use crate::abi::AbiAttributeSet;
use crate::compiler::WordSize;
use crate::layout::{Layout, TypeLayout};
use crate::types::{CallConv, ScalarType};
use crate::{SV4, SV8, impl_copy_if_small, nz_u32_id};

/// A scalar machine value local to the function being emitted
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Value {
    pub id: u32,
    pub scalar: ScalarType,
}
impl_copy_if_small!(8, Value);

impl Value {
    pub const fn new(id: u32, scalar: ScalarType) -> Value {
        Value { id, scalar }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}:{}", self.id, self.scalar)
    }
}

/// A pointer value plus the alignment the pointee is known to have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub ptr: Value,
    pub align: u32,
}

nz_u32_id!(EntryPoint);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    Direct(EntryPoint),
    /// A function pointer computed at runtime
    Indirect(Value),
}

/// The physical shape of a function: what a backend declares and calls
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoweredSignature {
    pub params: SV8<ScalarType>,
    pub results: SV4<ScalarType>,
    pub conv: CallConv,
    pub attrs: AbiAttributeSet,
}

impl LoweredSignature {
    /// The shape of heap-object destroy functions: they receive the object
    pub fn destroy_fn() -> LoweredSignature {
        LoweredSignature {
            params: smallvec::smallvec![ScalarType::Pointer],
            results: SV4::new(),
            conv: CallConv::Native,
            attrs: AbiAttributeSet::default(),
        }
    }
}

impl Display for LoweredSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}) -> ({}) {}",
            self.params.iter().join(", "),
            self.results.iter().join(", "),
            self.conv
        )?;
        if !self.attrs.is_empty() {
            write!(f, " {}", self.attrs)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    SDiv,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    CmpEq,
    CmpNe,
    CmpSlt,
    CmpSle,
    FAdd,
    FSub,
    FMul,
    FDiv,
}

impl BinaryOp {
    pub fn result_scalar(&self, operand: ScalarType) -> ScalarType {
        match self {
            BinaryOp::CmpEq | BinaryOp::CmpNe | BinaryOp::CmpSlt | BinaryOp::CmpSle => {
                ScalarType::I8
            }
            _ => operand,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, BinaryOp::FAdd | BinaryOp::FSub | BinaryOp::FMul | BinaryOp::FDiv)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::SDiv => "sdiv",
            BinaryOp::SRem => "srem",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::LShr => "lshr",
            BinaryOp::CmpEq => "cmp_eq",
            BinaryOp::CmpNe => "cmp_ne",
            BinaryOp::CmpSlt => "cmp_slt",
            BinaryOp::CmpSle => "cmp_sle",
            BinaryOp::FAdd => "fadd",
            BinaryOp::FSub => "fsub",
            BinaryOp::FMul => "fmul",
            BinaryOp::FDiv => "fdiv",
        }
    }
}

/// Every method appends to the current insert function except the declaration and
/// insertion-point methods. Each lowering worker owns its emitter exclusively.
pub trait CodeEmitter {
    fn word_size(&self) -> WordSize;

    fn declare_function(&mut self, symbol: &str, signature: &LoweredSignature) -> EntryPoint;
    fn lookup_function(&self, symbol: &str) -> Option<EntryPoint>;
    fn function_signature(&self, entry: EntryPoint) -> &LoweredSignature;
    fn has_body(&self, entry: EntryPoint) -> bool;

    /// Starts the body of `entry`, makes it the insert function, and returns its parameters
    fn begin_body(&mut self, entry: EntryPoint) -> SV8<Value>;
    fn insert_function(&self) -> Option<EntryPoint>;
    fn set_insert_function(&mut self, entry: Option<EntryPoint>);

    fn const_int(&mut self, scalar: ScalarType, value: u64) -> Value;
    fn const_float(&mut self, scalar: ScalarType, value: f64) -> Value;
    fn const_null(&mut self) -> Value;
    fn function_address(&mut self, entry: EntryPoint) -> Value;

    /// Zero-initialized stack temporary, live until the insert function returns
    fn alloca(&mut self, layout: Layout) -> Address;
    fn offset_address(&mut self, base: Value, offset: u32) -> Value;
    fn load(&mut self, scalar: ScalarType, ptr: Value, offset: u32) -> Value;
    fn store(&mut self, value: Value, ptr: Value, offset: u32);
    fn memcpy(&mut self, dst: Value, src: Value, size: u32);
    fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Value;

    fn call(&mut self, callee: Callee, signature: &LoweredSignature, args: &[Value]) -> SV4<Value>;

    /// Allocates a heap object with refcount 1 and the given destroy function in its header
    fn heap_alloc(&mut self, object: Layout, destroy: Option<EntryPoint>) -> Value;
    /// No-op on null
    fn retain(&mut self, ptr: Value);
    /// No-op on null; runs the destroy function and frees when the count reaches zero
    fn release(&mut self, ptr: Value);

    fn ret(&mut self, values: &[Value]);
}

pub fn store_explosion(
    emitter: &mut dyn CodeEmitter,
    layout: &TypeLayout,
    values: &[Value],
    ptr: Value,
    base_offset: u32,
) {
    debug_assert_eq!(values.len(), layout.explosion_arity());
    for (slot, value) in layout.slots.iter().zip(values.iter()) {
        emitter.store(*value, ptr, base_offset + slot.offset);
    }
}

pub fn load_explosion(
    emitter: &mut dyn CodeEmitter,
    layout: &TypeLayout,
    ptr: Value,
    base_offset: u32,
) -> SV8<Value> {
    layout
        .slots
        .iter()
        .map(|slot| emitter.load(slot.scalar, ptr, base_offset + slot.offset))
        .collect()
}

/// Retains (or releases) the reference-counted slots of one value's explosion
pub fn retain_refcounted(emitter: &mut dyn CodeEmitter, layout: &TypeLayout, values: &[Value]) {
    for index in layout.refcounted.iter() {
        emitter.retain(values[*index as usize]);
    }
}

pub fn release_refcounted(emitter: &mut dyn CodeEmitter, layout: &TypeLayout, values: &[Value]) {
    for index in layout.refcounted.iter() {
        emitter.release(values[*index as usize]);
    }
}
