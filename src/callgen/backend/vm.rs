use std::error::Error;
use std::fmt::{Display, Formatter};

use ahash::HashMapExt;
use fxhash::FxHashMap;
use log::trace;

use crate::backend::ir::{Inst, IrModule};
use crate::compiler::WordSize;
use crate::emit::{BinaryOp, Callee, CodeEmitter, EntryPoint};
use crate::layout::{HEAP_DESTROY_OFFSET, HEAP_REFCOUNT_OFFSET, align_to};
use crate::types::ScalarType;
use crate::{MEGABYTE, SV4, SV8};

#[cfg(test)]
mod vm_test;

/// Function pointers are tagged so they can never alias memory
pub const FUNCTION_POINTER_TAG: u64 = 0x8000_0000;
const STACK_BASE: u64 = 16;
const STACK_LIMIT: u64 = MEGABYTE as u64;
const MAX_CALL_DEPTH: u32 = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    UnknownSymbol(String),
    MissingBody(String),
    ArgumentCount { symbol: String, expected: usize, actual: usize },
    NullCall,
    NotAFunction(u64),
    OutOfBounds(u64),
    UseAfterFree(u64),
    StackOverflow,
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::UnknownSymbol(s) => write!(f, "no function named {s}"),
            VmError::MissingBody(s) => write!(f, "{s} is declared but has no body"),
            VmError::ArgumentCount { symbol, expected, actual } => {
                write!(f, "{symbol} takes {expected} arguments, got {actual}")
            }
            VmError::NullCall => write!(f, "call through null function pointer"),
            VmError::NotAFunction(v) => write!(f, "call through non-function value {v:#x}"),
            VmError::OutOfBounds(addr) => write!(f, "memory access out of bounds at {addr:#x}"),
            VmError::UseAfterFree(addr) => {
                write!(f, "reference count operation on freed {addr:#x}")
            }
            VmError::StackOverflow => write!(f, "stack overflow"),
        }
    }
}

impl Error for VmError {}

pub type VmResult<A> = Result<A, VmError>;

/// Executes a lowered module. Memory is one little-endian byte array: a stack region
/// followed by a bump-allocated heap whose live objects are tracked for leak checks.
pub struct Vm<'m> {
    module: &'m IrModule,
    word_size: WordSize,
    memory: Vec<u8>,
    stack_top: u64,
    heap_top: u64,
    live: FxHashMap<u64, u32>,
    depth: u32,
}

impl<'m> Vm<'m> {
    pub fn make(module: &'m IrModule) -> Vm<'m> {
        Vm {
            module,
            word_size: module.word_size(),
            memory: vec![0; STACK_LIMIT as usize],
            stack_top: STACK_BASE,
            heap_top: STACK_LIMIT,
            live: FxHashMap::with_capacity(64),
            depth: 0,
        }
    }

    /// Heap objects allocated and not yet destroyed
    pub fn live_objects(&self) -> usize {
        self.live.len()
    }

    pub fn call_symbol(&mut self, symbol: &str, args: &[u64]) -> VmResult<SV4<u64>> {
        let Some(entry) = self.module.lookup_function(symbol) else {
            return Err(VmError::UnknownSymbol(symbol.to_string()));
        };
        self.call(entry, args)
    }

    pub fn function_pointer(entry: EntryPoint) -> u64 {
        FUNCTION_POINTER_TAG | entry.as_u32() as u64
    }

    fn decode_function_pointer(&self, value: u64) -> VmResult<EntryPoint> {
        if value == 0 {
            return Err(VmError::NullCall);
        }
        if value & FUNCTION_POINTER_TAG == 0 {
            return Err(VmError::NotAFunction(value));
        }
        match EntryPoint::from_u32((value & !FUNCTION_POINTER_TAG) as u32) {
            Some(e) if e.index() < self.module.function_count() => Ok(e),
            _ => Err(VmError::NotAFunction(value)),
        }
    }

    pub fn call(&mut self, entry: EntryPoint, args: &[u64]) -> VmResult<SV4<u64>> {
        let module = self.module;
        let function = module.get_function(entry);
        let Some(body) = &function.body else {
            return Err(VmError::MissingBody(function.symbol.clone()));
        };
        if args.len() != function.params.len() {
            return Err(VmError::ArgumentCount {
                symbol: function.symbol.clone(),
                expected: function.params.len(),
                actual: args.len(),
            });
        }
        if self.depth >= MAX_CALL_DEPTH {
            return Err(VmError::StackOverflow);
        }
        trace!("vm: enter {}", function.symbol);
        self.depth += 1;
        let saved_stack = self.stack_top;
        let mut regs: Vec<u64> = vec![0; function.value_count as usize];
        for (param, arg) in function.params.iter().zip(args.iter()) {
            regs[param.id as usize] = truncate(*arg, param.scalar, self.word_size);
        }
        let result = self.run_body(body, &mut regs);
        self.stack_top = saved_stack;
        self.depth -= 1;
        result
    }

    fn run_body(&mut self, body: &[Inst], regs: &mut [u64]) -> VmResult<SV4<u64>> {
        for inst in body.iter() {
            match inst {
                Inst::ConstInt { dst, value } => {
                    regs[dst.id as usize] = truncate(*value, dst.scalar, self.word_size)
                }
                Inst::ConstFloat { dst, value } => {
                    regs[dst.id as usize] = match dst.scalar {
                        ScalarType::F32 => (*value as f32).to_bits() as u64,
                        _ => value.to_bits(),
                    }
                }
                Inst::Null { dst } => regs[dst.id as usize] = 0,
                Inst::FunctionAddress { dst, entry } => {
                    regs[dst.id as usize] = Vm::function_pointer(*entry)
                }
                Inst::Alloca { dst, layout } => {
                    let addr = align_to(self.stack_top as u32, layout.align.max(1)) as u64;
                    let end = addr + layout.size as u64;
                    if end > STACK_LIMIT {
                        return Err(VmError::StackOverflow);
                    }
                    self.memory[addr as usize..end as usize].fill(0);
                    self.stack_top = end;
                    regs[dst.id as usize] = addr;
                }
                Inst::Offset { dst, base, offset } => {
                    regs[dst.id as usize] = regs[base.id as usize] + *offset as u64
                }
                Inst::Load { dst, ptr, offset } => {
                    let addr = regs[ptr.id as usize] + *offset as u64;
                    regs[dst.id as usize] = self.read(addr, dst.scalar)?;
                }
                Inst::Store { value, ptr, offset } => {
                    let addr = regs[ptr.id as usize] + *offset as u64;
                    self.write(addr, value.scalar, regs[value.id as usize])?;
                }
                Inst::Memcpy { dst, src, size } => {
                    let (dst, src) = (regs[dst.id as usize], regs[src.id as usize]);
                    self.check_bounds(dst, *size)?;
                    self.check_bounds(src, *size)?;
                    let src_range = src as usize..(src + *size as u64) as usize;
                    self.memory.copy_within(src_range, dst as usize);
                }
                Inst::Binary { dst, op, lhs, rhs } => {
                    let l = regs[lhs.id as usize];
                    let r = regs[rhs.id as usize];
                    regs[dst.id as usize] = binary(*op, lhs.scalar, l, r, self.word_size);
                }
                Inst::Call { dsts, callee, args, .. } => {
                    let entry = match callee {
                        Callee::Direct(e) => *e,
                        Callee::Indirect(v) => self.decode_function_pointer(regs[v.id as usize])?,
                    };
                    let arg_values: SV8<u64> = args.iter().map(|a| regs[a.id as usize]).collect();
                    let results = self.call(entry, &arg_values)?;
                    for (dst, result) in dsts.iter().zip(results.iter()) {
                        regs[dst.id as usize] = *result;
                    }
                }
                Inst::HeapAlloc { dst, layout, destroy } => {
                    let addr = self.heap_alloc(layout.size, layout.align);
                    self.write(addr + HEAP_REFCOUNT_OFFSET as u64, ScalarType::I64, 1)?;
                    let destroy_ptr = destroy.map(Vm::function_pointer).unwrap_or(0);
                    let destroy_addr = addr + HEAP_DESTROY_OFFSET as u64;
                    self.write(destroy_addr, ScalarType::Pointer, destroy_ptr)?;
                    regs[dst.id as usize] = addr;
                }
                Inst::Retain { ptr } => self.retain(regs[ptr.id as usize])?,
                Inst::Release { ptr } => self.release(regs[ptr.id as usize])?,
                Inst::Ret { values } => {
                    return Ok(values.iter().map(|v| regs[v.id as usize]).collect());
                }
            }
        }
        Ok(SV4::new())
    }

    fn heap_alloc(&mut self, size: u32, align: u32) -> u64 {
        let addr = align_to(self.heap_top as u32, align.max(8)) as u64;
        let end = addr + size as u64;
        if self.memory.len() < end as usize {
            self.memory.resize(end as usize, 0);
        }
        self.heap_top = end;
        self.live.insert(addr, size);
        addr
    }

    pub fn retain(&mut self, ptr: u64) -> VmResult<()> {
        if ptr == 0 {
            return Ok(());
        }
        if !self.live.contains_key(&ptr) {
            return Err(VmError::UseAfterFree(ptr));
        }
        let count = self.read(ptr + HEAP_REFCOUNT_OFFSET as u64, ScalarType::I64)?;
        self.write(ptr + HEAP_REFCOUNT_OFFSET as u64, ScalarType::I64, count + 1)
    }

    pub fn release(&mut self, ptr: u64) -> VmResult<()> {
        if ptr == 0 {
            return Ok(());
        }
        if !self.live.contains_key(&ptr) {
            return Err(VmError::UseAfterFree(ptr));
        }
        let count = self.read(ptr + HEAP_REFCOUNT_OFFSET as u64, ScalarType::I64)?;
        if count > 1 {
            return self.write(ptr + HEAP_REFCOUNT_OFFSET as u64, ScalarType::I64, count - 1);
        }
        self.write(ptr + HEAP_REFCOUNT_OFFSET as u64, ScalarType::I64, 0)?;
        let destroy = self.read(ptr + HEAP_DESTROY_OFFSET as u64, ScalarType::Pointer)?;
        if destroy != 0 {
            let entry = self.decode_function_pointer(destroy)?;
            self.call(entry, &[ptr])?;
        }
        trace!("vm: freed {:#x}", ptr);
        self.live.remove(&ptr);
        Ok(())
    }

    /// The current reference count of a live heap object
    pub fn refcount(&self, ptr: u64) -> Option<u64> {
        if !self.live.contains_key(&ptr) {
            return None;
        }
        self.read(ptr + HEAP_REFCOUNT_OFFSET as u64, ScalarType::I64).ok()
    }

    fn check_bounds(&self, addr: u64, size: u32) -> VmResult<()> {
        if addr < STACK_BASE || addr + size as u64 > self.memory.len() as u64 {
            return Err(VmError::OutOfBounds(addr));
        }
        Ok(())
    }

    pub fn read(&self, addr: u64, scalar: ScalarType) -> VmResult<u64> {
        let size = scalar.size_bytes(self.word_size);
        self.check_bounds(addr, size)?;
        let mut bytes = [0u8; 8];
        let range = addr as usize..(addr as usize + size as usize);
        bytes[..size as usize].copy_from_slice(&self.memory[range]);
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn write(&mut self, addr: u64, scalar: ScalarType, value: u64) -> VmResult<()> {
        let size = scalar.size_bytes(self.word_size);
        self.check_bounds(addr, size)?;
        let bytes = value.to_le_bytes();
        let range = addr as usize..(addr as usize + size as usize);
        self.memory[range].copy_from_slice(&bytes[..size as usize]);
        Ok(())
    }
}

fn truncate(value: u64, scalar: ScalarType, word_size: WordSize) -> u64 {
    match scalar.size_bytes(word_size) {
        8 => value,
        bytes => value & ((1u64 << (bytes * 8)) - 1),
    }
}

fn sign_extend(value: u64, scalar: ScalarType, word_size: WordSize) -> i64 {
    let bits = scalar.size_bytes(word_size) * 8;
    if bits == 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

fn float_op(op: BinaryOp, scalar: ScalarType, l: u64, r: u64) -> u64 {
    match scalar {
        ScalarType::F32 => {
            let (l, r) = (f32::from_bits(l as u32), f32::from_bits(r as u32));
            let result = match op {
                BinaryOp::FAdd => l + r,
                BinaryOp::FSub => l - r,
                BinaryOp::FMul => l * r,
                _ => l / r,
            };
            result.to_bits() as u64
        }
        _ => {
            let (l, r) = (f64::from_bits(l), f64::from_bits(r));
            let result = match op {
                BinaryOp::FAdd => l + r,
                BinaryOp::FSub => l - r,
                BinaryOp::FMul => l * r,
                _ => l / r,
            };
            result.to_bits()
        }
    }
}

fn binary(op: BinaryOp, scalar: ScalarType, l: u64, r: u64, word_size: WordSize) -> u64 {
    if op.is_float() {
        return float_op(op, scalar, l, r);
    }
    let (sl, sr) = (sign_extend(l, scalar, word_size), sign_extend(r, scalar, word_size));
    let bits = scalar.size_bytes(word_size) * 8;
    let result = match op {
        BinaryOp::Add => l.wrapping_add(r),
        BinaryOp::Sub => l.wrapping_sub(r),
        BinaryOp::Mul => l.wrapping_mul(r),
        // Division by zero yields zero rather than trapping
        BinaryOp::SDiv => sl.checked_div(sr).unwrap_or(0) as u64,
        BinaryOp::SRem => sl.checked_rem(sr).unwrap_or(0) as u64,
        BinaryOp::And => l & r,
        BinaryOp::Or => l | r,
        BinaryOp::Xor => l ^ r,
        BinaryOp::Shl => l.wrapping_shl((r % bits as u64) as u32),
        BinaryOp::LShr => l.wrapping_shr((r % bits as u64) as u32),
        BinaryOp::CmpEq => return (l == r) as u64,
        BinaryOp::CmpNe => return (l != r) as u64,
        BinaryOp::CmpSlt => return (sl < sr) as u64,
        BinaryOp::CmpSle => return (sl <= sr) as u64,
        BinaryOp::FAdd | BinaryOp::FSub | BinaryOp::FMul | BinaryOp::FDiv => unreachable!(),
    };
    truncate(result, scalar, word_size)
}
