// Copyright (c) 2025 knix
// All rights reserved.

use std::fmt::{Display, Formatter};

use ahash::HashMapExt;
use fxhash::FxHashMap;
use itertools::Itertools;
use log::debug;

use crate::compiler::WordSize;
use crate::emit::{Address, BinaryOp, Callee, CodeEmitter, EntryPoint, LoweredSignature, Value};
use crate::layout::Layout;
use crate::types::ScalarType;
use crate::{SV4, SV8};

#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    ConstInt { dst: Value, value: u64 },
    ConstFloat { dst: Value, value: f64 },
    Null { dst: Value },
    FunctionAddress { dst: Value, entry: EntryPoint },
    Alloca { dst: Value, layout: Layout },
    Offset { dst: Value, base: Value, offset: u32 },
    Load { dst: Value, ptr: Value, offset: u32 },
    Store { value: Value, ptr: Value, offset: u32 },
    Memcpy { dst: Value, src: Value, size: u32 },
    Binary { dst: Value, op: BinaryOp, lhs: Value, rhs: Value },
    Call { dsts: SV4<Value>, callee: Callee, signature: LoweredSignature, args: SV8<Value> },
    HeapAlloc { dst: Value, layout: Layout, destroy: Option<EntryPoint> },
    Retain { ptr: Value },
    Release { ptr: Value },
    Ret { values: SV4<Value> },
}

impl Inst {
    fn remap_entries(&mut self, map: &[EntryPoint]) {
        let remap = |e: &mut EntryPoint| *e = map[e.index()];
        match self {
            Inst::FunctionAddress { entry, .. } => remap(entry),
            Inst::Call { callee: Callee::Direct(entry), .. } => remap(entry),
            Inst::HeapAlloc { destroy: Some(entry), .. } => remap(entry),
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct IrFunction {
    pub symbol: String,
    pub signature: LoweredSignature,
    pub params: SV8<Value>,
    /// None until a body is begun; declarations only are external
    pub body: Option<Vec<Inst>>,
    pub value_count: u32,
}

impl IrFunction {
    fn new_value(&mut self, scalar: ScalarType) -> Value {
        let v = Value::new(self.value_count, scalar);
        self.value_count += 1;
        v
    }
}

/// A recording emitter. Value ids are local to their function, so bodies can be moved
/// between modules by remapping entry points alone.
#[derive(Debug, Clone)]
pub struct IrModule {
    pub name: String,
    word_size: WordSize,
    functions: Vec<IrFunction>,
    by_symbol: FxHashMap<String, EntryPoint>,
    insert: Option<EntryPoint>,
}

impl IrModule {
    pub fn make(name: impl Into<String>, word_size: WordSize) -> IrModule {
        IrModule {
            name: name.into(),
            word_size,
            functions: Vec::new(),
            by_symbol: FxHashMap::with_capacity(64),
            insert: None,
        }
    }

    pub fn get_function(&self, entry: EntryPoint) -> &IrFunction {
        &self.functions[entry.index()]
    }

    pub fn function_by_symbol(&self, symbol: &str) -> Option<&IrFunction> {
        self.by_symbol.get(symbol).map(|e| self.get_function(*e))
    }

    pub fn iter_functions(&self) -> impl Iterator<Item = (EntryPoint, &IrFunction)> {
        self.functions.iter().enumerate().map(|(i, f)| (EntryPoint::from_index(i), f))
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    fn current(&mut self) -> &mut IrFunction {
        let Some(entry) = self.insert else {
            panic!("IrModule: no insert function")
        };
        &mut self.functions[entry.index()]
    }

    fn push(&mut self, inst: Inst) {
        let f = self.current();
        match &mut f.body {
            Some(body) => body.push(inst),
            None => panic!("IrModule: {} has no body begun", f.symbol),
        }
    }

    fn define(&mut self, scalar: ScalarType, make: impl FnOnce(Value) -> Inst) -> Value {
        let dst = self.current().new_value(scalar);
        self.push(make(dst));
        dst
    }

    /// Merges worker modules by symbol. A symbol defined in several modules keeps the
    /// first body; those duplicates are trampolines and instantiations lowered
    /// identically by more than one worker. Functions end up sorted by symbol so the
    /// result does not depend on how work was split.
    pub fn link(name: impl Into<String>, word_size: WordSize, modules: Vec<IrModule>) -> IrModule {
        let mut symbols: Vec<String> = modules
            .iter()
            .flat_map(|m| m.functions.iter().map(|f| f.symbol.clone()))
            .unique()
            .collect();
        symbols.sort();
        let mut linked = IrModule::make(name, word_size);
        for symbol in symbols.iter() {
            let Some(signature) = modules
                .iter()
                .find_map(|m| m.function_by_symbol(symbol).map(|f| f.signature.clone()))
            else {
                continue;
            };
            linked.declare_function(symbol, &signature);
        }
        for module in modules.into_iter() {
            let map: Vec<EntryPoint> =
                module.functions.iter().map(|f| linked.by_symbol[&f.symbol]).collect();
            for function in module.functions.into_iter() {
                let target = linked.by_symbol[&function.symbol];
                let Some(mut body) = function.body else { continue };
                let slot = &mut linked.functions[target.index()];
                if slot.body.is_some() {
                    debug!("link: dropping duplicate body of {}", function.symbol);
                    continue;
                }
                for inst in body.iter_mut() {
                    inst.remap_entries(&map);
                }
                slot.body = Some(body);
                slot.params = function.params;
                slot.value_count = function.value_count;
            }
        }
        linked
    }
}

impl CodeEmitter for IrModule {
    fn word_size(&self) -> WordSize {
        self.word_size
    }

    fn declare_function(&mut self, symbol: &str, signature: &LoweredSignature) -> EntryPoint {
        if let Some(existing) = self.by_symbol.get(symbol) {
            debug_assert_eq!(&self.functions[existing.index()].signature, signature);
            return *existing;
        }
        let entry = EntryPoint::from_index(self.functions.len());
        self.functions.push(IrFunction {
            symbol: symbol.to_string(),
            signature: signature.clone(),
            params: SV8::new(),
            body: None,
            value_count: 0,
        });
        self.by_symbol.insert(symbol.to_string(), entry);
        entry
    }

    fn lookup_function(&self, symbol: &str) -> Option<EntryPoint> {
        self.by_symbol.get(symbol).copied()
    }

    fn function_signature(&self, entry: EntryPoint) -> &LoweredSignature {
        &self.functions[entry.index()].signature
    }

    fn has_body(&self, entry: EntryPoint) -> bool {
        self.functions[entry.index()].body.is_some()
    }

    fn begin_body(&mut self, entry: EntryPoint) -> SV8<Value> {
        let f = &mut self.functions[entry.index()];
        debug_assert!(f.body.is_none(), "{} already has a body", f.symbol);
        let scalars = f.signature.params.clone();
        let params: SV8<Value> = scalars.iter().map(|s| f.new_value(*s)).collect();
        f.params = params.clone();
        f.body = Some(Vec::new());
        self.insert = Some(entry);
        params
    }

    fn insert_function(&self) -> Option<EntryPoint> {
        self.insert
    }

    fn set_insert_function(&mut self, entry: Option<EntryPoint>) {
        self.insert = entry;
    }

    fn const_int(&mut self, scalar: ScalarType, value: u64) -> Value {
        self.define(scalar, |dst| Inst::ConstInt { dst, value })
    }

    fn const_float(&mut self, scalar: ScalarType, value: f64) -> Value {
        self.define(scalar, |dst| Inst::ConstFloat { dst, value })
    }

    fn const_null(&mut self) -> Value {
        self.define(ScalarType::Pointer, |dst| Inst::Null { dst })
    }

    fn function_address(&mut self, entry: EntryPoint) -> Value {
        self.define(ScalarType::Pointer, |dst| Inst::FunctionAddress { dst, entry })
    }

    fn alloca(&mut self, layout: Layout) -> Address {
        let ptr = self.define(ScalarType::Pointer, |dst| Inst::Alloca { dst, layout });
        Address { ptr, align: layout.align }
    }

    fn offset_address(&mut self, base: Value, offset: u32) -> Value {
        self.define(ScalarType::Pointer, |dst| Inst::Offset { dst, base, offset })
    }

    fn load(&mut self, scalar: ScalarType, ptr: Value, offset: u32) -> Value {
        self.define(scalar, |dst| Inst::Load { dst, ptr, offset })
    }

    fn store(&mut self, value: Value, ptr: Value, offset: u32) {
        self.push(Inst::Store { value, ptr, offset })
    }

    fn memcpy(&mut self, dst: Value, src: Value, size: u32) {
        self.push(Inst::Memcpy { dst, src, size })
    }

    fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Value {
        self.define(op.result_scalar(lhs.scalar), |dst| Inst::Binary { dst, op, lhs, rhs })
    }

    fn call(&mut self, callee: Callee, signature: &LoweredSignature, args: &[Value]) -> SV4<Value> {
        let f = self.current();
        let dsts: SV4<Value> = signature.results.iter().map(|s| f.new_value(*s)).collect();
        self.push(Inst::Call {
            dsts: dsts.clone(),
            callee,
            signature: signature.clone(),
            args: args.iter().copied().collect(),
        });
        dsts
    }

    fn heap_alloc(&mut self, object: Layout, destroy: Option<EntryPoint>) -> Value {
        self.define(ScalarType::Pointer, |dst| Inst::HeapAlloc { dst, layout: object, destroy })
    }

    fn retain(&mut self, ptr: Value) {
        self.push(Inst::Retain { ptr })
    }

    fn release(&mut self, ptr: Value) {
        self.push(Inst::Release { ptr })
    }

    fn ret(&mut self, values: &[Value]) {
        self.push(Inst::Ret { values: values.iter().copied().collect() })
    }
}

struct InstDisplay<'a> {
    module: &'a IrModule,
    inst: &'a Inst,
}

impl Display for InstDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let symbol = |e: &EntryPoint| &self.module.get_function(*e).symbol;
        match self.inst {
            Inst::ConstInt { dst, value } => write!(f, "{dst} = const {value}"),
            Inst::ConstFloat { dst, value } => write!(f, "{dst} = const {value:?}"),
            Inst::Null { dst } => write!(f, "{dst} = null"),
            Inst::FunctionAddress { dst, entry } => write!(f, "{dst} = fn @{}", symbol(entry)),
            Inst::Alloca { dst, layout } => {
                write!(f, "{dst} = alloca size {} align {}", layout.size, layout.align)
            }
            Inst::Offset { dst, base, offset } => write!(f, "{dst} = offset {base}, {offset}"),
            Inst::Load { dst, ptr, offset } => write!(f, "{dst} = load {ptr}+{offset}"),
            Inst::Store { value, ptr, offset } => write!(f, "store {value} -> {ptr}+{offset}"),
            Inst::Memcpy { dst, src, size } => write!(f, "memcpy {dst} <- {src}, {size}"),
            Inst::Binary { dst, op, lhs, rhs } => write!(f, "{dst} = {} {lhs}, {rhs}", op.name()),
            Inst::Call { dsts, callee, signature, args } => {
                if !dsts.is_empty() {
                    write!(f, "{} = ", dsts.iter().join(", "))?;
                }
                match callee {
                    Callee::Direct(e) => write!(f, "call @{}", symbol(e))?,
                    Callee::Indirect(v) => write!(f, "call {v}")?,
                }
                write!(f, "({}) {}", args.iter().join(", "), signature.conv)?;
                if !signature.attrs.is_empty() {
                    write!(f, " {}", signature.attrs)?;
                }
                Ok(())
            }
            Inst::HeapAlloc { dst, layout, destroy } => {
                write!(f, "{dst} = heap_alloc size {} align {}", layout.size, layout.align)?;
                if let Some(d) = destroy {
                    write!(f, " destroy @{}", symbol(d))?;
                }
                Ok(())
            }
            Inst::Retain { ptr } => write!(f, "retain {ptr}"),
            Inst::Release { ptr } => write!(f, "release {ptr}"),
            Inst::Ret { values } => write!(f, "ret {}", values.iter().join(", ")),
        }
    }
}

impl Display for IrModule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for function in self.functions.iter() {
            match &function.body {
                None => writeln!(f, "declare @{} {}", function.symbol, function.signature)?,
                Some(body) => {
                    writeln!(
                        f,
                        "define @{}({}) {} {{",
                        function.symbol,
                        function.params.iter().join(", "),
                        function.signature
                    )?;
                    for inst in body.iter() {
                        writeln!(f, "  {}", InstDisplay { module: self, inst })?;
                    }
                    writeln!(f, "}}")?;
                }
            }
        }
        Ok(())
    }
}
