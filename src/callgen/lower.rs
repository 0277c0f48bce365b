// Copyright (c) 2025 knix
// All rights reserved.

use std::sync::Arc;

use itertools::Itertools;
use log::{debug, info};

use crate::abi::{AbiClassifier, ArgPlan, ResultPlan, SignatureAbi, SignatureCache};
use crate::apply;
use crate::ast::{FunctionId, FunctionSignature, ParamClause, Program, TypedExpr};
use crate::backend::ir::IrModule;
use crate::bridge;
use crate::compiler::LowerConfig;
use crate::emit::{
    Address, CodeEmitter, EntryPoint, Value, load_explosion, release_refcounted,
    retain_refcounted, store_explosion,
};
use crate::errors::{LowerErrorKind, LowerResult, SourceLocation};
use crate::explosion::Explosion;
use crate::idents::Ident;
use crate::layout::{Layout, LayoutCache, TypeLayout};
use crate::types::{Substitutions, Type, TypeId, Types};
use crate::uncurry::{BindingContext, bind_parameter_clauses};
use crate::{SV8, failf};

#[cfg(test)]
mod lower_test;

/// The caches every worker shares for one lowering run
pub struct LowerCaches {
    pub layouts: LayoutCache,
    pub signatures: SignatureCache,
}

impl LowerCaches {
    pub fn new(config: &LowerConfig) -> LowerCaches {
        LowerCaches { layouts: LayoutCache::new(config), signatures: SignatureCache::new() }
    }
}

#[derive(Debug, Clone)]
struct Binding {
    name: Ident,
    type_id: TypeId,
    /// Borrowed: reading the binding retains
    values: SV8<Value>,
}

/// Lowers function bodies into one emitter. A worker owns exactly one of these.
pub struct Lowering<'a> {
    pub program: &'a Program,
    pub config: &'a LowerConfig,
    pub caches: &'a LowerCaches,
    pub emitter: &'a mut dyn CodeEmitter,
    substitutions: Substitutions,
    bindings: Vec<Binding>,
    pub location: SourceLocation,
    /// Generic instantiations declared but not yet given a body
    pending: Vec<(FunctionId, Substitutions)>,
}

impl<'a> Lowering<'a> {
    pub fn new(
        program: &'a Program,
        config: &'a LowerConfig,
        caches: &'a LowerCaches,
        emitter: &'a mut dyn CodeEmitter,
    ) -> Lowering<'a> {
        Lowering {
            program,
            config,
            caches,
            emitter,
            substitutions: Substitutions::empty(),
            bindings: Vec::new(),
            location: SourceLocation::UNKNOWN,
            pending: Vec::new(),
        }
    }

    pub fn types(&self) -> &'a Types {
        &self.program.types
    }

    pub fn classifier(&self) -> AbiClassifier<'a> {
        AbiClassifier::new(&self.program.types, self.caches, self.config.target)
    }

    pub fn concrete(&self, type_id: TypeId) -> TypeId {
        self.types().substitute(type_id, &self.substitutions)
    }

    pub fn type_layout(&self, type_id: TypeId) -> LowerResult<Arc<TypeLayout>> {
        let concrete = self.concrete(type_id);
        self.caches.layouts.classify(self.types(), concrete).map_err(|e| e.located(self.location))
    }

    /// Callee substitutions may mention the current body's own generic parameters
    pub fn resolve_substitutions(&self, subs: &Substitutions) -> Substitutions {
        if self.substitutions.is_empty() {
            return subs.clone();
        }
        Substitutions::from_pairs(subs.iter().map(|(param, t)| (*param, self.concrete(*t))))
    }

    pub fn mangled_symbol(&self, function: FunctionId, subs: &Substitutions) -> String {
        let name = self.program.function_name(function);
        if subs.is_empty() {
            return name.to_string();
        }
        let args = subs
            .iter()
            .map(|(param, t)| {
                format!(
                    "{}={}",
                    self.program.idents.get_name(*param),
                    self.types().type_to_string(*t, &self.program.idents)
                )
            })
            .join(",");
        format!("{name}[{args}]")
    }

    pub fn natural_signature(
        &self,
        function: FunctionId,
        subs: &Substitutions,
    ) -> FunctionSignature {
        self.program.get_function(function).signature().substituted(self.types(), subs)
    }

    pub fn function_abi(
        &self,
        function: FunctionId,
        subs: &Substitutions,
    ) -> LowerResult<Arc<SignatureAbi>> {
        let signature = self.natural_signature(function, subs);
        self.classifier().classify_declaration(&signature).map_err(|e| e.located(self.location))
    }

    /// Declares the natural entry point of `function` on first use
    pub fn entry_point_for(
        &mut self,
        function: FunctionId,
        subs: &Substitutions,
    ) -> LowerResult<(EntryPoint, Arc<SignatureAbi>)> {
        let abi = self.function_abi(function, subs)?;
        let symbol = self.mangled_symbol(function, subs);
        if let Some(entry) = self.emitter.lookup_function(&symbol) {
            return Ok((entry, abi));
        }
        let entry = self.emitter.declare_function(&symbol, &abi.lowered);
        let decl = self.program.get_function(function);
        if !subs.is_empty() && decl.body.is_some() && !decl.is_builtin {
            self.pending.push((function, subs.clone()));
        }
        debug!("declared {} as {}", symbol, abi.lowered);
        Ok((entry, abi))
    }

    pub fn emit_function_body(
        &mut self,
        function: FunctionId,
        subs: Substitutions,
    ) -> LowerResult<()> {
        let program = self.program;
        let decl = program.get_function(function);
        let Some(body) = &decl.body else { return Ok(()) };
        if decl.is_builtin {
            return Ok(());
        }
        self.location = decl.location;
        self.bindings.clear();
        self.substitutions = subs;
        let subs = self.substitutions.clone();
        let (entry, abi) = self.entry_point_for(function, &subs)?;
        if self.emitter.has_body(entry) {
            return Ok(());
        }
        debug!("lowering body of {}", self.mangled_symbol(function, &subs));

        let previous = self.emitter.insert_function();
        let params = self.emitter.begin_body(entry);
        let (mut incoming, sret) = self.emit_prologue(&abi, &params);
        self.emit_parameter_clauses(&decl.clauses, &mut incoming)?;
        incoming.expect_drained(self.location, "parameter binding")?;

        match sret {
            Some(dest) => {
                self.emit_expr_to_memory(body, dest)?;
                self.emitter.ret(&[]);
            }
            None => {
                let result = self.emit_expr(body)?;
                emit_return(self.emitter, &abi, None, result, self.location)?;
            }
        }
        self.bindings.clear();
        self.emitter.set_insert_function(previous);
        Ok(())
    }

    /// Rebuilds each parameter's explosion from the physical parameters, leaving out the
    /// context
    pub fn emit_prologue(
        &mut self,
        abi: &SignatureAbi,
        params: &[Value],
    ) -> (Explosion, Option<Address>) {
        let sret = match &abi.result {
            ResultPlan::Indirect { layout } => {
                Some(Address { ptr: params[0], align: layout.align })
            }
            ResultPlan::Direct | ResultPlan::Coerced { .. } => None,
        };
        let mut incoming = Explosion::new();
        for param in abi.params.iter() {
            let start = param.physical_start as usize;
            match &param.plan {
                ArgPlan::Direct => {
                    incoming.add_all(params[start..start + param.physical_count()].iter().copied())
                }
                ArgPlan::Coerced { scalars } => {
                    let temp = self.emitter.alloca(param.layout.layout.eightbyte_padded());
                    for (i, _) in scalars.iter().enumerate() {
                        self.emitter.store(params[start + i], temp.ptr, 8 * i as u32);
                    }
                    incoming.add_all(load_explosion(self.emitter, &param.layout, temp.ptr, 0));
                }
                ArgPlan::Byval { .. } | ArgPlan::IndirectCopy { .. } => {
                    let copy = params[start];
                    incoming.add_all(load_explosion(self.emitter, &param.layout, copy, 0));
                }
            }
        }
        (incoming, sret)
    }

    /// Binds every clause's patterns to the incoming explosion, in declaration order
    pub fn emit_parameter_clauses(
        &mut self,
        clauses: &[ParamClause],
        incoming: &mut Explosion,
    ) -> LowerResult<()> {
        let ctx = BindingContext {
            types: self.types(),
            layouts: &self.caches.layouts,
            substitutions: &self.substitutions,
            location: self.location,
        };
        let bound = bind_parameter_clauses(&ctx, clauses, incoming)?;
        for b in bound.into_iter() {
            let type_id = self.concrete(b.type_id);
            self.bind(b.name, type_id, b.values);
        }
        Ok(())
    }

    fn bind(&mut self, name: Ident, type_id: TypeId, values: SV8<Value>) {
        self.bindings.push(Binding { name, type_id, values });
    }

    fn lookup_binding(&self, name: Ident) -> LowerResult<&Binding> {
        match self.bindings.iter().rev().find(|b| b.name == name) {
            Some(b) => Ok(b),
            None => failf!(
                self.location,
                LowerErrorKind::ArityMismatch,
                "'{}' is not bound by any parameter clause",
                self.program.idents.get_name(name)
            ),
        }
    }

    /// Produces an owned explosion of `expr`
    pub fn emit_expr(&mut self, expr: &TypedExpr) -> LowerResult<Explosion> {
        self.location = expr.get_location();
        match expr {
            TypedExpr::Unit { .. } => Ok(Explosion::new()),
            TypedExpr::Int { value, type_id, .. } => {
                let layout = self.type_layout(*type_id)?;
                let Some(scalar) = layout.is_single_scalar() else {
                    return failf!(
                        self.location,
                        LowerErrorKind::Layout,
                        "integer literal of non-scalar type {}",
                        type_id
                    );
                };
                Ok(Explosion::from_values([self.emitter.const_int(scalar, *value)]))
            }
            TypedExpr::Float { value, type_id, .. } => {
                let layout = self.type_layout(*type_id)?;
                let Some(scalar) = layout.is_single_scalar().filter(|s| s.is_float()) else {
                    return failf!(
                        self.location,
                        LowerErrorKind::Layout,
                        "float literal of non-float type {}",
                        type_id
                    );
                };
                Ok(Explosion::from_values([self.emitter.const_float(scalar, *value)]))
            }
            TypedExpr::Variable { name, .. } => {
                let binding = self.lookup_binding(*name)?.clone();
                let layout = self.type_layout(binding.type_id)?;
                retain_refcounted(self.emitter, &layout, &binding.values);
                Ok(Explosion::from_values(binding.values))
            }
            TypedExpr::FunctionRef { function, substitutions, .. } => {
                let subs = self.resolve_substitutions(substitutions);
                apply::emit_rvalue_for_function(self, *function, &subs)
            }
            TypedExpr::Apply(apply) => apply::emit_apply_expr(self, apply),
            TypedExpr::Struct { fields, .. } => {
                let mut explosion = Explosion::new();
                for field in fields.iter() {
                    let field_explosion = self.emit_expr(field)?;
                    explosion.append(field_explosion);
                }
                Ok(explosion)
            }
            TypedExpr::Field { base, index, .. } => self.emit_field(base, *index),
            TypedExpr::Let { name, value, body, .. } => {
                let value_type = self.concrete(value.get_type());
                let mut bound = self.emit_expr(value)?;
                let values = bound.claim_all();
                self.bind(*name, value_type, values.clone());
                let result = self.emit_expr(body);
                self.bindings.pop();
                let result = result?;
                let layout = self.type_layout(value_type)?;
                release_refcounted(self.emitter, &layout, &values);
                Ok(result)
            }
            TypedExpr::BridgeToBlock { closure, type_id, .. } => {
                let closure_type = self.concrete(closure.get_type());
                let block_type = self.concrete(*type_id);
                let explosion = self.emit_expr(closure)?;
                self.location = expr.get_location();
                bridge::emit_bridge_to_block(self, closure_type, block_type, explosion)
            }
        }
    }

    fn struct_fields(&self, type_id: TypeId) -> LowerResult<SV8<TypeId>> {
        let concrete = self.concrete(type_id);
        match &*self.types().get(concrete) {
            Type::Struct(s) => Ok(s.fields.iter().copied().collect()),
            _ => failf!(
                self.location,
                LowerErrorKind::Layout,
                "field access on non-struct type {}",
                self.types().type_to_string(concrete, &self.program.idents)
            ),
        }
    }

    /// Takes one field out of an owned struct explosion; the other fields are released
    fn emit_field(&mut self, base: &TypedExpr, index: u32) -> LowerResult<Explosion> {
        let fields = self.struct_fields(base.get_type())?;
        if index as usize >= fields.len() {
            return failf!(
                self.location,
                LowerErrorKind::ArityMismatch,
                "field {} of a struct with {} fields",
                index,
                fields.len()
            );
        }
        let mut explosion = self.emit_expr(base)?;
        let mut result = Explosion::new();
        for (i, field) in fields.iter().enumerate() {
            let layout = self.type_layout(*field)?;
            let values: SV8<Value> =
                explosion.claim(layout.explosion_arity(), self.location)?.iter().copied().collect();
            if i as u32 == index {
                result.add_all(values);
            } else {
                release_refcounted(self.emitter, &layout, &values);
            }
        }
        explosion.expect_drained(self.location, "field access")?;
        Ok(result)
    }

    /// Writes `expr` into `dest`, letting calls with indirect results write there directly
    pub fn emit_expr_to_memory(&mut self, expr: &TypedExpr, dest: Address) -> LowerResult<()> {
        self.location = expr.get_location();
        match expr {
            TypedExpr::Apply(apply) => {
                let leftover = apply::emit_apply_expr_to_memory(self, apply, dest)?;
                leftover.expect_drained(self.location, "call into memory")
            }
            TypedExpr::Struct { fields, type_id, .. } => {
                let field_types = self.struct_fields(*type_id)?;
                let mut layout = Layout::ZERO;
                for (field, field_type) in fields.iter().zip(field_types.iter()) {
                    let field_layout = self.type_layout(*field_type)?;
                    let offset = layout.append_to_aggregate(field_layout.layout);
                    let ptr = self.emitter.offset_address(dest.ptr, offset);
                    let align = field_layout.layout.align.min(dest.align);
                    self.emit_expr_to_memory(field, Address { ptr, align })?;
                }
                Ok(())
            }
            TypedExpr::Let { name, value, body, .. } => {
                let value_type = self.concrete(value.get_type());
                let mut bound = self.emit_expr(value)?;
                let values = bound.claim_all();
                self.bind(*name, value_type, values.clone());
                let result = self.emit_expr_to_memory(body, dest);
                self.bindings.pop();
                result?;
                let layout = self.type_layout(value_type)?;
                release_refcounted(self.emitter, &layout, &values);
                Ok(())
            }
            _ => {
                let layout = self.type_layout(expr.get_type())?;
                let explosion = self.emit_expr(expr)?;
                store_explosion(self.emitter, &layout, explosion.peek_all(), dest.ptr, 0);
                Ok(())
            }
        }
    }

    fn drain_pending(&mut self) -> LowerResult<()> {
        while let Some((function, subs)) = self.pending.pop() {
            self.emit_function_body(function, subs)?;
        }
        Ok(())
    }
}

/// Returns `result` from the current function according to its result plan
pub fn emit_return(
    emitter: &mut dyn CodeEmitter,
    abi: &SignatureAbi,
    sret: Option<Address>,
    result: Explosion,
    location: SourceLocation,
) -> LowerResult<()> {
    let values = result.peek_all();
    if values.len() != abi.result_layout.explosion_arity() {
        return failf!(
            location,
            LowerErrorKind::ArityMismatch,
            "returning {} scalars for a result of arity {}",
            values.len(),
            abi.result_layout.explosion_arity()
        );
    }
    match &abi.result {
        ResultPlan::Direct => emitter.ret(values),
        ResultPlan::Coerced { scalars } => {
            let temp = emitter.alloca(abi.result_layout.layout.eightbyte_padded());
            store_explosion(emitter, &abi.result_layout, values, temp.ptr, 0);
            let coerced: SV8<Value> = scalars
                .iter()
                .enumerate()
                .map(|(i, s)| emitter.load(*s, temp.ptr, 8 * i as u32))
                .collect();
            emitter.ret(&coerced);
        }
        ResultPlan::Indirect { .. } => {
            let Some(dest) = sret else {
                return failf!(
                    location,
                    LowerErrorKind::Layout,
                    "indirect result without an sret address"
                );
            };
            store_explosion(emitter, &abi.result_layout, values, dest.ptr, 0);
            emitter.ret(&[]);
        }
    }
    Ok(())
}

fn lower_functions(
    program: &Program,
    config: &LowerConfig,
    caches: &LowerCaches,
    functions: &[FunctionId],
    worker_index: usize,
) -> LowerResult<IrModule> {
    let mut module = IrModule::make(format!("worker{worker_index}"), config.target.word_size());
    let start = std::time::Instant::now();
    scopeguard::defer! {
        debug!(
            "worker {} lowered {} functions in {}us",
            worker_index,
            functions.len(),
            start.elapsed().as_micros()
        );
    }
    let mut lowering = Lowering::new(program, config, caches, &mut module);
    for function in functions.iter() {
        lowering.emit_function_body(*function, Substitutions::empty())?;
        lowering.drain_pending()?;
    }
    drop(lowering);
    Ok(module)
}

/// Lowers every non-generic function with a body. Bodies are split over
/// `config.workers` threads, each with a private emitter, and linked by symbol.
pub fn lower_program(program: &Program, config: &LowerConfig) -> LowerResult<IrModule> {
    let caches = LowerCaches::new(config);
    let roots: Vec<FunctionId> = program
        .iter_functions()
        .filter(|(_, decl)| {
            !decl.is_builtin && decl.generic_params.is_empty() && decl.body.is_some()
        })
        .map(|(id, _)| id)
        .collect();
    let workers = config.workers.max(1).min(roots.len().max(1));
    let modules = if workers == 1 {
        vec![lower_functions(program, config, &caches, &roots, 0)?]
    } else {
        let chunk_size = roots.len().div_ceil(workers);
        let caches = &caches;
        std::thread::scope(|scope| {
            let handles = roots
                .chunks(chunk_size)
                .enumerate()
                .map(|(i, chunk)| {
                    scope.spawn(move || lower_functions(program, config, caches, chunk, i))
                })
                .collect_vec();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect::<LowerResult<Vec<IrModule>>>()
        })?
    };
    let module = IrModule::link("program", config.target.word_size(), modules);
    info!(
        "lowered {} functions with {} workers ({} layouts cached)",
        module.function_count(),
        workers,
        caches.layouts.len()
    );
    Ok(module)
}
