// Copyright (c) 2025 knix
// All rights reserved.

//! Partial application. Supplying the first `k` clauses of a multi-clause function produces
//! a thick function value `(trampoline k, context k)`: the context is a refcounted heap
//! object holding the captured explosions, and the trampoline takes clause `k` plus the
//! context. Trampolines either call the natural entry point (last clause) or capture one
//! more clause and return the next pair.

use std::sync::Arc;

use log::debug;

use crate::abi::SignatureAbi;
use crate::ast::FunctionId;
use crate::call::{CallEmission, CallResult, Ownership};
use crate::emit::{
    Callee, EntryPoint, LoweredSignature, Value, load_explosion, release_refcounted,
    retain_refcounted, store_explosion,
};
use crate::errors::{LowerErrorKind, LowerResult};
use crate::explosion::Explosion;
use crate::layout::{Layout, TypeLayout, heap_object_layout};
use crate::lower::{Lowering, emit_return};
use crate::types::{CallConv, Substitutions, TypeId};
use crate::{SV8, failf};

/// The heap object holding the first `k` clauses of an application
struct ContextLayout {
    payload: Arc<TypeLayout>,
    object: Layout,
    payload_offset: u32,
}

fn context_layout(
    lw: &Lowering,
    function: FunctionId,
    subs: &Substitutions,
    k: usize,
) -> LowerResult<ContextLayout> {
    let signature = lw.natural_signature(function, subs);
    let captured: SV8<TypeId> = signature.clauses[..k].iter().flatten().copied().collect();
    let payload_type = lw.types().add_struct(captured);
    let payload = lw.type_layout(payload_type)?;
    let (object, payload_offset) =
        heap_object_layout(lw.config.target.word_size(), payload.layout);
    Ok(ContextLayout { payload, object, payload_offset })
}

/// The destroy function for a context; None when nothing in it is refcounted
fn ensure_context_destroy(
    lw: &mut Lowering,
    function: FunctionId,
    subs: &Substitutions,
    k: usize,
    context: &ContextLayout,
) -> Option<EntryPoint> {
    if context.payload.is_trivial() {
        return None;
    }
    let symbol = format!("{}$context{}$destroy", lw.mangled_symbol(function, subs), k);
    if let Some(entry) = lw.emitter.lookup_function(&symbol) {
        return Some(entry);
    }
    let entry = lw.emitter.declare_function(&symbol, &LoweredSignature::destroy_fn());
    let previous = lw.emitter.insert_function();
    let params = lw.emitter.begin_body(entry);
    let values = load_explosion(lw.emitter, &context.payload, params[0], context.payload_offset);
    release_refcounted(lw.emitter, &context.payload, &values);
    lw.emitter.ret(&[]);
    lw.emitter.set_insert_function(previous);
    Some(entry)
}

/// Allocates a context and moves `values` into it
fn allocate_context(
    lw: &mut Lowering,
    function: FunctionId,
    subs: &Substitutions,
    k: usize,
    values: &[Value],
) -> LowerResult<Value> {
    let context = context_layout(lw, function, subs, k)?;
    if values.len() != context.payload.explosion_arity() {
        return failf!(
            lw.location,
            LowerErrorKind::ArityMismatch,
            "context for {} clauses holds {} scalars but {} were captured",
            k,
            context.payload.explosion_arity(),
            values.len()
        );
    }
    let destroy = ensure_context_destroy(lw, function, subs, k, &context);
    let ptr = lw.emitter.heap_alloc(context.object, destroy);
    store_explosion(lw.emitter, &context.payload, values, ptr, context.payload_offset);
    Ok(ptr)
}

/// Produces `(trampoline k, context)` for `function` applied to its first `k` clauses.
/// The captured values are moved into the context.
pub fn emit_function_partial_application(
    lw: &mut Lowering,
    function: FunctionId,
    subs: &Substitutions,
    mut captured: Explosion,
    k: usize,
) -> LowerResult<Explosion> {
    let clause_count = lw.program.get_function(function).clauses.len();
    if k >= clause_count {
        return failf!(
            lw.location,
            LowerErrorKind::ArityMismatch,
            "cannot partially apply {} of {} clauses of '{}'",
            k,
            clause_count,
            lw.program.function_name(function)
        );
    }
    let context = if k == 0 {
        captured.expect_drained(lw.location, "unapplied function")?;
        lw.emitter.const_null()
    } else {
        let values = captured.claim_all();
        allocate_context(lw, function, subs, k, &values)?
    };
    let trampoline = ensure_trampoline(lw, function, subs, k)?;
    let address = lw.emitter.function_address(trampoline);
    Ok(Explosion::from_values([address, context]))
}

/// Declares and emits `{symbol}$partial{k}` on first use
pub fn ensure_trampoline(
    lw: &mut Lowering,
    function: FunctionId,
    subs: &Substitutions,
    k: usize,
) -> LowerResult<EntryPoint> {
    let symbol = format!("{}$partial{}", lw.mangled_symbol(function, subs), k);
    if let Some(entry) = lw.emitter.lookup_function(&symbol) {
        return Ok(entry);
    }
    let signature = lw.natural_signature(function, subs);
    let result_type = signature.remaining_type(lw.types(), k + 1);
    let abi = lw
        .classifier()
        .classify_signature(CallConv::Native, &signature.clauses[k], result_type, true)
        .map_err(|e| e.located(lw.location))?;
    let entry = lw.emitter.declare_function(&symbol, &abi.lowered);
    debug!("emitting trampoline {} as {}", symbol, abi.lowered);

    let previous = lw.emitter.insert_function();
    let result = emit_trampoline_body(lw, function, subs, k, entry, &abi);
    lw.emitter.set_insert_function(previous);
    result?;
    Ok(entry)
}

fn emit_trampoline_body(
    lw: &mut Lowering,
    function: FunctionId,
    subs: &Substitutions,
    k: usize,
    entry: EntryPoint,
    abi: &SignatureAbi,
) -> LowerResult<()> {
    let location = lw.location;
    let clause_count = lw.program.get_function(function).clauses.len();
    let params = lw.emitter.begin_body(entry);
    let Some(context_ptr) = params.last().copied() else {
        return failf!(location, LowerErrorKind::ArityMismatch, "trampoline without a context");
    };
    let (mut clause_values, sret) = lw.emit_prologue(abi, &params);

    let context = if k == 0 { None } else { Some(context_layout(lw, function, subs, k)?) };
    let mut values: SV8<Value> = match &context {
        None => SV8::new(),
        Some(context) => {
            load_explosion(lw.emitter, &context.payload, context_ptr, context.payload_offset)
        }
    };
    values.extend(clause_values.claim_all());

    if k + 1 == clause_count {
        // Both the context and our own parameters stay owned by the caller
        let (natural, natural_abi) = lw.entry_point_for(function, subs)?;
        let mut call = CallEmission::start(Callee::Direct(natural), natural_abi, location);
        call.add_all_args(lw.emitter, Explosion::from_values(values), Ownership::Borrowed)?;
        if let Some(dest) = sret {
            call.set_indirect_result(dest);
        }
        match call.emit(lw.emitter)? {
            CallResult::InMemory(_) => lw.emitter.ret(&[]),
            CallResult::Direct(result) => emit_return(lw.emitter, abi, sret, result, location)?,
        }
        return Ok(());
    }

    let next = context_layout(lw, function, subs, k + 1)?;
    retain_refcounted(lw.emitter, &next.payload, &values);
    let next_context = allocate_context(lw, function, subs, k + 1, &values)?;
    let next_trampoline = ensure_trampoline(lw, function, subs, k + 1)?;
    let address = lw.emitter.function_address(next_trampoline);
    emit_return(lw.emitter, abi, sret, Explosion::from_values([address, next_context]), location)
}
