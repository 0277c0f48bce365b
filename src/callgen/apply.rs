// Copyright (c) 2025 knix
// All rights reserved.

use log::debug;

use crate::ast::{ApplyExpr, FunctionId, TypedExpr};
use crate::bridge;
use crate::builtins::{self, Builtin};
use crate::call::{CallEmission, CallResult, Ownership};
use crate::emit::{Address, Callee, load_explosion, store_explosion};
use crate::errors::{LowerErrorKind, LowerResult};
use crate::explosion::Explosion;
use crate::layout::TypeLayout;
use crate::lower::Lowering;
use crate::thunk;
use crate::types::{CallConv, Substitutions, Type, TypeId};
use crate::uncurry::natural_uncurry_level;
use crate::failf;

/// How a call expression reaches its target, decided once per expression
#[derive(Debug)]
enum CalleeKind<'e> {
    /// A named declaration: may be saturated, under-applied or over-applied
    Direct { function: FunctionId, substitutions: Substitutions },
    /// A thick native function value, applied one clause at a time
    Value { callee: &'e TypedExpr, type_id: TypeId },
    /// A foreign block handle
    Block { callee: &'e TypedExpr, type_id: TypeId },
}

fn classify_callee<'e>(lw: &Lowering, callee: &'e TypedExpr) -> LowerResult<CalleeKind<'e>> {
    if let TypedExpr::FunctionRef { function, substitutions, .. } = callee {
        let substitutions = lw.resolve_substitutions(substitutions);
        return Ok(CalleeKind::Direct { function: *function, substitutions });
    }
    let type_id = lw.concrete(callee.get_type());
    match &*lw.types().get(type_id) {
        Type::Function(f) => match f.conv {
            CallConv::Native => Ok(CalleeKind::Value { callee, type_id }),
            CallConv::Foreign => Ok(CalleeKind::Block { callee, type_id }),
        },
        _ => failf!(
            lw.location,
            LowerErrorKind::Layout,
            "callee of non-function type {}",
            lw.types().type_to_string(type_id, &lw.program.idents)
        ),
    }
}

/// Lowers a call expression to an owned explosion of its result
pub fn emit_apply_expr(lw: &mut Lowering, apply: &ApplyExpr) -> LowerResult<Explosion> {
    emit_apply(lw, apply, None)
}

/// Lowers a call expression into `dest`. The returned explosion is always empty; calls
/// with an indirect result write straight into `dest`.
pub fn emit_apply_expr_to_memory(
    lw: &mut Lowering,
    apply: &ApplyExpr,
    dest: Address,
) -> LowerResult<Explosion> {
    emit_apply(lw, apply, Some(dest))
}

fn emit_apply(
    lw: &mut Lowering,
    apply: &ApplyExpr,
    dest: Option<Address>,
) -> LowerResult<Explosion> {
    lw.location = apply.location;
    if let Some(result) = builtins::try_emit_builtin(lw, apply, dest)? {
        return Ok(result);
    }
    match classify_callee(lw, &apply.callee)? {
        CalleeKind::Direct { function, substitutions } => {
            emit_direct_apply(lw, function, &substitutions, apply, dest)
        }
        CalleeKind::Value { callee, type_id } | CalleeKind::Block { callee, type_id } => {
            let function_value = lw.emit_expr(callee)?;
            lw.location = apply.location;
            if apply.clauses.is_empty() {
                return finish_value(lw, function_value, type_id, dest);
            }
            emit_value_apply(lw, type_id, function_value, &apply.clauses, dest)
        }
    }
}

/// The value of a named function: its natural entry with a null context when it takes one
/// clause, otherwise the first trampoline
pub fn emit_rvalue_for_function(
    lw: &mut Lowering,
    function: FunctionId,
    subs: &Substitutions,
) -> LowerResult<Explosion> {
    let program = lw.program;
    let decl = program.get_function(function);
    if decl.is_builtin && Builtin::from_name(program.function_name(function)).is_some() {
        return failf!(
            lw.location,
            LowerErrorKind::ArityMismatch,
            "builtin '{}' must be applied to its arguments",
            lw.program.function_name(function)
        );
    }
    if decl.conv == CallConv::Foreign {
        return failf!(
            lw.location,
            LowerErrorKind::UnsupportedBridge,
            "foreign function '{}' cannot be used as a value; bridge a closure instead",
            lw.program.function_name(function)
        );
    }
    if natural_uncurry_level(decl) == 0 {
        let (entry, _) = lw.entry_point_for(function, subs)?;
        let address = lw.emitter.function_address(entry);
        let context = lw.emitter.const_null();
        return Ok(Explosion::from_values([address, context]));
    }
    thunk::emit_function_partial_application(lw, function, subs, Explosion::new(), 0)
}

fn check_clause_arity(
    lw: &Lowering,
    function: FunctionId,
    clause_index: usize,
    supplied: usize,
) -> LowerResult<()> {
    let expected = lw.program.get_function(function).clauses[clause_index].params.len();
    if supplied != expected {
        return failf!(
            lw.location,
            LowerErrorKind::ArityMismatch,
            "clause {} of '{}' takes {} arguments but {} were supplied",
            clause_index,
            lw.program.function_name(function),
            expected,
            supplied
        );
    }
    Ok(())
}

fn emit_direct_apply(
    lw: &mut Lowering,
    function: FunctionId,
    subs: &Substitutions,
    apply: &ApplyExpr,
    dest: Option<Address>,
) -> LowerResult<Explosion> {
    let program = lw.program;
    let decl = program.get_function(function);
    let clauses = &apply.clauses;
    let clause_count = decl.clauses.len();
    if clause_count == 0 {
        return failf!(
            lw.location,
            LowerErrorKind::ArityMismatch,
            "'{}' declares no parameter clauses",
            lw.program.function_name(function)
        );
    }
    if decl.conv == CallConv::Foreign && clauses.len() != clause_count {
        return failf!(
            lw.location,
            LowerErrorKind::UnsupportedBridge,
            "foreign function '{}' must be applied to all {} of its clauses",
            lw.program.function_name(function),
            clause_count
        );
    }
    let location = lw.location;

    if clauses.is_empty() {
        let value = emit_rvalue_for_function(lw, function, subs)?;
        return finish_value(lw, value, apply.type_id, dest);
    }

    if clauses.len() < clause_count {
        debug!(
            "partial application of '{}': {} of {} clauses",
            lw.program.function_name(function),
            clauses.len(),
            clause_count
        );
        let mut captured = Explosion::new();
        for (i, clause) in clauses.iter().enumerate() {
            check_clause_arity(lw, function, i, clause.len())?;
            for arg in clause.iter() {
                captured.append(lw.emit_expr(arg)?);
            }
        }
        lw.location = location;
        let closure =
            thunk::emit_function_partial_application(lw, function, subs, captured, clauses.len())?;
        return finish_value(lw, closure, apply.type_id, dest);
    }

    let (natural, extra) = clauses.split_at(clause_count);
    let natural_dest = if extra.is_empty() { dest } else { None };
    let result = emit_saturated_call(lw, function, subs, natural, natural_dest)?;
    if extra.is_empty() {
        return Ok(result);
    }
    debug!(
        "over-application of '{}': {} extra clauses",
        lw.program.function_name(function),
        extra.len()
    );
    let result_type = lw.natural_signature(function, subs).result;
    emit_value_apply(lw, result_type, result, extra, dest)
}

/// One call to the natural entry point with every clause merged
fn emit_saturated_call(
    lw: &mut Lowering,
    function: FunctionId,
    subs: &Substitutions,
    clauses: &[Vec<TypedExpr>],
    dest: Option<Address>,
) -> LowerResult<Explosion> {
    let location = lw.location;
    for (i, clause) in clauses.iter().enumerate() {
        check_clause_arity(lw, function, i, clause.len())?;
    }
    let (entry, abi) = lw.entry_point_for(function, subs)?;
    let mut call = CallEmission::start(Callee::Direct(entry), abi.clone(), location);
    for clause in clauses.iter() {
        for arg in clause.iter() {
            let mut explosion = lw.emit_expr(arg)?;
            call.add_arg(lw.emitter, &mut explosion, Ownership::Owned)?;
            explosion.expect_drained(location, "argument")?;
        }
    }
    if let Some(dest) = dest {
        call.set_indirect_result(dest);
    }
    lw.location = location;
    let result = call.emit(lw.emitter)?;
    finish_call(lw, result, &abi.result_layout, dest)
}

/// Applies `clauses` one at a time to an owned function value
fn emit_value_apply(
    lw: &mut Lowering,
    type_id: TypeId,
    function_value: Explosion,
    clauses: &[Vec<TypedExpr>],
    dest: Option<Address>,
) -> LowerResult<Explosion> {
    let mut value = function_value;
    let mut value_type = type_id;
    for (i, clause) in clauses.iter().enumerate() {
        let is_last = i + 1 == clauses.len();
        let Some(function_type) = lw.types().get_function(value_type) else {
            return failf!(
                lw.location,
                LowerErrorKind::ArityMismatch,
                "{} clauses applied to a value that takes {}",
                clauses.len(),
                i
            );
        };
        value = emit_value_call(lw, value_type, value, clause, if is_last { dest } else { None })?;
        value_type = function_type.result;
    }
    Ok(value)
}

/// Calls a native closure (entry, context) or a foreign block with one clause
pub fn emit_value_call(
    lw: &mut Lowering,
    type_id: TypeId,
    mut callee: Explosion,
    args: &[TypedExpr],
    dest: Option<Address>,
) -> LowerResult<Explosion> {
    let location = lw.location;
    let Some(function_type) = lw.types().get_function(type_id) else {
        return failf!(
            location,
            LowerErrorKind::Layout,
            "call through non-function type {}",
            type_id
        );
    };
    if function_type.params.len() != args.len() {
        return failf!(
            location,
            LowerErrorKind::ArityMismatch,
            "function value takes {} arguments but {} were supplied",
            function_type.params.len(),
            args.len()
        );
    }
    let abi =
        lw.classifier().classify_function_type(type_id).map_err(|e| e.located(location))?;
    let mut call = match function_type.conv {
        CallConv::Native => {
            let entry = callee.claim_next(location)?;
            let context = callee.claim_next(location)?;
            let mut call = CallEmission::start(Callee::Indirect(entry), abi.clone(), location);
            call.set_context(context, Ownership::Owned);
            call
        }
        CallConv::Foreign => {
            let block = callee.claim_next(location)?;
            let invoke = bridge::load_block_invoke(lw.emitter, block);
            let mut call = CallEmission::start(Callee::Indirect(invoke), abi.clone(), location);
            let mut block_arg = Explosion::from_values([block]);
            call.add_arg(lw.emitter, &mut block_arg, Ownership::Owned)?;
            call
        }
    };
    callee.expect_drained(location, "function value")?;
    for arg in args.iter() {
        let mut explosion = lw.emit_expr(arg)?;
        call.add_arg(lw.emitter, &mut explosion, Ownership::Owned)?;
        explosion.expect_drained(location, "argument")?;
    }
    if let Some(dest) = dest {
        call.set_indirect_result(dest);
    }
    lw.location = location;
    let result = call.emit(lw.emitter)?;
    finish_call(lw, result, &abi.result_layout, dest)
}

/// Turns a raw call result into what the caller asked for: an owned explosion, or an
/// empty one after the value has landed in `dest`
fn finish_call(
    lw: &mut Lowering,
    result: CallResult,
    layout: &TypeLayout,
    dest: Option<Address>,
) -> LowerResult<Explosion> {
    match (result, dest) {
        (CallResult::InMemory(addr), Some(dest)) => {
            if addr.ptr != dest.ptr {
                lw.emitter.memcpy(dest.ptr, addr.ptr, layout.layout.size);
            }
            Ok(Explosion::new())
        }
        (CallResult::InMemory(addr), None) => {
            Ok(Explosion::from_values(load_explosion(lw.emitter, layout, addr.ptr, 0)))
        }
        (CallResult::Direct(explosion), Some(dest)) => {
            store_explosion(lw.emitter, layout, explosion.peek_all(), dest.ptr, 0);
            Ok(Explosion::new())
        }
        (CallResult::Direct(explosion), None) => Ok(explosion),
    }
}

fn finish_value(
    lw: &mut Lowering,
    value: Explosion,
    type_id: TypeId,
    dest: Option<Address>,
) -> LowerResult<Explosion> {
    match dest {
        None => Ok(value),
        Some(dest) => {
            let layout = lw.type_layout(type_id)?;
            store_explosion(lw.emitter, &layout, value.peek_all(), dest.ptr, 0);
            Ok(Explosion::new())
        }
    }
}
