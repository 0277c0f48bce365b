use log::trace;

use crate::ast::{ApplyExpr, FunctionDecl, TypedExpr};
use crate::emit::{Address, BinaryOp, Value, store_explosion};
use crate::errors::{LowerErrorKind, LowerResult, SourceLocation};
use crate::explosion::Explosion;
use crate::lower::Lowering;
use crate::types::{ScalarType, TypeId};
use crate::{SV8, failf};

/// Operations lowered inline instead of through a call. A call whose callee names one of
/// these is never given an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Binary(BinaryOp),
    SizeOf,
    AlignOf,
    StrideOf,
    ZeroInitializer,
}

impl Builtin {
    pub const ALL: [Builtin; 22] = [
        Builtin::Binary(BinaryOp::Add),
        Builtin::Binary(BinaryOp::Sub),
        Builtin::Binary(BinaryOp::Mul),
        Builtin::Binary(BinaryOp::SDiv),
        Builtin::Binary(BinaryOp::SRem),
        Builtin::Binary(BinaryOp::And),
        Builtin::Binary(BinaryOp::Or),
        Builtin::Binary(BinaryOp::Xor),
        Builtin::Binary(BinaryOp::Shl),
        Builtin::Binary(BinaryOp::LShr),
        Builtin::Binary(BinaryOp::CmpEq),
        Builtin::Binary(BinaryOp::CmpNe),
        Builtin::Binary(BinaryOp::CmpSlt),
        Builtin::Binary(BinaryOp::CmpSle),
        Builtin::Binary(BinaryOp::FAdd),
        Builtin::Binary(BinaryOp::FSub),
        Builtin::Binary(BinaryOp::FMul),
        Builtin::Binary(BinaryOp::FDiv),
        Builtin::SizeOf,
        Builtin::AlignOf,
        Builtin::StrideOf,
        Builtin::ZeroInitializer,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Binary(op) => op.name(),
            Builtin::SizeOf => "sizeof",
            Builtin::AlignOf => "alignof",
            Builtin::StrideOf => "strideof",
            Builtin::ZeroInitializer => "zeroInitializer",
        }
    }

    pub fn from_name(name: &str) -> Option<Builtin> {
        Builtin::ALL.iter().find(|b| b.name() == name).copied()
    }
}

fn single_scalar(lw: &Lowering, type_id: TypeId, what: &str) -> LowerResult<ScalarType> {
    match lw.type_layout(type_id)?.is_single_scalar() {
        Some(scalar) => Ok(scalar),
        None => failf!(
            lw.location,
            LowerErrorKind::Layout,
            "{} of type {} is not a single scalar",
            what,
            lw.types().type_to_string(lw.concrete(type_id), &lw.program.idents)
        ),
    }
}

/// Binary operands explode to exactly one scalar
fn operand_scalar(
    lw: &Lowering,
    builtin: Builtin,
    operand: &TypedExpr,
) -> LowerResult<ScalarType> {
    let type_id = operand.get_type();
    let layout = lw.type_layout(type_id)?;
    match layout.is_single_scalar() {
        Some(scalar) => Ok(scalar),
        None => failf!(
            lw.location,
            LowerErrorKind::ArityMismatch,
            "builtin '{}' operand of type {} explodes to {} scalars, not 1",
            builtin.name(),
            lw.types().type_to_string(lw.concrete(type_id), &lw.program.idents),
            layout.explosion_arity()
        ),
    }
}

fn emit_operand(
    lw: &mut Lowering,
    operand: &TypedExpr,
    location: SourceLocation,
) -> LowerResult<Value> {
    let mut explosion = lw.emit_expr(operand)?;
    let value = explosion.claim_next(location)?;
    explosion.expect_drained(location, "builtin operand")?;
    Ok(value)
}

fn type_argument(lw: &Lowering, decl: &FunctionDecl, apply: &ApplyExpr) -> LowerResult<TypeId> {
    let TypedExpr::FunctionRef { substitutions, .. } = &apply.callee else {
        return failf!(lw.location, LowerErrorKind::Layout, "builtin without a callee");
    };
    let resolved = decl
        .generic_params
        .first()
        .and_then(|param| lw.resolve_substitutions(substitutions).get(*param));
    match resolved {
        Some(type_id) => Ok(type_id),
        None => failf!(
            lw.location,
            LowerErrorKind::Layout,
            "'{}' needs a type argument",
            lw.program.idents.get_name(decl.name)
        ),
    }
}

fn expect_args(
    lw: &Lowering,
    builtin: Builtin,
    args: &[TypedExpr],
    count: usize,
) -> LowerResult<()> {
    if args.len() != count {
        return failf!(
            lw.location,
            LowerErrorKind::ArityMismatch,
            "builtin '{}' takes {} arguments but {} were supplied",
            builtin.name(),
            count,
            args.len()
        );
    }
    Ok(())
}

/// Lowers `apply` inline when its callee is a builtin; Ok(None) means it is an ordinary call
pub fn try_emit_builtin(
    lw: &mut Lowering,
    apply: &ApplyExpr,
    dest: Option<Address>,
) -> LowerResult<Option<Explosion>> {
    let TypedExpr::FunctionRef { function, .. } = &apply.callee else { return Ok(None) };
    let program = lw.program;
    let decl = program.get_function(*function);
    if !decl.is_builtin {
        return Ok(None);
    }
    let Some(builtin) = Builtin::from_name(program.function_name(*function)) else {
        return Ok(None);
    };
    if apply.clauses.len() != 1 {
        return failf!(
            lw.location,
            LowerErrorKind::ArityMismatch,
            "builtin '{}' takes exactly one argument clause, not {}",
            builtin.name(),
            apply.clauses.len()
        );
    }
    let args = &apply.clauses[0];
    trace!("lowering builtin {}", builtin.name());

    let values: SV8<Value> = match builtin {
        Builtin::Binary(op) => {
            expect_args(lw, builtin, args, 2)?;
            let lhs_scalar = operand_scalar(lw, builtin, &args[0])?;
            let rhs_scalar = operand_scalar(lw, builtin, &args[1])?;
            if op.is_float() != lhs_scalar.is_float() || rhs_scalar != lhs_scalar {
                return failf!(
                    lw.location,
                    LowerErrorKind::Layout,
                    "builtin '{}' cannot operate on {} and {}",
                    builtin.name(),
                    lhs_scalar,
                    rhs_scalar
                );
            }
            let location = lw.location;
            let lhs = emit_operand(lw, &args[0], location)?;
            let rhs = emit_operand(lw, &args[1], location)?;
            lw.location = location;
            smallvec::smallvec![lw.emitter.binary(op, lhs, rhs)]
        }
        Builtin::SizeOf | Builtin::AlignOf | Builtin::StrideOf => {
            expect_args(lw, builtin, args, 0)?;
            let layout = lw.type_layout(type_argument(lw, decl, apply)?)?.layout;
            let amount = match builtin {
                Builtin::SizeOf => layout.size,
                Builtin::AlignOf => layout.align,
                _ => layout.stride(),
            };
            let scalar = single_scalar(lw, apply.type_id, "layout query result")?;
            smallvec::smallvec![lw.emitter.const_int(scalar, amount as u64)]
        }
        Builtin::ZeroInitializer => {
            expect_args(lw, builtin, args, 0)?;
            let layout = lw.type_layout(type_argument(lw, decl, apply)?)?;
            layout
                .scalars()
                .map(|scalar| match scalar {
                    ScalarType::Pointer => lw.emitter.const_null(),
                    ScalarType::F32 | ScalarType::F64 => lw.emitter.const_float(scalar, 0.0),
                    _ => lw.emitter.const_int(scalar, 0),
                })
                .collect()
        }
    };

    match dest {
        None => Ok(Some(Explosion::from_values(values))),
        Some(dest) => {
            let layout = lw.type_layout(apply.type_id)?;
            store_explosion(lw.emitter, &layout, &values, dest.ptr, 0);
            Ok(Some(Explosion::new()))
        }
    }
}
