// Copyright (c) 2025 knix
// All rights reserved.

use log::trace;

use crate::ast::{FunctionDecl, ParamClause, Pattern};
use crate::emit::Value;
use crate::errors::{LowerErrorKind, LowerResult, SourceLocation};
use crate::explosion::Explosion;
use crate::idents::Ident;
use crate::layout::LayoutCache;
use crate::types::{Substitutions, Type, TypeId, Types};
use crate::{SV8, failf};


/// How many extra clauses the natural entry point merges into one call
pub fn natural_uncurry_level(decl: &FunctionDecl) -> usize {
    decl.clauses.len().saturating_sub(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundParam {
    pub name: Ident,
    pub type_id: TypeId,
    pub values: SV8<Value>,
}

/// Everything binding needs to know about the declaration's types
pub struct BindingContext<'a> {
    pub types: &'a Types,
    pub layouts: &'a LayoutCache,
    pub substitutions: &'a Substitutions,
    pub location: SourceLocation,
}

impl BindingContext<'_> {
    fn arity(&self, type_id: TypeId) -> LowerResult<usize> {
        let concrete = self.types.substitute(type_id, self.substitutions);
        let layout =
            self.layouts.classify(self.types, concrete).map_err(|e| e.located(self.location))?;
        Ok(layout.explosion_arity())
    }
}

/// Drains each clause's scalars from `incoming` in declaration order. A short explosion is
/// an arity mismatch; nothing is ever padded.
pub fn bind_parameter_clauses(
    ctx: &BindingContext,
    clauses: &[ParamClause],
    incoming: &mut Explosion,
) -> LowerResult<Vec<BoundParam>> {
    let mut bound = Vec::new();
    for (clause_index, clause) in clauses.iter().enumerate() {
        let mut clause_arity = 0;
        for pattern in clause.params.iter() {
            clause_arity += ctx.arity(pattern.type_id())?;
        }
        if incoming.remaining() < clause_arity {
            return failf!(
                ctx.location,
                LowerErrorKind::ArityMismatch,
                "clause {} needs {} scalars but only {} were supplied",
                clause_index,
                clause_arity,
                incoming.remaining()
            );
        }
        for pattern in clause.params.iter() {
            bind_pattern(ctx, pattern, incoming, &mut bound)?;
        }
        trace!("bound clause {} ({} scalars)", clause_index, clause_arity);
    }
    Ok(bound)
}

fn bind_pattern(
    ctx: &BindingContext,
    pattern: &Pattern,
    incoming: &mut Explosion,
    bound: &mut Vec<BoundParam>,
) -> LowerResult<()> {
    match pattern {
        Pattern::Named { name, type_id } => {
            let arity = ctx.arity(*type_id)?;
            let values = incoming.claim(arity, ctx.location)?.iter().copied().collect();
            bound.push(BoundParam { name: *name, type_id: *type_id, values });
        }
        Pattern::Wildcard { type_id } => {
            let arity = ctx.arity(*type_id)?;
            incoming.claim(arity, ctx.location)?;
        }
        Pattern::Tuple { elements, type_id } => {
            let concrete = ctx.types.substitute(*type_id, ctx.substitutions);
            let field_count = match &*ctx.types.get(concrete) {
                Type::Struct(s) => s.fields.len(),
                _ => {
                    return failf!(
                        ctx.location,
                        LowerErrorKind::ArityMismatch,
                        "tuple pattern against non-struct type {}",
                        concrete
                    );
                }
            };
            if field_count != elements.len() {
                return failf!(
                    ctx.location,
                    LowerErrorKind::ArityMismatch,
                    "tuple pattern has {} elements but the struct has {} fields",
                    elements.len(),
                    field_count
                );
            }
            for element in elements.iter() {
                bind_pattern(ctx, element, incoming, bound)?;
            }
        }
    }
    Ok(())
}
