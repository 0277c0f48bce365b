//! The typed program handed to lowering. Everything here is produced by type checking and
//! is immutable once built.

use crate::errors::SourceLocation;
use crate::idents::{Ident, IdentPool};
use crate::types::{CallConv, Substitutions, TypeId, Types};
use crate::{SV4, nz_u32_id};

nz_u32_id!(FunctionId);

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Named { name: Ident, type_id: TypeId },
    /// Accounts for the parameter's arity without binding anything
    Wildcard { type_id: TypeId },
    /// Destructures a struct parameter field by field
    Tuple { elements: Vec<Pattern>, type_id: TypeId },
}

impl Pattern {
    pub fn type_id(&self) -> TypeId {
        match self {
            Pattern::Named { type_id, .. } => *type_id,
            Pattern::Wildcard { type_id } => *type_id,
            Pattern::Tuple { type_id, .. } => *type_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParamClause {
    pub params: Vec<Pattern>,
}

impl ParamClause {
    pub fn new(params: Vec<Pattern>) -> ParamClause {
        ParamClause { params }
    }

    pub fn types(&self) -> SV4<TypeId> {
        self.params.iter().map(|p| p.type_id()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: Ident,
    pub generic_params: Vec<Ident>,
    pub clauses: Vec<ParamClause>,
    /// The result after every clause has been applied
    pub result: TypeId,
    pub conv: CallConv,
    pub body: Option<TypedExpr>,
    pub is_builtin: bool,
    pub location: SourceLocation,
}

impl FunctionDecl {
    pub fn signature(&self) -> FunctionSignature {
        FunctionSignature {
            clauses: self.clauses.iter().map(|c| c.types()).collect(),
            result: self.result,
            conv: self.conv,
        }
    }
}

/// The types-only view of a declaration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionSignature {
    pub clauses: Vec<SV4<TypeId>>,
    pub result: TypeId,
    pub conv: CallConv,
}

impl FunctionSignature {
    pub fn substituted(&self, types: &Types, subs: &Substitutions) -> FunctionSignature {
        FunctionSignature {
            clauses: self
                .clauses
                .iter()
                .map(|c| c.iter().map(|t| types.substitute(*t, subs)).collect())
                .collect(),
            result: types.substitute(self.result, subs),
            conv: self.conv,
        }
    }

    /// The type of the function after its first `applied` clauses have been supplied,
    /// built by nesting the remaining clauses innermost-last
    pub fn remaining_type(&self, types: &Types, applied: usize) -> TypeId {
        self.clauses[applied..].iter().rev().fold(self.result, |result, clause| {
            types.add_function(clause.iter().copied(), result, self.conv)
        })
    }
}

#[derive(Debug, Clone)]
pub struct ApplyExpr {
    pub callee: TypedExpr,
    /// Argument clauses in application order
    pub clauses: Vec<Vec<TypedExpr>>,
    pub type_id: TypeId,
    pub location: SourceLocation,
}

#[derive(Debug, Clone)]
pub enum TypedExpr {
    Unit {
        location: SourceLocation,
    },
    Int {
        value: u64,
        type_id: TypeId,
        location: SourceLocation,
    },
    Float {
        value: f64,
        type_id: TypeId,
        location: SourceLocation,
    },
    Variable {
        name: Ident,
        type_id: TypeId,
        location: SourceLocation,
    },
    FunctionRef {
        function: FunctionId,
        substitutions: Substitutions,
        type_id: TypeId,
        location: SourceLocation,
    },
    Apply(Box<ApplyExpr>),
    Struct {
        fields: Vec<TypedExpr>,
        type_id: TypeId,
        location: SourceLocation,
    },
    Field {
        base: Box<TypedExpr>,
        index: u32,
        type_id: TypeId,
        location: SourceLocation,
    },
    Let {
        name: Ident,
        value: Box<TypedExpr>,
        body: Box<TypedExpr>,
        type_id: TypeId,
        location: SourceLocation,
    },
    /// Wraps a native closure as a foreign block handle
    BridgeToBlock {
        closure: Box<TypedExpr>,
        type_id: TypeId,
        location: SourceLocation,
    },
}

impl TypedExpr {
    pub fn get_type(&self) -> TypeId {
        match self {
            TypedExpr::Unit { .. } => crate::types::UNIT_TYPE_ID,
            TypedExpr::Int { type_id, .. } => *type_id,
            TypedExpr::Float { type_id, .. } => *type_id,
            TypedExpr::Variable { type_id, .. } => *type_id,
            TypedExpr::FunctionRef { type_id, .. } => *type_id,
            TypedExpr::Apply(apply) => apply.type_id,
            TypedExpr::Struct { type_id, .. } => *type_id,
            TypedExpr::Field { type_id, .. } => *type_id,
            TypedExpr::Let { type_id, .. } => *type_id,
            TypedExpr::BridgeToBlock { type_id, .. } => *type_id,
        }
    }

    pub fn get_location(&self) -> SourceLocation {
        match self {
            TypedExpr::Unit { location } => *location,
            TypedExpr::Int { location, .. } => *location,
            TypedExpr::Float { location, .. } => *location,
            TypedExpr::Variable { location, .. } => *location,
            TypedExpr::FunctionRef { location, .. } => *location,
            TypedExpr::Apply(apply) => apply.location,
            TypedExpr::Struct { location, .. } => *location,
            TypedExpr::Field { location, .. } => *location,
            TypedExpr::Let { location, .. } => *location,
            TypedExpr::BridgeToBlock { location, .. } => *location,
        }
    }
}

/// A whole compilation unit: shared by every lowering worker, never mutated by lowering
/// except for the hash-consed type pool
pub struct Program {
    pub types: Types,
    pub idents: IdentPool,
    functions: Vec<FunctionDecl>,
}

impl Program {
    pub fn make() -> Program {
        Program { types: Types::make(), idents: IdentPool::make(), functions: Vec::new() }
    }

    pub fn add_function(&mut self, decl: FunctionDecl) -> FunctionId {
        let id = FunctionId::from_index(self.functions.len());
        self.functions.push(decl);
        id
    }

    pub fn get_function(&self, id: FunctionId) -> &FunctionDecl {
        &self.functions[id.index()]
    }

    /// Fills in the body of a declared function; lets bodies refer to themselves and to
    /// functions declared after them
    pub fn set_body(&mut self, id: FunctionId, body: TypedExpr) {
        self.functions[id.index()].body = Some(body);
    }

    pub fn find_function(&self, name: &str) -> Option<FunctionId> {
        let ident = self.idents.get(name)?;
        self.functions.iter().position(|f| f.name == ident).map(FunctionId::from_index)
    }

    pub fn iter_functions(&self) -> impl Iterator<Item = (FunctionId, &FunctionDecl)> {
        self.functions.iter().enumerate().map(|(i, f)| (FunctionId::from_index(i), f))
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn function_name(&self, id: FunctionId) -> &str {
        self.idents.get_name(self.get_function(id).name)
    }
}
