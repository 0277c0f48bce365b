//! Small typed programs exercising each lowering path. Every scenario has a foreign `main`
//! taking and returning i64s so the reference interpreter can run it directly.

use crate::ast::{ApplyExpr, FunctionDecl, FunctionId, ParamClause, Pattern, Program, TypedExpr};
use crate::errors::SourceLocation;
use crate::idents::Ident;
use crate::types::{BOOL_TYPE_ID, CallConv, I64_TYPE_ID, Substitutions, Type, TypeId};

pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub program: Program,
    /// Symbol of the foreign entry point
    pub entry: &'static str,
    pub args: Vec<u64>,
    pub expected: Vec<u64>,
}

pub const SCENARIO_NAMES: [&str; 9] = [
    "curried_direct",
    "curried_partial",
    "three_clauses",
    "over_application",
    "big_result",
    "generic_identity",
    "bridge_block",
    "foreign_pair",
    "builtins",
];

pub fn find_scenario(name: &str) -> Option<Scenario> {
    let scenario = match name {
        "curried_direct" => curried_direct(),
        "curried_partial" => curried_partial(),
        "three_clauses" => three_clauses(),
        "over_application" => over_application(),
        "big_result" => big_result(),
        "generic_identity" => generic_identity(),
        "bridge_block" => bridge_block(),
        "foreign_pair" => foreign_pair(),
        "builtins" => builtins(),
        _ => return None,
    };
    Some(scenario)
}

pub fn all_scenarios() -> Vec<Scenario> {
    SCENARIO_NAMES.iter().filter_map(|name| find_scenario(name)).collect()
}

/// Builds typed programs by hand, giving every node a fresh source line
pub struct ProgramBuilder {
    pub program: Program,
    line: u32,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        ProgramBuilder::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> ProgramBuilder {
        ProgramBuilder { program: Program::make(), line: 0 }
    }

    pub fn finish(self) -> Program {
        self.program
    }

    pub fn loc(&mut self) -> SourceLocation {
        self.line += 1;
        SourceLocation::new(self.line, 1)
    }

    pub fn ident(&mut self, name: &str) -> Ident {
        self.program.idents.intern(name)
    }

    pub fn struct_type(&self, fields: &[TypeId]) -> TypeId {
        self.program.types.add_struct(fields.iter().copied())
    }

    pub fn function_type(&self, params: &[TypeId], result: TypeId, conv: CallConv) -> TypeId {
        self.program.types.add_function(params.iter().copied(), result, conv)
    }

    pub fn declare_patterns(
        &mut self,
        name: &str,
        generic_params: Vec<Ident>,
        clauses: Vec<ParamClause>,
        result: TypeId,
        conv: CallConv,
    ) -> FunctionId {
        let name = self.ident(name);
        let location = self.loc();
        self.program.add_function(FunctionDecl {
            name,
            generic_params,
            clauses,
            result,
            conv,
            body: None,
            is_builtin: false,
            location,
        })
    }

    /// Declares a function whose parameters are all simple names
    pub fn declare(
        &mut self,
        name: &str,
        clauses: &[&[(&str, TypeId)]],
        result: TypeId,
        conv: CallConv,
    ) -> FunctionId {
        let clauses = clauses
            .iter()
            .map(|clause| {
                ParamClause::new(
                    clause
                        .iter()
                        .map(|(name, type_id)| Pattern::Named {
                            name: self.program.idents.intern(name),
                            type_id: *type_id,
                        })
                        .collect(),
                )
            })
            .collect();
        self.declare_patterns(name, Vec::new(), clauses, result, conv)
    }

    pub fn set_body(&mut self, function: FunctionId, body: TypedExpr) {
        self.program.set_body(function, body)
    }

    /// Declares (once) one of the generic builtins; binary operators are `op<T>(lhs: T, rhs: T)`
    pub fn builtin(&mut self, name: &str) -> FunctionId {
        if let Some(existing) = self.program.find_function(name) {
            return existing;
        }
        let t = self.program.idents.b.T;
        let t_type = self.program.types.add_type_param(t);
        let (clause, result) = match name {
            "sizeof" | "alignof" | "strideof" => (ParamClause::default(), I64_TYPE_ID),
            "zeroInitializer" => (ParamClause::default(), t_type),
            _ => {
                let lhs = self.ident("lhs");
                let rhs = self.ident("rhs");
                let clause = ParamClause::new(vec![
                    Pattern::Named { name: lhs, type_id: t_type },
                    Pattern::Named { name: rhs, type_id: t_type },
                ]);
                (clause, t_type)
            }
        };
        let name = self.ident(name);
        let location = self.loc();
        self.program.add_function(FunctionDecl {
            name,
            generic_params: vec![t],
            clauses: vec![clause],
            result,
            conv: CallConv::Native,
            body: None,
            is_builtin: true,
            location,
        })
    }

    pub fn int(&mut self, value: u64) -> TypedExpr {
        let location = self.loc();
        TypedExpr::Int { value, type_id: I64_TYPE_ID, location }
    }

    pub fn var(&mut self, name: &str, type_id: TypeId) -> TypedExpr {
        let name = self.ident(name);
        let location = self.loc();
        TypedExpr::Variable { name, type_id, location }
    }

    pub fn func(&mut self, function: FunctionId) -> TypedExpr {
        self.func_with(function, Substitutions::empty())
    }

    pub fn func_with(&mut self, function: FunctionId, substitutions: Substitutions) -> TypedExpr {
        let types = &self.program.types;
        let type_id = self
            .program
            .get_function(function)
            .signature()
            .substituted(types, &substitutions)
            .remaining_type(types, 0);
        let location = self.loc();
        TypedExpr::FunctionRef { function, substitutions, type_id, location }
    }

    /// Applies `clauses` to `callee`; the type is found by peeling one function type per clause
    pub fn apply(&mut self, callee: TypedExpr, clauses: Vec<Vec<TypedExpr>>) -> TypedExpr {
        let mut type_id = callee.get_type();
        for _ in clauses.iter() {
            match &*self.program.types.get(type_id) {
                Type::Function(f) => type_id = f.result,
                _ => break,
            }
        }
        self.apply_typed(callee, clauses, type_id)
    }

    pub fn apply_typed(
        &mut self,
        callee: TypedExpr,
        clauses: Vec<Vec<TypedExpr>>,
        type_id: TypeId,
    ) -> TypedExpr {
        let location = self.loc();
        TypedExpr::Apply(Box::new(ApplyExpr { callee, clauses, type_id, location }))
    }

    /// `function(args)(args)..` for a non-generic function
    pub fn call(&mut self, function: FunctionId, clauses: Vec<Vec<TypedExpr>>) -> TypedExpr {
        let callee = self.func(function);
        self.apply(callee, clauses)
    }

    pub fn binop(&mut self, name: &str, lhs: TypedExpr, rhs: TypedExpr) -> TypedExpr {
        let operand = lhs.get_type();
        let result = if name.starts_with("cmp_") { BOOL_TYPE_ID } else { operand };
        let builtin = self.builtin(name);
        let subs = Substitutions::from_pairs([(self.program.idents.b.T, operand)]);
        let callee = self.func_with(builtin, subs);
        self.apply_typed(callee, vec![vec![lhs, rhs]], result)
    }

    /// `sizeof<T>()`, `alignof<T>()`, `strideof<T>()` or `zeroInitializer<T>()`
    pub fn type_query(&mut self, name: &str, of: TypeId) -> TypedExpr {
        let result = if name == "zeroInitializer" { of } else { I64_TYPE_ID };
        let builtin = self.builtin(name);
        let subs = Substitutions::from_pairs([(self.program.idents.b.T, of)]);
        let callee = self.func_with(builtin, subs);
        self.apply_typed(callee, vec![vec![]], result)
    }

    pub fn structure(&mut self, fields: Vec<TypedExpr>) -> TypedExpr {
        let field_types: Vec<TypeId> = fields.iter().map(|f| f.get_type()).collect();
        let type_id = self.struct_type(&field_types);
        let location = self.loc();
        TypedExpr::Struct { fields, type_id, location }
    }

    pub fn field(&mut self, base: TypedExpr, index: u32) -> TypedExpr {
        let type_id = match &*self.program.types.get(base.get_type()) {
            Type::Struct(s) => s.fields.get(index as usize).copied().unwrap_or(I64_TYPE_ID),
            _ => I64_TYPE_ID,
        };
        let location = self.loc();
        TypedExpr::Field { base: Box::new(base), index, type_id, location }
    }

    pub fn let_in(&mut self, name: &str, value: TypedExpr, body: TypedExpr) -> TypedExpr {
        let name = self.ident(name);
        let type_id = body.get_type();
        let location = self.loc();
        TypedExpr::Let { name, value: Box::new(value), body: Box::new(body), type_id, location }
    }

    pub fn bridge(&mut self, closure: TypedExpr, block_type: TypeId) -> TypedExpr {
        let location = self.loc();
        TypedExpr::BridgeToBlock { closure: Box::new(closure), type_id: block_type, location }
    }

    /// Left fold of `add` over at least one operand
    pub fn sum(&mut self, mut operands: Vec<TypedExpr>) -> TypedExpr {
        let first = operands.remove(0);
        operands.into_iter().fold(first, |acc, operand| self.binop("add", acc, operand))
    }
}

const I64: TypeId = I64_TYPE_ID;

/// `add_scaled(a)(b) = a * 10 + b`
fn declare_add_scaled(b: &mut ProgramBuilder) -> FunctionId {
    let add_scaled =
        b.declare("add_scaled", &[&[("a", I64)], &[("b", I64)]], I64, CallConv::Native);
    let a = b.var("a", I64);
    let ten = b.int(10);
    let scaled = b.binop("mul", a, ten);
    let bv = b.var("b", I64);
    let body = b.binop("add", scaled, bv);
    b.set_body(add_scaled, body);
    add_scaled
}

fn curried_direct() -> Scenario {
    let mut b = ProgramBuilder::new();
    let add_scaled = declare_add_scaled(&mut b);
    let main = b.declare("main", &[&[("x", I64), ("y", I64)]], I64, CallConv::Foreign);
    let x = b.var("x", I64);
    let y = b.var("y", I64);
    let body = b.call(add_scaled, vec![vec![x], vec![y]]);
    b.set_body(main, body);
    Scenario {
        name: "curried_direct",
        description: "both clauses supplied at once: one call to the natural entry point",
        program: b.finish(),
        entry: "main",
        args: vec![4, 2],
        expected: vec![42],
    }
}

fn curried_partial() -> Scenario {
    let mut b = ProgramBuilder::new();
    let add_scaled = declare_add_scaled(&mut b);
    let main = b.declare("main", &[&[("x", I64), ("y", I64)]], I64, CallConv::Foreign);
    let x = b.var("x", I64);
    let partial = b.call(add_scaled, vec![vec![x]]);
    let closure_type = partial.get_type();
    let g = b.var("g", closure_type);
    let y = b.var("y", I64);
    let applied = b.apply(g, vec![vec![y]]);
    let body = b.let_in("g", partial, applied);
    b.set_body(main, body);
    Scenario {
        name: "curried_partial",
        description: "one clause captured in a context, the second supplied through a trampoline",
        program: b.finish(),
        entry: "main",
        args: vec![4, 2],
        expected: vec![42],
    }
}

fn three_clauses() -> Scenario {
    let mut b = ProgramBuilder::new();
    let a = b.ident("a");
    let bn = b.ident("b");
    let c = b.ident("c");
    let combine = b.declare_patterns(
        "combine",
        Vec::new(),
        vec![
            ParamClause::new(vec![Pattern::Named { name: a, type_id: I64 }]),
            ParamClause::new(vec![
                Pattern::Named { name: bn, type_id: I64 },
                Pattern::Wildcard { type_id: I64 },
            ]),
            ParamClause::new(vec![Pattern::Named { name: c, type_id: I64 }]),
        ],
        I64,
        CallConv::Native,
    );
    let av = b.var("a", I64);
    let hundred = b.int(100);
    let hundreds = b.binop("mul", av, hundred);
    let bv = b.var("b", I64);
    let ten = b.int(10);
    let tens = b.binop("mul", bv, ten);
    let cv = b.var("c", I64);
    let body = b.sum(vec![hundreds, tens, cv]);
    b.set_body(combine, body);

    let main =
        b.declare("main", &[&[("x", I64), ("y", I64), ("z", I64)]], I64, CallConv::Foreign);
    let x = b.var("x", I64);
    let f_value = b.call(combine, vec![vec![x]]);
    let f_type = f_value.get_type();
    let f = b.var("f", f_type);
    let y = b.var("y", I64);
    let ignored = b.int(999);
    let g_value = b.apply(f, vec![vec![y, ignored]]);
    let g_type = g_value.get_type();
    let g = b.var("g", g_type);
    let z = b.var("z", I64);
    let applied = b.apply(g, vec![vec![z]]);
    let inner = b.let_in("g", g_value, applied);
    let body = b.let_in("f", f_value, inner);
    b.set_body(main, body);
    Scenario {
        name: "three_clauses",
        description: "a chain of trampolines, each capturing one more clause",
        program: b.finish(),
        entry: "main",
        args: vec![1, 2, 3],
        expected: vec![123],
    }
}

fn over_application() -> Scenario {
    let mut b = ProgramBuilder::new();
    let adder = b.declare("adder", &[&[("a", I64)], &[("b", I64)]], I64, CallConv::Native);
    let av = b.var("a", I64);
    let bv = b.var("b", I64);
    let body = b.binop("add", av, bv);
    b.set_body(adder, body);

    let closure_type = b.function_type(&[I64], I64, CallConv::Native);
    let make_adder = b.declare("make_adder", &[&[("n", I64)]], closure_type, CallConv::Native);
    let n = b.var("n", I64);
    let body = b.call(adder, vec![vec![n]]);
    b.set_body(make_adder, body);

    let main = b.declare("main", &[&[("x", I64), ("y", I64)]], I64, CallConv::Foreign);
    let x = b.var("x", I64);
    let y = b.var("y", I64);
    let body = b.call(make_adder, vec![vec![x], vec![y]]);
    b.set_body(main, body);
    Scenario {
        name: "over_application",
        description: "more clauses than the natural arity: the returned closure takes the rest",
        program: b.finish(),
        entry: "main",
        args: vec![40, 2],
        expected: vec![42],
    }
}

fn big_result() -> Scenario {
    let mut b = ProgramBuilder::new();
    let big = b.struct_type(&[I64; 6]);
    let make_big = b.declare("make_big", &[&[("a", I64)]], big, CallConv::Native);
    let mut fields = Vec::new();
    for i in 0..6 {
        let a = b.var("a", I64);
        let offset = b.int(i);
        fields.push(b.binop("add", a, offset));
    }
    let body = b.structure(fields);
    b.set_body(make_big, body);

    // The same sum behind both conventions: exploded natively, copied in memory foreignly
    let sum_big = b.declare("sum_big", &[&[("big", big)]], I64, CallConv::Native);
    let foreign_sum = b.declare("foreign_sum", &[&[("big", big)]], I64, CallConv::Foreign);
    for function in [sum_big, foreign_sum] {
        let mut operands = Vec::new();
        for i in 0..6 {
            let base = b.var("big", big);
            operands.push(b.field(base, i));
        }
        let body = b.sum(operands);
        b.set_body(function, body);
    }

    let main = b.declare("main", &[&[("x", I64)]], I64, CallConv::Foreign);
    let x = b.var("x", I64);
    let native_big = b.call(make_big, vec![vec![x]]);
    let native = b.call(sum_big, vec![vec![native_big]]);
    let x = b.var("x", I64);
    let foreign_big = b.call(make_big, vec![vec![x]]);
    let foreign = b.call(foreign_sum, vec![vec![foreign_big]]);
    let body = b.binop("add", native, foreign);
    b.set_body(main, body);
    Scenario {
        name: "big_result",
        description: "a six-word struct returned through sret and passed by copy to foreign code",
        program: b.finish(),
        entry: "main",
        args: vec![1],
        expected: vec![42],
    }
}

fn generic_identity() -> Scenario {
    let mut b = ProgramBuilder::new();
    let t = b.program.idents.b.T;
    let t_type = b.program.types.add_type_param(t);
    let value = b.ident("value");
    let identity = b.declare_patterns(
        "identity",
        vec![t],
        vec![ParamClause::new(vec![Pattern::Named { name: value, type_id: t_type }])],
        t_type,
        CallConv::Native,
    );
    let body = b.var("value", t_type);
    b.set_body(identity, body);

    let pair = b.struct_type(&[I64, I64]);
    let main = b.declare("main", &[&[("x", I64)]], I64, CallConv::Foreign);
    let int_identity = b.func_with(identity, Substitutions::from_pairs([(t, I64)]));
    let x = b.var("x", I64);
    let int_result = b.apply(int_identity, vec![vec![x]]);
    let pair_identity = b.func_with(identity, Substitutions::from_pairs([(t, pair)]));
    let x = b.var("x", I64);
    let two = b.int(2);
    let pair_value = b.structure(vec![x, two]);
    let pair_result = b.apply(pair_identity, vec![vec![pair_value]]);
    let second = b.field(pair_result, 1);
    let body = b.binop("add", int_result, second);
    b.set_body(main, body);
    Scenario {
        name: "generic_identity",
        description: "one generic declaration instantiated at a scalar and at a struct",
        program: b.finish(),
        entry: "main",
        args: vec![40],
        expected: vec![42],
    }
}

fn bridge_block() -> Scenario {
    let mut b = ProgramBuilder::new();
    let scale_add =
        b.declare("scale_add", &[&[("k", I64)], &[("v", I64)]], I64, CallConv::Native);
    let k = b.var("k", I64);
    let v = b.var("v", I64);
    let scaled = b.binop("mul", k, v);
    let two = b.int(2);
    let body = b.binop("add", scaled, two);
    b.set_body(scale_add, body);

    let block_type = b.function_type(&[I64], I64, CallConv::Foreign);
    let apply_block = b.declare(
        "apply_block",
        &[&[("block", block_type), ("v", I64)]],
        I64,
        CallConv::Foreign,
    );
    let block = b.var("block", block_type);
    let v = b.var("v", I64);
    let body = b.apply(block, vec![vec![v]]);
    b.set_body(apply_block, body);

    let main = b.declare("main", &[&[("x", I64), ("y", I64)]], I64, CallConv::Foreign);
    let x = b.var("x", I64);
    let closure = b.call(scale_add, vec![vec![x]]);
    let bridged = b.bridge(closure, block_type);
    let y = b.var("y", I64);
    let body = b.call(apply_block, vec![vec![bridged, y]]);
    b.set_body(main, body);
    Scenario {
        name: "bridge_block",
        description: "a partially applied closure wrapped as a block and called by foreign code",
        program: b.finish(),
        entry: "main",
        args: vec![4, 10],
        expected: vec![42],
    }
}

fn foreign_pair() -> Scenario {
    let mut b = ProgramBuilder::new();
    let pair = b.struct_type(&[I64, I64]);
    let swap = b.declare("swap", &[&[("p", pair)]], pair, CallConv::Foreign);
    let p = b.var("p", pair);
    let second = b.field(p, 1);
    let p = b.var("p", pair);
    let first = b.field(p, 0);
    let body = b.structure(vec![second, first]);
    b.set_body(swap, body);

    let hi = b.ident("hi");
    let lo = b.ident("lo");
    let weigh = b.declare_patterns(
        "weigh",
        Vec::new(),
        vec![ParamClause::new(vec![Pattern::Tuple {
            elements: vec![
                Pattern::Named { name: hi, type_id: I64 },
                Pattern::Named { name: lo, type_id: I64 },
            ],
            type_id: pair,
        }])],
        I64,
        CallConv::Native,
    );
    let hv = b.var("hi", I64);
    let ten = b.int(10);
    let tens = b.binop("mul", hv, ten);
    let lv = b.var("lo", I64);
    let body = b.binop("add", tens, lv);
    b.set_body(weigh, body);

    let main = b.declare("main", &[&[("x", I64), ("y", I64)]], I64, CallConv::Foreign);
    let x = b.var("x", I64);
    let y = b.var("y", I64);
    let p = b.structure(vec![x, y]);
    let swapped = b.call(swap, vec![vec![p]]);
    let s = b.var("s", pair);
    let weighed = b.call(weigh, vec![vec![s]]);
    let body = b.let_in("s", swapped, weighed);
    b.set_body(main, body);
    Scenario {
        name: "foreign_pair",
        description: "a 16-byte struct coerced into two eightbytes in both directions",
        program: b.finish(),
        entry: "main",
        args: vec![2, 4],
        expected: vec![42],
    }
}

fn builtins() -> Scenario {
    let mut b = ProgramBuilder::new();
    let big = b.struct_type(&[I64; 6]);
    let pair = b.struct_type(&[I64, I64]);
    let main = b.declare("main", &[&[("x", I64), ("y", I64)]], I64, CallConv::Foreign);
    let size = b.type_query("sizeof", big);
    let x = b.var("x", I64);
    let y = b.var("y", I64);
    let product = b.binop("mul", x, y);
    let zero = b.type_query("zeroInitializer", pair);
    let zero_field = b.field(zero, 1);
    let align = b.type_query("alignof", pair);
    let body = b.sum(vec![size, product, zero_field, align]);
    b.set_body(main, body);
    Scenario {
        name: "builtins",
        description: "arithmetic and layout queries lowered inline without entry points",
        program: b.finish(),
        entry: "main",
        args: vec![3, 4],
        expected: vec![48 + 12 + 8],
    }
}
