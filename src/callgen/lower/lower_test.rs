use crate::abi::AbiAttributeSet;
use crate::apply;
use crate::ast::{ApplyExpr, Program, TypedExpr};
use crate::backend::ir::{Inst, IrModule};
use crate::backend::vm::Vm;
use crate::builtins::Builtin;
use crate::compiler::{LowerConfig, Target};
use crate::emit::{Callee, CodeEmitter, LoweredSignature};
use crate::errors::{LowerErrorKind, LowerResult};
use crate::layout::Layout;
use crate::lower::*;
use crate::scenarios::{ProgramBuilder, all_scenarios, find_scenario};
use crate::types::{CallConv, F64_TYPE_ID, I64_TYPE_ID, ScalarType, TypeId};

const I64: TypeId = I64_TYPE_ID;

fn lower(program: &Program, target: Target) -> LowerResult<IrModule> {
    lower_program(program, &LowerConfig::for_target(target))
}

fn run(module: &IrModule, entry: &str, args: &[u64]) -> (Vec<u64>, usize) {
    let mut vm = Vm::make(module);
    let result = vm.call_symbol(entry, args).unwrap();
    (result.to_vec(), vm.live_objects())
}

fn lower_error(program: &Program) -> LowerErrorKind {
    lower(program, Target::LinuxIntel64).unwrap_err().kind
}

#[test]
fn every_scenario_runs_on_every_target() {
    for scenario in all_scenarios() {
        for target in Target::ALL {
            let module = lower(&scenario.program, target).unwrap();
            let (result, live) = run(&module, scenario.entry, &scenario.args);
            assert_eq!(result, scenario.expected, "{} on {}", scenario.name, target.name());
            assert_eq!(live, 0, "{} leaked on {}", scenario.name, target.name());
        }
    }
}

#[test]
fn wider_direct_threshold_gives_the_same_answers() {
    for scenario in all_scenarios() {
        let mut config = LowerConfig::for_target(Target::MacOsArm64);
        config.max_direct_scalars = 8;
        let module = lower_program(&scenario.program, &config).unwrap();
        let (result, live) = run(&module, scenario.entry, &scenario.args);
        assert_eq!(result, scenario.expected, "{}", scenario.name);
        assert_eq!(live, 0, "{}", scenario.name);
    }
}

#[test]
fn parallel_lowering_matches_serial() {
    for scenario in all_scenarios() {
        let serial = lower(&scenario.program, Target::LinuxIntel64).unwrap();
        let mut config = LowerConfig::for_target(Target::LinuxIntel64);
        config.workers = 4;
        let parallel = lower_program(&scenario.program, &config).unwrap();
        assert_eq!(serial.to_string(), parallel.to_string(), "{}", scenario.name);
    }
}

#[test]
fn partial_application_agrees_with_saturated_calls() {
    let direct = find_scenario("curried_direct").unwrap();
    let partial = find_scenario("curried_partial").unwrap();
    for target in Target::ALL {
        let direct_module = lower(&direct.program, target).unwrap();
        let partial_module = lower(&partial.program, target).unwrap();
        assert!(direct_module.function_by_symbol("add_scaled$partial1").is_none());
        assert!(partial_module.function_by_symbol("add_scaled$partial1").is_some());
        // An i64 capture needs no destroy function
        assert!(partial_module.function_by_symbol("add_scaled$context1$destroy").is_none());
        for args in [[0, 0], [4, 2], [7, 9], [u64::MAX, 3]] {
            let (expected, _) = run(&direct_module, "main", &args);
            let (actual, live) = run(&partial_module, "main", &args);
            assert_eq!(expected, actual);
            assert_eq!(live, 0);
        }
    }
}

#[test]
fn builtins_have_no_entry_points() {
    let scenario = find_scenario("builtins").unwrap();
    let module = lower(&scenario.program, Target::LinuxIntel64).unwrap();
    assert_eq!(module.function_count(), 1);
    for (_, function) in module.iter_functions() {
        let base = function.symbol.split('[').next().unwrap_or_default();
        assert!(Builtin::from_name(base).is_none(), "{}", function.symbol);
    }
}

#[test]
fn generic_instantiations_are_mangled_per_substitution() {
    let scenario = find_scenario("generic_identity").unwrap();
    let module = lower(&scenario.program, Target::LinuxIntel64).unwrap();
    let instances =
        module.iter_functions().filter(|(_, f)| f.symbol.starts_with("identity[")).count();
    assert_eq!(instances, 2);
    assert!(module.function_by_symbol("identity").is_none());
}

#[test]
fn indirect_results_never_reach_the_explosion() {
    let mut b = ProgramBuilder::new();
    let big = b.struct_type(&[I64; 6]);
    let make_big = b.declare("make_big", &[&[("a", I64)]], big, CallConv::Native);
    let a = b.var("a", I64);
    let body = b.structure(vec![a.clone(), a.clone(), a.clone(), a.clone(), a.clone(), a]);
    b.set_body(make_big, body);
    let five = b.int(5);
    let call = b.call(make_big, vec![vec![five]]);
    let program = b.finish();
    let TypedExpr::Apply(apply) = &call else { panic!("expected an apply") };

    let config = LowerConfig::for_target(Target::LinuxIntel64);
    let caches = LowerCaches::new(&config);
    let mut module = IrModule::make("test", config.target.word_size());
    let dest_ptr = {
        let mut lw = Lowering::new(&program, &config, &caches, &mut module);
        let host_signature = LoweredSignature {
            params: Default::default(),
            results: Default::default(),
            conv: CallConv::Native,
            attrs: AbiAttributeSet::default(),
        };
        let host = lw.emitter.declare_function("host", &host_signature);
        lw.emitter.begin_body(host);

        let exploded = apply::emit_apply_expr(&mut lw, apply).unwrap();
        assert_eq!(exploded.remaining(), 6);
        assert!(exploded.peek_all().iter().all(|v| v.scalar == ScalarType::I64));

        let dest = lw.emitter.alloca(Layout { size: 48, align: 8 });
        let leftover = apply::emit_apply_expr_to_memory(&mut lw, apply, dest).unwrap();
        assert!(leftover.is_empty());
        lw.emitter.ret(&[]);
        dest.ptr
    };

    let make_big = module.function_by_symbol("make_big").unwrap();
    assert!(make_big.signature.results.is_empty());
    assert!(make_big.signature.attrs.has_indirect_result());
    assert_eq!(make_big.signature.params[0], ScalarType::Pointer);

    let host = module.function_by_symbol("host").unwrap();
    let calls: Vec<&Inst> = host
        .body
        .iter()
        .flatten()
        .filter(|inst| matches!(inst, Inst::Call { callee: Callee::Direct(_), .. }))
        .collect();
    assert_eq!(calls.len(), 2);
    let Inst::Call { args, dsts, .. } = calls[1] else { unreachable!() };
    assert_eq!(args[0], dest_ptr);
    assert!(dsts.is_empty());
}

#[test]
fn wide_arguments_reach_trampolines_through_memory() {
    let mut b = ProgramBuilder::new();
    let wide_type = b.struct_type(&[I64; 6]);
    // pick(a)(w) = a + w.5
    let pick = b.declare("pick", &[&[("a", I64)], &[("w", wide_type)]], I64, CallConv::Native);
    let a = b.var("a", I64);
    let w = b.var("w", wide_type);
    let last = b.field(w, 5);
    let body = b.binop("add", a, last);
    b.set_body(pick, body);

    let main = b.declare("main", &[&[("x", I64)]], I64, CallConv::Foreign);
    let x = b.var("x", I64);
    let partial = b.call(pick, vec![vec![x]]);
    let closure_type = partial.get_type();
    let fields = (1..=6).map(|i| b.int(i)).collect();
    let wide = b.structure(fields);
    let f = b.var("f", closure_type);
    let applied = b.apply(f, vec![vec![wide]]);
    let body = b.let_in("f", partial, applied);
    b.set_body(main, body);
    let program = b.finish();

    for target in Target::ALL {
        let module = lower(&program, target).unwrap();
        assert_eq!(run(&module, "main", &[36]), (vec![42], 0), "{}", target.name());

        // copy address, context
        let trampoline = module.function_by_symbol("pick$partial1").unwrap();
        assert_eq!(
            trampoline.signature.params.as_slice(),
            &[ScalarType::Pointer, ScalarType::Pointer]
        );
        let natural = module.function_by_symbol("pick").unwrap();
        assert_eq!(
            natural.signature.params.as_slice(),
            &[ScalarType::I64, ScalarType::Pointer, ScalarType::Pointer]
        );
    }
}

#[test]
fn clause_arity_is_checked() {
    let mut b = ProgramBuilder::new();
    let pair_fn = b.declare("pair_fn", &[&[("a", I64)], &[("b", I64)]], I64, CallConv::Native);
    let body = b.var("a", I64);
    b.set_body(pair_fn, body);
    let main = b.declare("main", &[&[("x", I64)]], I64, CallConv::Foreign);
    let x = b.var("x", I64);
    let x2 = b.var("x", I64);
    let x3 = b.var("x", I64);
    let body = b.call(pair_fn, vec![vec![x, x2], vec![x3]]);
    b.set_body(main, body);
    assert_eq!(lower_error(&b.finish()), LowerErrorKind::ArityMismatch);
}

#[test]
fn builtins_take_exactly_one_clause() {
    let mut b = ProgramBuilder::new();
    let main = b.declare("main", &[&[("x", I64)]], I64, CallConv::Foreign);
    let x = b.var("x", I64);
    let x2 = b.var("x", I64);
    let x3 = b.var("x", I64);
    let add = b.binop("add", x, x2);
    let TypedExpr::Apply(mut apply) = add else { unreachable!() };
    apply.clauses.push(vec![x3]);
    b.set_body(main, TypedExpr::Apply(apply));
    assert_eq!(lower_error(&b.finish()), LowerErrorKind::ArityMismatch);
}

#[test]
fn builtin_operands_are_single_matching_scalars() {
    let add_program = |lhs: &str, rhs: &str| {
        let mut b = ProgramBuilder::new();
        let pair = b.struct_type(&[I64, I64]);
        let params = [("x", I64), ("p", pair), ("f", F64_TYPE_ID)];
        let type_of = |name: &str| params.iter().find(|(n, _)| *n == name).unwrap().1;
        let main = b.declare("main", &[&params], I64, CallConv::Foreign);
        let lhs = b.var(lhs, type_of(lhs));
        let rhs = b.var(rhs, type_of(rhs));
        let body = b.binop("add", lhs, rhs);
        b.set_body(main, body);
        b.finish()
    };

    // The pair's second scalar would otherwise be dropped
    assert_eq!(lower_error(&add_program("x", "p")), LowerErrorKind::ArityMismatch);
    assert_eq!(lower_error(&add_program("p", "x")), LowerErrorKind::ArityMismatch);
    assert_eq!(lower_error(&add_program("x", "f")), LowerErrorKind::Layout);

    // x, the pair as two eightbytes, f
    let module = lower(&add_program("x", "x"), Target::LinuxIntel64).unwrap();
    assert_eq!(run(&module, "main", &[21, 0, 0, 0]), (vec![42], 0));
}

#[test]
fn builtins_cannot_be_values() {
    let mut b = ProgramBuilder::new();
    let main = b.declare("main", &[&[("x", I64)]], I64, CallConv::Foreign);
    let x = b.var("x", I64);
    let x2 = b.var("x", I64);
    let TypedExpr::Apply(apply) = b.binop("sub", x, x2) else { unreachable!() };
    let ApplyExpr { callee, mut clauses, .. } = *apply;
    let operand = clauses[0].remove(0);
    let body = b.let_in("op", callee, operand);
    b.set_body(main, body);
    assert_eq!(lower_error(&b.finish()), LowerErrorKind::ArityMismatch);
}

#[test]
fn foreign_functions_are_not_values() {
    let mut b = ProgramBuilder::new();
    let callback = b.declare("callback", &[&[("a", I64)]], I64, CallConv::Foreign);
    let body = b.var("a", I64);
    b.set_body(callback, body);
    let main = b.declare("main", &[&[("x", I64)]], I64, CallConv::Foreign);
    let value = b.func(callback);
    let x = b.var("x", I64);
    let body = b.let_in("f", value, x);
    b.set_body(main, body);
    assert_eq!(lower_error(&b.finish()), LowerErrorKind::UnsupportedBridge);
}

#[test]
fn foreign_functions_cannot_be_partially_applied() {
    let mut b = ProgramBuilder::new();
    let curried = b.declare("curried", &[&[("a", I64)], &[("b", I64)]], I64, CallConv::Foreign);
    let body = b.var("b", I64);
    b.set_body(curried, body);
    let main = b.declare("main", &[&[("x", I64)]], I64, CallConv::Foreign);
    let x = b.var("x", I64);
    let partial = b.call(curried, vec![vec![x]]);
    let x = b.var("x", I64);
    let body = b.let_in("f", partial, x);
    b.set_body(main, body);
    assert_eq!(lower_error(&b.finish()), LowerErrorKind::UnsupportedBridge);
}

/// `main(x) = bridge(closure, block_type); x` for a one-clause native `closure`
fn bridge_program(closure_params: &[TypeId], block_type_params: usize) -> Program {
    let mut b = ProgramBuilder::new();
    let params: Vec<(String, TypeId)> =
        closure_params.iter().enumerate().map(|(i, t)| (format!("p{i}"), *t)).collect();
    let named: Vec<(&str, TypeId)> =
        params.iter().map(|(n, t)| (n.as_str(), *t)).collect();
    let closure = b.declare("closure", &[&named], I64, CallConv::Native);
    let body = b.int(1);
    b.set_body(closure, body);

    let block_params = vec![I64; block_type_params];
    let block_type = b.function_type(&block_params, I64, CallConv::Foreign);
    let main = b.declare("main", &[&[("x", I64)]], I64, CallConv::Foreign);
    let value = b.func(closure);
    let bridged = b.bridge(value, block_type);
    let x = b.var("x", I64);
    let body = b.let_in("blk", bridged, x);
    b.set_body(main, body);
    b.finish()
}

#[test]
fn bridging_checks_the_block_shape() {
    // A matching two-parameter shape lowers and releases the block at scope end
    let program = bridge_program(&[I64, I64], 2);
    let module = lower(&program, Target::LinuxIntel64).unwrap();
    assert!(module.function_by_symbol("__callgen_block_invoke_i64_i64_to_i64").is_some());
    assert_eq!(run(&module, "main", &[5]), (vec![5], 0));

    assert_eq!(lower_error(&bridge_program(&[I64; 5], 5)), LowerErrorKind::UnsupportedBridge);
    assert_eq!(lower_error(&bridge_program(&[I64, I64], 1)), LowerErrorKind::UnsupportedBridge);

    let mut b = ProgramBuilder::new();
    let pair = b.struct_type(&[I64, I64]);
    let wide = b.declare("wide", &[&[("p", pair)]], I64, CallConv::Native);
    let body = b.int(0);
    b.set_body(wide, body);
    let block_type = b.function_type(&[pair], I64, CallConv::Foreign);
    let main = b.declare("main", &[&[("x", I64)]], I64, CallConv::Foreign);
    let value = b.func(wide);
    let bridged = b.bridge(value, block_type);
    let x = b.var("x", I64);
    let body = b.let_in("blk", bridged, x);
    b.set_body(main, body);
    assert_eq!(lower_error(&b.finish()), LowerErrorKind::UnsupportedBridge);
}
