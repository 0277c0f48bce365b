use std::sync::Arc;

use itertools::Itertools;
use log::debug;

use crate::abi::{ArgPlan, SignatureAbi};
use crate::call::{CallEmission, CallResult, Ownership};
use crate::compiler::WordSize;
use crate::emit::{Callee, CodeEmitter, EntryPoint, LoweredSignature, Value};
use crate::errors::{LowerErrorKind, LowerResult};
use crate::explosion::Explosion;
use crate::layout::{Layout, heap_object_layout};
use crate::lower::{Lowering, emit_return};
use crate::types::{CallConv, FunctionType, ScalarType, TypeId};
use crate::{SV4, failf};

/// Blocks with more parameters than this are not bridged
pub const MAX_BLOCK_PARAMS: usize = 4;

/// A block is a heap object whose payload is `{ invoke, function, context }`. Foreign code
/// calls `invoke(block, args..)`; the shared invoke shim forwards to the wrapped closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub object: Layout,
    pub invoke_offset: u32,
    pub function_offset: u32,
    pub context_offset: u32,
}

impl BlockLayout {
    pub fn for_word_size(word_size: WordSize) -> BlockLayout {
        let pointer = Layout::scalar(ScalarType::Pointer, word_size);
        let mut payload = Layout::ZERO;
        let invoke = payload.append_to_aggregate(pointer);
        let function = payload.append_to_aggregate(pointer);
        let context = payload.append_to_aggregate(pointer);
        let (object, payload_offset) = heap_object_layout(word_size, payload);
        BlockLayout {
            object,
            invoke_offset: payload_offset + invoke,
            function_offset: payload_offset + function,
            context_offset: payload_offset + context,
        }
    }
}

/// The invoke pointer foreign callers go through
pub fn load_block_invoke(emitter: &mut dyn CodeEmitter, block: Value) -> Value {
    let layout = BlockLayout::for_word_size(emitter.word_size());
    emitter.load(ScalarType::Pointer, block, layout.invoke_offset)
}

/// The scalar shape a block signature lowers to; shims are shared per shape
fn bridge_shape(
    lw: &Lowering,
    function_type: &FunctionType,
) -> LowerResult<(SV4<ScalarType>, Option<ScalarType>)> {
    if function_type.params.len() > MAX_BLOCK_PARAMS {
        return failf!(
            lw.location,
            LowerErrorKind::UnsupportedBridge,
            "blocks take at most {} parameters, not {}",
            MAX_BLOCK_PARAMS,
            function_type.params.len()
        );
    }
    let mut params = SV4::new();
    for param in function_type.params.iter() {
        let layout = lw.type_layout(*param)?;
        let Some(scalar) = layout.is_single_scalar() else {
            return failf!(
                lw.location,
                LowerErrorKind::UnsupportedBridge,
                "block parameter of type {} is not a single scalar",
                lw.types().type_to_string(*param, &lw.program.idents)
            );
        };
        params.push(scalar);
    }
    let result_layout = lw.type_layout(function_type.result)?;
    let result = match result_layout.is_single_scalar() {
        Some(scalar) => Some(scalar),
        None if result_layout.explosion_arity() == 0 => None,
        None => {
            return failf!(
                lw.location,
                LowerErrorKind::UnsupportedBridge,
                "block result of type {} is not a single scalar",
                lw.types().type_to_string(function_type.result, &lw.program.idents)
            );
        }
    };
    Ok((params, result))
}

fn shim_symbol(params: &[ScalarType], result: Option<ScalarType>) -> String {
    let params = if params.is_empty() {
        "void".to_string()
    } else {
        params.iter().map(|s| s.short_name()).join("_")
    };
    let result = result.map(|s| s.short_name()).unwrap_or("void");
    format!("__callgen_block_invoke_{params}_to_{result}")
}

const BLOCK_DESTROY_SYMBOL: &str = "__callgen_block_destroy";

fn ensure_block_destroy(lw: &mut Lowering) -> EntryPoint {
    if let Some(entry) = lw.emitter.lookup_function(BLOCK_DESTROY_SYMBOL) {
        return entry;
    }
    let layout = BlockLayout::for_word_size(lw.emitter.word_size());
    let entry =
        lw.emitter.declare_function(BLOCK_DESTROY_SYMBOL, &LoweredSignature::destroy_fn());
    let previous = lw.emitter.insert_function();
    let params = lw.emitter.begin_body(entry);
    let context = lw.emitter.load(ScalarType::Pointer, params[0], layout.context_offset);
    lw.emitter.release(context);
    lw.emitter.ret(&[]);
    lw.emitter.set_insert_function(previous);
    entry
}

fn ensure_invoke_shim(
    lw: &mut Lowering,
    closure_type: TypeId,
    block_type: TypeId,
    symbol: &str,
) -> LowerResult<EntryPoint> {
    if let Some(entry) = lw.emitter.lookup_function(symbol) {
        return Ok(entry);
    }
    let location = lw.location;
    let classifier = lw.classifier();
    let block_abi =
        classifier.classify_function_type(block_type).map_err(|e| e.located(location))?;
    let closure_abi =
        classifier.classify_function_type(closure_type).map_err(|e| e.located(location))?;
    let entry = lw.emitter.declare_function(symbol, &block_abi.lowered);
    debug!("emitting block invoke shim {} as {}", symbol, block_abi.lowered);

    let previous = lw.emitter.insert_function();
    let result = emit_invoke_shim_body(lw, entry, &block_abi, closure_abi);
    lw.emitter.set_insert_function(previous);
    result?;
    Ok(entry)
}

/// `invoke(block, args..)` loads the closure out of the block and calls it, borrowing both
fn emit_invoke_shim_body(
    lw: &mut Lowering,
    entry: EntryPoint,
    block_abi: &SignatureAbi,
    closure_abi: Arc<SignatureAbi>,
) -> LowerResult<()> {
    let location = lw.location;
    let params = lw.emitter.begin_body(entry);
    let layout = BlockLayout::for_word_size(lw.emitter.word_size());
    let block = params[0];
    let function = lw.emitter.load(ScalarType::Pointer, block, layout.function_offset);
    let context = lw.emitter.load(ScalarType::Pointer, block, layout.context_offset);

    let mut call = CallEmission::start(Callee::Indirect(function), closure_abi, location);
    let mut args = Explosion::new();
    for param in block_abi.params.iter().skip(1) {
        debug_assert!(matches!(param.plan, ArgPlan::Direct));
        let start = param.physical_start as usize;
        args.add_all(params[start..start + param.physical_count()].iter().copied());
    }
    call.add_all_args(lw.emitter, args, Ownership::Borrowed)?;
    call.set_context(context, Ownership::Borrowed);
    match call.emit(lw.emitter)? {
        CallResult::Direct(result) => emit_return(lw.emitter, block_abi, None, result, location),
        CallResult::InMemory(_) => failf!(
            location,
            LowerErrorKind::UnsupportedBridge,
            "bridged closure returns through memory"
        ),
    }
}

/// Wraps an owned native closure `(function, context)` in a block. The context moves into
/// the block and is released when the block is destroyed.
pub fn emit_bridge_to_block(
    lw: &mut Lowering,
    closure_type: TypeId,
    block_type: TypeId,
    mut closure: Explosion,
) -> LowerResult<Explosion> {
    let location = lw.location;
    let (Some(native), Some(foreign)) =
        (lw.types().get_function(closure_type), lw.types().get_function(block_type))
    else {
        return failf!(location, LowerErrorKind::UnsupportedBridge, "bridging a non-function");
    };
    if native.conv != CallConv::Native || foreign.conv != CallConv::Foreign {
        return failf!(
            location,
            LowerErrorKind::UnsupportedBridge,
            "can only bridge a native closure to a foreign block, not {} to {}",
            native.conv,
            foreign.conv
        );
    }
    if native.params != foreign.params || native.result != foreign.result {
        return failf!(
            location,
            LowerErrorKind::UnsupportedBridge,
            "closure {} does not match block {}",
            lw.types().type_to_string(closure_type, &lw.program.idents),
            lw.types().type_to_string(block_type, &lw.program.idents)
        );
    }
    let (params, result) = bridge_shape(lw, &foreign)?;
    let symbol = shim_symbol(&params, result);
    let invoke = ensure_invoke_shim(lw, closure_type, block_type, &symbol)?;
    let destroy = ensure_block_destroy(lw);

    let function = closure.claim_next(location)?;
    let context = closure.claim_next(location)?;
    closure.expect_drained(location, "bridged closure")?;

    let layout = BlockLayout::for_word_size(lw.emitter.word_size());
    let block = lw.emitter.heap_alloc(layout.object, Some(destroy));
    let invoke_address = lw.emitter.function_address(invoke);
    lw.emitter.store(invoke_address, block, layout.invoke_offset);
    lw.emitter.store(function, block, layout.function_offset);
    lw.emitter.store(context, block, layout.context_offset);
    Ok(Explosion::from_values([block]))
}

#[cfg(test)]
mod bridge_test {
    use super::*;

    #[test]
    fn block_payload_follows_header() {
        let layout = BlockLayout::for_word_size(WordSize::W64);
        assert_eq!(layout.invoke_offset, 16);
        assert_eq!(layout.function_offset, 24);
        assert_eq!(layout.context_offset, 32);
        assert_eq!(layout.object.size, 40);

        let layout = BlockLayout::for_word_size(WordSize::W32);
        assert_eq!(layout.invoke_offset, 12);
        assert_eq!(layout.context_offset, 20);
    }

    #[test]
    fn shims_are_named_by_shape() {
        assert_eq!(
            shim_symbol(&[ScalarType::I64, ScalarType::I32], Some(ScalarType::I64)),
            "__callgen_block_invoke_i64_i32_to_i64"
        );
        assert_eq!(shim_symbol(&[], None), "__callgen_block_invoke_void_to_void");
    }
}
