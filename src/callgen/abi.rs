// Copyright (c) 2025 knix
// All rights reserved.

use std::fmt::{Display, Formatter};
use std::sync::{Arc, PoisonError, RwLock};

use ahash::HashMapExt;
use fxhash::FxHashMap;
use itertools::Itertools;
use log::debug;

use crate::ast::FunctionSignature;
use crate::compiler::{Arch, Target};
use crate::emit::LoweredSignature;
use crate::errors::{LowerErrorKind, LowerResult, SourceLocation};
use crate::layout::{Layout, TypeLayout};
use crate::lower::LowerCaches;
use crate::types::{CallConv, ScalarType, Type, TypeId, Types};
use crate::{SV4, SV8, failf};

#[cfg(test)]
mod abi_test;

/// How a single argument crosses the call boundary
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgPlan {
    /// The value's own explosion is appended to the argument list
    Direct,
    /// The value's bytes are reinterpreted as these eightbyte scalars
    Coerced { scalars: SV4<ScalarType> },
    /// A caller-owned copy passed by address, carrying the byval attribute
    Byval { layout: Layout },
    /// A caller-owned copy passed by plain address
    IndirectCopy { layout: Layout },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResultPlan {
    Direct,
    Coerced { scalars: SV4<ScalarType> },
    /// Written through a caller-supplied address passed as the first parameter
    Indirect { layout: Layout },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiAttribute {
    IndirectResult { align: u32 },
    /// `index` is the physical parameter index
    Byval { index: u32, align: u32 },
}

impl Display for AbiAttribute {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AbiAttribute::IndirectResult { align } => write!(f, "sret(align {align})"),
            AbiAttribute::Byval { index, align } => write!(f, "byval({index}, align {align})"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AbiAttributeSet {
    attrs: SV4<AbiAttribute>,
}

impl AbiAttributeSet {
    fn add(&mut self, attr: AbiAttribute) {
        if !self.attrs.contains(&attr) {
            self.attrs.push(attr);
        }
    }

    pub fn add_indirect_return_attributes(&mut self, align: u32) {
        self.add(AbiAttribute::IndirectResult { align })
    }

    pub fn add_byval_argument_attributes(&mut self, index: u32, align: u32) {
        self.add(AbiAttribute::Byval { index, align })
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AbiAttribute> {
        self.attrs.iter()
    }

    pub fn contains(&self, attr: &AbiAttribute) -> bool {
        self.attrs.contains(attr)
    }

    pub fn has_indirect_result(&self) -> bool {
        self.attrs.iter().any(|a| matches!(a, AbiAttribute::IndirectResult { .. }))
    }
}

impl Display for AbiAttributeSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.attrs.iter().join(" "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EightbyteClass {
    Initial,
    Int,
    Float,
}

impl EightbyteClass {
    pub fn combine(&self, other: EightbyteClass) -> EightbyteClass {
        match (self, other) {
            (EightbyteClass::Initial, _) => other,
            (EightbyteClass::Int, EightbyteClass::Int) => EightbyteClass::Int,
            (EightbyteClass::Float, EightbyteClass::Float) => EightbyteClass::Float,
            // Anything fits in a general purpose register, only floats fit in the
            // float registers, so mixtures are ints
            _mix => EightbyteClass::Int,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamAbi {
    pub type_id: TypeId,
    pub layout: Arc<TypeLayout>,
    pub plan: ArgPlan,
    /// Index of this parameter's first physical parameter
    pub physical_start: u32,
}

impl ParamAbi {
    pub fn physical_count(&self) -> usize {
        match &self.plan {
            ArgPlan::Direct => self.layout.explosion_arity(),
            ArgPlan::Coerced { scalars } => scalars.len(),
            ArgPlan::Byval { .. } | ArgPlan::IndirectCopy { .. } => 1,
        }
    }
}

/// The complete calling-convention decision for one signature
#[derive(Debug, Clone)]
pub struct SignatureAbi {
    pub conv: CallConv,
    pub params: SV8<ParamAbi>,
    pub result_type: TypeId,
    pub result_layout: Arc<TypeLayout>,
    pub result: ResultPlan,
    /// Native entry points take a trailing context pointer
    pub has_context: bool,
    pub lowered: LoweredSignature,
}

impl SignatureAbi {
    pub fn has_sret(&self) -> bool {
        matches!(self.result, ResultPlan::Indirect { .. })
    }

    pub fn context_index(&self) -> Option<usize> {
        if self.has_context { Some(self.lowered.params.len() - 1) } else { None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SignatureKey {
    conv: CallConv,
    params: SV8<TypeId>,
    result: TypeId,
    has_context: bool,
}

/// Resolved signatures, shared across lowering workers the same way as the layout cache
pub struct SignatureCache {
    cache: RwLock<FxHashMap<SignatureKey, Arc<SignatureAbi>>>,
}

impl SignatureCache {
    pub fn new() -> SignatureCache {
        SignatureCache { cache: RwLock::new(FxHashMap::with_capacity(128)) }
    }

    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, key: &SignatureKey) -> Option<Arc<SignatureAbi>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    fn insert(&self, key: SignatureKey, abi: Arc<SignatureAbi>) -> Arc<SignatureAbi> {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.entry(key).or_insert(abi).clone()
    }
}

impl Default for SignatureCache {
    fn default() -> Self {
        SignatureCache::new()
    }
}

/// How clang passes 9-16 byte aggregates on ARM64
fn eightbyte_pair() -> SV4<ScalarType> {
    smallvec::smallvec![ScalarType::I64, ScalarType::I64]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForeignAbi {
    Amd64,
    /// Also used for wasm32
    Arm64,
}

pub struct AbiClassifier<'a> {
    types: &'a Types,
    caches: &'a LowerCaches,
    target: Target,
}

impl<'a> AbiClassifier<'a> {
    pub fn new(types: &'a Types, caches: &'a LowerCaches, target: Target) -> AbiClassifier<'a> {
        AbiClassifier { types, caches, target }
    }

    pub fn classify(&self, type_id: TypeId) -> LowerResult<Arc<TypeLayout>> {
        self.caches.layouts.classify(self.types, type_id)
    }

    fn foreign_abi(&self) -> ForeignAbi {
        match self.target.arch() {
            Arch::Intel => ForeignAbi::Amd64,
            Arch::Arm | Arch::Wasm => ForeignAbi::Arm64,
        }
    }

    pub fn is_foreign_representation(&self, type_id: TypeId) -> bool {
        matches!(&*self.types.get(type_id), Type::Function(f) if f.conv == CallConv::Foreign)
    }

    pub fn classify_declaration(
        &self,
        signature: &FunctionSignature,
    ) -> LowerResult<Arc<SignatureAbi>> {
        let params: SV8<TypeId> = signature.clauses.iter().flatten().copied().collect();
        self.classify_signature(
            signature.conv,
            &params,
            signature.result,
            signature.conv == CallConv::Native,
        )
    }

    /// The signature a function value of this type is called with: native values take
    /// their context last, blocks take themselves first
    pub fn classify_function_type(&self, type_id: TypeId) -> LowerResult<Arc<SignatureAbi>> {
        let Some(fun) = self.types.get_function(type_id) else {
            return failf!(
                SourceLocation::UNKNOWN,
                LowerErrorKind::Layout,
                "type {} is not a function type",
                type_id
            );
        };
        match fun.conv {
            CallConv::Native => {
                self.classify_signature(CallConv::Native, &fun.params, fun.result, true)
            }
            CallConv::Foreign => {
                let mut params: SV8<TypeId> = SV8::with_capacity(fun.params.len() + 1);
                // The block is its own first parameter
                params.push(type_id);
                params.extend(fun.params.iter().copied());
                self.classify_signature(CallConv::Foreign, &params, fun.result, false)
            }
        }
    }

    pub fn classify_signature(
        &self,
        conv: CallConv,
        params: &[TypeId],
        result: TypeId,
        has_context: bool,
    ) -> LowerResult<Arc<SignatureAbi>> {
        let key =
            SignatureKey { conv, params: params.iter().copied().collect(), result, has_context };
        if let Some(hit) = self.caches.signatures.get(&key) {
            return Ok(hit);
        }

        let result_layout = self.classify(result)?;
        let result_plan = match conv {
            CallConv::Native => {
                if result_layout.indirect_required {
                    ResultPlan::Indirect { layout: result_layout.layout }
                } else {
                    ResultPlan::Direct
                }
            }
            CallConv::Foreign => self.foreign_result_plan(&result_layout),
        };
        debug_assert_eq!(
            matches!(result_plan, ResultPlan::Indirect { .. }),
            result_layout.indirect_required_for(conv)
        );

        let mut attrs = AbiAttributeSet::default();
        let mut physical: SV8<ScalarType> = SV8::new();
        if let ResultPlan::Indirect { layout } = &result_plan {
            attrs.add_indirect_return_attributes(layout.align);
            physical.push(ScalarType::Pointer);
        }

        let mut param_abis: SV8<ParamAbi> = SV8::with_capacity(params.len());
        for param in params.iter() {
            let layout = self.classify(*param)?;
            let plan = match conv {
                CallConv::Native => {
                    if layout.indirect_required {
                        ArgPlan::IndirectCopy { layout: layout.layout }
                    } else {
                        ArgPlan::Direct
                    }
                }
                CallConv::Foreign => self.foreign_arg_plan(&layout),
            };
            let physical_start = physical.len() as u32;
            match &plan {
                ArgPlan::Direct => physical.extend(layout.scalars()),
                ArgPlan::Coerced { scalars } => physical.extend(scalars.iter().copied()),
                ArgPlan::Byval { layout } => {
                    attrs.add_byval_argument_attributes(physical_start, layout.align);
                    physical.push(ScalarType::Pointer)
                }
                ArgPlan::IndirectCopy { .. } => physical.push(ScalarType::Pointer),
            }
            param_abis.push(ParamAbi { type_id: *param, layout, plan, physical_start });
        }
        if has_context {
            physical.push(ScalarType::Pointer);
        }

        let results: SV4<ScalarType> = match &result_plan {
            ResultPlan::Direct => result_layout.scalars().collect(),
            ResultPlan::Coerced { scalars } => scalars.clone(),
            ResultPlan::Indirect { .. } => SV4::new(),
        };
        let lowered = LoweredSignature { params: physical, results, conv, attrs };
        debug!("classified {} signature of {} params as {}", conv, params.len(), lowered);

        let abi = Arc::new(SignatureAbi {
            conv,
            params: param_abis,
            result_type: result,
            result_layout,
            result: result_plan,
            has_context,
            lowered,
        });
        Ok(self.caches.signatures.insert(key, abi))
    }

    fn is_aggregate(&self, layout: &TypeLayout) -> bool {
        match layout.is_single_scalar() {
            Some(scalar) => scalar.size_bytes(self.target.word_size()) != layout.layout.size,
            None => layout.explosion_arity() > 0,
        }
    }

    /// Anything not `foreign_indirect_required` fits in two eightbytes
    fn foreign_arg_plan(&self, layout: &TypeLayout) -> ArgPlan {
        if layout.foreign_indirect_required {
            return match self.foreign_abi() {
                ForeignAbi::Amd64 => ArgPlan::Byval { layout: layout.layout },
                ForeignAbi::Arm64 => ArgPlan::IndirectCopy { layout: layout.layout },
            };
        }
        if !self.is_aggregate(layout) {
            return ArgPlan::Direct;
        }
        match self.foreign_abi() {
            ForeignAbi::Amd64 => ArgPlan::Coerced { scalars: Self::amd64_eightbytes(layout) },
            ForeignAbi::Arm64 => {
                if layout.layout.size <= 8 {
                    ArgPlan::Coerced { scalars: smallvec::smallvec![ScalarType::I64] }
                } else {
                    ArgPlan::Coerced { scalars: eightbyte_pair() }
                }
            }
        }
    }

    fn foreign_result_plan(&self, layout: &TypeLayout) -> ResultPlan {
        if layout.foreign_indirect_required {
            return ResultPlan::Indirect { layout: layout.layout };
        }
        if !self.is_aggregate(layout) {
            return ResultPlan::Direct;
        }
        let size = layout.layout.size;
        match self.foreign_abi() {
            ForeignAbi::Amd64 => ResultPlan::Coerced { scalars: Self::amd64_eightbytes(layout) },
            ForeignAbi::Arm64 => {
                if size <= 8 {
                    // Returns use the exact width
                    ResultPlan::Coerced {
                        scalars: smallvec::smallvec![ScalarType::int_for_size(size)],
                    }
                } else {
                    ResultPlan::Coerced { scalars: eightbyte_pair() }
                }
            }
        }
    }

    /// Classifies each eightbyte of a small aggregate as Int or Float by the scalars
    /// overlapping it
    fn amd64_eightbytes(layout: &TypeLayout) -> SV4<ScalarType> {
        let size = layout.layout.size;
        if size <= 8 {
            return smallvec::smallvec![ScalarType::int_for_size(size)];
        }
        let mut classes = [EightbyteClass::Initial, EightbyteClass::Initial];
        for slot in layout.slots.iter() {
            let class =
                if slot.scalar.is_float() { EightbyteClass::Float } else { EightbyteClass::Int };
            let eightbyte = (slot.offset / 8) as usize;
            classes[eightbyte] = classes[eightbyte].combine(class);
        }
        let second_bytes = size - 8;
        let first = match classes[0] {
            EightbyteClass::Float => ScalarType::F64,
            EightbyteClass::Int | EightbyteClass::Initial => ScalarType::I64,
        };
        let second = match classes[1] {
            EightbyteClass::Float if second_bytes <= 4 => ScalarType::F32,
            EightbyteClass::Float => ScalarType::F64,
            EightbyteClass::Int | EightbyteClass::Initial => ScalarType::int_for_size(second_bytes),
        };
        smallvec::smallvec![first, second]
    }

    /// The memory the caller must provide for a foreign call's result, if any
    pub fn requires_external_indirect_result(
        &self,
        type_id: TypeId,
    ) -> LowerResult<Option<Layout>> {
        let layout = self.classify(type_id)?;
        match self.foreign_result_plan(&layout) {
            ResultPlan::Indirect { layout } => Ok(Some(layout)),
            ResultPlan::Direct | ResultPlan::Coerced { .. } => Ok(None),
        }
    }

    /// The caller-owned copy a foreign call needs for this argument, if any. Only x86-64
    /// marks the copy with the byval attribute; the copy itself is needed on every target.
    pub fn requires_external_byval_argument(
        &self,
        type_id: TypeId,
    ) -> LowerResult<Option<Layout>> {
        let layout = self.classify(type_id)?;
        match self.foreign_arg_plan(&layout) {
            ArgPlan::Byval { layout } | ArgPlan::IndirectCopy { layout } => Ok(Some(layout)),
            ArgPlan::Direct | ArgPlan::Coerced { .. } => Ok(None),
        }
    }
}
