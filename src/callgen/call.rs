// Copyright (c) 2025 knix
// All rights reserved.

use std::sync::Arc;

use log::{debug, trace};

use crate::abi::{ArgPlan, ResultPlan, SignatureAbi};
use crate::emit::{Address, Callee, CodeEmitter, Value, load_explosion, store_explosion};
use crate::errors::{LowerErrorKind, LowerResult, SourceLocation};
use crate::explosion::Explosion;
use crate::{SV8, failf};

/// Whether the caller hands the callee its own +1 or lends a value it keeps owning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Released by the caller once the call returns
    Owned,
    Borrowed,
}

#[derive(Debug)]
pub enum CallResult {
    Direct(Explosion),
    /// The result was written through the indirect-result address
    InMemory(Address),
}

/// Assembles one call. Arguments are added parameter by parameter, in clause order;
/// `emit` consumes the state, so a call can only be issued once.
#[derive(Debug)]
pub struct CallEmission {
    callee: Callee,
    abi: Arc<SignatureAbi>,
    args: SV8<Value>,
    next_param: usize,
    context: Option<Value>,
    indirect_result: Option<Address>,
    /// Owned arguments, released after the call
    cleanups: SV8<Value>,
    location: SourceLocation,
}

impl CallEmission {
    pub fn start(callee: Callee, abi: Arc<SignatureAbi>, location: SourceLocation) -> Self {
        CallEmission {
            callee,
            abi,
            args: SV8::new(),
            next_param: 0,
            context: None,
            indirect_result: None,
            cleanups: SV8::new(),
            location,
        }
    }

    pub fn abi(&self) -> &SignatureAbi {
        &self.abi
    }

    pub fn remaining_params(&self) -> usize {
        self.abi.params.len() - self.next_param
    }

    /// Claims the next parameter's scalars from `source` and passes them per its plan
    pub fn add_arg(
        &mut self,
        emitter: &mut dyn CodeEmitter,
        source: &mut Explosion,
        ownership: Ownership,
    ) -> LowerResult<()> {
        let abi = self.abi.clone();
        let Some(param) = abi.params.get(self.next_param) else {
            return failf!(
                self.location,
                LowerErrorKind::ArityMismatch,
                "call takes {} arguments but more were supplied",
                abi.params.len()
            );
        };
        let layout = &param.layout;
        let values: SV8<Value> =
            source.claim(layout.explosion_arity(), self.location)?.iter().copied().collect();
        if ownership == Ownership::Owned {
            self.cleanups.extend(layout.refcounted.iter().map(|i| values[*i as usize]));
        }
        match &param.plan {
            ArgPlan::Direct => self.args.extend(values),
            ArgPlan::Coerced { scalars } => {
                let temp = emitter.alloca(layout.layout.eightbyte_padded());
                store_explosion(emitter, layout, &values, temp.ptr, 0);
                for (i, scalar) in scalars.iter().enumerate() {
                    let coerced = emitter.load(*scalar, temp.ptr, 8 * i as u32);
                    self.args.push(coerced);
                }
            }
            ArgPlan::Byval { layout: copy_layout }
            | ArgPlan::IndirectCopy { layout: copy_layout } => {
                let copy = emitter.alloca(*copy_layout);
                store_explosion(emitter, layout, &values, copy.ptr, 0);
                self.args.push(copy.ptr);
            }
        }
        trace!("call arg {} planned as {:?}", self.next_param, param.plan);
        self.next_param += 1;
        Ok(())
    }

    /// Adds every argument of `clause`, which must hold exactly the remaining arity
    pub fn add_all_args(
        &mut self,
        emitter: &mut dyn CodeEmitter,
        mut clause: Explosion,
        ownership: Ownership,
    ) -> LowerResult<()> {
        while self.remaining_params() > 0 {
            self.add_arg(emitter, &mut clause, ownership)?;
        }
        clause.expect_drained(self.location, "call arguments")
    }

    pub fn set_context(&mut self, context: Value, ownership: Ownership) {
        self.context = Some(context);
        if ownership == Ownership::Owned {
            self.cleanups.push(context);
        }
    }

    pub fn set_indirect_result(&mut self, dest: Address) {
        self.indirect_result = Some(dest);
    }

    pub fn emit(self, emitter: &mut dyn CodeEmitter) -> LowerResult<CallResult> {
        if self.next_param != self.abi.params.len() {
            return failf!(
                self.location,
                LowerErrorKind::ArityMismatch,
                "call supplied {} of {} arguments",
                self.next_param,
                self.abi.params.len()
            );
        }
        let mut physical: SV8<Value> = SV8::with_capacity(self.args.len() + 2);
        let result_address = match &self.abi.result {
            ResultPlan::Indirect { layout } => {
                let addr = match self.indirect_result {
                    Some(dest) => dest,
                    None => emitter.alloca(*layout),
                };
                physical.push(addr.ptr);
                Some(addr)
            }
            ResultPlan::Direct | ResultPlan::Coerced { .. } => None,
        };
        physical.extend(self.args.iter().copied());
        if self.abi.has_context {
            let context = match self.context {
                Some(c) => c,
                None => emitter.const_null(),
            };
            physical.push(context);
        }
        debug!(
            "emitting {} call with {} physical args ({} indirect result)",
            self.abi.conv,
            physical.len(),
            if result_address.is_some() { "with" } else { "no" }
        );
        let results = emitter.call(self.callee, &self.abi.lowered, &physical);
        for value in self.cleanups.iter() {
            emitter.release(*value);
        }

        match (&self.abi.result, result_address) {
            (ResultPlan::Indirect { .. }, Some(addr)) => Ok(CallResult::InMemory(addr)),
            (ResultPlan::Coerced { .. }, _) => {
                let layout = &self.abi.result_layout;
                let temp = emitter.alloca(layout.layout.eightbyte_padded());
                for (i, value) in results.iter().enumerate() {
                    emitter.store(*value, temp.ptr, 8 * i as u32);
                }
                let values = load_explosion(emitter, layout, temp.ptr, 0);
                Ok(CallResult::Direct(Explosion::from_values(values)))
            }
            _ => Ok(CallResult::Direct(Explosion::from_values(results))),
        }
    }
}
