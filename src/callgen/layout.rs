use std::sync::{Arc, PoisonError, RwLock};

use ahash::HashMapExt;
use fxhash::FxHashMap;
use log::debug;

use crate::compiler::{LowerConfig, Target, WordSize};
use crate::errors::{LowerErrorKind, LowerResult, SourceLocation};
use crate::types::{CallConv, FloatType, ScalarType, Type, TypeId, Types};
use crate::{SV4, SV8, failf};

#[cfg(test)]
mod layout_test;

pub fn align_to(bytes: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (bytes + align - 1) & !(align - 1)
}

pub fn checked_align_to(bytes: u32, align: u32) -> Option<u32> {
    debug_assert!(align.is_power_of_two());
    Some(bytes.checked_add(align - 1)? & !(align - 1))
}

/// Widest explosion a type may have
pub const MAX_EXPLOSION_ARITY: usize = 1 << 16;

/// Foreign aggregates wider than this are passed and returned through memory
pub const FOREIGN_MAX_DIRECT_BYTES: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Layout {
    pub size: u32,
    pub align: u32,
}

impl Layout {
    pub const ZERO: Layout = Layout { size: 0, align: 1 };

    pub const fn from_scalar_bytes(bytes: u32) -> Layout {
        Layout { size: bytes, align: bytes }
    }

    pub fn scalar(scalar: ScalarType, word_size: WordSize) -> Layout {
        Layout::from_scalar_bytes(scalar.size_bytes(word_size))
    }

    pub fn stride(&self) -> u32 {
        align_to(self.size, self.align)
    }

    /// Appends a field and returns its offset
    pub fn append_to_aggregate(&mut self, field: Layout) -> u32 {
        let offset = align_to(self.size, field.align);
        self.size = offset + field.size;
        self.align = self.align.max(field.align);
        offset
    }

    /// Like `append_to_aggregate`, but `None` when the size no longer fits in a u32
    pub fn checked_append_to_aggregate(&mut self, field: Layout) -> Option<u32> {
        let offset = checked_align_to(self.size, field.align)?;
        self.size = offset.checked_add(field.size)?;
        self.align = self.align.max(field.align);
        Some(offset)
    }

    /// Rounded up to whole eightbytes, for temporaries that receive coerced scalars
    pub fn eightbyte_padded(&self) -> Layout {
        Layout { size: align_to(self.size, 8), align: self.align.max(8) }
    }
}

/// One scalar of a type's explosion and where it lives when the value is in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScalarSlot {
    pub scalar: ScalarType,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeLayout {
    pub layout: Layout,
    /// The explosion schema, in order
    pub slots: SV8<ScalarSlot>,
    /// Explosion indices holding reference-counted context pointers
    pub refcounted: SV4<u32>,
    /// Too wide to travel through registers under the native convention; passed and
    /// returned through memory
    pub indirect_required: bool,
    /// The same decision under the foreign convention. Implies nothing less than
    /// `indirect_required`; aggregates over 16 bytes are added on top.
    pub foreign_indirect_required: bool,
}

impl TypeLayout {
    pub fn explosion_arity(&self) -> usize {
        self.slots.len()
    }

    pub fn scalars(&self) -> impl Iterator<Item = ScalarType> + '_ {
        self.slots.iter().map(|s| s.scalar)
    }

    pub fn indirect_required_for(&self, conv: CallConv) -> bool {
        match conv {
            CallConv::Native => self.indirect_required,
            CallConv::Foreign => self.foreign_indirect_required,
        }
    }

    pub fn is_trivial(&self) -> bool {
        self.refcounted.is_empty()
    }

    pub fn is_single_scalar(&self) -> Option<ScalarType> {
        match self.slots.as_slice() {
            [slot] if slot.offset == 0 => Some(slot.scalar),
            _ => None,
        }
    }
}

/// Every heap object starts with `{ refcount: u64, destroy: ptr }`; returns the whole object
/// layout and the offset of the payload
pub fn heap_object_layout(word_size: WordSize, payload: Layout) -> (Layout, u32) {
    let mut object = Layout::ZERO;
    object.append_to_aggregate(Layout::from_scalar_bytes(8));
    object.append_to_aggregate(Layout::scalar(ScalarType::Pointer, word_size));
    let payload_offset = object.append_to_aggregate(payload);
    (object, payload_offset)
}

pub const HEAP_REFCOUNT_OFFSET: u32 = 0;
pub const HEAP_DESTROY_OFFSET: u32 = 8;

struct RawLayout {
    layout: Layout,
    slots: SV8<ScalarSlot>,
    refcounted: SV4<u32>,
}

impl RawLayout {
    fn scalar(scalar: ScalarType, word_size: WordSize) -> RawLayout {
        RawLayout {
            layout: Layout::scalar(scalar, word_size),
            slots: smallvec::smallvec![ScalarSlot { scalar, offset: 0 }],
            refcounted: SV4::new(),
        }
    }

    fn empty() -> RawLayout {
        RawLayout { layout: Layout::ZERO, slots: SV8::new(), refcounted: SV4::new() }
    }

    /// `None` when the aggregate outgrows a u32 size or `MAX_EXPLOSION_ARITY`
    fn append(&mut self, field: &RawLayout) -> Option<()> {
        if self.slots.len() + field.slots.len() > MAX_EXPLOSION_ARITY {
            return None;
        }
        let offset = self.layout.checked_append_to_aggregate(field.layout)?;
        let base_index = self.slots.len() as u32;
        self.slots.extend(
            field.slots.iter().map(|s| ScalarSlot { scalar: s.scalar, offset: s.offset + offset }),
        );
        self.refcounted.extend(field.refcounted.iter().map(|r| r + base_index));
        Some(())
    }
}

/// Read-mostly cache of type classifications, shared by every lowering worker.
///
/// A miss computes outside the lock; two workers racing on the same type compute identical
/// layouts and whichever inserts first wins.
pub struct LayoutCache {
    target: Target,
    max_direct_scalars: u32,
    cache: RwLock<FxHashMap<TypeId, Arc<TypeLayout>>>,
}

impl LayoutCache {
    pub fn new(config: &LowerConfig) -> LayoutCache {
        LayoutCache {
            target: config.target,
            max_direct_scalars: config.max_direct_scalars,
            cache: RwLock::new(FxHashMap::with_capacity(256)),
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn classify(&self, types: &Types, type_id: TypeId) -> LowerResult<Arc<TypeLayout>> {
        if let Some(hit) = self.cache.read().unwrap_or_else(PoisonError::into_inner).get(&type_id)
        {
            return Ok(hit.clone());
        }
        let mut visiting: SV8<TypeId> = SV8::new();
        let raw = self.compute(types, type_id, &mut visiting)?;
        let word_bytes = self.target.word_size().bytes();
        let is_scalar = raw.slots.len() == 1;
        let indirect_required = !is_scalar
            && (raw.slots.len() as u32 > self.max_direct_scalars
                || raw.layout.size > 4 * word_bytes);
        let foreign_indirect_required =
            indirect_required || (!is_scalar && raw.layout.size > FOREIGN_MAX_DIRECT_BYTES);
        let computed = Arc::new(TypeLayout {
            layout: raw.layout,
            slots: raw.slots,
            refcounted: raw.refcounted,
            indirect_required,
            foreign_indirect_required,
        });
        debug!(
            "classified type {} as size {} align {} arity {} indirect {}",
            type_id,
            computed.layout.size,
            computed.layout.align,
            computed.explosion_arity(),
            computed.indirect_required
        );
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let entry = cache.entry(type_id).or_insert(computed);
        Ok(entry.clone())
    }

    fn compute(
        &self,
        types: &Types,
        type_id: TypeId,
        visiting: &mut SV8<TypeId>,
    ) -> LowerResult<RawLayout> {
        if visiting.contains(&type_id) {
            return failf!(
                SourceLocation::UNKNOWN,
                LowerErrorKind::Layout,
                "type {} has an unsupported recursive layout",
                type_id
            );
        }
        let word_size = self.target.word_size();
        let typ = types.get(type_id);
        let raw = match &*typ {
            Type::Unit => RawLayout::empty(),
            Type::Bool => RawLayout::scalar(ScalarType::I8, word_size),
            Type::Integer(int) => RawLayout::scalar(int.scalar_type(), word_size),
            Type::Float(FloatType::F32) => RawLayout::scalar(ScalarType::F32, word_size),
            Type::Float(FloatType::F64) => RawLayout::scalar(ScalarType::F64, word_size),
            Type::Pointer => RawLayout::scalar(ScalarType::Pointer, word_size),
            Type::Function(fun) => {
                let mut raw = RawLayout::scalar(ScalarType::Pointer, word_size);
                match fun.conv {
                    CallConv::Native => {
                        // (entry, context); only the context is counted
                        raw.append(&RawLayout::scalar(ScalarType::Pointer, word_size));
                        raw.refcounted.push(1);
                    }
                    CallConv::Foreign => {
                        raw.refcounted.push(0);
                    }
                }
                raw
            }
            Type::Struct(s) => {
                visiting.push(type_id);
                let mut raw = RawLayout::empty();
                for field in s.fields.iter() {
                    let field_raw = self.compute(types, *field, visiting)?;
                    if raw.append(&field_raw).is_none() {
                        return Self::too_large(type_id);
                    }
                }
                visiting.pop();
                raw
            }
            Type::Array { element, len } => {
                visiting.push(type_id);
                let element_raw = self.compute(types, *element, visiting)?;
                let arity = element_raw.slots.len() as u64 * u64::from(*len);
                if arity > MAX_EXPLOSION_ARITY as u64 {
                    return Self::too_large(type_id);
                }
                let mut raw = RawLayout::empty();
                // Elements without scalars are zero-sized; nothing to append
                if !element_raw.slots.is_empty() {
                    for _ in 0..*len {
                        if raw.append(&element_raw).is_none() {
                            return Self::too_large(type_id);
                        }
                    }
                }
                // An empty array still carries its element's alignment
                raw.layout.align = raw.layout.align.max(element_raw.layout.align);
                visiting.pop();
                raw
            }
            Type::TypeParam(_) => {
                return failf!(
                    SourceLocation::UNKNOWN,
                    LowerErrorKind::Layout,
                    "type {} is an unresolved generic parameter; no substitution was provided",
                    type_id
                );
            }
        };
        Ok(raw)
    }

    fn too_large<T>(type_id: TypeId) -> LowerResult<T> {
        failf!(
            SourceLocation::UNKNOWN,
            LowerErrorKind::Layout,
            "type {} is too large to lower: its size or explosion exceeds {} scalars",
            type_id,
            MAX_EXPLOSION_ARITY
        )
    }
}
