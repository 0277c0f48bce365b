use std::fmt::{Display, Formatter, Write};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ahash::HashMapExt;
use fxhash::FxHashMap;
use itertools::Itertools;

use crate::SV4;
use crate::compiler::WordSize;
use crate::idents::{Ident, IdentPool};

#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
pub struct TypeId(u32);

impl Display for TypeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.to_string())
    }
}

pub const UNIT_TYPE_ID: TypeId = TypeId(0);
pub const BOOL_TYPE_ID: TypeId = TypeId(1);
pub const U8_TYPE_ID: TypeId = TypeId(2);
pub const U16_TYPE_ID: TypeId = TypeId(3);
pub const U32_TYPE_ID: TypeId = TypeId(4);
pub const U64_TYPE_ID: TypeId = TypeId(5);
pub const I8_TYPE_ID: TypeId = TypeId(6);
pub const I16_TYPE_ID: TypeId = TypeId(7);
pub const I32_TYPE_ID: TypeId = TypeId(8);
pub const I64_TYPE_ID: TypeId = TypeId(9);
pub const F32_TYPE_ID: TypeId = TypeId(10);
pub const F64_TYPE_ID: TypeId = TypeId(11);
pub const POINTER_TYPE_ID: TypeId = TypeId(12);

/// The machine-level kinds a value can be exploded into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Pointer,
}

impl ScalarType {
    pub fn size_bytes(&self, word_size: WordSize) -> u32 {
        match self {
            ScalarType::I8 => 1,
            ScalarType::I16 => 2,
            ScalarType::I32 => 4,
            ScalarType::I64 => 8,
            ScalarType::F32 => 4,
            ScalarType::F64 => 8,
            ScalarType::Pointer => word_size.bytes(),
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ScalarType::F32 | ScalarType::F64)
    }

    /// The smallest integer scalar that can hold `size_bytes`
    pub fn int_for_size(size_bytes: u32) -> ScalarType {
        if size_bytes <= 1 {
            ScalarType::I8
        } else if size_bytes <= 2 {
            ScalarType::I16
        } else if size_bytes <= 4 {
            ScalarType::I32
        } else {
            ScalarType::I64
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            ScalarType::I8 => "i8",
            ScalarType::I16 => "i16",
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
            ScalarType::Pointer => "ptr",
        }
    }
}

impl Display for ScalarType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntegerType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl Display for IntegerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegerType::U8 => write!(f, "u8"),
            IntegerType::U16 => write!(f, "u16"),
            IntegerType::U32 => write!(f, "u32"),
            IntegerType::U64 => write!(f, "u64"),
            IntegerType::I8 => write!(f, "i8"),
            IntegerType::I16 => write!(f, "i16"),
            IntegerType::I32 => write!(f, "i32"),
            IntegerType::I64 => write!(f, "i64"),
        }
    }
}

impl IntegerType {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            IntegerType::U8 | IntegerType::I8 => ScalarType::I8,
            IntegerType::U16 | IntegerType::I16 => ScalarType::I16,
            IntegerType::U32 | IntegerType::I32 => ScalarType::I32,
            IntegerType::U64 | IntegerType::I64 => ScalarType::I64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatType {
    F32,
    F64,
}

/// How a function type is called and represented as a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallConv {
    /// Thick values: an entry point plus a reference-counted context
    Native,
    /// The platform C convention; function values are block objects
    Foreign,
}

impl Display for CallConv {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CallConv::Native => f.write_str("native"),
            CallConv::Foreign => f.write_str("foreign"),
        }
    }
}

/// One parameter clause; curried types nest through `result`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    pub params: SV4<TypeId>,
    pub result: TypeId,
    pub conv: CallConv,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructType {
    pub fields: SV4<TypeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Unit,
    Bool,
    Integer(IntegerType),
    Float(FloatType),
    Pointer,
    Struct(StructType),
    Array { element: TypeId, len: u32 },
    Function(FunctionType),
    TypeParam(Ident),
}

impl Type {
    pub fn as_function(&self) -> Option<&FunctionType> {
        match self {
            Type::Function(f) => Some(f),
            _ => None,
        }
    }
}

/// A resolved mapping from generic parameters to concrete types
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Substitutions {
    pairs: SV4<(Ident, TypeId)>,
}

impl Substitutions {
    pub fn empty() -> Substitutions {
        Substitutions { pairs: SV4::new() }
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (Ident, TypeId)>) -> Substitutions {
        Substitutions { pairs: pairs.into_iter().collect() }
    }

    pub fn get(&self, param: Ident) -> Option<TypeId> {
        self.pairs.iter().find(|(p, _)| *p == param).map(|(_, t)| *t)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Ident, TypeId)> {
        self.pairs.iter()
    }
}

struct TypesInner {
    types: Vec<Arc<Type>>,
    dedupe: FxHashMap<Arc<Type>, TypeId>,
}

/// Append-only, hash-consed type pool. Lowering workers share one pool; interning a type
/// that already exists returns the existing id, so racing interns of the same type agree.
pub struct Types {
    inner: RwLock<TypesInner>,
}

impl Types {
    pub fn make() -> Types {
        let types = Types {
            inner: RwLock::new(TypesInner {
                types: Vec::with_capacity(256),
                dedupe: FxHashMap::with_capacity(256),
            }),
        };
        let builtins = [
            (UNIT_TYPE_ID, Type::Unit),
            (BOOL_TYPE_ID, Type::Bool),
            (U8_TYPE_ID, Type::Integer(IntegerType::U8)),
            (U16_TYPE_ID, Type::Integer(IntegerType::U16)),
            (U32_TYPE_ID, Type::Integer(IntegerType::U32)),
            (U64_TYPE_ID, Type::Integer(IntegerType::U64)),
            (I8_TYPE_ID, Type::Integer(IntegerType::I8)),
            (I16_TYPE_ID, Type::Integer(IntegerType::I16)),
            (I32_TYPE_ID, Type::Integer(IntegerType::I32)),
            (I64_TYPE_ID, Type::Integer(IntegerType::I64)),
            (F32_TYPE_ID, Type::Float(FloatType::F32)),
            (F64_TYPE_ID, Type::Float(FloatType::F64)),
            (POINTER_TYPE_ID, Type::Pointer),
        ];
        for (expected_id, typ) in builtins {
            let id = types.add_type(typ);
            debug_assert_eq!(id, expected_id);
        }
        types
    }

    fn read(&self) -> RwLockReadGuard<'_, TypesInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TypesInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_type(&self, typ: Type) -> TypeId {
        if let Some(existing) = self.read().dedupe.get(&typ) {
            return *existing;
        }
        let mut inner = self.write();
        // Another writer may have interned it between our read and write
        if let Some(existing) = inner.dedupe.get(&typ) {
            return *existing;
        }
        let type_id = TypeId(inner.types.len() as u32);
        let typ = Arc::new(typ);
        inner.types.push(typ.clone());
        inner.dedupe.insert(typ, type_id);
        type_id
    }

    pub fn get(&self, type_id: TypeId) -> Arc<Type> {
        self.read().types[type_id.0 as usize].clone()
    }

    pub fn len(&self) -> usize {
        self.read().types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_struct(&self, fields: impl IntoIterator<Item = TypeId>) -> TypeId {
        self.add_type(Type::Struct(StructType { fields: fields.into_iter().collect() }))
    }

    pub fn add_array(&self, element: TypeId, len: u32) -> TypeId {
        self.add_type(Type::Array { element, len })
    }

    pub fn add_function(
        &self,
        params: impl IntoIterator<Item = TypeId>,
        result: TypeId,
        conv: CallConv,
    ) -> TypeId {
        self.add_type(Type::Function(FunctionType {
            params: params.into_iter().collect(),
            result,
            conv,
        }))
    }

    pub fn add_type_param(&self, name: Ident) -> TypeId {
        self.add_type(Type::TypeParam(name))
    }

    pub fn get_function(&self, type_id: TypeId) -> Option<FunctionType> {
        self.get(type_id).as_function().cloned()
    }

    /// Replaces every mapped type parameter. Unmapped parameters are left in place; it is
    /// classification that rejects them.
    pub fn substitute(&self, type_id: TypeId, subs: &Substitutions) -> TypeId {
        if subs.is_empty() {
            return type_id;
        }
        let typ = self.get(type_id);
        match &*typ {
            Type::Unit
            | Type::Bool
            | Type::Integer(_)
            | Type::Float(_)
            | Type::Pointer => type_id,
            Type::TypeParam(name) => subs.get(*name).unwrap_or(type_id),
            Type::Struct(s) => {
                let fields: SV4<TypeId> =
                    s.fields.iter().map(|f| self.substitute(*f, subs)).collect();
                if fields == s.fields { type_id } else { self.add_struct(fields) }
            }
            Type::Array { element, len } => {
                let new_element = self.substitute(*element, subs);
                if new_element == *element { type_id } else { self.add_array(new_element, *len) }
            }
            Type::Function(fun) => {
                let params: SV4<TypeId> =
                    fun.params.iter().map(|p| self.substitute(*p, subs)).collect();
                let result = self.substitute(fun.result, subs);
                if params == fun.params && result == fun.result {
                    type_id
                } else {
                    self.add_function(params, result, fun.conv)
                }
            }
        }
    }

    pub fn type_to_string(&self, type_id: TypeId, idents: &IdentPool) -> String {
        let mut s = String::new();
        self.write_type(&mut s, type_id, idents).unwrap_or_default();
        s
    }

    fn write_type(
        &self,
        w: &mut impl Write,
        type_id: TypeId,
        idents: &IdentPool,
    ) -> std::fmt::Result {
        match &*self.get(type_id) {
            Type::Unit => w.write_str("unit"),
            Type::Bool => w.write_str("bool"),
            Type::Integer(int) => write!(w, "{int}"),
            Type::Float(FloatType::F32) => w.write_str("f32"),
            Type::Float(FloatType::F64) => w.write_str("f64"),
            Type::Pointer => w.write_str("ptr"),
            Type::Struct(s) => {
                w.write_str("{ ")?;
                for (i, field) in s.fields.iter().enumerate() {
                    if i > 0 {
                        w.write_str(", ")?;
                    }
                    self.write_type(w, *field, idents)?;
                }
                w.write_str(" }")
            }
            Type::Array { element, len } => {
                w.write_char('[')?;
                self.write_type(w, *element, idents)?;
                write!(w, " x {len}]")
            }
            Type::Function(fun) => {
                if fun.conv == CallConv::Foreign {
                    w.write_str("@block ")?;
                }
                let params =
                    fun.params.iter().map(|p| self.type_to_string(*p, idents)).join(", ");
                write!(w, "({params}) -> ")?;
                self.write_type(w, fun.result, idents)
            }
            Type::TypeParam(name) => w.write_str(idents.get_name(*name)),
        }
    }
}
