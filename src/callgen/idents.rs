use std::fmt::{Display, Formatter};

use string_interner::{Symbol, backend::StringBackend};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Ident(string_interner::symbol::SymbolU32);

impl Ord for Ident {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Ident {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl From<Ident> for usize {
    fn from(value: Ident) -> Self {
        value.0.to_usize()
    }
}

impl Display for Ident {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_usize())
    }
}

/// Generic parameter names the builtins are declared over
#[allow(non_snake_case)]
pub struct BuiltinIdents {
    pub T: Ident,
}

// We use the default StringInterner, which uses a contiguous string as its backend
// and u32 symbols
pub struct IdentPool {
    intern_pool: string_interner::StringInterner<StringBackend>,
    /// b for builtins
    pub b: BuiltinIdents,
}

impl IdentPool {
    pub fn intern(&mut self, s: impl AsRef<str>) -> Ident {
        let s = self.intern_pool.get_or_intern(s);
        Ident(s)
    }

    pub fn get(&self, s: impl AsRef<str>) -> Option<Ident> {
        self.intern_pool.get(s).map(Ident)
    }

    pub fn get_name(&self, id: Ident) -> &str {
        self.intern_pool.resolve(id.0).unwrap_or("<unresolved>")
    }

    #[allow(non_snake_case)]
    pub fn make() -> Self {
        let mut pool = string_interner::StringInterner::with_capacity(1024);

        macro_rules! intern {
            ($name: expr) => {
                Ident(pool.get_or_intern_static($name))
            };
        }

        let b = BuiltinIdents {
            T: intern!("T"),
        };

        IdentPool { intern_pool: pool, b }
    }
}
