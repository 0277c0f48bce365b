// Copyright (c) 2025 knix
// All rights reserved.

use smallvec::SmallVec;

pub mod abi;
pub mod apply;
pub mod ast;
pub mod backend;
pub mod bridge;
pub mod builtins;
pub mod call;
pub mod compiler;
pub mod emit;
pub mod errors;
pub mod explosion;
pub mod idents;
pub mod layout;
pub mod lower;
pub mod scenarios;
pub mod thunk;
pub mod types;
pub mod uncurry;

pub const KILOBYTE: usize = 1024;
pub const MEGABYTE: usize = KILOBYTE * 1024;

pub type SV8<T> = SmallVec<[T; 8]>;
pub type SV4<T> = SmallVec<[T; 4]>;

#[macro_export]
macro_rules! nz_u32_id {
    ($name: ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(std::num::NonZeroU32);
        impl From<std::num::NonZeroU32> for $name {
            fn from(value: std::num::NonZeroU32) -> Self {
                Self::from_nzu32(value)
            }
        }
        impl From<$name> for std::num::NonZeroU32 {
            fn from(val: $name) -> Self {
                val.0
            }
        }
        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl $name {
            pub const fn as_u32(self) -> u32 {
                self.0.get()
            }

            /// Zero-based position, for ids that index a Vec
            pub const fn index(self) -> usize {
                (self.0.get() - 1) as usize
            }

            pub const fn from_index(index: usize) -> Self {
                $name($crate::nzu32_increment(index as u32))
            }

            pub const fn from_nzu32(value: std::num::NonZeroU32) -> Self {
                $name(value)
            }
            pub const fn from_u32(value: u32) -> Option<Self> {
                match std::num::NonZeroU32::new(value) {
                    None => None,
                    Some(nz_u32) => Some($name(nz_u32)),
                }
            }
            pub const ONE: Self = $name(std::num::NonZeroU32::new(1).unwrap());
        }
    };
}

pub const fn nzu32_increment(n: u32) -> std::num::NonZeroU32 {
    // Safety: If you add one to a u32 it'll never be zero
    unsafe { std::num::NonZeroU32::new_unchecked(n + 1) }
}

#[macro_export]
macro_rules! impl_copy_if_small {
    ($size:expr, $struct_name:ident) => {
        const _: () = {
            if std::mem::size_of::<$struct_name>() > $size {
                panic!("impl_copy_if_small: Size constraint violated");
            }
        };

        impl std::marker::Copy for $struct_name where Self: Sized {}
    };
}
