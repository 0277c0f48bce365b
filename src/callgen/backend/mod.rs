//! A reference code-emission backend: `ir` records lowered functions as a printable,
//! linkable module and `vm` executes one.

pub mod ir;
pub mod vm;
