use std::error::Error;
use std::fmt::{Display, Formatter};

use colored::Colorize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub const UNKNOWN: SourceLocation = SourceLocation { line: 0, column: 0 };

    pub const fn new(line: u32, column: u32) -> SourceLocation {
        SourceLocation { line, column }
    }

    pub fn is_unknown(&self) -> bool {
        *self == SourceLocation::UNKNOWN
    }
}

impl Display for SourceLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_unknown() {
            f.write_str("<unknown>")
        } else {
            write!(f, "{}:{}", self.line, self.column)
        }
    }
}

/// Every lowering failure is an internal-consistency violation between the typed AST and
/// this layer; none of them are recoverable for the enclosing function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerErrorKind {
    /// A type could not be classified: unresolved generic or unsupported recursive layout
    Layout,
    /// An explosion did not carry the number of scalars a clause or parameter requires
    ArityMismatch,
    /// No block shim contract exists for the requested function shape
    UnsupportedBridge,
}

impl LowerErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            LowerErrorKind::Layout => "layout",
            LowerErrorKind::ArityMismatch => "arity mismatch",
            LowerErrorKind::UnsupportedBridge => "unsupported bridge",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LowerError {
    pub kind: LowerErrorKind,
    pub message: String,
    pub location: SourceLocation,
}

impl LowerError {
    pub fn make(
        kind: LowerErrorKind,
        message: impl AsRef<str>,
        location: SourceLocation,
    ) -> LowerError {
        LowerError { kind, message: message.as_ref().to_owned(), location }
    }

    /// Classification happens without a source position; the lowering site that asked
    /// for it fills one in
    pub fn located(mut self, location: SourceLocation) -> LowerError {
        if self.location.is_unknown() {
            self.location = location;
        }
        self
    }
}

impl Display for LowerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error at {}: {}", self.kind.name(), self.location, self.message)
    }
}

impl Error for LowerError {}

pub type LowerResult<A> = Result<A, LowerError>;

pub fn make_error(
    message: impl AsRef<str>,
    kind: LowerErrorKind,
    location: SourceLocation,
) -> LowerError {
    LowerError::make(kind, message, location)
}

pub fn make_fail<A>(
    message: impl AsRef<str>,
    kind: LowerErrorKind,
    location: SourceLocation,
) -> LowerResult<A> {
    Err(make_error(message, kind, location))
}

#[macro_export]
macro_rules! failf {
    ($location:expr, $kind:expr, $($format_args:expr),* $(,)?) => {
        {
            let s: String = format!($($format_args),*);
            $crate::errors::make_fail(&s, $kind, $location)
        }
    };
}

pub fn write_error(
    w: &mut impl std::io::Write,
    unit_name: &str,
    error: &LowerError,
) -> std::io::Result<()> {
    writeln!(w, "{} [{}]: {}", "error".red().bold(), error.kind.name(), error.message.bold())?;
    writeln!(w, "  {} {}:{}", "-->".blue(), unit_name, error.location)?;
    Ok(())
}
