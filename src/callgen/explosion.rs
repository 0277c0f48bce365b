use log::trace;

use crate::SV8;
use crate::emit::Value;
use crate::errors::{LowerErrorKind, LowerResult, SourceLocation};
use crate::failf;

/// One high-level value flattened into scalar machine values, consumed left to right.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Explosion {
    values: SV8<Value>,
    next: usize,
}

impl Explosion {
    pub fn new() -> Explosion {
        Explosion { values: SV8::new(), next: 0 }
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Explosion {
        Explosion { values: values.into_iter().collect(), next: 0 }
    }

    pub fn add(&mut self, value: Value) {
        self.values.push(value);
    }

    pub fn add_all(&mut self, values: impl IntoIterator<Item = Value>) {
        self.values.extend(values);
    }

    /// Moves the unclaimed values of `other` onto the end of this explosion
    pub fn append(&mut self, mut other: Explosion) {
        self.values.extend(other.claim_all());
    }

    pub fn remaining(&self) -> usize {
        self.values.len() - self.next
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unclaimed values, without claiming them
    pub fn peek_all(&self) -> &[Value] {
        &self.values[self.next..]
    }

    pub fn claim_next(&mut self, location: SourceLocation) -> LowerResult<Value> {
        match self.values.get(self.next) {
            None => failf!(location, LowerErrorKind::ArityMismatch, "explosion is exhausted"),
            Some(v) => {
                self.next += 1;
                Ok(*v)
            }
        }
    }

    pub fn claim(&mut self, count: usize, location: SourceLocation) -> LowerResult<&[Value]> {
        if self.remaining() < count {
            return failf!(
                location,
                LowerErrorKind::ArityMismatch,
                "needed {} scalars but only {} remain",
                count,
                self.remaining()
            );
        }
        let start = self.next;
        self.next += count;
        trace!("claimed {} scalars, {} remain", count, self.remaining());
        Ok(&self.values[start..self.next])
    }

    pub fn claim_all(&mut self) -> SV8<Value> {
        let rest = self.values[self.next..].iter().copied().collect();
        self.next = self.values.len();
        rest
    }

    /// Consumers must leave nothing behind
    pub fn expect_drained(&self, location: SourceLocation, what: &str) -> LowerResult<()> {
        if self.remaining() != 0 {
            return failf!(
                location,
                LowerErrorKind::ArityMismatch,
                "{} left {} unconsumed scalars",
                what,
                self.remaining()
            );
        }
        Ok(())
    }
}
