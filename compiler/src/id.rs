// id.rs — Stable identifiers for operations and values
//
// Operations live in an arena (`Program::ops`) and are addressed by index.
// Every analysis keys its tables by these identifiers, never by reference,
// so caches stay valid for as long as the program is not mutated.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier for an operation: its index in `Program::ops`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(pub u32);

impl OpId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op #{}", self.0)
    }
}

/// A value: one result slot of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueRef {
    pub op: OpId,
    pub result: usize,
}

impl ValueRef {
    pub fn new(op: OpId, result: usize) -> Self {
        Self { op, result }
    }
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}#{}", self.op.0, self.result)
    }
}

/// Monotonic allocator for generated names (`loop_0`, `buffer_3`, ...).
///
/// Names already present in the program are skipped, so generated names
/// never collide with user-provided ones.
#[derive(Debug, Clone)]
pub struct NameAllocator {
    prefix: &'static str,
    next: usize,
}

impl NameAllocator {
    pub fn new(prefix: &'static str) -> Self {
        Self { prefix, next: 0 }
    }

    /// Allocate the next name for which `in_use` returns false.
    pub fn fresh(&mut self, in_use: impl Fn(&str) -> bool) -> String {
        loop {
            let name = format!("{}_{}", self.prefix, self.next);
            self.next += 1;
            if !in_use(&name) {
                return name;
            }
        }
    }
}
