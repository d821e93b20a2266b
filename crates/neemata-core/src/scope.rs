// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifetime tiers for dependency injection.

use std::fmt;

/// The lifetime tier at which a provider's value is cached.
///
/// Tiers nest: `Global ⊂ Connection ⊂ Call`. A container of a deeper scope
/// sees instances cached by its ancestors. `Transient` bypasses caching
/// entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// One instance per application.
    Global,
    /// One instance per connection.
    Connection,
    /// One instance per call.
    Call,
    /// A fresh instance per resolution; never cached or tracked.
    Transient,
}

impl Scope {
    /// Nesting depth, shallow to deep. `None` for `Transient`.
    pub fn depth(self) -> Option<u8> {
        match self {
            Scope::Global => Some(0),
            Scope::Connection => Some(1),
            Scope::Call => Some(2),
            Scope::Transient => None,
        }
    }

    /// Whether a provider of this scope may be resolved in a container of
    /// scope `container`: the container must be at this tier or deeper.
    pub fn resolvable_in(self, container: Scope) -> bool {
        match (self.depth(), container.depth()) {
            (None, _) => true,
            (Some(p), Some(c)) => p <= c,
            (Some(_), None) => false,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scope::Global => "global",
            Scope::Connection => "connection",
            Scope::Call => "call",
            Scope::Transient => "transient",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_nesting_order() {
        assert!(Scope::Global.depth() < Scope::Connection.depth());
        assert!(Scope::Connection.depth() < Scope::Call.depth());
        assert_eq!(Scope::Transient.depth(), None);
    }

    #[test]
    fn test_resolvable_in() {
        assert!(Scope::Global.resolvable_in(Scope::Global));
        assert!(Scope::Global.resolvable_in(Scope::Call));
        assert!(Scope::Connection.resolvable_in(Scope::Call));
        assert!(!Scope::Call.resolvable_in(Scope::Connection));
        assert!(!Scope::Call.resolvable_in(Scope::Global));
        assert!(Scope::Transient.resolvable_in(Scope::Global));
        assert!(Scope::Transient.resolvable_in(Scope::Call));
    }
}
