//! Transaction states.

use std::fmt;

/// Lifecycle of a transaction.
///
/// Being killed is not a state: it is a flag that forces the transaction
/// to roll back at its next operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Operations are allowed.
    Active,
    /// Committed; terminal.
    Committed,
    /// Rolled back; terminal.
    RolledBack,
}

impl TransactionState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        })
    }
}
