//! Transaction status codes and the status state machine.
//!
//! A transaction is always in exactly one of ten states. Four are terminal;
//! five are transient "temporary statuses" written before the call loop
//! starts work, so that a crash at any point leaves a state recovery can
//! complete; `i` (in progress) is the ordinary open state.
//!
//! The persisted form is a single character for compatibility with the
//! on-disk schema; [`TxStatus::as_char`] and [`TxStatus::from_char`]
//! convert, erroring on unknown codes.

use crate::error::{TxError, TxResult};
use std::fmt;

/// Status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxStatus {
    /// `i` - in progress (open, accepting calls).
    InProgress,
    /// `a` - aborting: rolling back an in-progress transaction.
    Aborting,
    /// `u` - undoing a committed transaction.
    Undoing,
    /// `d` - redoing an undone transaction.
    Redoing,
    /// `v` - aborting an undo.
    UndoAborting,
    /// `e` - aborting a redo.
    RedoAborting,
    /// `C` - committed.
    Committed,
    /// `R` - rolled back.
    RolledBack,
    /// `U` - committed, then undone.
    Undone,
    /// `X` - inconsistent: a rollback itself failed.
    Inconsistent,
}

impl TxStatus {
    /// All ten statuses.
    pub const ALL: [TxStatus; 10] = [
        Self::InProgress,
        Self::Aborting,
        Self::Undoing,
        Self::Redoing,
        Self::UndoAborting,
        Self::RedoAborting,
        Self::Committed,
        Self::RolledBack,
        Self::Undone,
        Self::Inconsistent,
    ];

    /// The statuses recovery drives to a terminal state.
    pub const NON_TERMINAL: [TxStatus; 6] = [
        Self::InProgress,
        Self::Aborting,
        Self::Undoing,
        Self::Redoing,
        Self::UndoAborting,
        Self::RedoAborting,
    ];

    /// The statuses `discard` accepts.
    pub const DISCARDABLE: [TxStatus; 3] = [Self::Committed, Self::Undone, Self::Inconsistent];

    /// The persisted single-character code.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::InProgress => 'i',
            Self::Aborting => 'a',
            Self::Undoing => 'u',
            Self::Redoing => 'd',
            Self::UndoAborting => 'v',
            Self::RedoAborting => 'e',
            Self::Committed => 'C',
            Self::RolledBack => 'R',
            Self::Undone => 'U',
            Self::Inconsistent => 'X',
        }
    }

    /// Parses the persisted single-character code.
    pub fn from_char(c: char) -> TxResult<Self> {
        match c {
            'i' => Ok(Self::InProgress),
            'a' => Ok(Self::Aborting),
            'u' => Ok(Self::Undoing),
            'd' => Ok(Self::Redoing),
            'v' => Ok(Self::UndoAborting),
            'e' => Ok(Self::RedoAborting),
            'C' => Ok(Self::Committed),
            'R' => Ok(Self::RolledBack),
            'U' => Ok(Self::Undone),
            'X' => Ok(Self::Inconsistent),
            other => Err(TxError::UnknownStatus { code: other }),
        }
    }

    /// Whether this status is terminal (recovery leaves it alone).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::RolledBack | Self::Undone | Self::Inconsistent
        )
    }

    /// Whether this is one of the five mid-operation temporary statuses.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Aborting
                | Self::Undoing
                | Self::Redoing
                | Self::UndoAborting
                | Self::RedoAborting
        )
    }

    /// Human-readable description, used in `480` messages.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::InProgress => "in progress",
            Self::Aborting => "aborting",
            Self::Undoing => "undoing",
            Self::Redoing => "redoing",
            Self::UndoAborting => "aborting an undo",
            Self::RedoAborting => "aborting a redo",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::Undone => "undone",
            Self::Inconsistent => "inconsistent",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// The `(transient, final)` route a rollback takes from `current`.
///
/// Rolling back an in-progress transaction lands on `R`; aborting an undo
/// restores `C`; aborting a redo restores `U`. A transient current status
/// resumes its own route (recovery re-enters here after a crash). Terminal
/// statuses have no route: rollback is a no-op on them.
#[must_use]
pub fn rollback_route(current: TxStatus) -> Option<(TxStatus, TxStatus)> {
    match current {
        TxStatus::InProgress | TxStatus::Aborting => {
            Some((TxStatus::Aborting, TxStatus::RolledBack))
        }
        TxStatus::Undoing | TxStatus::UndoAborting => {
            Some((TxStatus::UndoAborting, TxStatus::Committed))
        }
        TxStatus::Redoing | TxStatus::RedoAborting => {
            Some((TxStatus::RedoAborting, TxStatus::Undone))
        }
        _ => None,
    }
}

/// The `(transient, final)` route of `undo`: requires `C`.
#[must_use]
pub fn undo_route(current: TxStatus) -> Option<(TxStatus, TxStatus)> {
    match current {
        TxStatus::Committed => Some((TxStatus::Undoing, TxStatus::Undone)),
        _ => None,
    }
}

/// The `(transient, final)` route of `redo`: requires `U`.
#[must_use]
pub fn redo_route(current: TxStatus) -> Option<(TxStatus, TxStatus)> {
    match current {
        TxStatus::Undone => Some((TxStatus::Redoing, TxStatus::Committed)),
        _ => None,
    }
}
