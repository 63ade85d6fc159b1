//! Propagation rules: what a unit of work does when a transaction is, or is
//! not, already bound to its execution context.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Propagation behaviour of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Propagation {
    /// Join the current transaction, or begin one if none is bound.
    #[default]
    Required,
    /// Always begin a new transaction, suspending the current one.
    RequiresNew,
    /// Join the current transaction if any, otherwise run without one.
    Supports,
    /// Join the current transaction; fail if none is bound.
    Mandatory,
    /// Suspend the current transaction, if any, and run without one.
    NotSupported,
    /// Run without a transaction; fail if one is bound.
    Never,
}

impl Propagation {
    /// Whether the rule reuses a bound transaction instead of suspending it.
    pub fn joins_existing(&self) -> bool {
        matches!(
            self,
            Propagation::Required | Propagation::Supports | Propagation::Mandatory
        )
    }

    /// Whether the rule begins a transaction when none is bound.
    pub fn begins_when_absent(&self) -> bool {
        matches!(self, Propagation::Required | Propagation::RequiresNew)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Propagation::Required => "REQUIRED",
            Propagation::RequiresNew => "REQUIRES_NEW",
            Propagation::Supports => "SUPPORTS",
            Propagation::Mandatory => "MANDATORY",
            Propagation::NotSupported => "NOT_SUPPORTED",
            Propagation::Never => "NEVER",
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Propagation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace(' ', "_").as_str() {
            "REQUIRED" => Ok(Propagation::Required),
            "REQUIRES_NEW" => Ok(Propagation::RequiresNew),
            "SUPPORTS" => Ok(Propagation::Supports),
            "MANDATORY" => Ok(Propagation::Mandatory),
            "NOT_SUPPORTED" => Ok(Propagation::NotSupported),
            "NEVER" => Ok(Propagation::Never),
            _ => Err(format!("unknown propagation: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_begin_rules() {
        assert!(Propagation::Required.joins_existing());
        assert!(Propagation::Required.begins_when_absent());
        assert!(!Propagation::RequiresNew.joins_existing());
        assert!(Propagation::RequiresNew.begins_when_absent());
        assert!(Propagation::Supports.joins_existing());
        assert!(!Propagation::Supports.begins_when_absent());
        assert!(!Propagation::Never.joins_existing());
    }

    #[test]
    fn test_parse_propagation() {
        assert_eq!("requires new".parse::<Propagation>().unwrap(), Propagation::RequiresNew);
        assert_eq!("NOT_SUPPORTED".parse::<Propagation>().unwrap(), Propagation::NotSupported);
        assert!("nested".parse::<Propagation>().is_err());
    }
}
