use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ─── Scalar aliases ───────────────────────────────────────────

/// Bytecode address (instruction index).
pub type Addr = u32;

/// Index into a program's constant pool.
pub type ConstIdx = u32;

/// Index into a program's variable slot table.
pub type SlotIdx = u32;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

// ─── Source span ──────────────────────────────────────────────

/// Half-open byte range into template source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Smallest span covering both `self` and `other`.
    pub fn join(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

// ─── Optimization level ───────────────────────────────────────

/// Gate for the optimization pass pipeline. Each level runs a strict
/// superset of the passes of the level below it.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationLevel {
    None,
    #[default]
    Basic,
    Advanced,
    Maximum,
}

impl fmt::Display for OptimizationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OptimizationLevel::None => "none",
            OptimizationLevel::Basic => "basic",
            OptimizationLevel::Advanced => "advanced",
            OptimizationLevel::Maximum => "maximum",
        };
        f.write_str(s)
    }
}

impl FromStr for OptimizationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(OptimizationLevel::None),
            "basic" | "1" => Ok(OptimizationLevel::Basic),
            "advanced" | "2" => Ok(OptimizationLevel::Advanced),
            "maximum" | "max" | "3" => Ok(OptimizationLevel::Maximum),
            other => Err(format!("unknown optimization level '{other}'")),
        }
    }
}

pub(crate) fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(OptimizationLevel::None < OptimizationLevel::Basic);
        assert!(OptimizationLevel::Basic < OptimizationLevel::Advanced);
        assert!(OptimizationLevel::Advanced < OptimizationLevel::Maximum);
    }

    #[test]
    fn level_parses_names_and_digits() {
        assert_eq!("Advanced".parse(), Ok(OptimizationLevel::Advanced));
        assert_eq!("3".parse(), Ok(OptimizationLevel::Maximum));
        assert!("turbo".parse::<OptimizationLevel>().is_err());
    }

    #[test]
    fn span_join_covers_both() {
        let s = Span::new(4, 8).join(Span::new(1, 5));
        assert_eq!(s, Span::new(1, 8));
        assert_eq!(s.to_string(), "1..8");
    }
}
