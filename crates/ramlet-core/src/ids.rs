//! Identifier types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation key of a request; assigned once by the requesting side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Key under which permanent, never-released capacity is withheld.
    pub const BASELINE: TaskId = TaskId(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a process started by the environment. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic task id source. Ids start at 1; 0 is [`TaskId::BASELINE`].
#[derive(Debug)]
pub struct IdCounter {
    value: u64,
}

impl Default for IdCounter {
    fn default() -> Self {
        Self { value: 1 }
    }
}

impl IdCounter {
    #[inline]
    pub fn next(&mut self) -> TaskId {
        let value = self.value;
        self.value += 1;
        TaskId(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_skips_baseline() {
        let mut counter = IdCounter::default();
        assert_eq!(counter.next(), TaskId(1));
        assert_eq!(counter.next(), TaskId(2));
        assert_ne!(counter.next(), TaskId::BASELINE);
    }

    #[test]
    fn test_task_id_is_transparent() {
        let json = serde_json::to_string(&TaskId(7)).unwrap();
        assert_eq!(json, "7");
        let id: TaskId = serde_json::from_str("42").unwrap();
        assert_eq!(id, TaskId(42));
    }
}
