use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::job::TaskCallback;

/// What a handler advertises to its job server for one task.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Advertisement {
    pub task: String,
    /// Seconds the server should wait before considering the job lost.
    pub timeout: Option<u32>,
}

#[derive(Clone)]
struct Ability {
    callback: TaskCallback,
    timeout: Option<u32>,
}

/// Registered task callbacks keyed by task name.
#[derive(Clone, Default)]
pub struct AbilityTable {
    entries: BTreeMap<String, Ability>,
}

impl AbilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any existing registration under the same name.
    pub fn insert(&mut self, task: impl Into<String>, callback: TaskCallback, timeout: Option<u32>) {
        self.entries
            .insert(task.into(), Ability { callback, timeout });
    }

    pub fn remove(&mut self, task: &str) -> bool {
        self.entries.remove(task).is_some()
    }

    pub fn contains(&self, task: &str) -> bool {
        self.entries.contains_key(task)
    }

    pub fn callback(&self, task: &str) -> Option<TaskCallback> {
        self.entries
            .get(task)
            .map(|ability| Arc::clone(&ability.callback))
    }

    pub fn task_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn advertisements(&self) -> Vec<Advertisement> {
        self.entries
            .iter()
            .map(|(task, ability)| Advertisement {
                task: task.clone(),
                timeout: ability.timeout,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for AbilityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.advertisements()).finish()
    }
}
