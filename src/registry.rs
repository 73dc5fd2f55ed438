//! Name-keyed table of task handlers

use crate::event::Event;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Result returned by task handlers
pub type TaskResult = anyhow::Result<()>;

/// A unit of work run for every event carrying its registered name
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process one event
    async fn run(&self, event: &Event) -> TaskResult;
}

/// Adapter turning a synchronous closure into a [`TaskHandler`]
pub struct FnTask<F> {
    f: F,
}

/// Wrap a closure `Fn(&Event) -> TaskResult` as a task handler
pub fn task_fn<F>(f: F) -> FnTask<F>
where
    F: Fn(&Event) -> TaskResult + Send + Sync,
{
    FnTask { f }
}

#[async_trait]
impl<F> TaskHandler for FnTask<F>
where
    F: Fn(&Event) -> TaskResult + Send + Sync,
{
    async fn run(&self, event: &Event) -> TaskResult {
        (self.f)(event)
    }
}

/// Registry of task handlers by event name
///
/// Populated before consumption starts, then shared read-only behind an
/// `Arc`, so lookups take no lock.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Returns false, keeping the existing handler, if
    /// the name is already taken.
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> bool
    where
        H: TaskHandler + 'static,
    {
        self.register_arc(name, Arc::new(handler))
    }

    /// Register an already shared handler
    pub fn register_arc(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> bool {
        match self.tasks.entry(name.into()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(handler);
                true
            }
        }
    }

    /// Remove a handler; returns whether one was registered
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tasks.remove(name).is_some()
    }

    /// Handler registered under `name`
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.tasks.get(name).cloned()
    }

    /// Whether a handler is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBuilder;

    #[tokio::test]
    async fn test_register_and_run() {
        let mut registry = TaskRegistry::new();
        assert!(registry.register("ok", task_fn(|_| Ok(()))));
        assert!(registry.contains("ok"));

        let handler = registry.get("ok").unwrap();
        handler.run(&EventBuilder::new("ok").build()).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_original() {
        let mut registry = TaskRegistry::new();
        assert!(registry.register("job", task_fn(|_| Ok(()))));
        assert!(!registry.register("job", task_fn(|_| anyhow::bail!("replacement"))));

        assert_eq!(registry.len(), 1);
        let handler = registry.get("job").unwrap();
        assert!(handler.run(&EventBuilder::new("job").build()).await.is_ok());
    }

    #[test]
    fn test_unregister() {
        let mut registry = TaskRegistry::new();
        registry.register("a", task_fn(|_| Ok(())));
        registry.register("b", task_fn(|_| Ok(())));

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert_eq!(registry.names(), vec!["b".to_string()]);
        assert!(!registry.is_empty());
    }
}
