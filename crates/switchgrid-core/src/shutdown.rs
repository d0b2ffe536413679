//! Explicit shutdown hook list. Components register a named async hook at
//! construction time; the binary runs them once, in reverse registration
//! order, when the process is asked to exit.

use futures::future::BoxFuture;
use std::sync::Mutex;

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Ordered list of one-shot shutdown hooks.
#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Mutex<Vec<(String, Hook)>>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook. Hooks run in reverse registration order, so leaf
    /// components should register before the things that own them.
    pub fn register<F, Fut>(&self, name: &str, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        hooks.push((name.to_string(), Box::new(move || Box::pin(hook()))));
    }

    /// Run all registered hooks once. Subsequent calls are no-ops.
    pub async fn run(&self) {
        let drained: Vec<(String, Hook)> = {
            let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
            hooks.drain(..).collect()
        };
        for (name, hook) in drained.into_iter().rev() {
            tracing::info!("🔻 Shutting down: {name}");
            hook().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_hooks_run_once_in_reverse_order() {
        let hooks = ShutdownHooks::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        hooks.register("store", move || async move {
            o.lock().unwrap().push("store");
        });
        let o = order.clone();
        hooks.register("gateway", move || async move {
            o.lock().unwrap().push("gateway");
        });

        hooks.run().await;
        assert_eq!(*order.lock().unwrap(), vec!["gateway", "store"]);

        // Second run must be a no-op
        hooks.run().await;
        assert_eq!(order.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_hooks() {
        let hooks = ShutdownHooks::new();
        hooks.run().await;
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        hooks.register("late", move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        hooks.run().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
