//! Work to do once when the process is asked to shut down.

use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Mutex, MutexGuard, PoisonError},
};

type Action = Box<dyn Fn() + Send + Sync>;
type PreCheck = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;
type Constructor = Box<dyn Fn() -> ShutdownHook + Send + Sync>;

pub struct ShutdownHook {
    name: String,
    pre_check: Option<PreCheck>,
    action: Action,
}

impl ShutdownHook {
    pub fn new(name: impl Into<String>, action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            pre_check: None,
            action: Box::new(action),
        }
    }

    /// The hook is skipped when `check` fails.
    pub fn with_pre_check(
        mut self,
        check: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.pre_check = Some(Box::new(check));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> bool {
        if let Some(check) = &self.pre_check {
            if let Err(e) = check() {
                tracing::info!("Shutdown hook {} skipped: {:#}", self.name, e);
                return false;
            }
        }

        match catch_unwind(AssertUnwindSafe(|| (self.action)())) {
            Ok(()) => {
                tracing::debug!("Shutdown hook {} done", self.name);
                true
            }
            Err(panic) => {
                tracing::error!(
                    "Shutdown hook {} panicked: {}",
                    self.name,
                    crate::panic_message(&panic)
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for ShutdownHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHook")
            .field("name", &self.name)
            .field("pre_check", &self.pre_check.is_some())
            .finish()
    }
}

/// Hooks known by name, built on demand.
#[derive(Default)]
pub struct HookTable {
    constructors: BTreeMap<String, Constructor>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        name: impl Into<String>,
        constructor: impl Fn() -> ShutdownHook + Send + Sync + 'static,
    ) -> Self {
        self.constructors.insert(name.into(), Box::new(constructor));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn build(&self) -> Vec<ShutdownHook> {
        self.constructors.values().map(|c| c()).collect()
    }

    pub fn build_named(&self, names: &[&str]) -> anyhow::Result<Vec<ShutdownHook>> {
        names
            .iter()
            .map(|name| {
                self.constructors
                    .get(*name)
                    .map(|c| c())
                    .ok_or_else(|| anyhow::anyhow!("Unknown shutdown hook {}", name))
            })
            .collect()
    }
}

/// The set of hooks currently installed. Installing replaces the previous
/// set, running consumes it.
#[derive(Default)]
pub struct ShutdownHooks {
    installed: Mutex<Option<Vec<ShutdownHook>>>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    fn installed(&self) -> MutexGuard<'_, Option<Vec<ShutdownHook>>> {
        self.installed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn install(&self, hooks: Vec<ShutdownHook>) {
        let mut installed = self.installed();
        if installed.take().is_some() {
            tracing::debug!("Previously installed shutdown hooks removed");
        }
        tracing::info!("{} shutdown hooks installed", hooks.len());
        *installed = Some(hooks);
    }

    pub fn install_from(&self, table: &HookTable) {
        self.install(table.build());
    }

    /// `false` when nothing was installed.
    pub fn remove(&self) -> bool {
        self.installed().take().is_some()
    }

    pub fn is_installed(&self) -> bool {
        self.installed().is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.installed()
            .iter()
            .flatten()
            .map(|hook| hook.name.clone())
            .collect()
    }

    /// Runs the installed hooks in order and removes them. Returns how many
    /// of them ran successfully.
    pub fn run(&self) -> usize {
        let hooks = match self.installed().take() {
            Some(hooks) => hooks,
            None => return 0,
        };

        tracing::info!("Running {} shutdown hooks", hooks.len());
        hooks.iter().filter(|hook| hook.run()).count()
    }

    pub async fn run_on_ctrl_c(&self) -> anyhow::Result<usize> {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Interrupt received");
        Ok(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn counting(name: &str, counter: &Arc<AtomicUsize>) -> ShutdownHook {
        let counter = counter.clone();
        ShutdownHook::new(name, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn hooks_run_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let hooks = ShutdownHooks::new();
        hooks.install(vec![counting("a", &counter), counting("b", &counter)]);

        assert_eq!(hooks.run(), 2);
        assert_eq!(hooks.run(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(!hooks.is_installed());
    }

    #[test]
    fn install_replaces_previous_hooks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let hooks = ShutdownHooks::new();
        hooks.install(vec![counting("old", &counter)]);
        hooks.install(vec![counting("new", &counter)]);

        assert_eq!(hooks.names(), vec!["new".to_string()]);
        assert_eq!(hooks.run(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let hooks = ShutdownHooks::new();
        assert!(!hooks.remove());

        hooks.install(Vec::new());
        assert!(hooks.remove());
        assert!(!hooks.remove());
    }

    #[test]
    fn failing_pre_check_and_panics_are_contained() {
        let counter = Arc::new(AtomicUsize::new(0));
        let hooks = ShutdownHooks::new();
        hooks.install(vec![
            counting("skipped", &counter).with_pre_check(|| anyhow::bail!("not needed")),
            ShutdownHook::new("panics", || panic!("boom")),
            counting("last", &counter),
        ]);

        assert_eq!(hooks.run(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn table_builds_by_name() {
        let table = HookTable::new()
            .register("flush", || ShutdownHook::new("flush", || {}))
            .register("close", || ShutdownHook::new("close", || {}));

        assert_eq!(table.names(), vec!["close", "flush"]);
        assert_eq!(table.build_named(&["flush"]).unwrap()[0].name(), "flush");
        assert!(table.build_named(&["missing"]).is_err());

        let hooks = ShutdownHooks::new();
        hooks.install_from(&table);
        assert_eq!(hooks.names().len(), 2);
    }
}
