//! Per-run state and its binding to the worker thread.
//!
//! Everything that needs a context takes it as a parameter. The thread-local
//! binding exists only for the runtime hooks that instrumented code calls
//! without one, and it lives exactly as long as [`SandboxRuntimeContext::use_context`].

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::config::SandboxConfiguration;
use crate::costing::CostAccounter;
use crate::loader::SandboxClassLoader;

/// First identity hash handed out inside a context is this plus one.
pub const HASH_CODE_SEED: i32 = 0xfed_c0de;

/// Classes whose static state must be rebuilt before every run.
///
/// Shared by every context created from one configuration lineage; classes
/// register themselves from their sandboxed `<clinit>`.
#[derive(Debug, Default)]
pub struct ClassResetter {
    classes: Mutex<Vec<String>>,
}

impl ClassResetter {
    pub fn register(&self, class_name: &str) {
        let mut classes = self
            .classes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !classes.iter().any(|registered| registered == class_name) {
            trace!(class = class_name, "registered for reset");
            classes.push(class_name.to_string());
        }
    }

    /// Registered classes in registration order.
    pub fn registered(&self) -> Vec<String> {
        self.classes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<SandboxRuntimeContext>>> = const { RefCell::new(None) };
}

/// Isolated state of one run.
#[derive(Debug)]
pub struct SandboxRuntimeContext {
    configuration: Arc<SandboxConfiguration>,
    class_loader: SandboxClassLoader,
    accounter: CostAccounter,
    thread_name: String,
    hash_codes: RefCell<HashMap<u64, i32>>,
    next_hash_code: Cell<i32>,
    strings: RefCell<HashSet<Rc<str>>>,
}

impl SandboxRuntimeContext {
    pub fn new(configuration: Arc<SandboxConfiguration>, thread_name: &str) -> Self {
        let accounter = CostAccounter::new(
            &configuration.execution_profile,
            thread_name,
            &configuration.filtered_threads,
        );
        Self {
            class_loader: SandboxClassLoader::new(configuration.clone()),
            configuration,
            accounter,
            thread_name: thread_name.to_string(),
            hash_codes: RefCell::new(HashMap::new()),
            next_hash_code: Cell::new(HASH_CODE_SEED),
            strings: RefCell::new(HashSet::new()),
        }
    }

    pub fn configuration(&self) -> &Arc<SandboxConfiguration> {
        &self.configuration
    }

    pub fn class_loader(&self) -> &SandboxClassLoader {
        &self.class_loader
    }

    pub fn accounter(&self) -> &CostAccounter {
        &self.accounter
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Deterministic replacement for the host identity hash. The same
    /// identity always gets the same code within this context, and codes
    /// are handed out in request order.
    pub fn identity_hash_code(&self, identity: u64) -> i32 {
        *self
            .hash_codes
            .borrow_mut()
            .entry(identity)
            .or_insert_with(|| {
                let next = self.next_hash_code.get().wrapping_add(1);
                self.next_hash_code.set(next);
                next
            })
    }

    /// Canonical instance of a string inside this context.
    pub fn intern(&self, value: &str) -> Rc<str> {
        let mut strings = self.strings.borrow_mut();
        if let Some(existing) = strings.get(value) {
            return existing.clone();
        }
        let interned: Rc<str> = Rc::from(value);
        strings.insert(interned.clone());
        interned
    }

    /// Bind `context` to this thread while `task` runs. The previous
    /// binding is restored afterwards, also when `task` panics.
    pub fn use_context<R>(context: Rc<SandboxRuntimeContext>, task: impl FnOnce(&SandboxRuntimeContext) -> R) -> R {
        struct Restore(Option<Rc<SandboxRuntimeContext>>);

        impl Drop for Restore {
            fn drop(&mut self) {
                let previous = self.0.take();
                CURRENT.with(|current| *current.borrow_mut() = previous);
            }
        }

        debug!(thread = %context.thread_name, "entering runtime context");
        let previous = CURRENT.with(|current| current.borrow_mut().replace(context.clone()));
        let _restore = Restore(previous);
        task(&context)
    }

    /// Run `task` against the context bound to this thread, if any.
    pub fn with_current<R>(task: impl FnOnce(&SandboxRuntimeContext) -> R) -> Option<R> {
        let context = CURRENT.with(|current| current.borrow().clone());
        context.map(|context| task(&context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Rc<SandboxRuntimeContext> {
        let configuration = Arc::new(SandboxConfiguration::builder().build());
        Rc::new(SandboxRuntimeContext::new(configuration, "djvm-test"))
    }

    #[test]
    fn hash_codes_are_stable_and_start_after_the_seed() {
        let context = context();

        let first = context.identity_hash_code(41);
        let second = context.identity_hash_code(7);

        assert_eq!(first, 0xfed_c0de + 1);
        assert_eq!(second, 0xfed_c0de + 2);
        assert_eq!(context.identity_hash_code(41), first);
    }

    #[test]
    fn fresh_contexts_hand_out_the_same_codes() {
        let first = context();
        let second = context();

        assert_eq!(first.identity_hash_code(99), second.identity_hash_code(12345));
    }

    #[test]
    fn interned_strings_are_shared() {
        let context = context();

        let first = context.intern("token");
        let second = context.intern("token");

        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn binding_is_scoped_and_nests() {
        assert!(SandboxRuntimeContext::with_current(|_| ()).is_none());
        let outer = context();
        let inner = Rc::new(SandboxRuntimeContext::new(outer.configuration().clone(), "djvm-inner"));

        SandboxRuntimeContext::use_context(outer, |_| {
            SandboxRuntimeContext::use_context(inner, |_| {
                let name = SandboxRuntimeContext::with_current(|current| current.thread_name().to_string());
                assert_eq!(name.as_deref(), Some("djvm-inner"));
            });
            let name = SandboxRuntimeContext::with_current(|current| current.thread_name().to_string());
            assert_eq!(name.as_deref(), Some("djvm-test"));
        });

        assert!(SandboxRuntimeContext::with_current(|_| ()).is_none());
    }

    #[test]
    fn resetter_keeps_registration_order_without_duplicates() {
        let resetter = ClassResetter::default();

        resetter.register("sandbox/com/example/B");
        resetter.register("sandbox/com/example/A");
        resetter.register("sandbox/com/example/B");

        assert_eq!(
            resetter.registered(),
            vec!["sandbox/com/example/B", "sandbox/com/example/A"]
        );
    }
}
