//! Per-container callbacks.
//!
//! Observers fire synchronously inside the mutating call, after the structural
//! change is committed and before the owner is notified.

use crate::value::{DictKey, WireValue};

/// Callbacks a container can register. Every method defaults to a no-op.
pub trait ContainerObserver: Send + Sync {
    /// A leaf value was set, or a whole container was assigned.
    fn on_set_value(&self, _old: Option<&WireValue>, _new: &WireValue) {}

    /// A value was appended to a list.
    fn on_add_elem(&self, _index: usize, _value: &WireValue) {}

    /// A value was inserted into a list.
    fn on_insert_item(&self, _index: usize, _value: &WireValue) {}

    /// A list element or dictionary entry was removed. List indices are
    /// reported as [`DictKey::Int`].
    fn on_remove_elem(&self, _key: &DictKey, _old: &WireValue) {}

    /// A dictionary entry was written, or a list slot replaced.
    fn on_update_pair(&self, _key: &DictKey, _old: Option<&WireValue>, _new: &WireValue) {}

    fn on_clear(&self) {}
}

type SetValueFn = Box<dyn Fn(Option<&WireValue>, &WireValue) + Send + Sync>;
type IndexedFn = Box<dyn Fn(usize, &WireValue) + Send + Sync>;
type RemoveFn = Box<dyn Fn(&DictKey, &WireValue) + Send + Sync>;
type UpdatePairFn = Box<dyn Fn(&DictKey, Option<&WireValue>, &WireValue) + Send + Sync>;
type ClearFn = Box<dyn Fn() + Send + Sync>;

/// Closure-backed observer for call sites that only care about a few events.
///
/// ```rust
/// use mesh_core::property::CallbackObserver;
///
/// let observer = CallbackObserver::new()
///     .on_add_elem(|index, value| println!("added {value:?} at {index}"))
///     .on_clear(|| println!("cleared"));
/// ```
#[derive(Default)]
pub struct CallbackObserver {
    set_value: Option<SetValueFn>,
    add_elem: Option<IndexedFn>,
    insert_item: Option<IndexedFn>,
    remove_elem: Option<RemoveFn>,
    update_pair: Option<UpdatePairFn>,
    clear: Option<ClearFn>,
}

impl CallbackObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_set_value(mut self, f: impl Fn(Option<&WireValue>, &WireValue) + Send + Sync + 'static) -> Self {
        self.set_value = Some(Box::new(f));
        self
    }

    pub fn on_add_elem(mut self, f: impl Fn(usize, &WireValue) + Send + Sync + 'static) -> Self {
        self.add_elem = Some(Box::new(f));
        self
    }

    pub fn on_insert_item(mut self, f: impl Fn(usize, &WireValue) + Send + Sync + 'static) -> Self {
        self.insert_item = Some(Box::new(f));
        self
    }

    pub fn on_remove_elem(mut self, f: impl Fn(&DictKey, &WireValue) + Send + Sync + 'static) -> Self {
        self.remove_elem = Some(Box::new(f));
        self
    }

    pub fn on_update_pair(
        mut self,
        f: impl Fn(&DictKey, Option<&WireValue>, &WireValue) + Send + Sync + 'static,
    ) -> Self {
        self.update_pair = Some(Box::new(f));
        self
    }

    pub fn on_clear(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.clear = Some(Box::new(f));
        self
    }
}

impl ContainerObserver for CallbackObserver {
    fn on_set_value(&self, old: Option<&WireValue>, new: &WireValue) {
        if let Some(f) = &self.set_value {
            f(old, new);
        }
    }

    fn on_add_elem(&self, index: usize, value: &WireValue) {
        if let Some(f) = &self.add_elem {
            f(index, value);
        }
    }

    fn on_insert_item(&self, index: usize, value: &WireValue) {
        if let Some(f) = &self.insert_item {
            f(index, value);
        }
    }

    fn on_remove_elem(&self, key: &DictKey, old: &WireValue) {
        if let Some(f) = &self.remove_elem {
            f(key, old);
        }
    }

    fn on_update_pair(&self, key: &DictKey, old: Option<&WireValue>, new: &WireValue) {
        if let Some(f) = &self.update_pair {
            f(key, old, new);
        }
    }

    fn on_clear(&self) {
        if let Some(f) = &self.clear {
            f();
        }
    }
}
