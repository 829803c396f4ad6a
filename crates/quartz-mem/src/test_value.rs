//! Named test-value hooks.
//!
//! A hook is a closure registered under a call-site name. When the registry
//! is enabled, code at that call site passes a mutable flag through
//! [`adjust`]; a registered hook may flip it to steer the call down a
//! failure path. Production builds leave the registry disabled, which makes
//! [`adjust`] a single relaxed atomic load.
//!
//! This is a test facility: backends use it to simulate refusal without
//! exhausting real memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

use parking_lot::RwLock;

type Hook = Box<dyn Fn(&mut bool) + Send + Sync>;

static ENABLED: AtomicBool = AtomicBool::new(false);
static HOOKS: LazyLock<RwLock<HashMap<String, Hook>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Enables hook dispatch process-wide.
pub fn enable() {
    ENABLED.store(true, Ordering::Release);
}

/// Disables hook dispatch. Registered hooks stay in place.
pub fn disable() {
    ENABLED.store(false, Ordering::Release);
}

/// Registers `hook` under `name`, replacing any previous registration.
pub fn set(name: &str, hook: impl Fn(&mut bool) + Send + Sync + 'static) {
    HOOKS.write().insert(name.to_string(), Box::new(hook));
}

/// Removes the hook registered under `name`, if any.
pub fn clear(name: &str) {
    HOOKS.write().remove(name);
}

/// Fires the hook registered under `name` with `value`, if dispatch is
/// enabled and a hook exists.
pub fn adjust(name: &str, value: &mut bool) {
    if !ENABLED.load(Ordering::Acquire) {
        return;
    }
    if let Some(hook) = HOOKS.read().get(name) {
        hook(value);
    }
}
