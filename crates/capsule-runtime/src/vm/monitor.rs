//! Reentrant monitors
//!
//! Confined code locks through its task's own [`MonitorTable`], so two
//! tasks naming the same unit or string never contend. Trusted host code
//! uses the process-wide table.

use crate::task::group::{ThreadControl, Wake};
use crate::value::{kinds, Fault, Value};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Identity of a lockable value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MonitorKey {
    Unit(Arc<str>),
    Str(Arc<str>),
    Ref(usize),
}

impl MonitorKey {
    pub fn from_value(value: &Value) -> Result<Self, Fault> {
        match value {
            Value::Unit(name) => Ok(MonitorKey::Unit(name.clone())),
            Value::Str(s) => Ok(MonitorKey::Str(s.clone())),
            Value::List(list) => Ok(MonitorKey::Ref(Arc::as_ptr(list) as *const u8 as usize)),
            Value::Fault(fault) => Ok(MonitorKey::Ref(Arc::as_ptr(fault) as *const u8 as usize)),
            Value::Null => Err(Fault::new(kinds::NULL, "cannot lock null")),
            other => Err(Fault::type_error("lockable value", other)),
        }
    }
}

#[derive(Debug)]
struct Owner {
    thread: u64,
    count: u32,
}

#[derive(Debug, Default)]
pub struct MonitorTable {
    owners: Mutex<HashMap<MonitorKey, Owner>>,
    released: Condvar,
}

impl MonitorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table shared by all trusted code in the process
    pub fn global() -> &'static MonitorTable {
        static GLOBAL: OnceLock<MonitorTable> = OnceLock::new();
        GLOBAL.get_or_init(MonitorTable::new)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MonitorKey, Owner>> {
        self.owners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire `key` for the controlled thread, waiting as long as needed
    ///
    /// Only a stop request ends the wait early; interrupts stay pending.
    pub fn enter(&self, key: &MonitorKey, control: &ThreadControl) -> Result<(), Wake> {
        let mut owners = self.lock();
        loop {
            match owners.get_mut(key) {
                None => {
                    owners.insert(
                        key.clone(),
                        Owner {
                            thread: control.id(),
                            count: 1,
                        },
                    );
                    return Ok(());
                }
                Some(owner) if owner.thread == control.id() => {
                    owner.count += 1;
                    return Ok(());
                }
                Some(_) => {
                    if control.should_stop() {
                        return Err(Wake::Stopped);
                    }
                    owners = self
                        .released
                        .wait_timeout(owners, WAIT_SLICE)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
    }

    /// Release one hold; false when `thread` does not own `key`
    pub fn exit(&self, key: &MonitorKey, thread: u64) -> bool {
        let mut owners = self.lock();
        match owners.get_mut(key) {
            Some(owner) if owner.thread == thread => {
                owner.count -= 1;
                if owner.count == 0 {
                    owners.remove(key);
                    self.released.notify_all();
                }
                true
            }
            _ => false,
        }
    }

    pub fn holder(&self, key: &MonitorKey) -> Option<u64> {
        self.lock().get(key).map(|o| o.thread)
    }
}
