//! Thread groups and per-thread control flags
//!
//! Every thread that runs task code is spawned through a [`ThreadGroup`],
//! which records it, attaches its CPU clock and sets the thread-local
//! group identity the hooks dispatch on. Threads are never killed from the
//! outside; they observe the flags on their [`ThreadControl`] instead.

use super::cpu::CpuClock;
use serde::Serialize;
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

static NEXT_GROUP: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

/// Longest single park while sleeping, so stop requests are seen promptly
const PARK_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GroupId(u64);

impl GroupId {
    fn next() -> Self {
        GroupId(NEXT_GROUP.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<(GroupId, Arc<ThreadControl>)>> = const { RefCell::new(None) };
}

/// Group of the calling thread, if it was spawned through a group
pub fn current_group() -> Option<GroupId> {
    CURRENT.with(|c| c.borrow().as_ref().map(|(id, _)| *id))
}

/// Control block of the calling thread
pub fn current_control() -> Option<Arc<ThreadControl>> {
    CURRENT.with(|c| c.borrow().as_ref().map(|(_, control)| control.clone()))
}

/// Why a blocking wait ended early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Interrupted,
    Stopped,
}

/// Flags one confined thread observes
#[derive(Debug)]
pub struct ThreadControl {
    id: u64,
    name: String,
    group: GroupId,
    interrupted: AtomicBool,
    stop: AtomicBool,
    low_priority: AtomicBool,
    finished: AtomicBool,
    thread: OnceLock<Thread>,
}

impl ThreadControl {
    fn new(name: &str, group: GroupId) -> Self {
        Self {
            id: NEXT_THREAD.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            group,
            interrupted: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            low_priority: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            thread: OnceLock::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    fn unpark(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    /// Wake the thread out of any blocking wait
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.unpark();
    }

    /// Consume a pending interrupt
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Ask the thread to abort at its next instruction; not catchable
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.unpark();
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Drop to minimum priority: the interpreter yields on every instruction
    pub fn lower_priority(&self) {
        self.low_priority.store(true, Ordering::Relaxed);
    }

    pub fn is_low_priority(&self) -> bool {
        self.low_priority.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Stop or interrupt check for blocking natives
    pub fn checkpoint(&self) -> Result<(), Wake> {
        if self.should_stop() {
            return Err(Wake::Stopped);
        }
        if self.take_interrupt() {
            return Err(Wake::Interrupted);
        }
        Ok(())
    }

    /// Sleep on the calling thread, which must be the controlled one
    pub fn sleep(&self, duration: Duration) -> Result<(), Wake> {
        let deadline = Instant::now().checked_add(duration);
        loop {
            self.checkpoint()?;
            let left = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => PARK_SLICE,
            };
            if left.is_zero() {
                return Ok(());
            }
            thread::park_timeout(left.min(PARK_SLICE));
        }
    }
}

struct Member {
    control: Arc<ThreadControl>,
    clock: Option<CpuClock>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct GroupState {
    members: Vec<Member>,
    retired_cpu: Duration,
    destroyed: bool,
}

/// Set of OS threads belonging to one task
pub struct ThreadGroup {
    id: GroupId,
    name: String,
    state: Mutex<GroupState>,
    changed: Condvar,
}

impl fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("active", &self.active_count())
            .finish()
    }
}

impl ThreadGroup {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: GroupId::next(),
            name: name.into(),
            state: Mutex::new(GroupState::default()),
            changed: Condvar::new(),
        })
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a thread in this group
    ///
    /// The body receives the thread's control block. Panics inside the body
    /// are contained; the thread is retired either way.
    pub fn spawn<F>(self: &Arc<Self>, name: &str, body: F) -> io::Result<Arc<ThreadControl>>
    where
        F: FnOnce(Arc<ThreadControl>) + Send + 'static,
    {
        let mut state = self.lock();
        if state.destroyed {
            return Err(io::Error::other(format!("{} is destroyed", self.id)));
        }

        let control = Arc::new(ThreadControl::new(name, self.id));
        let group = Arc::clone(self);
        let thread_control = Arc::clone(&control);
        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.name, name))
            .spawn(move || {
                CURRENT.with(|c| *c.borrow_mut() = Some((group.id, thread_control.clone())));
                group.attach_clock(&thread_control);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(thread_control.clone())));
                if outcome.is_err() {
                    tracing::warn!(group = %group.id, thread = thread_control.name(), "confined thread panicked");
                }
                group.retire(&thread_control);
            })?;

        let _ = control.thread.set(handle.thread().clone());
        state.members.push(Member {
            control: Arc::clone(&control),
            clock: None,
            handle: Some(handle),
        });
        Ok(control)
    }

    fn attach_clock(&self, control: &ThreadControl) {
        let mut state = self.lock();
        if let Some(member) = state.members.iter_mut().find(|m| m.control.id == control.id) {
            member.clock = CpuClock::current();
        }
    }

    fn retire(&self, control: &ThreadControl) {
        let mut state = self.lock();
        let spent = state
            .members
            .iter_mut()
            .find(|m| m.control.id == control.id)
            .and_then(|m| m.clock.take())
            .map(|clock| clock.elapsed())
            .unwrap_or_default();
        state.retired_cpu += spent;
        control.finished.store(true, Ordering::SeqCst);
        self.changed.notify_all();
    }

    /// Total CPU time of live and retired threads
    pub fn cpu_time(&self) -> Duration {
        let state = self.lock();
        state.retired_cpu
            + state
                .members
                .iter()
                .filter_map(|m| m.clock.as_ref())
                .map(|clock| clock.elapsed())
                .sum::<Duration>()
    }

    /// Control blocks of threads that have not finished
    pub fn live_controls(&self) -> Vec<Arc<ThreadControl>> {
        self.lock()
            .members
            .iter()
            .filter(|m| !m.control.is_finished())
            .map(|m| Arc::clone(&m.control))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .members
            .iter()
            .filter(|m| !m.control.is_finished())
            .count()
    }

    /// Wait until every thread has finished; false on timeout
    pub fn join_all(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| {
                s.members.iter().any(|m| !m.control.is_finished())
            })
            .unwrap_or_else(|e| e.into_inner());
        state.members.iter().all(|m| m.control.is_finished())
    }

    /// Refuse new threads and reap finished ones; returns the live count
    pub fn destroy(&self) -> usize {
        let mut state = self.lock();
        state.destroyed = true;
        let mut live = 0;
        for member in &mut state.members {
            if member.control.is_finished() {
                if let Some(handle) = member.handle.take() {
                    let _ = handle.join();
                }
            } else {
                live += 1;
            }
        }
        live
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_spawned_thread_sees_its_group() {
        let group = ThreadGroup::new("t");
        let (tx, rx) = mpsc::channel();
        group
            .spawn("worker", move |control| {
                tx.send((current_group(), control.id())).unwrap();
            })
            .unwrap();

        let (seen, _) = rx.recv().unwrap();
        assert_eq!(seen, Some(group.id()));
        assert!(group.join_all(Duration::from_secs(5)));
        assert_eq!(current_group(), None);
    }

    #[test]
    fn test_stop_wakes_sleeper() {
        let group = ThreadGroup::new("t");
        let (tx, rx) = mpsc::channel();
        let control = group
            .spawn("sleeper", move |control| {
                tx.send(control.sleep(Duration::from_secs(30))).unwrap();
            })
            .unwrap();

        control.request_stop();
        assert_eq!(rx.recv().unwrap(), Err(Wake::Stopped));
        assert!(group.join_all(Duration::from_secs(5)));
    }

    #[test]
    fn test_interrupt_wakes_sleeper() {
        let group = ThreadGroup::new("t");
        let (tx, rx) = mpsc::channel();
        let control = group
            .spawn("sleeper", move |control| {
                tx.send(control.sleep(Duration::from_secs(30))).unwrap();
            })
            .unwrap();

        control.interrupt();
        assert_eq!(rx.recv().unwrap(), Err(Wake::Interrupted));
        assert!(group.join_all(Duration::from_secs(5)));
    }

    #[test]
    fn test_panic_is_contained_and_retired() {
        let group = ThreadGroup::new("t");
        group.spawn("boom", |_| panic!("boom")).unwrap();
        assert!(group.join_all(Duration::from_secs(5)));
        assert_eq!(group.active_count(), 0);
    }

    #[test]
    fn test_destroyed_group_refuses_threads() {
        let group = ThreadGroup::new("t");
        assert_eq!(group.destroy(), 0);
        assert!(group.spawn("late", |_| {}).is_err());
    }
}
