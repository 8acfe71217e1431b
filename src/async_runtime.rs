// File: src/async_runtime.rs
//
// Task and channel primitives for Hemlock's async runtime.
// Each spawned task runs on its own OS thread with a fresh VM; channels are
// the only sanctioned cross-thread communication mechanism. Channel
// operations follow a mutex + condvar protocol with a dedicated rendezvous
// slot for unbuffered hand-offs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::value::{Closure, Value};
use crate::vm::{Output, Vm, VmError};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Ready,
    Running,
    Completed,
}

#[derive(Debug)]
pub struct TaskState {
    pub status: TaskStatus,
    pub result: Value,
    pub exception: Option<Value>,
    pub joined: bool,
    pub detached: bool,
    pub handle: Option<JoinHandle<()>>,
}

/// A spawned task. The closure runs on a dedicated worker thread; the result
/// or exception is stored back under the task mutex for `join`/`await`.
#[derive(Debug)]
pub struct Task {
    pub id: u64,
    pub state: Mutex<TaskState>,
}

impl Task {
    fn new() -> Self {
        Task {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TaskState {
                status: TaskStatus::Ready,
                result: Value::Null,
                exception: None,
                joined: false,
                detached: false,
                handle: None,
            }),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().unwrap().status
    }
}

/// Spawn a task running `closure` on its own thread. Arguments were already
/// deep-copied by the caller. The worker thread builds a fresh VM seeded
/// with a snapshot of the spawner's globals: bindings are private to the
/// task, heap values are shared through their reference counts.
pub fn spawn_task(
    closure: Arc<Closure>,
    args: Vec<Value>,
    output: Output,
    globals: Vec<(Arc<str>, Value, bool)>,
) -> Arc<Task> {
    let task = Arc::new(Task::new());
    let thread_task = Arc::clone(&task);
    let handle = std::thread::spawn(move || {
        {
            let mut state = thread_task.state.lock().unwrap();
            state.status = TaskStatus::Running;
        }
        let mut vm = Vm::with_output(output);
        vm.globals.install(globals);
        let outcome = vm.call_closure(&closure, args);
        let mut state = thread_task.state.lock().unwrap();
        match outcome {
            Ok(value) => state.result = value,
            Err(VmError::Exception(value)) => state.exception = Some(value),
            Err(VmError::Fatal(message)) => {
                state.exception = Some(Value::str(message));
            }
        }
        state.status = TaskStatus::Completed;
    });
    task.state.lock().unwrap().handle = Some(handle);
    task
}

/// Block until the task finishes. Re-throws a stored exception in the
/// caller's VM via the returned `VmError`.
pub fn join_task(task: &Arc<Task>) -> Result<Value, VmError> {
    let handle = {
        let mut state = task.state.lock().unwrap();
        if state.detached {
            return Err(VmError::exception("Cannot join detached task"));
        }
        if state.joined {
            return Err(VmError::exception("Task already joined"));
        }
        state.joined = true;
        state.handle.take()
    };
    if let Some(handle) = handle {
        if handle.join().is_err() {
            return Err(VmError::Fatal("Task thread panicked".to_string()));
        }
    }
    let mut state = task.state.lock().unwrap();
    if let Some(exception) = state.exception.take() {
        return Err(VmError::Exception(exception));
    }
    Ok(state.result.clone())
}

/// Release the join capability. The thread keeps running; its result and any
/// exception are discarded.
pub fn detach_task(task: &Arc<Task>) -> Result<(), VmError> {
    let mut state = task.state.lock().unwrap();
    if state.joined {
        return Err(VmError::exception("Cannot detach joined task"));
    }
    if state.detached {
        return Err(VmError::exception("Task already detached"));
    }
    state.detached = true;
    // Dropping the handle detaches the OS thread.
    state.handle.take();
    Ok(())
}

#[derive(Debug)]
struct ChannelState {
    buffer: VecDeque<Value>,
    closed: bool,
    /// Rendezvous slot for capacity-0 channels.
    slot: Option<Value>,
    sender_waiting: bool,
    /// A single waiter flag cannot count multiple parked receivers, so
    /// wakeups are sent unconditionally; the flag is diagnostic state.
    #[allow(dead_code)]
    receiver_waiting: bool,
}

/// FIFO channel. Capacity 0 means unbuffered: the sender parks until a
/// receiver takes the value out of the rendezvous slot.
#[derive(Debug)]
pub struct Channel {
    capacity: usize,
    state: Mutex<ChannelState>,
    not_empty: Condvar,
    not_full: Condvar,
    rendezvous: Condvar,
}

impl Channel {
    pub fn new(capacity: usize) -> Self {
        Channel {
            capacity,
            state: Mutex::new(ChannelState {
                buffer: VecDeque::new(),
                closed: false,
                slot: None,
                sender_waiting: false,
                receiver_waiting: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            rendezvous: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn send(&self, value: Value) -> Result<(), VmError> {
        if self.capacity == 0 {
            return self.send_rendezvous(value);
        }
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(VmError::exception("Cannot send on closed channel"));
            }
            if state.buffer.len() < self.capacity {
                break;
            }
            state = self.not_full.wait(state).unwrap();
        }
        state.buffer.push_back(value);
        self.not_empty.notify_one();
        Ok(())
    }

    fn send_rendezvous(&self, value: Value) -> Result<(), VmError> {
        let mut state = self.state.lock().unwrap();
        // Wait for the slot to be free in case another sender is mid-handoff.
        loop {
            if state.closed {
                return Err(VmError::exception("Cannot send on closed channel"));
            }
            if !state.sender_waiting && state.slot.is_none() {
                break;
            }
            state = self.not_full.wait(state).unwrap();
        }
        state.slot = Some(value);
        state.sender_waiting = true;
        self.not_empty.notify_one();
        while state.sender_waiting {
            if state.closed {
                // No receiver will ever take the value.
                state.slot = None;
                state.sender_waiting = false;
                self.not_full.notify_one();
                return Err(VmError::exception("Cannot send on closed channel"));
            }
            state = self.rendezvous.wait(state).unwrap();
        }
        self.not_full.notify_one();
        Ok(())
    }

    /// Blocking receive. Returns `Null` once the channel is closed and
    /// drained.
    pub fn recv(&self) -> Value {
        let mut state = self.state.lock().unwrap();
        loop {
            if self.capacity == 0 {
                if state.sender_waiting {
                    if let Some(value) = state.slot.take() {
                        state.sender_waiting = false;
                        self.rendezvous.notify_all();
                        return value;
                    }
                }
            } else if let Some(value) = state.buffer.pop_front() {
                self.not_full.notify_one();
                return value;
            }
            if state.closed {
                return Value::Null;
            }
            state.receiver_waiting = true;
            state = self.not_empty.wait(state).unwrap();
            state.receiver_waiting = false;
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.rendezvous.notify_all();
    }

    /// Non-blocking readiness probe used by `select`.
    pub fn is_ready(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.closed
            || !state.buffer.is_empty()
            || (state.sender_waiting && state.slot.is_some())
    }
}

/// Poll the given channels until one is ready, receiving its value. Returns
/// `None` on timeout.
pub fn select_channels(
    channels: &[Arc<Channel>],
    timeout_ms: Option<u64>,
) -> Option<(Arc<Channel>, Value)> {
    let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
    loop {
        for channel in channels {
            if channel.is_ready() {
                let value = channel.recv();
                return Some((Arc::clone(channel), value));
            }
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return None;
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::values_equal;

    #[test]
    fn buffered_channel_preserves_fifo_order() {
        let ch = Channel::new(3);
        ch.send(Value::I32(1)).unwrap();
        ch.send(Value::I32(2)).unwrap();
        ch.send(Value::I32(3)).unwrap();
        assert!(values_equal(&ch.recv(), &Value::I32(1)));
        assert!(values_equal(&ch.recv(), &Value::I32(2)));
        assert!(values_equal(&ch.recv(), &Value::I32(3)));
    }

    #[test]
    fn recv_on_drained_closed_channel_returns_null() {
        let ch = Channel::new(2);
        ch.send(Value::I32(7)).unwrap();
        ch.close();
        assert!(values_equal(&ch.recv(), &Value::I32(7)));
        assert!(ch.recv().is_null());
    }

    #[test]
    fn send_on_closed_channel_errors() {
        let ch = Channel::new(1);
        ch.close();
        assert!(ch.send(Value::I32(1)).is_err());
    }

    #[test]
    fn rendezvous_hands_value_to_receiver() {
        let ch = Arc::new(Channel::new(0));
        let sender = Arc::clone(&ch);
        let handle = std::thread::spawn(move || {
            sender.send(Value::I32(42)).unwrap();
        });
        assert!(values_equal(&ch.recv(), &Value::I32(42)));
        handle.join().unwrap();
    }

    #[test]
    fn rendezvous_sender_blocks_until_received() {
        let ch = Arc::new(Channel::new(0));
        let sender = Arc::clone(&ch);
        let handle = std::thread::spawn(move || {
            sender.send(Value::I32(1)).unwrap();
            // Only reachable after the receiver took the value.
            sender.is_ready()
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(ch.is_ready());
        assert!(values_equal(&ch.recv(), &Value::I32(1)));
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn select_returns_first_ready_channel() {
        let a = Arc::new(Channel::new(1));
        let b = Arc::new(Channel::new(1));
        b.send(Value::I32(9)).unwrap();
        let (ready, value) = select_channels(&[a, Arc::clone(&b)], Some(100)).unwrap();
        assert!(Arc::ptr_eq(&ready, &b));
        assert!(values_equal(&value, &Value::I32(9)));
    }

    #[test]
    fn select_times_out_with_none() {
        let a = Arc::new(Channel::new(1));
        assert!(select_channels(&[a], Some(10)).is_none());
    }
}
