//! Shared server state
//!
//! One `ServerState` exists per server, owned by the accept task and shared
//! with every connection task through `Rc<RefCell<...>>`. All tasks run on
//! a single-threaded `LocalSet`, so no lock is needed; the only contract is
//! that every registration has a matching removal, which the RAII guards
//! here enforce on all exit paths including panics and aborts unwinding
//! through drops.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::rc::Rc;

use tokio::task::AbortHandle;

pub type ConnId = u64;
pub type TaskId = u64;

/// Lifecycle phase of a connection, mirrored into the registry for the
/// shutdown orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    AwaitingRequestLine,
    ReadingHeaders,
    ReadingBody,
    Dispatched,
    WritingResponse,
    KeepAliveIdle,
    Closing,
}

/// Registry entry for an open connection
#[derive(Debug)]
pub struct ConnHandle {
    pub peer: SocketAddr,
    pub phase: ConnPhase,
    pub websocket: bool,
    pub abort: AbortHandle,
}

/// Counters and registries shared across all connection tasks
#[derive(Debug)]
pub struct ServerState {
    next_conn_id: ConnId,
    next_task_id: TaskId,
    pub connections: HashMap<ConnId, ConnHandle>,
    pub in_flight: HashSet<TaskId>,
    pub total_requests: u64,
    pub default_headers: Vec<(String, String)>,
}

pub type SharedState = Rc<RefCell<ServerState>>;

impl ServerState {
    pub fn new(default_headers: Vec<(String, String)>) -> SharedState {
        Rc::new(RefCell::new(Self {
            next_conn_id: 0,
            next_task_id: 0,
            connections: HashMap::new(),
            in_flight: HashSet::new(),
            total_requests: 0,
            default_headers,
        }))
    }

    pub fn allocate_conn_id(&mut self) -> ConnId {
        self.next_conn_id += 1;
        self.next_conn_id
    }

    pub fn register_connection(&mut self, id: ConnId, handle: ConnHandle) {
        self.connections.insert(id, handle);
    }

    pub fn set_phase(&mut self, id: ConnId, phase: ConnPhase) {
        if let Some(handle) = self.connections.get_mut(&id) {
            handle.phase = phase;
        }
    }

    pub fn set_websocket(&mut self, id: ConnId) {
        if let Some(handle) = self.connections.get_mut(&id) {
            handle.websocket = true;
        }
    }
}

/// Removes the connection from the registry when the task ends
pub struct ConnGuard {
    state: SharedState,
    id: ConnId,
}

impl ConnGuard {
    pub fn new(state: SharedState, id: ConnId) -> Self {
        Self { state, id }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.state.borrow_mut().connections.remove(&self.id);
    }
}

/// Claims an in-flight slot for a dispatched handler task and releases it
/// when the task finishes, however it finishes
pub struct TaskSlot {
    state: SharedState,
    id: TaskId,
}

impl TaskSlot {
    pub fn claim(state: SharedState) -> Self {
        let id = {
            let mut st = state.borrow_mut();
            st.next_task_id += 1;
            let id = st.next_task_id;
            st.in_flight.insert(id);
            id
        };
        Self { state, id }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.state.borrow_mut().in_flight.remove(&self.id);
    }
}
