use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::console_log;
use crate::error::PipelineError;

pub type RequestId = u32;

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

static NEXT_REQUEST_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestKind {
    #[default]
    Get,
    Head,
}

struct HandleInner {
    id: RequestId,
    kind: RequestKind,
    state: AtomicU8,
}

/// Shared view of one outstanding request.
///
/// The state moves from pending to either completed or cancelled exactly
/// once; whichever transition wins is final. Clones observe the same
/// request and may be sent to other threads.
#[derive(Clone)]
pub struct RequestHandle {
    inner: Arc<HandleInner>,
}

impl RequestHandle {
    pub fn new(kind: RequestKind) -> Self {
        Self::with_state(kind, PENDING)
    }

    /// A handle for a request satisfied without any I/O.
    pub fn completed(kind: RequestKind) -> Self {
        Self::with_state(kind, COMPLETED)
    }

    fn with_state(kind: RequestKind, state: u8) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                state: AtomicU8::new(state),
            }),
        }
    }

    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    pub fn kind(&self) -> RequestKind {
        self.inner.kind
    }

    /// True once the request terminated, cancellation included.
    pub fn is_completed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != PENDING
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Suppress the completion callback. Returns false when the request had
    /// already terminated, in which case nothing changes.
    pub fn cancel(&self) -> bool {
        self.transition(CANCELLED)
    }

    pub(crate) fn try_complete(&self) -> bool {
        self.transition(COMPLETED)
    }

    fn transition(&self, to: u8) -> bool {
        self.inner
            .state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl PartialEq for RequestHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            PENDING => "pending",
            COMPLETED => "completed",
            _ => "cancelled",
        };
        f.debug_struct("RequestHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &state)
            .finish()
    }
}

/// Process-wide id -> handle map so a request can be cancelled by id from
/// any context.
#[derive(Default)]
pub struct RequestRegistry {
    handles: HashMap<RequestId, RequestHandle>,
}

impl RequestRegistry {
    pub fn register(&mut self, handle: &RequestHandle) {
        self.handles.insert(handle.id(), handle.clone());
    }

    pub fn cancel(&mut self, id: RequestId) -> bool {
        match self.handles.remove(&id) {
            Some(handle) => handle.cancel(),
            None => false,
        }
    }

    pub fn release(&mut self, id: RequestId) {
        self.handles.remove(&id);
    }

    pub fn get(&self, id: RequestId) -> Option<RequestHandle> {
        self.handles.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

lazy_static! {
    static ref GLOBAL_REQUEST_REGISTRY: Mutex<RequestRegistry> =
        Mutex::new(RequestRegistry::default());
}

pub fn register_request(handle: &RequestHandle) {
    GLOBAL_REQUEST_REGISTRY.lock().register(handle);
}

pub fn cancel_registered(id: RequestId) -> bool {
    GLOBAL_REQUEST_REGISTRY.lock().cancel(id)
}

pub fn release_request(id: RequestId) {
    GLOBAL_REQUEST_REGISTRY.lock().release(id);
}

pub fn registered_request(id: RequestId) -> Option<RequestHandle> {
    GLOBAL_REQUEST_REGISTRY.lock().get(id)
}

type Completion<T, C> = Box<dyn FnOnce(Result<T, PipelineError>, &mut C)>;

/// Issues async requests and hands their results back on the owner's loop.
///
/// The future returned by `issue` only forwards the result over a channel;
/// callbacks run inside `dispatch_completed`, with the owner borrowed
/// mutably, and only for requests that were not cancelled first.
pub struct RequestDispatcher<T, C> {
    sender: UnboundedSender<(RequestId, Result<T, PipelineError>)>,
    receiver: UnboundedReceiver<(RequestId, Result<T, PipelineError>)>,
    pending: HashMap<RequestId, (RequestHandle, Completion<T, C>)>,
}

impl<T: 'static, C> RequestDispatcher<T, C> {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            pending: HashMap::new(),
        }
    }

    /// Track `request`. The returned driver must be polled to completion by
    /// an executor (`spawn_local` on wasm).
    pub fn issue<F>(
        &mut self,
        kind: RequestKind,
        request: LocalBoxFuture<'static, Result<T, PipelineError>>,
        callback: F,
    ) -> (RequestHandle, LocalBoxFuture<'static, ()>)
    where
        F: FnOnce(Result<T, PipelineError>, &mut C) + 'static,
    {
        let handle = RequestHandle::new(kind);
        register_request(&handle);
        self.pending
            .insert(handle.id(), (handle.clone(), Box::new(callback)));

        let sender = self.sender.clone();
        let watched = handle.clone();
        let driver = async move {
            let result = request.await;
            if watched.is_cancelled() {
                return;
            }
            // the receiver only goes away with the dispatcher
            let _ = sender.unbounded_send((watched.id(), result));
        }
        .boxed_local();

        (handle, driver)
    }

    /// Run callbacks for every request that finished since the last call.
    /// Returns how many callbacks ran.
    pub fn dispatch_completed(&mut self, owner: &mut C) -> usize {
        let mut delivered = 0;
        while let Ok(Some((id, result))) = self.receiver.try_next() {
            let Some((handle, callback)) = self.pending.remove(&id) else {
                continue;
            };
            release_request(id);
            if handle.try_complete() {
                callback(result, owner);
                delivered += 1;
            }
        }
        self.prune_cancelled();
        delivered
    }

    /// Number of requests still waiting for delivery.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn prune_cancelled(&mut self) {
        let before = self.pending.len();
        self.pending.retain(|id, (handle, _)| {
            if handle.is_cancelled() {
                release_request(*id);
                false
            } else {
                true
            }
        });
        let pruned = before - self.pending.len();
        if pruned > 0 {
            console_log!("Dropped {} cancelled request(s)", pruned);
        }
    }
}

impl<T: 'static, C> Default for RequestDispatcher<T, C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::oneshot;
    use futures::executor::LocalPool;
    use futures::task::LocalSpawnExt;

    type Log = Vec<Result<u32, PipelineError>>;

    fn ready_request(value: u32) -> LocalBoxFuture<'static, Result<u32, PipelineError>> {
        async move { Ok(value) }.boxed_local()
    }

    fn gated_request() -> (
        oneshot::Sender<u32>,
        LocalBoxFuture<'static, Result<u32, PipelineError>>,
    ) {
        let (tx, rx) = oneshot::channel();
        let request = async move {
            rx.await.map_err(|_| PipelineError::Fetch {
                tile: "test".to_string(),
                reason: "sender dropped".to_string(),
            })
        }
        .boxed_local();
        (tx, request)
    }

    fn record(result: Result<u32, PipelineError>, log: &mut Log) {
        log.push(result);
    }

    #[test]
    fn completion_is_delivered_once_on_dispatch() {
        let mut pool = LocalPool::new();
        let mut dispatcher: RequestDispatcher<u32, Log> = RequestDispatcher::new();
        let mut log = Log::new();

        let (handle, driver) = dispatcher.issue(RequestKind::Get, ready_request(7), record);
        pool.spawner().spawn_local(driver).unwrap();
        pool.run_until_stalled();

        // nothing runs until the owner pumps
        assert!(log.is_empty());
        assert!(!handle.is_completed());

        assert_eq!(dispatcher.dispatch_completed(&mut log), 1);
        assert_eq!(dispatcher.dispatch_completed(&mut log), 0);
        assert_eq!(log, vec![Ok(7)]);
        assert!(handle.is_completed());
        assert!(!handle.is_cancelled());
        assert_eq!(handle.kind(), RequestKind::Get);
    }

    #[test]
    fn cancel_before_completion_suppresses_callback() {
        let mut pool = LocalPool::new();
        let mut dispatcher: RequestDispatcher<u32, Log> = RequestDispatcher::new();
        let mut log = Log::new();

        let (tx, request) = gated_request();
        let (handle, driver) = dispatcher.issue(RequestKind::Head, request, record);
        pool.spawner().spawn_local(driver).unwrap();
        pool.run_until_stalled();

        assert!(handle.cancel());
        assert!(handle.is_completed());
        let _ = tx.send(1);
        pool.run_until_stalled();

        assert_eq!(dispatcher.dispatch_completed(&mut log), 0);
        assert!(log.is_empty());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn cancel_after_result_arrived_but_before_dispatch_wins() {
        let mut pool = LocalPool::new();
        let mut dispatcher: RequestDispatcher<u32, Log> = RequestDispatcher::new();
        let mut log = Log::new();

        let (handle, driver) = dispatcher.issue(RequestKind::Get, ready_request(3), record);
        pool.spawner().spawn_local(driver).unwrap();
        pool.run_until_stalled();

        handle.cancel();
        assert_eq!(dispatcher.dispatch_completed(&mut log), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn cancel_after_completion_is_a_no_op() {
        let mut pool = LocalPool::new();
        let mut dispatcher: RequestDispatcher<u32, Log> = RequestDispatcher::new();
        let mut log = Log::new();

        let (handle, driver) = dispatcher.issue(RequestKind::Get, ready_request(5), record);
        pool.spawner().spawn_local(driver).unwrap();
        pool.run_until_stalled();
        dispatcher.dispatch_completed(&mut log);

        assert!(!handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_completed());
        assert!(!handle.is_cancelled());
        assert_eq!(log, vec![Ok(5)]);
    }

    #[test]
    fn errors_reach_the_callback() {
        let mut pool = LocalPool::new();
        let mut dispatcher: RequestDispatcher<u32, Log> = RequestDispatcher::new();
        let mut log = Log::new();

        let (tx, request) = gated_request();
        let (_handle, driver) = dispatcher.issue(RequestKind::Get, request, record);
        pool.spawner().spawn_local(driver).unwrap();
        drop(tx);
        pool.run_until_stalled();

        dispatcher.dispatch_completed(&mut log);
        assert!(matches!(log.as_slice(), [Err(PipelineError::Fetch { .. })]));
    }

    #[test]
    fn cancel_from_another_thread_through_registry() {
        let mut pool = LocalPool::new();
        let mut dispatcher: RequestDispatcher<u32, Log> = RequestDispatcher::new();
        let mut log = Log::new();

        let (tx, request) = gated_request();
        let (handle, driver) = dispatcher.issue(RequestKind::Get, request, record);
        pool.spawner().spawn_local(driver).unwrap();
        assert_eq!(registered_request(handle.id()), Some(handle.clone()));

        let id = handle.id();
        let cancelled = std::thread::spawn(move || cancel_registered(id))
            .join()
            .unwrap();
        assert!(cancelled);
        assert!(!cancel_registered(id));

        let _ = tx.send(9);
        pool.run_until_stalled();
        assert_eq!(dispatcher.dispatch_completed(&mut log), 0);
        assert!(log.is_empty());
        assert!(registered_request(id).is_none());
    }

    #[test]
    fn delivered_requests_leave_the_registry() {
        let mut pool = LocalPool::new();
        let mut dispatcher: RequestDispatcher<u32, Log> = RequestDispatcher::new();
        let mut log = Log::new();

        let (handle, driver) = dispatcher.issue(RequestKind::Get, ready_request(1), record);
        pool.spawner().spawn_local(driver).unwrap();
        pool.run_until_stalled();
        dispatcher.dispatch_completed(&mut log);
        assert!(registered_request(handle.id()).is_none());
    }

    #[test]
    fn preset_completed_handle_ignores_cancel() {
        let handle = RequestHandle::completed(RequestKind::Head);
        assert!(handle.is_completed());
        assert!(!handle.cancel());
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn local_registry_cancel_and_release() {
        let mut registry = RequestRegistry::default();
        let a = RequestHandle::new(RequestKind::Get);
        let b = RequestHandle::new(RequestKind::Get);
        registry.register(&a);
        registry.register(&b);

        assert!(registry.cancel(a.id()));
        registry.release(b.id());
        assert!(registry.is_empty());
        assert!(a.is_cancelled());
        assert!(!b.is_completed());
    }
}
