use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::errors::EngineError;
use crate::value::AnyValue;

// ─── Requests and replies ─────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputRequestKind {
    Invalid,
    UserValue,
    UserChoice,
}

/// A user-input request as issued by an instruction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserInputRequest {
    pub kind: InputRequestKind,
    pub payload: AnyValue,
}

impl UserInputRequest {
    /// Request a value of the same shape as `prototype` from the user.
    pub fn user_value(prototype: &AnyValue, description: &str) -> Self {
        UserInputRequest {
            kind: InputRequestKind::UserValue,
            payload: json!({ "value": prototype, "description": description }),
        }
    }

    /// Request a choice between `options`, with free-form dialog metadata.
    pub fn user_choice(options: &[String], metadata: &AnyValue) -> Self {
        UserInputRequest {
            kind: InputRequestKind::UserChoice,
            payload: json!({ "options": options, "metadata": metadata }),
        }
    }

    pub fn parse_user_value(&self) -> Option<(AnyValue, String)> {
        if self.kind != InputRequestKind::UserValue {
            return None;
        }
        let value = self.payload.get("value")?.clone();
        let description = self.payload.get("description")?.as_str()?.to_string();
        Some((value, description))
    }

    pub fn parse_user_choice(&self) -> Option<(Vec<String>, AnyValue)> {
        if self.kind != InputRequestKind::UserChoice {
            return None;
        }
        let options = self
            .payload
            .get("options")?
            .as_array()?
            .iter()
            .map(|o| o.as_str().map(str::to_string))
            .collect::<Option<Vec<String>>>()?;
        let metadata = self.payload.get("metadata")?.clone();
        Some((options, metadata))
    }
}

/// Reply produced by the input backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserInputReply {
    pub kind: InputRequestKind,
    pub result: bool,
    pub payload: AnyValue,
}

impl UserInputReply {
    pub fn invalid() -> Self {
        UserInputReply {
            kind: InputRequestKind::Invalid,
            result: false,
            payload: AnyValue::Null,
        }
    }

    pub fn user_value(result: bool, value: AnyValue) -> Self {
        UserInputReply {
            kind: InputRequestKind::UserValue,
            result,
            payload: value,
        }
    }

    pub fn user_choice(result: bool, choice: i32) -> Self {
        UserInputReply {
            kind: InputRequestKind::UserChoice,
            result,
            payload: json!(choice),
        }
    }

    /// `(success, value)` of a user-value reply.
    pub fn parse_user_value(&self) -> Option<(bool, AnyValue)> {
        if self.kind != InputRequestKind::UserValue {
            return None;
        }
        Some((self.result, self.payload.clone()))
    }

    /// `(success, choice)` of a user-choice reply.
    pub fn parse_user_choice(&self) -> Option<(bool, i32)> {
        if self.kind != InputRequestKind::UserChoice {
            return None;
        }
        Some((self.result, self.payload.as_i64()? as i32))
    }
}

// ─── Backend contract ─────────────────────────────────────────

/// Synchronous-looking user-input backend, driven one request at a time.
///
/// `interrupt` is called with the id of an in-flight request when the engine
/// cancels the corresponding future; backends bridging to blocking UIs use it
/// to abort the pending dialog.
#[async_trait]
pub trait UserInputBackend: Send + Sync {
    async fn input(&self, request: UserInputRequest, id: u64) -> UserInputReply;

    fn interrupt(&self, id: u64);
}

// ─── Futures ──────────────────────────────────────────────────

#[derive(Debug)]
enum PendingState {
    Waiting,
    Ready(UserInputReply),
    Cancelled,
}

struct PendingShared {
    state: Mutex<PendingState>,
    ready: Notify,
    cancelled: Notify,
}

/// Handle on an outstanding user-input request.
///
/// Dropping the future cancels the request: queued requests are skipped and
/// the in-flight one is interrupted. `value` on a cancelled or never-valid
/// future fails explicitly.
pub struct UserInputFuture {
    id: u64,
    shared: Option<Arc<PendingShared>>,
}

impl UserInputFuture {
    /// Future standing in for interfaces without user-input support.
    pub fn unsupported() -> Self {
        UserInputFuture {
            id: 0,
            shared: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.shared.is_some()
    }

    pub fn is_ready(&self) -> bool {
        match &self.shared {
            Some(shared) => matches!(*shared.state.lock().unwrap(), PendingState::Ready(_)),
            None => false,
        }
    }

    /// Wait up to `seconds` for the reply; true when it became ready.
    pub async fn wait_for(&self, seconds: f64) -> bool {
        let Some(shared) = &self.shared else {
            return false;
        };
        let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
        loop {
            let notified = shared.ready.notified();
            match *shared.state.lock().unwrap() {
                PendingState::Ready(_) => return true,
                PendingState::Cancelled => return false,
                PendingState::Waiting => {}
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_ready();
            }
        }
    }

    /// Take the reply. Fails unless the future is valid and ready.
    pub fn value(&self) -> Result<UserInputReply, EngineError> {
        let Some(shared) = &self.shared else {
            return Err(EngineError::InvalidOperation(
                "this user interface does not support user input".into(),
            ));
        };
        let state = shared.state.lock().unwrap();
        match &*state {
            PendingState::Ready(reply) => Ok(reply.clone()),
            PendingState::Cancelled => Err(EngineError::InvalidOperation(format!(
                "user input request {} was cancelled",
                self.id
            ))),
            PendingState::Waiting => Err(EngineError::InvalidOperation(format!(
                "user input request {} is not ready",
                self.id
            ))),
        }
    }
}

impl Drop for UserInputFuture {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            let mut state = shared.state.lock().unwrap();
            if matches!(*state, PendingState::Waiting) {
                *state = PendingState::Cancelled;
                drop(state);
                // notify_one stores a permit, so the cancellation is seen
                // even when the worker has not yet entered its select.
                shared.cancelled.notify_one();
            }
        }
    }
}

// ─── Adapter ──────────────────────────────────────────────────

struct RequestEntry {
    id: u64,
    request: UserInputRequest,
    shared: Arc<PendingShared>,
}

struct AdapterShared {
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

/// Serialises user-input requests onto a single worker so at most one backend
/// call is active at any instant, and bridges the replies to non-blocking
/// futures.
pub struct AsyncInputAdapter {
    tx: mpsc::UnboundedSender<RequestEntry>,
    next_id: AtomicU64,
    shared: Arc<AdapterShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncInputAdapter {
    pub fn new(backend: Arc<dyn UserInputBackend>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(AdapterShared {
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        });
        let worker = tokio::spawn(handle_request_queue(rx, backend, shared.clone()));
        AsyncInputAdapter {
            tx,
            next_id: AtomicU64::new(1),
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue a request and return the future carrying its dense id.
    pub fn add_request(&self, request: UserInputRequest) -> UserInputFuture {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(PendingShared {
            state: Mutex::new(PendingState::Waiting),
            ready: Notify::new(),
            cancelled: Notify::new(),
        });
        let entry = RequestEntry {
            id,
            request,
            shared: shared.clone(),
        };
        if self.shared.shutdown.load(Ordering::SeqCst) || self.tx.send(entry).is_err() {
            // Worker already gone; the request is born cancelled.
            *shared.state.lock().unwrap() = PendingState::Cancelled;
        }
        UserInputFuture {
            id,
            shared: Some(shared),
        }
    }

    /// Cancel all outstanding requests, interrupt the one in flight and join
    /// the worker.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.shutdown_notify.notify_one();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for AsyncInputAdapter {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.shutdown_notify.notify_one();
    }
}

async fn handle_request_queue(
    mut rx: mpsc::UnboundedReceiver<RequestEntry>,
    backend: Arc<dyn UserInputBackend>,
    adapter: Arc<AdapterShared>,
) {
    loop {
        let entry = tokio::select! {
            entry = rx.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
            _ = adapter.shutdown_notify.notified() => {
                if adapter.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }
        };
        if adapter.shutdown.load(Ordering::SeqCst) {
            cancel_entry(&entry);
            continue;
        }
        {
            let state = entry.shared.state.lock().unwrap();
            if matches!(*state, PendingState::Cancelled) {
                continue;
            }
        }
        tokio::select! {
            reply = backend.input(entry.request.clone(), entry.id) => {
                let mut state = entry.shared.state.lock().unwrap();
                if matches!(*state, PendingState::Waiting) {
                    *state = PendingState::Ready(reply);
                    drop(state);
                    entry.shared.ready.notify_one();
                }
            }
            _ = entry.shared.cancelled.notified() => {
                backend.interrupt(entry.id);
            }
            _ = adapter.shutdown_notify.notified() => {
                backend.interrupt(entry.id);
                cancel_entry(&entry);
                break;
            }
        }
    }
    // Drain whatever is still queued so no future waits forever.
    while let Ok(entry) = rx.try_recv() {
        cancel_entry(&entry);
    }
    rx.close();
}

fn cancel_entry(entry: &RequestEntry) {
    let mut state = entry.shared.state.lock().unwrap();
    if matches!(*state, PendingState::Waiting) {
        *state = PendingState::Cancelled;
        drop(state);
        entry.shared.ready.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    /// Backend answering after a configurable delay, recording interrupts.
    struct TestBackend {
        delay: Duration,
        interrupted: StdMutex<Vec<u64>>,
    }

    impl TestBackend {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(TestBackend {
                delay,
                interrupted: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl UserInputBackend for TestBackend {
        async fn input(&self, request: UserInputRequest, id: u64) -> UserInputReply {
            tokio::time::sleep(self.delay).await;
            match request.kind {
                InputRequestKind::UserValue => {
                    UserInputReply::user_value(true, json!(id))
                }
                InputRequestKind::UserChoice => UserInputReply::user_choice(true, 1),
                InputRequestKind::Invalid => UserInputReply::invalid(),
            }
        }

        fn interrupt(&self, id: u64) {
            self.interrupted.lock().unwrap().push(id);
        }
    }

    fn value_request() -> UserInputRequest {
        UserInputRequest::user_value(&json!(0), "enter a value")
    }

    #[test]
    fn request_reply_round_trips() {
        let request = UserInputRequest::user_value(&json!({"a": 1}), "describe");
        let (value, description) = request.parse_user_value().unwrap();
        assert_eq!(value, json!({"a": 1}));
        assert_eq!(description, "describe");
        assert!(request.parse_user_choice().is_none());

        let reply = UserInputReply::user_choice(true, 2);
        assert_eq!(reply.parse_user_choice(), Some((true, 2)));
    }

    #[tokio::test]
    async fn replies_arrive_through_the_future() {
        let backend = TestBackend::new(Duration::from_millis(5));
        let adapter = AsyncInputAdapter::new(backend);
        let future = adapter.add_request(value_request());
        assert!(future.is_valid());
        assert!(future.wait_for(1.0).await);
        let reply = future.value().unwrap();
        assert!(reply.result);
        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn requests_are_served_one_at_a_time_in_order() {
        let backend = TestBackend::new(Duration::from_millis(10));
        let adapter = AsyncInputAdapter::new(backend);
        let first = adapter.add_request(value_request());
        let second = adapter.add_request(value_request());
        assert!(second.wait_for(1.0).await);
        // By the time the second completed, the first must have as well.
        assert!(first.is_ready());
        assert_eq!(first.value().unwrap().payload, json!(first.id()));
        assert_eq!(second.value().unwrap().payload, json!(second.id()));
        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn dropping_a_future_interrupts_the_inflight_request() {
        let backend = TestBackend::new(Duration::from_millis(500));
        let adapter = AsyncInputAdapter::new(backend.clone());
        let future = adapter.add_request(value_request());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = future.id();
        drop(future);
        // Give the worker a moment to observe the cancellation.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*backend.interrupted.lock().unwrap(), vec![id]);
        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn value_on_cancelled_future_fails() {
        let backend = TestBackend::new(Duration::from_millis(500));
        let adapter = AsyncInputAdapter::new(backend);
        let first = adapter.add_request(value_request());
        let second = adapter.add_request(value_request());
        adapter.shutdown().await;
        assert!(first.value().is_err());
        assert!(second.value().is_err());
        assert!(!second.wait_for(0.05).await);
    }

    #[test]
    fn unsupported_future_is_never_valid() {
        let future = UserInputFuture::unsupported();
        assert!(!future.is_valid());
        assert!(!future.is_ready());
        assert!(future.value().is_err());
    }
}
