//
// dispatch.rs
//
// Request dispatch: lifecycle, cancellation and ordering of notifications
//

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tower_lsp::jsonrpc::{self, ErrorCode, Id, Request, Response};

tokio::task_local! {
    static REQUEST_TOKEN: CancellationToken;
}

/// Cancellation token of the request being handled on this task. Outside a
/// request it is a token that never fires.
pub fn request_token() -> CancellationToken {
    REQUEST_TOKEN.try_with(CancellationToken::clone).unwrap_or_default()
}

/// Notifications that change documents or state, applied one at a time in
/// the order they arrived.
const ORDERED_NOTIFICATIONS: &[&str] = &[
    "textDocument/didOpen",
    "textDocument/didChange",
    "textDocument/didClose",
    "textDocument/didSave",
    "workspace/didChangeWatchedFiles",
    "workspace/didChangeConfiguration",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Uninitialized = 0,
    /// `initialize` received, response not sent yet
    Initializing = 1,
    Initialized = 2,
    ShuttingDown = 3,
    Exited = 4,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Uninitialized,
            1 => Lifecycle::Initializing,
            2 => Lifecycle::Initialized,
            3 => Lifecycle::ShuttingDown,
            _ => Lifecycle::Exited,
        }
    }
}

/// Hands out tickets at receipt and lets holders run strictly in ticket
/// order.
struct Tickets {
    next: AtomicU64,
    serving: watch::Sender<u64>,
}

impl Tickets {
    fn new() -> Self {
        let (serving, _) = watch::channel(0);
        Self {
            next: AtomicU64::new(0),
            serving,
        }
    }

    fn take(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    async fn wait_turn(&self, ticket: u64) {
        let mut serving = self.serving.subscribe();
        let _ = serving.wait_for(|current| *current >= ticket).await;
    }

    fn advance(&self) {
        self.serving.send_modify(|current| *current += 1);
    }
}

/// Passes the turn on when the holder finishes, panics or is dropped.
struct Turn(Arc<Shared>);

impl Drop for Turn {
    fn drop(&mut self) {
        self.0.tickets.advance();
    }
}

/// Removes a request's cancellation handle once it has been answered.
struct Registration {
    shared: Arc<Shared>,
    id: Id,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.id);
    }
}

struct Shared {
    lifecycle: AtomicU8,
    pending: DashMap<Id, CancellationToken>,
    tickets: Tickets,
}

impl Shared {
    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    fn set_lifecycle(&self, state: Lifecycle) {
        self.lifecycle.store(state as u8, Ordering::SeqCst);
    }

    fn cancel(&self, id: &Id) {
        match self.pending.get(id) {
            Some(token) => {
                log::trace!("Cancelling request {}", id);
                token.cancel();
            }
            None => log::trace!("Cancel for unknown or finished request {}", id),
        }
    }
}

/// Wraps the language server service with the protocol lifecycle, per
/// request cancellation and ordered document notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchLayer;

impl<S> Layer<S> for DispatchLayer {
    type Service = Dispatcher<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Dispatcher::new(inner)
    }
}

pub struct Dispatcher<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> Dispatcher<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            shared: Arc::new(Shared {
                lifecycle: AtomicU8::new(Lifecycle::Uninitialized as u8),
                pending: DashMap::new(),
                tickets: Tickets::new(),
            }),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    /// Requests currently holding a cancellation handle.
    pub fn in_flight(&self) -> usize {
        self.shared.pending.len()
    }
}

pub fn not_initialized() -> jsonrpc::Error {
    jsonrpc::Error {
        code: ErrorCode::ServerError(-32002),
        message: "server not initialized".into(),
        data: None,
    }
}

fn invalid_request(message: &'static str) -> jsonrpc::Error {
    jsonrpc::Error {
        code: ErrorCode::InvalidRequest,
        message: message.into(),
        data: None,
    }
}

fn cancel_target(params: Option<&Value>) -> Option<Id> {
    match params?.get("id")? {
        Value::Number(n) => n.as_i64().map(Id::Number),
        Value::String(s) => Some(Id::String(s.clone())),
        _ => None,
    }
}

type DispatchFuture<E> = Pin<Box<dyn Future<Output = Result<Option<Response>, E>> + Send>>;

fn ready<E: Send + 'static>(response: Option<Response>) -> DispatchFuture<E> {
    Box::pin(async move { Ok(response) })
}

impl<S> Service<Request> for Dispatcher<S>
where
    S: Service<Request, Response = Option<Response>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Option<Response>;
    type Error = S::Error;
    type Future = DispatchFuture<S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let method = request.method().to_string();
        let shared = self.shared.clone();

        let Some(id) = request.id().cloned() else {
            return self.notification(&method, request);
        };

        let lifecycle = shared.lifecycle();
        if method == "initialize" {
            let claimed = shared.lifecycle.compare_exchange(
                Lifecycle::Uninitialized as u8,
                Lifecycle::Initializing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            if claimed.is_err() {
                let error = match lifecycle {
                    Lifecycle::ShuttingDown | Lifecycle::Exited => {
                        invalid_request("server is shutting down")
                    }
                    _ => invalid_request("server is already initialized"),
                };
                return ready(Some(Response::from_error(id, error)));
            }
            let future = self.inner.call(request);
            return Box::pin(async move {
                let response = future.await?;
                let ok = response.as_ref().is_some_and(|r| r.error().is_none());
                shared.set_lifecycle(if ok {
                    Lifecycle::Initialized
                } else {
                    Lifecycle::Uninitialized
                });
                Ok(response)
            });
        }

        match lifecycle {
            Lifecycle::Uninitialized | Lifecycle::Initializing => {
                log::debug!("Rejecting {} before initialization", method);
                return ready(Some(Response::from_error(id, not_initialized())));
            }
            Lifecycle::ShuttingDown | Lifecycle::Exited => {
                return ready(Some(Response::from_error(
                    id,
                    invalid_request("server is shutting down"),
                )));
            }
            Lifecycle::Initialized => {}
        }

        if method == "shutdown" {
            shared.set_lifecycle(Lifecycle::ShuttingDown);
            for entry in shared.pending.iter() {
                entry.value().cancel();
            }
        }

        let token = CancellationToken::new();
        shared.pending.insert(id.clone(), token.clone());
        let registration = Registration {
            shared,
            id: id.clone(),
        };
        let future = self.inner.call(request);
        let task = tokio::spawn(REQUEST_TOKEN.scope(token, future));

        Box::pin(async move {
            let _registration = registration;
            match task.await {
                Ok(result) => result,
                Err(err) => {
                    log::error!("Handler for {} failed: {}", method, err);
                    Ok(Some(Response::from_error(
                        id,
                        jsonrpc::Error {
                            code: ErrorCode::InternalError,
                            message: format!("request handler for {} failed", method).into(),
                            data: None,
                        },
                    )))
                }
            }
        })
    }
}

impl<S> Dispatcher<S>
where
    S: Service<Request, Response = Option<Response>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    fn notification(&mut self, method: &str, request: Request) -> DispatchFuture<S::Error> {
        let shared = self.shared.clone();

        if method == "exit" {
            shared.set_lifecycle(Lifecycle::Exited);
            return Box::pin(self.inner.call(request));
        }
        if shared.lifecycle() != Lifecycle::Initialized {
            log::debug!("Dropping {} outside the initialized state", method);
            return ready(None);
        }
        if method == "$/cancelRequest" {
            if let Some(id) = cancel_target(request.params()) {
                shared.cancel(&id);
            }
            return Box::pin(self.inner.call(request));
        }
        if !ORDERED_NOTIFICATIONS.contains(&method) {
            return Box::pin(self.inner.call(request));
        }

        let ticket = shared.tickets.take();
        let future = self.inner.call(request);
        let method = method.to_string();
        let task = tokio::spawn(async move {
            shared.tickets.wait_turn(ticket).await;
            let _turn = Turn(shared);
            future.await
        });
        Box::pin(async move {
            match task.await {
                Ok(result) => result,
                Err(err) => {
                    log::error!("Handler for {} failed: {}", method, err);
                    Ok(None)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::convert::Infallible;
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Echo service: records notifications, answers requests with their
    /// method name, sleeps for `params.sleep` ms and panics on `boom`.
    fn echo(log: Log) -> impl Service<
        Request,
        Response = Option<Response>,
        Error = Infallible,
        Future = Pin<Box<dyn Future<Output = Result<Option<Response>, Infallible>> + Send>>,
    > + Clone {
        tower::service_fn(move |request: Request| {
            let log = log.clone();
            Box::pin(async move {
                let (method, id, params) = request.into_parts();
                let sleep = params
                    .as_ref()
                    .and_then(|p| p.get("sleep"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                if sleep > 0 {
                    tokio::time::sleep(Duration::from_millis(sleep)).await;
                }
                if method == "boom" {
                    panic!("handler exploded");
                }
                if method == "token" {
                    let token = request_token();
                    token.cancelled().await;
                }
                let tag = params
                    .as_ref()
                    .and_then(|p| p.get("tag"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                log.lock().unwrap().push(format!("{}{}", method, tag));
                Ok(id.map(|id| Response::from_ok(id, json!(method.to_string()))))
            }) as Pin<Box<dyn Future<Output = Result<Option<Response>, Infallible>> + Send>>
        })
    }

    fn request(method: &'static str, id: i64, params: Value) -> Request {
        Request::build(method).id(id).params(params).finish()
    }

    fn notification(method: &'static str, params: Value) -> Request {
        Request::build(method).params(params).finish()
    }

    async fn send<S>(service: &mut S, request: Request) -> Option<Response>
    where
        S: Service<Request, Response = Option<Response>, Error = Infallible>,
    {
        service.ready().await.unwrap().call(request).await.unwrap()
    }

    async fn initialized(log: Log) -> Dispatcher<impl Service<
        Request,
        Response = Option<Response>,
        Error = Infallible,
        Future = Pin<Box<dyn Future<Output = Result<Option<Response>, Infallible>> + Send>>,
    >> {
        let mut service = DispatchLayer.layer(echo(log));
        let response = send(&mut service, request("initialize", 1, json!({}))).await;
        assert!(response.unwrap().error().is_none());
        service
    }

    #[tokio::test]
    async fn test_requests_before_initialize_are_rejected() {
        let log = Log::default();
        let mut service = DispatchLayer.layer(echo(log.clone()));

        let response = send(&mut service, request("textDocument/hover", 1, json!({}))).await;
        assert_eq!(
            response.unwrap().error().map(|e| e.code),
            Some(ErrorCode::ServerError(-32002))
        );
        assert!(send(&mut service, notification("textDocument/didOpen", json!({}))).await.is_none());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_initialize_fails() {
        let log = Log::default();
        let mut service = initialized(log).await;
        assert_eq!(service.lifecycle(), Lifecycle::Initialized);

        let response = send(&mut service, request("initialize", 2, json!({}))).await.unwrap();
        assert_eq!(response.error().map(|e| e.code), Some(ErrorCode::InvalidRequest));
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_are_rejected() {
        let log = Log::default();
        let mut service = initialized(log).await;
        assert!(send(&mut service, request("shutdown", 2, json!({}))).await.is_some());
        assert_eq!(service.lifecycle(), Lifecycle::ShuttingDown);

        let response = send(&mut service, request("textDocument/hover", 3, json!({})))
            .await
            .unwrap();
        let error = response.error().unwrap();
        assert_eq!(error.code, ErrorCode::InvalidRequest);
        assert_eq!(error.message, "server is shutting down");

        send(&mut service, notification("exit", json!({}))).await;
        assert_eq!(service.lifecycle(), Lifecycle::Exited);
    }

    #[tokio::test]
    async fn test_ordered_notifications_run_in_receipt_order() {
        let log = Log::default();
        let mut service = initialized(log.clone()).await;

        // The first change sleeps longest, so unordered execution would
        // record it last.
        let mut pending = Vec::new();
        for (i, sleep) in [40u64, 20, 0].into_iter().enumerate() {
            service.ready().await.unwrap();
            pending.push(service.call(notification(
                "textDocument/didChange",
                json!({ "sleep": sleep, "tag": format!("#{}", i) }),
            )));
        }
        for future in pending {
            future.await.unwrap();
        }
        let entries = log.lock().unwrap().clone();
        assert_eq!(
            &entries[1..],
            &[
                "textDocument/didChange#0",
                "textDocument/didChange#1",
                "textDocument/didChange#2"
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_internal_error() {
        let log = Log::default();
        let mut service = initialized(log).await;
        let response = send(&mut service, request("boom", 2, json!({}))).await.unwrap();
        assert_eq!(response.error().map(|e| e.code), Some(ErrorCode::InternalError));

        // The dispatcher keeps serving
        let response = send(&mut service, request("textDocument/hover", 3, json!({}))).await;
        assert!(response.unwrap().error().is_none());
    }

    #[tokio::test]
    async fn test_cancel_request_fires_handler_token() {
        let log = Log::default();
        let mut service = initialized(log).await;

        service.ready().await.unwrap();
        let waiting = service.call(request("token", 7, json!({})));
        let handle = tokio::spawn(waiting);
        while service.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        send(&mut service, notification("$/cancelRequest", json!({ "id": 7 }))).await;
        let response = handle.await.unwrap().unwrap().unwrap();
        assert!(response.error().is_none());
        assert_eq!(service.in_flight(), 0);
    }

    #[test]
    fn test_request_token_outside_request_never_fires() {
        assert!(!request_token().is_cancelled());
    }
}
