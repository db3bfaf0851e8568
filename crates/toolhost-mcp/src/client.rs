//! Client runtime for one server connection.
//!
//! The client owns a transport and a dispatcher task. Outbound requests park a
//! oneshot sender in the pending table keyed by request id; the dispatcher
//! resolves it when the matching response arrives. Inbound requests and
//! notifications are routed to registered [`MessageHandler`]s.

use crate::error::{McpError, McpResult};
use crate::protocol::{
    methods, Message, Notification, ParseError, Request, RequestId, Response, RpcError,
};
use crate::transport::{Connected, Inbound, Incoming, Transport};
use crate::types::{
    CallToolParams, CallToolResult, ClientCapabilities, CompleteParams, CompleteResult,
    CompletionArgument, CompletionReference, GetPromptParams, GetPromptResult, Implementation,
    InitializeParams, InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult,
    LoggingLevel, Paginated, Prompt, ReadResourceParams, ReadResourceResult, Resource,
    ServerCapabilities, SetLevelParams, SubscribeParams, Tool, PROTOCOL_VERSION,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use toolhost_util::TimingGuard;
use tracing::{debug, info, trace, warn};

/// Upper bound on pages fetched by one list call.
const MAX_PAGES: usize = 100;

/// Handler for inbound requests and notifications.
///
/// For notifications the returned value is discarded.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>) -> Result<Value, RpcError>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>) -> Result<Value, RpcError> {
        (self.0)(params).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
    /// Default deadline for requests without an explicit timeout.
    pub request_timeout: Duration,
    /// Deadline for the `initialize` exchange.
    pub init_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_info: Implementation::default(),
            capabilities: ClientCapabilities::default(),
            request_timeout: Duration::from_secs(30),
            init_timeout: Duration::from_secs(30),
        }
    }
}

type PendingMap = HashMap<RequestId, oneshot::Sender<McpResult<Value>>>;
type HandlerMap = HashMap<String, Arc<dyn MessageHandler>>;

/// State shared between the client and its dispatcher task.
struct Shared {
    server: String,
    transport: Arc<dyn Transport>,
    pending: Mutex<PendingMap>,
    request_handlers: RwLock<HandlerMap>,
    notification_handlers: RwLock<HandlerMap>,
    closed: AtomicBool,
}

impl Shared {
    async fn on_message(self: &Arc<Self>, message: Message) {
        match message {
            Message::Response(response) => self.on_response(response).await,
            Message::Request(request) => self.on_request(request).await,
            Message::Notification(notification) => self.on_notification(notification).await,
        }
    }

    async fn on_response(&self, response: Response) {
        let Some(id) = response.id else {
            if let Err(error) = response.outcome {
                warn!(server = %self.server, error = %error, "Server reported an uncorrelated error");
            }
            return;
        };

        let slot = self.pending.lock().await.remove(&id);
        match slot {
            Some(tx) => {
                let result = response.outcome.map_err(McpError::from_rpc);
                // The caller may have timed out already.
                let _ = tx.send(result);
            }
            None => {
                warn!(server = %self.server, id = %id, "Dropping response for unknown request");
            }
        }
    }

    /// Fail the pending request a malformed frame was addressed to.
    async fn on_malformed(&self, error: ParseError) {
        let Some(id) = error.id.clone() else {
            return;
        };
        let slot = self.pending.lock().await.remove(&id);
        match slot {
            Some(tx) => {
                let _ = tx.send(Err(McpError::protocol_error(error.message)));
            }
            None => {
                debug!(server = %self.server, id = %id, error = %error, "Malformed frame for unknown request");
            }
        }
    }

    async fn on_request(self: &Arc<Self>, request: Request) {
        let handler = self
            .request_handlers
            .read()
            .await
            .get(&request.method)
            .cloned();

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match handler {
                Some(handler) => handler.handle(request.params).await,
                None => {
                    debug!(server = %shared.server, method = %request.method, "No handler for request");
                    Err(RpcError::method_not_found(&request.method))
                }
            };
            let response = Message::Response(Response {
                id: Some(request.id),
                outcome,
            });
            if let Err(e) = shared.transport.send(&response).await {
                warn!(server = %shared.server, error = %e, "Failed to answer server request");
            }
        });
    }

    async fn on_notification(&self, notification: Notification) {
        let handler = self
            .notification_handlers
            .read()
            .await
            .get(&notification.method)
            .cloned();

        match handler {
            Some(handler) => {
                let server = self.server.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler.handle(notification.params).await {
                        debug!(server = %server, method = %notification.method, error = %e, "Notification handler failed");
                    }
                });
            }
            None => {
                trace!(server = %self.server, method = %notification.method, "Ignoring notification");
            }
        }
    }

    /// Mark closed and fail every pending request.
    async fn fail_pending(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!(server = %self.server, count = drained.len(), "Failing pending requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(McpError::ConnectionClosed));
        }
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut inbound: Inbound) {
    while let Some(incoming) = inbound.recv().await {
        match incoming {
            Incoming::Message(message) => shared.on_message(message).await,
            Incoming::Malformed(error) => shared.on_malformed(error).await,
        }
    }
    debug!(server = %shared.server, "Inbound stream ended");
    shared.fail_pending().await;
}

/// Client for one server connection.
pub struct McpClient {
    shared: Arc<Shared>,
    options: ClientOptions,
    next_id: AtomicI64,
    init: OnceLock<InitializeResult>,
    dispatcher: JoinHandle<()>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server", &self.shared.server)
            .field("initialized", &self.init.get().is_some())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl McpClient {
    /// Wrap an established transport and start dispatching its messages.
    pub fn new(server: impl Into<String>, connected: Connected, options: ClientOptions) -> Self {
        let mut request_handlers: HandlerMap = HashMap::new();
        request_handlers.insert(
            methods::PING.to_string(),
            handler_fn(|_| async { Ok::<_, RpcError>(json!({})) }),
        );

        let shared = Arc::new(Shared {
            server: server.into(),
            transport: connected.transport,
            pending: Mutex::new(HashMap::new()),
            request_handlers: RwLock::new(request_handlers),
            notification_handlers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&shared), connected.inbound));

        Self {
            shared,
            options,
            next_id: AtomicI64::new(1),
            init: OnceLock::new(),
            dispatcher,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.shared.server
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Perform the capability handshake. Repeated calls return the first result.
    pub async fn initialize(&self) -> McpResult<InitializeResult> {
        if let Some(result) = self.init.get() {
            return Ok(result.clone());
        }

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: self.options.capabilities.clone(),
            client_info: self.options.client_info.clone(),
        };

        let value = match self
            .send_request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params)?),
                self.options.init_timeout,
            )
            .await
        {
            Ok(value) => value,
            Err(McpError::Timeout { timeout, .. }) => {
                return Err(McpError::connection_failed(format!(
                    "{}: handshake timed out after {timeout:?}",
                    self.shared.server
                )))
            }
            Err(McpError::Rpc { message, .. }) | Err(McpError::MethodNotFound(message)) => {
                return Err(McpError::InitializationFailed(message))
            }
            Err(e) => return Err(e),
        };

        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| McpError::protocol_error(format!("Invalid initialize result: {e}")))?;

        info!(
            server = %self.shared.server,
            protocol_version = %result.protocol_version,
            server_name = %result.server_info.name,
            tools = result.capabilities.supports_tools(),
            resources = result.capabilities.supports_resources(),
            prompts = result.capabilities.supports_prompts(),
            "Server initialized"
        );

        self.send_notification(methods::INITIALIZED, None).await?;

        let _ = self.init.set(result.clone());
        Ok(result)
    }

    pub fn is_initialized(&self) -> bool {
        self.init.get().is_some()
    }

    /// Negotiated server capabilities, once initialized.
    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.init.get().map(|r| &r.capabilities)
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.init.get().map(|r| &r.server_info)
    }

    fn supports(&self, check: impl Fn(&ServerCapabilities) -> bool) -> bool {
        self.capabilities().is_some_and(check)
    }

    fn unsupported(&self, family: &str) -> McpError {
        McpError::MethodNotFound(format!(
            "server {} does not support {family}",
            self.shared.server
        ))
    }

    /// Send a request and wait for its response.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<Value> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.shared.pending.lock().await;
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(McpError::ConnectionClosed);
            }
            pending.insert(id.clone(), tx);
        }

        let _timing = TimingGuard::request(method);
        let request = Message::Request(Request {
            id: id.clone(),
            method: method.to_string(),
            params,
        });

        if let Err(e) = self.shared.transport.send(&request).await {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::ConnectionClosed),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                warn!(
                    server = %self.shared.server,
                    method = %method,
                    id = %id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                self.cancel_remote(id);
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Tell the server we stopped waiting for `id`. Best effort.
    fn cancel_remote(&self, id: RequestId) {
        let transport = Arc::clone(&self.shared.transport);
        tokio::spawn(async move {
            let notification = Message::notification(
                methods::CANCELLED,
                Some(json!({ "requestId": id, "reason": "timeout" })),
            );
            let _ = transport.send(&notification).await;
        });
    }

    /// Send a request with the default timeout and decode the result.
    async fn request_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<T> {
        let value = self.send_request(method, params, timeout).await?;
        serde_json::from_value(value)
            .map_err(|e| McpError::protocol_error(format!("Invalid {method} result: {e}")))
    }

    /// Fire-and-forget notification.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(McpError::ConnectionClosed);
        }
        self.shared
            .transport
            .send(&Message::notification(method, params))
            .await
    }

    /// Follow `nextCursor` until the listing is exhausted.
    async fn paginate<P: Paginated>(
        &self,
        method: &str,
        timeout: Duration,
    ) -> McpResult<Vec<P::Item>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: P = self.request_typed(method, params, timeout).await?;
            cursor = page.next_cursor().map(str::to_string);
            items.extend(page.into_items());
            if cursor.is_none() {
                return Ok(items);
            }
        }

        warn!(server = %self.shared.server, method = %method, "Pagination limit reached");
        Ok(items)
    }

    /// List tools; empty if the server never advertised tools.
    pub async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        self.list_tools_within(self.options.request_timeout).await
    }

    pub async fn list_tools_within(&self, timeout: Duration) -> McpResult<Vec<Tool>> {
        if !self.supports(ServerCapabilities::supports_tools) {
            debug!(server = %self.shared.server, "Server does not support tools capability");
            return Ok(Vec::new());
        }
        self.paginate::<ListToolsResult>(methods::TOOLS_LIST, timeout)
            .await
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<CallToolResult> {
        self.call_tool_with_timeout(name, arguments, self.options.request_timeout)
            .await
    }

    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> McpResult<CallToolResult> {
        if !self.supports(ServerCapabilities::supports_tools) {
            return Err(self.unsupported("tools"));
        }
        let params = CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        };
        debug!(server = %self.shared.server, tool = %name, "Calling tool");
        self.request_typed(
            methods::TOOLS_CALL,
            Some(serde_json::to_value(&params)?),
            timeout,
        )
        .await
    }

    /// List resources; empty if the server never advertised resources.
    pub async fn list_resources(&self) -> McpResult<Vec<Resource>> {
        if !self.supports(ServerCapabilities::supports_resources) {
            debug!(server = %self.shared.server, "Server does not support resources capability");
            return Ok(Vec::new());
        }
        self.paginate::<ListResourcesResult>(methods::RESOURCES_LIST, self.options.request_timeout)
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        if !self.supports(ServerCapabilities::supports_resources) {
            return Err(self.unsupported("resources"));
        }
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        self.request_typed(
            methods::RESOURCES_READ,
            Some(serde_json::to_value(&params)?),
            self.options.request_timeout,
        )
        .await
    }

    pub async fn subscribe_resource(&self, uri: &str) -> McpResult<()> {
        self.resource_subscription(methods::RESOURCES_SUBSCRIBE, uri)
            .await
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> McpResult<()> {
        self.resource_subscription(methods::RESOURCES_UNSUBSCRIBE, uri)
            .await
    }

    async fn resource_subscription(&self, method: &str, uri: &str) -> McpResult<()> {
        if !self.supports(ServerCapabilities::supports_resource_subscribe) {
            return Err(self.unsupported("resource subscriptions"));
        }
        let params = SubscribeParams {
            uri: uri.to_string(),
        };
        self.send_request(
            method,
            Some(serde_json::to_value(&params)?),
            self.options.request_timeout,
        )
        .await?;
        Ok(())
    }

    /// List prompts; empty if the server never advertised prompts.
    pub async fn list_prompts(&self) -> McpResult<Vec<Prompt>> {
        if !self.supports(ServerCapabilities::supports_prompts) {
            debug!(server = %self.shared.server, "Server does not support prompts capability");
            return Ok(Vec::new());
        }
        self.paginate::<ListPromptsResult>(methods::PROMPTS_LIST, self.options.request_timeout)
            .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> McpResult<GetPromptResult> {
        if !self.supports(ServerCapabilities::supports_prompts) {
            return Err(self.unsupported("prompts"));
        }
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        self.request_typed(
            methods::PROMPTS_GET,
            Some(serde_json::to_value(&params)?),
            self.options.request_timeout,
        )
        .await
    }

    pub async fn set_log_level(&self, level: LoggingLevel) -> McpResult<()> {
        if !self.supports(ServerCapabilities::supports_logging) {
            return Err(self.unsupported("logging"));
        }
        let params = SetLevelParams { level };
        self.send_request(
            methods::LOGGING_SET_LEVEL,
            Some(serde_json::to_value(&params)?),
            self.options.request_timeout,
        )
        .await?;
        Ok(())
    }

    pub async fn complete(
        &self,
        reference: CompletionReference,
        argument: CompletionArgument,
    ) -> McpResult<CompleteResult> {
        if !self.supports(ServerCapabilities::supports_completions) {
            return Err(self.unsupported("completions"));
        }
        let params = CompleteParams {
            reference,
            argument,
        };
        self.request_typed(
            methods::COMPLETION_COMPLETE,
            Some(serde_json::to_value(&params)?),
            self.options.request_timeout,
        )
        .await
    }

    /// Register a handler for server-initiated requests of `method`.
    pub async fn on_request(&self, method: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.shared
            .request_handlers
            .write()
            .await
            .insert(method.into(), handler);
    }

    /// Register a handler for notifications of `method`.
    pub async fn on_notification(
        &self,
        method: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.shared
            .notification_handlers
            .write()
            .await
            .insert(method.into(), handler);
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst) && self.shared.transport.is_connected()
    }

    pub async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    /// Close the transport; pending requests fail with `ConnectionClosed`.
    pub async fn close(&self) -> McpResult<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        let result = self.shared.transport.close().await;
        self.shared.fail_pending().await;
        info!(server = %self.shared.server, "Connection closed");
        result
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}
