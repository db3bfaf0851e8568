//! Minimal tool server speaking the protocol over a byte stream.
//!
//! Used by the `serve-echo` command and as the far end of in-memory test
//! connections.

use crate::framing::{self, encode_line};
use crate::protocol::{methods, Message, Request, Response, RpcError};
use crate::types::{
    CallToolParams, CallToolResult, GetPromptParams, GetPromptResult, Implementation,
    InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult, Prompt,
    PromptMessage, ReadResourceParams, ReadResourceResult, Resource, ResourceContents, Role,
    ServerCapabilities, Tool, ToolContent, ToolsCapability, PROTOCOL_VERSION,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

/// Implementation of one served tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<CallToolResult, RpcError>;
}

/// Simple handler that wraps a closure.
pub struct ClosureHandler<F>
where
    F: Fn(Value) -> Result<CallToolResult, RpcError> + Send + Sync,
{
    f: F,
}

impl<F> ClosureHandler<F>
where
    F: Fn(Value) -> Result<CallToolResult, RpcError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ToolHandler for ClosureHandler<F>
where
    F: Fn(Value) -> Result<CallToolResult, RpcError> + Send + Sync,
{
    async fn call(&self, arguments: Value) -> Result<CallToolResult, RpcError> {
        (self.f)(arguments)
    }
}

struct ServedTool {
    tool: Tool,
    handler: Arc<dyn ToolHandler>,
}

/// In-process tool server.
pub struct ToolServer {
    info: Implementation,
    tools: Vec<ServedTool>,
    resources: Vec<(Resource, String)>,
    prompts: Vec<(Prompt, String)>,
    advertise_resources: bool,
    silenced: HashSet<String>,
    page_size: Option<usize>,
}

impl ToolServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            info: Implementation {
                name: name.into(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
            advertise_resources: true,
            silenced: HashSet::new(),
            page_size: None,
        }
    }

    pub fn with_tool(mut self, tool: Tool, handler: impl ToolHandler + 'static) -> Self {
        self.tools.push(ServedTool {
            tool,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn with_resource(mut self, resource: Resource, text: impl Into<String>) -> Self {
        self.resources.push((resource, text.into()));
        self
    }

    pub fn with_prompt(mut self, prompt: Prompt, text: impl Into<String>) -> Self {
        self.prompts.push((prompt, text.into()));
        self
    }

    /// Report `resources: false` in the handshake and refuse resource methods.
    pub fn without_resources(mut self) -> Self {
        self.advertise_resources = false;
        self
    }

    /// Never answer requests for `method`.
    pub fn silence(mut self, method: impl Into<String>) -> Self {
        self.silenced.insert(method.into());
        self
    }

    /// Split list results into pages of `size` items.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    fn initialize_result(&self) -> Result<Value, RpcError> {
        let capabilities = ServerCapabilities {
            tools: Some(ToolsCapability::default()),
            prompts: (!self.prompts.is_empty()).then(Default::default),
            logging: Some(Default::default()),
            ..Default::default()
        };
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities,
            server_info: self.info.clone(),
            instructions: None,
        };
        let mut value = to_value(&result)?;
        value["capabilities"]["resources"] = if self.advertise_resources {
            json!({ "subscribe": true, "listChanged": false })
        } else {
            Value::Bool(false)
        };
        Ok(value)
    }

    /// Slice `items` according to the request cursor.
    fn page<T: Clone>(&self, items: &[T], params: &Option<Value>) -> (Vec<T>, Option<String>) {
        let start = params
            .as_ref()
            .and_then(|p| p.get("cursor"))
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0)
            .min(items.len());
        let end = match self.page_size {
            Some(size) => (start + size).min(items.len()),
            None => items.len(),
        };
        let next = (end < items.len()).then(|| end.to_string());
        (items[start..end].to_vec(), next)
    }

    async fn dispatch(&self, request: &Request) -> Result<Value, RpcError> {
        let params = &request.params;
        match request.method.as_str() {
            methods::INITIALIZE => self.initialize_result(),
            methods::PING | methods::LOGGING_SET_LEVEL => Ok(json!({})),
            methods::TOOLS_LIST => {
                let tools: Vec<Tool> = self.tools.iter().map(|t| t.tool.clone()).collect();
                let (tools, next_cursor) = self.page(&tools, params);
                to_value(&ListToolsResult { tools, next_cursor })
            }
            methods::TOOLS_CALL => {
                let call: CallToolParams = parse_params(params)?;
                let served = self
                    .tools
                    .iter()
                    .find(|t| t.tool.name == call.name)
                    .ok_or_else(|| RpcError::invalid_params(format!("Unknown tool: {}", call.name)))?;
                let result = served
                    .handler
                    .call(call.arguments.unwrap_or_else(|| json!({})))
                    .await?;
                to_value(&result)
            }
            methods::RESOURCES_LIST if self.advertise_resources => {
                let resources: Vec<Resource> =
                    self.resources.iter().map(|(r, _)| r.clone()).collect();
                let (resources, next_cursor) = self.page(&resources, params);
                to_value(&ListResourcesResult {
                    resources,
                    next_cursor,
                })
            }
            methods::RESOURCES_READ if self.advertise_resources => {
                let read: ReadResourceParams = parse_params(params)?;
                let (resource, text) = self
                    .resources
                    .iter()
                    .find(|(r, _)| r.uri == read.uri)
                    .ok_or_else(|| {
                        RpcError::invalid_params(format!("Unknown resource: {}", read.uri))
                    })?;
                to_value(&ReadResourceResult {
                    contents: vec![ResourceContents {
                        uri: resource.uri.clone(),
                        mime_type: resource.mime_type.clone(),
                        text: Some(text.clone()),
                        blob: None,
                    }],
                })
            }
            methods::RESOURCES_SUBSCRIBE | methods::RESOURCES_UNSUBSCRIBE
                if self.advertise_resources =>
            {
                Ok(json!({}))
            }
            methods::PROMPTS_LIST if !self.prompts.is_empty() => {
                let prompts: Vec<Prompt> = self.prompts.iter().map(|(p, _)| p.clone()).collect();
                let (prompts, next_cursor) = self.page(&prompts, params);
                to_value(&ListPromptsResult {
                    prompts,
                    next_cursor,
                })
            }
            methods::PROMPTS_GET if !self.prompts.is_empty() => {
                let get: GetPromptParams = parse_params(params)?;
                let (prompt, text) = self
                    .prompts
                    .iter()
                    .find(|(p, _)| p.name == get.name)
                    .ok_or_else(|| {
                        RpcError::invalid_params(format!("Unknown prompt: {}", get.name))
                    })?;
                to_value(&GetPromptResult {
                    description: prompt.description.clone(),
                    messages: vec![PromptMessage {
                        role: Role::User,
                        content: ToolContent::Text { text: text.clone() },
                    }],
                })
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }

    /// Handle one inbound message, returning the reply if one is due.
    pub async fn handle(&self, message: Message) -> Option<Message> {
        match message {
            Message::Request(request) => {
                if self.silenced.contains(&request.method) {
                    debug!(server = %self.info.name, method = %request.method, "Ignoring silenced request");
                    return None;
                }
                let outcome = self.dispatch(&request).await;
                Some(Message::Response(Response {
                    id: Some(request.id),
                    outcome,
                }))
            }
            Message::Notification(notification) => {
                debug!(server = %self.info.name, method = %notification.method, "Notification");
                None
            }
            Message::Response(_) => None,
        }
    }

    /// Serve until `reader` reaches EOF.
    ///
    /// Requests are handled concurrently; replies are written in completion
    /// order.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let name = self.info.name.clone();
        let writer_task = tokio::spawn(async move {
            let mut sink = FramedWrite::new(writer, framing::codec());
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(encode_line(&message)).await {
                    warn!(server = %name, error = %e, "Write failed, stopping server");
                    break;
                }
            }
        });

        let mut frames = FramedRead::new(reader, framing::codec());
        while let Some(frame) = frames.next().await {
            let line = match frame {
                Ok(line) => line,
                Err(e) => {
                    warn!(server = %self.info.name, error = %e, "Frame error");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match Message::decode(line.as_bytes()) {
                Ok(message) => {
                    let server = Arc::clone(&self);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Some(reply) = server.handle(message).await {
                            let _ = tx.send(reply);
                        }
                    });
                }
                Err(e) => {
                    warn!(server = %self.info.name, error = %e, "Rejecting undecodable frame");
                    let _ = tx.send(Message::Response(e.to_response()));
                }
            }
        }

        drop(tx);
        let _ = writer_task.await;
        Ok(())
    }

    /// Serve on this process's stdin/stdout.
    pub async fn serve_stdio(self: Arc<Self>) -> std::io::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }
}

fn parse_params<T: DeserializeOwned>(params: &Option<Value>) -> Result<T, RpcError> {
    let value = params.clone().unwrap_or_else(|| json!({}));
    serde_json::from_value(value).map_err(|e| RpcError::invalid_params(e.to_string()))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::internal_error(e.to_string()))
}

/// The demo `echo` tool.
///
/// Returns its arguments as text and structured content. `delay_ms` sleeps
/// first, `fail: true` reports an error result.
pub struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    async fn call(&self, arguments: Value) -> Result<CallToolResult, RpcError> {
        if let Some(delay) = arguments.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if arguments.get("fail").and_then(Value::as_bool) == Some(true) {
            return Ok(CallToolResult::error("echo failed on request"));
        }
        Ok(CallToolResult {
            structured_content: Some(arguments.clone()),
            ..CallToolResult::text(arguments.to_string())
        })
    }
}

/// Server with the `echo` tool, one resource and one prompt.
pub fn echo_server() -> ToolServer {
    let schema = json!({
        "type": "object",
        "properties": {
            "delay_ms": {"type": "integer", "description": "Sleep before answering"},
            "fail": {"type": "boolean", "description": "Report a tool error"}
        },
        "additionalProperties": true
    });

    ToolServer::new("toolhost-echo")
        .with_tool(
            Tool::new("echo", "Echo the given arguments back").with_schema(schema),
            EchoTool,
        )
        .with_resource(
            Resource {
                uri: "echo://readme".to_string(),
                name: "readme".to_string(),
                description: Some("About this server".to_string()),
                mime_type: Some("text/plain".to_string()),
            },
            "This server echoes tool arguments.",
        )
        .with_prompt(
            Prompt {
                name: "echo".to_string(),
                description: Some("Ask for an echo".to_string()),
                arguments: Vec::new(),
            },
            "Please echo this.",
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn call(server: &ToolServer, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match server.handle(Message::request(1, method, params)).await {
            Some(Message::Response(Response { outcome, .. })) => outcome,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_initialize_reports_capabilities() {
        let result = call(&echo_server(), methods::INITIALIZE, None).await.unwrap();
        assert_eq!(result["serverInfo"]["name"], "toolhost-echo");
        assert!(result["capabilities"]["tools"].is_object());
        assert_eq!(result["capabilities"]["resources"]["subscribe"], true);

        let result = call(&echo_server().without_resources(), methods::INITIALIZE, None)
            .await
            .unwrap();
        assert_eq!(result["capabilities"]["resources"], false);
    }

    #[tokio::test]
    async fn test_echo_tool() {
        let result = call(
            &echo_server(),
            methods::TOOLS_CALL,
            Some(json!({"name": "echo", "arguments": {"x": 1}})),
        )
        .await
        .unwrap();
        let result: CallToolResult = serde_json::from_value(result).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.structured_content, Some(json!({"x": 1})));
        assert_eq!(result.text_content(), r#"{"x":1}"#);
    }

    #[tokio::test]
    async fn test_unknown_tool_and_method() {
        let server = echo_server();
        let err = call(&server, methods::TOOLS_CALL, Some(json!({"name": "nope"})))
            .await
            .unwrap_err();
        assert_eq!(err.code, -32602);
        let err = call(&server, "bogus/method", None).await.unwrap_err();
        assert_eq!(err.code, -32601);
    }

    #[tokio::test]
    async fn test_resources_refused_when_not_advertised() {
        let server = echo_server().without_resources();
        let err = call(&server, methods::RESOURCES_LIST, None).await.unwrap_err();
        assert_eq!(err.code, -32601);
    }

    #[tokio::test]
    async fn test_silenced_method_gets_no_reply() {
        let server = echo_server().silence(methods::TOOLS_CALL);
        let reply = server
            .handle(Message::request(1, methods::TOOLS_CALL, Some(json!({"name": "echo"}))))
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_paged_listing() {
        let server = ToolServer::new("paged")
            .with_tool(Tool::new("a", "a"), EchoTool)
            .with_tool(Tool::new("b", "b"), EchoTool)
            .with_tool(Tool::new("c", "c"), EchoTool)
            .with_page_size(2);
        let first = call(&server, methods::TOOLS_LIST, None).await.unwrap();
        assert_eq!(first["tools"].as_array().unwrap().len(), 2);
        assert_eq!(first["nextCursor"], "2");
        let second = call(&server, methods::TOOLS_LIST, Some(json!({"cursor": "2"})))
            .await
            .unwrap();
        assert_eq!(second["tools"].as_array().unwrap().len(), 1);
        assert!(second.get("nextCursor").is_none());
    }

    #[tokio::test]
    async fn test_serve_answers_parse_errors() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let (client, server_end) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_end);
        let task = tokio::spawn(Arc::new(echo_server()).serve(server_read, server_write));

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"{oops\n").await.unwrap();
        let mut lines = BufReader::new(client_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        match Message::decode(line.as_bytes()).unwrap() {
            Message::Response(Response { id, outcome }) => {
                assert!(id.is_none());
                assert_eq!(outcome.unwrap_err().code, -32700);
            }
            other => panic!("unexpected {other:?}"),
        }

        drop(lines);
        drop(client_write);
        task.await.unwrap().unwrap();
    }
}
