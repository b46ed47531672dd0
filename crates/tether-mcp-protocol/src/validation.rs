//! Message validation
//!
//! Everything that arrives from the peer passes through [`MessageValidator::parse`]
//! before the client looks at it. The validator is pure: it never touches
//! connection state and reports failures as a [`ValidationError`] carrying the
//! path of the offending field.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use tether_mcp_json_rpc::{
    JSONRPC_VERSION, JsonRpcErrorObject, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, ResponsePayload,
};

use crate::resources::Resource;
use crate::tools::Tool;

lazy_static! {
    static ref METHOD_NAME: Regex =
        Regex::new(r"^[A-Za-z][A-Za-z0-9_/]*$").expect("method name pattern compiles");
}

/// Resource-safety caps applied to every message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    /// Serialized size cap in bytes
    pub max_message_size: usize,
    pub max_method_length: usize,
    pub max_tool_name_length: usize,
    pub max_tool_description_length: usize,
    pub max_uri_length: usize,
    pub max_tools: usize,
    pub max_resources: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024, // 10MB
            max_method_length: 128,
            max_tool_name_length: 128,
            max_tool_description_length: 4096,
            max_uri_length: 2048,
            max_tools: 1000,
            max_resources: 10_000,
        }
    }
}

/// A rejected message, with the path of the field at fault
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("invalid message at '{path}': {reason}")]
pub struct ValidationError {
    pub path: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates raw frames and outbound envelopes against [`ValidationLimits`]
#[derive(Debug, Clone, Default)]
pub struct MessageValidator {
    limits: ValidationLimits,
}

impl MessageValidator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    /// Parse a raw inbound frame into a typed message
    pub fn parse(&self, raw: &str) -> ValidationResult<JsonRpcMessage> {
        self.check_size(raw.len())?;
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ValidationError::new("message", format!("not valid JSON: {}", e)))?;
        self.classify(value)
    }

    /// Classify an already-decoded JSON value
    pub fn classify(&self, value: Value) -> ValidationResult<JsonRpcMessage> {
        let Value::Object(mut object) = value else {
            return Err(ValidationError::new("message", "must be a JSON object"));
        };

        match object.get("jsonrpc") {
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            _ => {
                return Err(ValidationError::new(
                    "jsonrpc",
                    format!("must be \"{}\"", JSONRPC_VERSION),
                ));
            }
        }

        if object.contains_key("method") {
            let method = match object.remove("method") {
                Some(Value::String(method)) => method,
                _ => return Err(ValidationError::new("method", "must be a string")),
            };
            self.validate_method_name(&method)?;
            let params = take_params(&mut object)?;

            return match object.remove("id") {
                Some(id) => Ok(JsonRpcMessage::Request(JsonRpcRequest::new(
                    parse_id(&id)?,
                    method,
                    params,
                ))),
                None => Ok(JsonRpcMessage::Notification(JsonRpcNotification::new(
                    method, params,
                ))),
            };
        }

        let id = match object.get("id") {
            Some(id) => parse_id(id)?,
            None => return Err(ValidationError::new("id", "response must carry an id")),
        };

        let payload = match (object.remove("result"), object.remove("error")) {
            (Some(result), None) => ResponsePayload::Result(result),
            (None, Some(error)) => ResponsePayload::Error(parse_error_object(error)?),
            _ => {
                return Err(ValidationError::new(
                    "result/error",
                    "response must contain exactly one of 'result' or 'error'",
                ));
            }
        };

        Ok(JsonRpcMessage::Response(JsonRpcResponse::new(id, payload)))
    }

    /// Validate an outbound message and serialize it
    pub fn serialize_outbound(&self, message: &JsonRpcMessage) -> ValidationResult<String> {
        match message {
            JsonRpcMessage::Request(request) => {
                self.validate_method_name(&request.method)?;
                check_params(request.params.as_ref())?;
            }
            JsonRpcMessage::Notification(notification) => {
                self.validate_method_name(&notification.method)?;
                check_params(notification.params.as_ref())?;
            }
            JsonRpcMessage::Response(_) => {}
        }

        let text = serde_json::to_string(message)
            .map_err(|e| ValidationError::new("message", format!("cannot serialize: {}", e)))?;
        self.check_size(text.len())?;
        Ok(text)
    }

    pub fn validate_method_name(&self, method: &str) -> ValidationResult<()> {
        if method.len() > self.limits.max_method_length {
            return Err(ValidationError::new(
                "method",
                format!(
                    "length {} exceeds maximum {}",
                    method.len(),
                    self.limits.max_method_length
                ),
            ));
        }
        if !METHOD_NAME.is_match(method) {
            return Err(ValidationError::new(
                "method",
                format!("'{}' is not a valid method name", method),
            ));
        }
        Ok(())
    }

    /// Check a tool name the caller is about to invoke
    pub fn validate_tool_name(&self, name: &str) -> ValidationResult<()> {
        check_text(
            "params.name",
            name,
            self.limits.max_tool_name_length,
            false,
        )
    }

    /// Check a resource URI the caller is about to read
    pub fn validate_uri(&self, uri: &str) -> ValidationResult<()> {
        check_text("params.uri", uri, self.limits.max_uri_length, false)
    }

    /// Check a tool list received from the server
    pub fn validate_tools(&self, tools: &[Tool]) -> ValidationResult<()> {
        if tools.len() > self.limits.max_tools {
            return Err(ValidationError::new(
                "tools",
                format!(
                    "{} tools exceeds maximum {}",
                    tools.len(),
                    self.limits.max_tools
                ),
            ));
        }
        for (index, tool) in tools.iter().enumerate() {
            check_text(
                &format!("tools[{}].name", index),
                &tool.name,
                self.limits.max_tool_name_length,
                false,
            )?;
            if let Some(description) = &tool.description {
                check_text(
                    &format!("tools[{}].description", index),
                    description,
                    self.limits.max_tool_description_length,
                    true,
                )?;
            }
        }
        Ok(())
    }

    /// Check a resource list received from the server
    pub fn validate_resources(&self, resources: &[Resource]) -> ValidationResult<()> {
        if resources.len() > self.limits.max_resources {
            return Err(ValidationError::new(
                "resources",
                format!(
                    "{} resources exceeds maximum {}",
                    resources.len(),
                    self.limits.max_resources
                ),
            ));
        }
        for (index, resource) in resources.iter().enumerate() {
            check_text(
                &format!("resources[{}].uri", index),
                &resource.uri,
                self.limits.max_uri_length,
                false,
            )?;
        }
        Ok(())
    }

    fn check_size(&self, size: usize) -> ValidationResult<()> {
        if size > self.limits.max_message_size {
            return Err(ValidationError::new(
                "message",
                format!(
                    "{} bytes exceeds maximum {} bytes",
                    size, self.limits.max_message_size
                ),
            ));
        }
        Ok(())
    }
}

fn parse_id(value: &Value) -> ValidationResult<RequestId> {
    match value {
        Value::String(id) => Ok(RequestId::String(id.clone())),
        Value::Number(number) => number
            .as_i64()
            .map(RequestId::Number)
            .ok_or_else(|| ValidationError::new("id", "numeric id must be an integer")),
        _ => Err(ValidationError::new("id", "must be a string or integer")),
    }
}

fn take_params(object: &mut Map<String, Value>) -> ValidationResult<Option<Value>> {
    let params = object.remove("params");
    check_params(params.as_ref())?;
    Ok(params)
}

fn check_params(params: Option<&Value>) -> ValidationResult<()> {
    match params {
        None | Some(Value::Object(_)) => Ok(()),
        Some(_) => Err(ValidationError::new("params", "must be an object")),
    }
}

fn parse_error_object(value: Value) -> ValidationResult<JsonRpcErrorObject> {
    let Value::Object(mut error) = value else {
        return Err(ValidationError::new("error", "must be an object"));
    };
    let code = error
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| ValidationError::new("error.code", "must be an integer"))?;
    let message = match error.remove("message") {
        Some(Value::String(message)) => message,
        _ => return Err(ValidationError::new("error.message", "must be a string")),
    };
    Ok(JsonRpcErrorObject {
        code,
        message,
        data: error.remove("data"),
    })
}

fn check_text(path: &str, text: &str, max_len: usize, allow_empty: bool) -> ValidationResult<()> {
    if !allow_empty && text.is_empty() {
        return Err(ValidationError::new(path, "must not be empty"));
    }
    if text.len() > max_len {
        return Err(ValidationError::new(
            path,
            format!("length {} exceeds maximum {}", text.len(), max_len),
        ));
    }
    Ok(())
}
