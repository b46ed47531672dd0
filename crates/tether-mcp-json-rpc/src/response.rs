use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JsonRpcErrorObject;
use crate::types::{JsonRpcVersion, RequestId};

/// Outcome carried by a response: exactly one of `result` or `error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponsePayload {
    /// Success result with data
    Result(Value),
    /// Peer-reported failure
    Error(JsonRpcErrorObject),
}

impl ResponsePayload {
    pub fn is_error(&self) -> bool {
        matches!(self, ResponsePayload::Error(_))
    }

    pub fn into_result(self) -> Result<Value, JsonRpcErrorObject> {
        match self {
            ResponsePayload::Result(value) => Ok(value),
            ResponsePayload::Error(error) => Err(error),
        }
    }
}

/// A JSON-RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(rename = "jsonrpc")]
    pub version: JsonRpcVersion,
    pub id: RequestId,
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl JsonRpcResponse {
    pub fn new(id: RequestId, payload: ResponsePayload) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            id,
            payload,
        }
    }

    pub fn success(id: RequestId, result: Value) -> Self {
        Self::new(id, ResponsePayload::Result(result))
    }

    pub fn error(id: RequestId, error: JsonRpcErrorObject) -> Self {
        Self::new(id, ResponsePayload::Error(error))
    }

    pub fn is_error(&self) -> bool {
        self.payload.is_error()
    }
}
