use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::RpcError;

/// Envelope encoding version. Only the major half is checked on decode.
pub const ENVELOPE_VERSION: &str = "2.0";

const ENVELOPE_VERSION_KEY: &str = "strand.version";
const ENVELOPE_MESSAGE_KEY: &str = "strand.message";

/// The application-visible part of a message: which method to invoke, with
/// which keyword arguments, against which namespace/version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub args: serde_json::Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Request {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, key: &str, value: Value) -> Self {
        self.args.insert(key.to_string(), value);
        self
    }

    pub fn versioned(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn namespaced(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }
}

/// Full wire message: the request plus context and the internal envelope
/// fields that make request/response correlation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    pub request: Request,
    #[serde(rename = "_context", skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(rename = "_msg_id", skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(rename = "_reply_q", skip_serializing_if = "Option::is_none")]
    pub reply_q: Option<String>,
}

impl Message {
    pub fn new(request: Request, context: Context) -> Self {
        Self {
            request,
            context: Some(context),
            msg_id: None,
            reply_q: None,
        }
    }

    /// Encode for the wire. With `envelope` on, the message is wrapped in
    /// the versioned envelope form; otherwise the bare JSON object is sent.
    pub fn encode(&self, envelope: bool) -> Result<Vec<u8>, RpcError> {
        if envelope {
            let inner = serde_json::to_string(self)
                .map_err(|e| RpcError::Encode(e.to_string()))?;
            let wrapped = serde_json::json!({
                ENVELOPE_VERSION_KEY: ENVELOPE_VERSION,
                ENVELOPE_MESSAGE_KEY: inner,
            });
            serde_json::to_vec(&wrapped)
                .map_err(|e| RpcError::Encode(e.to_string()))
        } else {
            serde_json::to_vec(self).map_err(|e| RpcError::Encode(e.to_string()))
        }
    }

    /// Decode either encoding. Enveloped messages with an unknown major
    /// version are rejected rather than misread.
    pub fn decode(body: &[u8]) -> Result<Self, RpcError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| RpcError::Decode(e.to_string()))?;
        if let Some(inner) = value.get(ENVELOPE_MESSAGE_KEY) {
            let version = value
                .get(ENVELOPE_VERSION_KEY)
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let major = version.split('.').next().unwrap_or("");
            let expected = ENVELOPE_VERSION.split('.').next().unwrap_or("");
            if major != expected {
                return Err(RpcError::Decode(format!(
                    "unsupported envelope version {}",
                    version
                )));
            }
            let inner = inner.as_str().ok_or_else(|| {
                RpcError::Decode("envelope message is not a string".to_string())
            })?;
            return serde_json::from_str(inner)
                .map_err(|e| RpcError::Decode(e.to_string()));
        }
        serde_json::from_value(value).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

/// Failure kinds a reply may carry. This closed enum is the trust boundary:
/// whatever a remote side claims, deserialization can only ever produce one
/// of these, and anything unrecognized lands on `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    Timeout,
    NoSuchMethod,
    UnsupportedVersion,
    InvalidArgs,
    Application,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: RemoteErrorKind,
    pub message: String,
    #[serde(default)]
    pub detail: Value,
}

/// One reply on the direct reply channel. A stream of replies for the same
/// `_msg_id` is terminated by an `ending: true` reply carrying no result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    #[serde(rename = "_msg_id", skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default)]
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    #[serde(default)]
    pub ending: bool,
}

impl Reply {
    pub fn result(msg_id: &str, result: Value) -> Self {
        Self {
            msg_id: Some(msg_id.to_string()),
            result,
            failure: None,
            ending: false,
        }
    }

    pub fn ending(msg_id: &str) -> Self {
        Self {
            msg_id: Some(msg_id.to_string()),
            result: Value::Null,
            failure: None,
            ending: true,
        }
    }

    pub fn failure(msg_id: &str, failure: FailureInfo) -> Self {
        Self {
            msg_id: Some(msg_id.to_string()),
            result: Value::Null,
            failure: Some(failure),
            ending: true,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        serde_json::to_vec(self).map_err(|e| RpcError::Encode(e.to_string()))
    }

    pub fn decode(body: &[u8]) -> Result<Self, RpcError> {
        serde_json::from_slice(body).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        let request = Request::new("echo")
            .arg("value", serde_json::json!(42))
            .versioned("1.2");
        let mut msg = Message::new(request, Context::new());
        msg.msg_id = Some("abc".to_string());
        msg.reply_q = Some("abc".to_string());
        msg
    }

    #[test]
    fn bare_encoding_round_trips() {
        let msg = sample_message();
        let decoded = Message::decode(&msg.encode(false).unwrap()).unwrap();
        assert_eq!(decoded.request.method, "echo");
        assert_eq!(decoded.request.args["value"], serde_json::json!(42));
        assert_eq!(decoded.msg_id.as_deref(), Some("abc"));
    }

    #[test]
    fn enveloped_encoding_round_trips() {
        let msg = sample_message();
        let body = msg.encode(true).unwrap();
        let raw: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(raw["strand.version"], ENVELOPE_VERSION);
        let decoded = Message::decode(&body).unwrap();
        assert_eq!(decoded.request.method, "echo");
        assert_eq!(decoded.request.version.as_deref(), Some("1.2"));
    }

    #[test]
    fn unknown_envelope_version_is_rejected() {
        let body = serde_json::to_vec(&serde_json::json!({
            "strand.version": "9.0",
            "strand.message": "{}",
        }))
        .unwrap();
        assert!(Message::decode(&body).is_err());
    }

    #[test]
    fn unknown_failure_kind_maps_to_unknown() {
        let reply: Reply = serde_json::from_value(serde_json::json!({
            "result": null,
            "failure": {"kind": "exotic_exception", "message": "boom"},
            "ending": true,
        }))
        .unwrap();
        assert_eq!(reply.failure.unwrap().kind, RemoteErrorKind::Unknown);
    }
}
