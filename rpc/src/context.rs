use serde::{Deserialize, Serialize};

/// Caller identity and request metadata, serialized alongside every message
/// and reconstructed on the receiving side. Immutable once built; crosses
/// the wire by value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Context {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            request_id: Some(strand_utils::uuid()),
            ..Default::default()
        }
    }

    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_dict(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_every_field() {
        let ctx = Context {
            user: Some("alice".to_string()),
            tenant: Some("acme".to_string()),
            is_admin: true,
            read_only: false,
            request_id: Some("req-1".to_string()),
        };
        let restored = Context::from_dict(ctx.to_dict()).unwrap();
        assert_eq!(ctx, restored);
    }

    #[test]
    fn missing_fields_default() {
        let restored =
            Context::from_dict(serde_json::json!({"user": "bob"})).unwrap();
        assert_eq!(restored.user.as_deref(), Some("bob"));
        assert!(!restored.is_admin);
        assert_eq!(restored.request_id, None);
    }
}
