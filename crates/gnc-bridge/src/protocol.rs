//! rosbridge v2 JSON envelopes.
//!
//! Only the ops the dashboard needs are modelled.  Everything the broker
//! sends that is not recognised decodes to [`Inbound::Unknown`] and is
//! ignored by the session.

use gnc_types::GncError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent to the broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Outbound {
    CallService {
        id: String,
        service: String,
        args: Value,
    },
    Subscribe {
        id: String,
        topic: String,
        #[serde(rename = "type")]
        msg_type: String,
    },
    Unsubscribe {
        id: String,
        topic: String,
    },
    Publish {
        topic: String,
        msg: Value,
    },
}

/// Frames received from the broker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Inbound {
    Publish {
        topic: String,
        #[serde(default)]
        msg: Value,
    },
    ServiceResponse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        service: String,
        #[serde(default)]
        values: Value,
        // rosbridge 1.x omits `result`; absence means the call went through.
        #[serde(default = "default_result")]
        result: bool,
    },
    Status {
        #[serde(default)]
        level: Option<String>,
        #[serde(default)]
        msg: String,
    },
    #[serde(other)]
    Unknown,
}

fn default_result() -> bool {
    true
}

/// Serialise an outbound frame to its JSON text.
pub fn encode(frame: &Outbound) -> Result<String, GncError> {
    serde_json::to_string(frame).map_err(|e| GncError::Serialization(e.to_string()))
}

/// Parse a text frame from the broker.
pub fn decode(text: &str) -> Result<Inbound, GncError> {
    serde_json::from_str(text).map_err(|e| GncError::Serialization(e.to_string()))
}

/// The `success` flag carried inside a service response's `values`, if the
/// service reports one (e.g. `std_srvs/SetBool`).  Services without the field
/// are treated as successful.
pub fn values_success(values: &Value) -> bool {
    values
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

/// Best-effort human-readable reason from a failed service response.
pub fn failure_message(values: &Value) -> String {
    match values {
        Value::String(s) => s.clone(),
        Value::Null => "service call failed".to_string(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_service_envelope_shape() {
        let text = encode(&Outbound::CallService {
            id: "call:1".to_string(),
            service: "/gnc/set_mode".to_string(),
            args: json!({ "mode": "Thruster" }),
        })
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["op"], "call_service");
        assert_eq!(value["service"], "/gnc/set_mode");
        assert_eq!(value["args"]["mode"], "Thruster");
        assert_eq!(value["id"], "call:1");
    }

    #[test]
    fn subscribe_envelope_uses_type_key() {
        let text = encode(&Outbound::Subscribe {
            id: "sub:1".to_string(),
            topic: "/gnc/control_mode".to_string(),
            msg_type: "std_msgs/String".to_string(),
        })
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["op"], "subscribe");
        assert_eq!(value["type"], "std_msgs/String");
        assert!(value.get("msg_type").is_none());
    }

    #[test]
    fn decode_publish() {
        let frame =
            decode(r#"{"op":"publish","topic":"/gnc/control_mode","msg":{"data":"Torque"}}"#)
                .unwrap();
        assert_eq!(
            frame,
            Inbound::Publish {
                topic: "/gnc/control_mode".to_string(),
                msg: json!({ "data": "Torque" }),
            }
        );
    }

    #[test]
    fn decode_service_response_without_result_defaults_to_true() {
        let frame = decode(r#"{"op":"service_response","id":"c1","values":{"success":false}}"#)
            .unwrap();
        match frame {
            Inbound::ServiceResponse { id, result, values, .. } => {
                assert_eq!(id.as_deref(), Some("c1"));
                assert!(result);
                assert!(!values_success(&values));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_op_is_tolerated() {
        let frame = decode(r#"{"op":"png","data":"..."}"#).unwrap();
        assert_eq!(frame, Inbound::Unknown);
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        assert!(matches!(decode("{not json"), Err(GncError::Serialization(_))));
    }

    #[test]
    fn failure_message_prefers_message_field() {
        assert_eq!(failure_message(&json!({ "message": "mode locked" })), "mode locked");
        assert_eq!(failure_message(&json!("no such service")), "no such service");
        assert_eq!(failure_message(&Value::Null), "service call failed");
    }
}
