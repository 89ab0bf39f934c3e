use axum::Json;
use serde::Serialize;
use serde_json::{json, Map, Value};

pub fn success(message: impl Into<String>) -> Json<Value> {
    Json(json!({ "success": true, "message": message.into() }))
}

pub fn success_with<T: Serialize>(message: impl Into<String>, data: T) -> Json<Value> {
    let mut envelope = Map::new();
    envelope.insert("success".into(), Value::Bool(true));
    envelope.insert("message".into(), Value::String(message.into()));
    match serde_json::to_value(data) {
        Ok(Value::Object(fields)) => envelope.extend(fields),
        Ok(Value::Null) => {}
        Ok(other) => {
            envelope.insert("data".into(), other);
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize response payload");
        }
    }
    Json(Value::Object(envelope))
}
