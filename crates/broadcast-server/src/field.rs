//! Capability seam for the cosmetic field generators.
//!
//! The generators themselves live outside this crate. The service only
//! needs something that turns `(kind, intention, frequency)` into JSON.

use intentcast_protocol::FieldType;

/// Produces decorative field data for a broadcast.
pub trait FieldGenerator: Send + Sync + 'static {
    fn generate_field(&self, kind: FieldType, intention: &str, frequency: f64) -> serde_json::Value;
}

/// Generator that attaches nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopField;

impl FieldGenerator for NoopField {
    fn generate_field(&self, _kind: FieldType, _intention: &str, _frequency: f64) -> serde_json::Value {
        serde_json::Value::Null
    }
}

impl<F> FieldGenerator for F
where
    F: Fn(FieldType, &str, f64) -> serde_json::Value + Send + Sync + 'static,
{
    fn generate_field(&self, kind: FieldType, intention: &str, frequency: f64) -> serde_json::Value {
        self(kind, intention, frequency)
    }
}
