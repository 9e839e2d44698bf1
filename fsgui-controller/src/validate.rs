//! Parameter validation against a node type's schema, rejecting with
//! `InvalidParams`. Grounded on
//! `authoring::validate::validate_dto` (collect, don't short-circuit on the
//! first rule — except here a single bad parameter is already enough to
//! reject the whole call, so we do stop at the first failure).

use fsgui_core::error::ConfigurationError;
use fsgui_core::types::{ParamDescriptor, ParamKind, ParamValues, TriggerTree};
use fsgui_core::value::Value;
use uuid::Uuid;

/// Merge `params` over `schema`'s defaults and validate every bound value
/// against its declared kind. Reference kinds (`Ref`, `TriggerTree`) are
/// only checked for well-formedness here; whether they point at a real,
/// existing instance is a `build_node`-time concern (`UnresolvedReference`).
pub fn validate_and_merge(
    type_id: &str,
    schema: &[ParamDescriptor],
    params: &ParamValues,
) -> Result<ParamValues, ConfigurationError> {
    let mut merged = ParamValues::new();
    for desc in schema {
        let value = params.get(&desc.name).cloned().unwrap_or_else(|| desc.default.clone());
        if !kind_matches(&desc.kind, &value) {
            return Err(ConfigurationError::InvalidParams {
                type_id: type_id.to_string(),
                message: format!("parameter \"{}\" does not match its schema", desc.name),
            });
        }
        merged.insert(desc.name.clone(), value);
    }
    Ok(merged)
}

fn kind_matches(kind: &ParamKind, value: &Value) -> bool {
    match kind {
        ParamKind::Int { lower, upper } => matches!(value, Value::Int(i) if i >= lower && i <= upper),
        ParamKind::Float { lower, upper } => value.as_f64().is_some_and(|f| f >= *lower && f <= *upper),
        ParamKind::Bool => matches!(value, Value::Bool(_)),
        ParamKind::String => matches!(value, Value::String(_)),
        ParamKind::Enum(variants) => matches!(value, Value::String(s) if variants.contains(s)),
        ParamKind::List(inner) => match value {
            Value::List(items) => items.iter().all(|item| kind_matches(inner, item)),
            _ => false,
        },
        // The declared default for an unset reference is `Bool(false)`
        // (no sensible default instance id exists); a bound reference is
        // a UUID string.
        ParamKind::Ref(_) => matches!(value, Value::Bool(false)) || matches!(value, Value::String(s) if Uuid::parse_str(s).is_ok()),
        ParamKind::TriggerTree => matches!(value, Value::Bool(false)) || TriggerTree::from_value(value).is_some(),
        ParamKind::TrackGeometry => matches!(value, Value::Bool(false) | Value::String(_)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Vec<ParamDescriptor> {
        vec![
            ParamDescriptor::new("threshold", ParamKind::Float { lower: 0.0, upper: 10.0 }, Value::Float(3.0)),
            ParamDescriptor::new("label", ParamKind::String, Value::String("x".to_string())),
            ParamDescriptor::new(
                "input",
                ParamKind::Ref(fsgui_core::types::Datatype::Float),
                Value::Bool(false),
            ),
        ]
    }

    #[test]
    fn fills_in_defaults_for_missing_params() {
        let merged = validate_and_merge("t", &schema(), &ParamValues::new()).unwrap();
        assert_eq!(merged.get("threshold"), Some(&Value::Float(3.0)));
        assert_eq!(merged.get("input"), Some(&Value::Bool(false)));
    }

    #[test]
    fn rejects_out_of_range_value() {
        let mut params = ParamValues::new();
        params.insert("threshold".to_string(), Value::Float(99.0));
        let err = validate_and_merge("t", &schema(), &params).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidParams { .. }));
    }

    #[test]
    fn rejects_wrong_type() {
        let mut params = ParamValues::new();
        params.insert("label".to_string(), Value::Bool(true));
        let err = validate_and_merge("t", &schema(), &params).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidParams { .. }));
    }

    #[test]
    fn accepts_bound_reference_uuid_string() {
        let mut params = ParamValues::new();
        let id = fsgui_core::types::InstanceId::new();
        params.insert("input".to_string(), Value::String(id.to_string()));
        let merged = validate_and_merge("t", &schema(), &params).unwrap();
        assert_eq!(merged.get("input"), Some(&Value::String(id.to_string())));
    }
}
