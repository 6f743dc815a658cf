//! Data-driven parameter schema validation
//!
//! Tool parameters are described by a JSON-schema-like structure and
//! validated without any reflection: type, numeric range, enum
//! membership, array item shape, and nested object shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Primitive kind of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

/// Schema for a single parameter value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSchema {
    #[serde(rename = "type")]
    pub kind: ParamKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    /// Allowed values; any JSON value can appear.
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    /// Item schema for arrays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParamSchema>>,
    /// Property schemas for objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, ParamSchema>>,
}

impl ParamSchema {
    pub fn string() -> Self {
        Self::of(ParamKind::String)
    }

    pub fn integer() -> Self {
        Self::of(ParamKind::Integer)
    }

    pub fn number() -> Self {
        Self::of(ParamKind::Number)
    }

    pub fn boolean() -> Self {
        Self::of(ParamKind::Boolean)
    }

    pub fn array_of(items: ParamSchema) -> Self {
        let mut schema = Self::of(ParamKind::Array);
        schema.items = Some(Box::new(items));
        schema
    }

    fn of(kind: ParamKind) -> Self {
        Self {
            kind,
            description: None,
            minimum: None,
            maximum: None,
            allowed: None,
            items: None,
            properties: None,
        }
    }

    pub fn with_range(mut self, minimum: f64, maximum: f64) -> Self {
        self.minimum = Some(minimum);
        self.maximum = Some(maximum);
        self
    }

    pub fn with_allowed(mut self, allowed: Vec<Value>) -> Self {
        self.allowed = Some(allowed);
        self
    }
}

/// Validate one value against its schema, appending any problems to
/// `errors`. `path` names the value in error messages.
pub fn validate_value(path: &str, value: &Value, schema: &ParamSchema, errors: &mut Vec<String>) {
    match schema.kind {
        ParamKind::String => {
            if !value.is_string() {
                errors.push(format!("{}: expected string", path));
                return;
            }
        }
        ParamKind::Integer => {
            if !value.is_i64() && !value.is_u64() {
                errors.push(format!("{}: expected integer", path));
                return;
            }
        }
        ParamKind::Number => {
            if !value.is_number() {
                errors.push(format!("{}: expected number", path));
                return;
            }
        }
        ParamKind::Boolean => {
            if !value.is_boolean() {
                errors.push(format!("{}: expected boolean", path));
                return;
            }
        }
        ParamKind::Array => {
            let Some(items) = value.as_array() else {
                errors.push(format!("{}: expected array", path));
                return;
            };
            if let Some(item_schema) = &schema.items {
                for (i, item) in items.iter().enumerate() {
                    validate_value(&format!("{}[{}]", path, i), item, item_schema, errors);
                }
            }
        }
        ParamKind::Object => {
            let Some(object) = value.as_object() else {
                errors.push(format!("{}: expected object", path));
                return;
            };
            if let Some(properties) = &schema.properties {
                for (key, prop_schema) in properties {
                    if let Some(prop) = object.get(key) {
                        validate_value(&format!("{}.{}", path, key), prop, prop_schema, errors);
                    }
                }
            }
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(minimum) = schema.minimum {
            if number < minimum {
                errors.push(format!("{}: {} is below minimum {}", path, number, minimum));
            }
        }
        if let Some(maximum) = schema.maximum {
            if number > maximum {
                errors.push(format!("{}: {} is above maximum {}", path, number, maximum));
            }
        }
    }

    if let Some(allowed) = &schema.allowed {
        if !allowed.contains(value) {
            errors.push(format!("{}: value not in allowed set", path));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn errors_for(value: Value, schema: &ParamSchema) -> Vec<String> {
        let mut errors = Vec::new();
        validate_value("p", &value, schema, &mut errors);
        errors
    }

    #[test]
    fn type_mismatches_are_reported() {
        assert!(!errors_for(json!(3), &ParamSchema::string()).is_empty());
        assert!(!errors_for(json!("x"), &ParamSchema::integer()).is_empty());
        assert!(errors_for(json!(3), &ParamSchema::integer()).is_empty());
        assert!(errors_for(json!(3.5), &ParamSchema::number()).is_empty());
    }

    #[test]
    fn numeric_range_is_enforced() {
        let schema = ParamSchema::number().with_range(0.0, 1.0);
        assert!(errors_for(json!(0.5), &schema).is_empty());
        assert!(!errors_for(json!(1.5), &schema).is_empty());
        assert!(!errors_for(json!(-0.1), &schema).is_empty());
    }

    #[test]
    fn enum_membership_is_enforced() {
        let schema =
            ParamSchema::string().with_allowed(vec![json!("pearson"), json!("spearman")]);
        assert!(errors_for(json!("pearson"), &schema).is_empty());
        assert!(!errors_for(json!("kendall"), &schema).is_empty());
    }

    #[test]
    fn array_items_are_validated() {
        let schema = ParamSchema::array_of(ParamSchema::string());
        assert!(errors_for(json!(["a", "b"]), &schema).is_empty());
        let errors = errors_for(json!(["a", 2]), &schema);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("p[1]"));
    }

    #[test]
    fn nested_object_shapes_are_validated() {
        let mut properties = HashMap::new();
        properties.insert("bins".to_string(), ParamSchema::integer().with_range(1.0, 100.0));
        let schema = ParamSchema {
            properties: Some(properties),
            ..ParamSchema::of(ParamKind::Object)
        };
        assert!(errors_for(json!({"bins": 10}), &schema).is_empty());
        assert!(!errors_for(json!({"bins": 1000}), &schema).is_empty());
    }
}
