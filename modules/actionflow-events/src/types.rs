//! The action record. Domain-agnostic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::InvalidActionError;

/// A typed message flowing through the agent.
///
/// `type` is mandatory; every other field is open-ended JSON. Actions are
/// immutable once dispatched and compared by occurrence, not by value, so
/// `PartialEq` exists for tests and assertions only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Action {
    action_type: String,
    fields: Map<String, Value>,
}

impl Action {
    /// Create an action with no fields beyond its type.
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            fields: Map::new(),
        }
    }

    /// Set a field. A `type` key here never overrides the discriminator.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Set the conventional `payload` field.
    pub fn with_payload(self, payload: impl Into<Value>) -> Self {
        self.with("payload", payload)
    }

    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn payload(&self) -> Option<&Value> {
        self.fields.get("payload")
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Check the discriminator. `Action::new("")` is constructible but never
    /// dispatchable.
    pub fn validate(&self) -> Result<(), InvalidActionError> {
        if self.action_type.is_empty() {
            return Err(InvalidActionError::EmptyType);
        }
        Ok(())
    }

    /// JSON form: the fields plus `type`.
    pub fn to_value(&self) -> Value {
        Value::from(self.clone())
    }
}

impl TryFrom<Value> for Action {
    type Error = InvalidActionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let mut fields = match value {
            Value::Object(map) => map,
            Value::Null => return Err(InvalidActionError::NotAnObject("null")),
            Value::Bool(_) => return Err(InvalidActionError::NotAnObject("a boolean")),
            Value::Number(_) => return Err(InvalidActionError::NotAnObject("a number")),
            Value::String(_) => return Err(InvalidActionError::NotAnObject("a string")),
            Value::Array(_) => return Err(InvalidActionError::NotAnObject("an array")),
        };

        let action_type = match fields.remove("type") {
            Some(Value::String(t)) => t,
            _ => return Err(InvalidActionError::MissingType),
        };

        let action = Self {
            action_type,
            fields,
        };
        action.validate()?;
        Ok(action)
    }
}

impl From<Action> for Value {
    fn from(action: Action) -> Self {
        let mut map = action.fields;
        map.insert("type".to_string(), Value::String(action.action_type));
        Value::Object(map)
    }
}
