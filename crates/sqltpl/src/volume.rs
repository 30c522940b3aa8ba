use crate::{Error, Fatal};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Volume is the bag of named parameter values produced while rendering
/// a template. Template helpers write values into the Volume and splice
/// `:name` placeholders into the rendered SQL, which are later resolved
/// against the same Volume.
///
/// A Volume belongs to a single render pass. It's not synchronized, and
/// concurrent renders must each use their own Volume.
#[derive(Debug, Default, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Volume {
    values: BTreeMap<String, Value>,
}

impl Volume {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a Volume from the top-level properties of a serializable record.
    /// Non-object records produce an error rather than an empty Volume.
    pub fn from_serialize<T: Serialize>(record: &T) -> Result<Self, Error> {
        match serde_json::to_value(record) {
            Ok(Value::Object(map)) => Ok(Self {
                values: map.into_iter().collect(),
            }),
            Ok(other) => Err(Error::ParameterSource(kind_of(&other).to_string())),
            Err(err) => Err(Error::ParameterSource(err.to_string())),
        }
    }

    /// Set `name` to `value`, replacing any prior value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    /// Set `name` to the serialization of `value`.
    pub fn set_serialized<T: Serialize>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<(), Error> {
        let name = name.into();
        let value = serde_json::to_value(value).map_err(|err| Error::HelperArgument {
            func: "set_serialized",
            expected: "a JSON-serializable value",
            actual: format!("{name}: {err}"),
        })?;
        self.values.insert(name, value);
        Ok(())
    }

    /// Fetch `name` as a `T`, returning Ok(None) if it's not set.
    ///
    /// A name which is set to null is found only by targets which accept
    /// null, such as `Option<U>` (yielding `Some(None)`). Other targets read
    /// a null value as Ok(None), the same as an unset name; use
    /// [`Volume::contains`] to tell the two apart.
    ///
    /// Conversion is best-effort: the value is first decoded as-is, then
    /// (for strings) parsed as a JSON scalar so that "42" or "true" can
    /// populate numeric and boolean targets, and finally (for scalars)
    /// stringified so that numbers can populate string targets.
    /// A value which can't be converted by any of these is a programming
    /// error, reported as [`Fatal::Conversion`].
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, Error> {
        let Some(value) = self.values.get(name) else {
            return Ok(None);
        };
        if value.is_null() {
            return Ok(serde_json::from_value(Value::Null).ok());
        }
        convert(value)
            .map(Some)
            .ok_or_else(|| {
                Fatal::Conversion {
                    name: name.to_string(),
                    value: value.to_string(),
                    target: std::any::type_name::<T>(),
                }
                .into()
            })
    }

    /// Raw value of `name`, if set.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Volume {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn convert<T: DeserializeOwned>(value: &Value) -> Option<T> {
    if let Ok(out) = serde_json::from_value(value.clone()) {
        return Some(out);
    }
    match value {
        Value::String(s) => match serde_json::from_str::<Value>(s.trim()) {
            Ok(parsed @ (Value::Number(_) | Value::Bool(_))) => serde_json::from_value(parsed).ok(),
            _ => None,
        },
        Value::Number(_) | Value::Bool(_) => {
            serde_json::from_value(Value::String(value.to_string())).ok()
        }
        _ => None,
    }
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
