use crate::volume::{kind_of, Volume};
use crate::Error;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Reserved Volume key holding the last index allocated by `in`.
pub const IN_INDEX: &str = "__inIndex";

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const ZERO_TIME: &str = "0000-00-00 00:00:00";
pub const PERMANENT_TIME: &str = "3000-12-31 23:59:59";

/// Bind the zero timestamp as `:ZeroTime`.
pub fn zero_time(volume: &mut Volume) -> String {
    bind_fixed(volume, "ZeroTime", ZERO_TIME.to_string())
}

/// Bind the current local time as `:CurrentTime`.
pub fn current_time(volume: &mut Volume) -> String {
    let now = chrono::Local::now().format(TIME_FORMAT).to_string();
    bind_fixed(volume, "CurrentTime", now)
}

/// Bind the far-future "never expires" timestamp as `:PermanentTime`.
pub fn permanent_time(volume: &mut Volume) -> String {
    bind_fixed(volume, "PermanentTime", PERMANENT_TIME.to_string())
}

fn bind_fixed(volume: &mut Volume, name: &str, value: String) -> String {
    volume.set(name, value);
    format!(":{name}")
}

/// Expand `data` into a comma-separated list of `:in_<k>` placeholders,
/// binding each item. `data` is either an array or a comma-separated string.
pub fn in_list(volume: &mut Volume, data: &Value) -> Result<String, Error> {
    match data {
        Value::Array(items) => in_values(volume, items.iter().cloned()),
        Value::String(s) => in_values(volume, s.split(',')),
        other => Err(Error::HelperArgument {
            func: "in",
            expected: "an array or a comma-separated string",
            actual: kind_of(other).to_string(),
        }),
    }
}

/// Bind each of `items` under a fresh `in_<k>` name. Indices are drawn from
/// a counter kept in the Volume itself, so repeated expansions into one
/// Volume never reuse a name.
pub fn in_values<I, V>(volume: &mut Volume, items: I) -> Result<String, Error>
where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
{
    let mut index: u64 = volume.get(IN_INDEX)?.unwrap_or(0);
    let mut placeholders = Vec::new();

    for item in items {
        index += 1;
        let name = format!("in_{index}");
        placeholders.push(format!(":{name}"));
        volume.set(name, item);
    }
    volume.set(IN_INDEX, index);

    Ok(placeholders.join(","))
}

/// Record describes the columns of a row to be inserted.
pub trait Record {
    /// Ordered (column name, value) pairs of this row.
    fn columns(&self) -> Vec<(String, Value)>;
}

impl<R: Record + ?Sized> Record for &R {
    fn columns(&self) -> Vec<(String, Value)> {
        (**self).columns()
    }
}

impl Record for Map<String, Value> {
    fn columns(&self) -> Vec<(String, Value)> {
        self.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

impl<V: Clone + Into<Value>> Record for BTreeMap<String, V> {
    fn columns(&self) -> Vec<(String, Value)> {
        self.iter()
            .map(|(k, v)| (k.clone(), v.clone().into()))
            .collect()
    }
}

/// Serialized adapts any Serialize struct into a Record, using its serialized
/// field names (and so `#[serde(rename = "...")]`) as column names, in
/// declaration order.
pub struct Serialized<T>(pub T);

impl<T: Serialize> Record for Serialized<T> {
    fn columns(&self) -> Vec<(String, Value)> {
        match serde_json::to_value(&self.0) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => Vec::new(),
        }
    }
}

/// Build the column list and VALUES tuples of an INSERT over `rows`,
/// binding every value as `insert_<row>_<column>`.
///
/// Columns are taken from the first row. Later rows are expected to have
/// the same columns; any they lack are bound as null.
pub fn insert<R: Record>(volume: &mut Volume, rows: &[R]) -> Result<String, Error> {
    if rows.is_empty() {
        return Err(Error::HelperArgument {
            func: "insert",
            expected: "at least one row",
            actual: "no rows".to_string(),
        });
    }
    let mut columns: Vec<String> = Vec::new();
    let mut tuples = Vec::with_capacity(rows.len());

    for (index, row) in rows.iter().enumerate() {
        let row = row.columns();
        if index == 0 {
            columns = row.iter().map(|(column, _)| column.clone()).collect();
        }
        let mut values: HashMap<String, Value> = row.into_iter().collect();

        let placeholders: Vec<String> = columns
            .iter()
            .map(|column| {
                let name = format!("insert_{index}_{column}");
                let placeholder = format!(":{name}");
                volume.set(name, values.remove(column).unwrap_or(Value::Null));
                placeholder
            })
            .collect();

        tuples.push(format!("({})", placeholders.join(",")));
    }

    // Leading space lets templates write `insert into t{{insert Rows}}`.
    Ok(format!(
        " (`{}`) values {}",
        columns.join("`,`"),
        tuples.join(",")
    ))
}

/// `insert` over a template argument: a single object, or an array of objects.
pub fn insert_value(volume: &mut Volume, data: &Value) -> Result<String, Error> {
    match data {
        Value::Object(row) => insert(volume, std::slice::from_ref(row)),
        Value::Array(items) => {
            let rows = items
                .iter()
                .map(|item| match item {
                    Value::Object(row) => Ok(row),
                    other => Err(Error::HelperArgument {
                        func: "insert",
                        expected: "an array of objects",
                        actual: format!("an array containing {}", kind_of(other)),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?;

            insert(volume, &rows)
        }
        other => Err(Error::HelperArgument {
            func: "insert",
            expected: "an object or an array of objects",
            actual: kind_of(other).to_string(),
        }),
    }
}
