use crate::ops::{self, Event, Op};
use crate::volume::{kind_of, Volume};
use crate::Error;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

/// Dialect selects the quoting rules of SQL literals.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    #[value(name = "mysql")]
    MySql,
    #[value(name = "sqlite")]
    Sqlite,
}

impl Dialect {
    /// Quote `s` as a string literal.
    pub fn quote(self, s: &str) -> String {
        let mut out = String::with_capacity(s.len() + 2);
        out.push('\'');

        match self {
            Dialect::MySql => {
                for c in s.chars() {
                    match c {
                        '\0' => out.push_str("\\0"),
                        '\'' => out.push_str("\\'"),
                        '"' => out.push_str("\\\""),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\x1a' => out.push_str("\\Z"),
                        c => out.push(c),
                    }
                }
            }
            Dialect::Sqlite => {
                for c in s.chars() {
                    if c == '\'' {
                        out.push('\'');
                    }
                    out.push(c);
                }
            }
        }
        out.push('\'');
        out
    }

    /// Render `value` as a SQL literal.
    pub fn literal(self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => self.quote(s),
            Value::Array(_) | Value::Object(_) => self.quote(&value.to_string()),
        }
    }
}

/// NamedData is a source of named parameter values.
pub trait NamedData {
    /// Flat mapping of parameter names to their values.
    fn named_values(&self) -> Result<Cow<'_, BTreeMap<String, Value>>, Error>;
}

impl NamedData for Volume {
    fn named_values(&self) -> Result<Cow<'_, BTreeMap<String, Value>>, Error> {
        Ok(Cow::Borrowed(self.as_map()))
    }
}

impl NamedData for BTreeMap<String, Value> {
    fn named_values(&self) -> Result<Cow<'_, BTreeMap<String, Value>>, Error> {
        Ok(Cow::Borrowed(self))
    }
}

impl NamedData for HashMap<String, Value> {
    fn named_values(&self) -> Result<Cow<'_, BTreeMap<String, Value>>, Error> {
        Ok(Cow::Owned(
            self.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        ))
    }
}

impl NamedData for Map<String, Value> {
    fn named_values(&self) -> Result<Cow<'_, BTreeMap<String, Value>>, Error> {
        Ok(Cow::Owned(
            self.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        ))
    }
}

/// Fields adapts a Serialize record into NamedData by flattening it.
///
/// Fields of nested objects are lifted to the top level, but never
/// replace a name which the enclosing object binds itself. Among nested
/// objects, earlier fields take precedence over later ones. Nested objects
/// are not themselves bound by their field name.
pub struct Fields<T>(pub T);

impl<T: Serialize> NamedData for Fields<T> {
    fn named_values(&self) -> Result<Cow<'_, BTreeMap<String, Value>>, Error> {
        match serde_json::to_value(&self.0) {
            Ok(Value::Object(map)) => Ok(Cow::Owned(flatten(map))),
            Ok(other) => Err(Error::ParameterSource(kind_of(&other).to_string())),
            Err(err) => Err(Error::ParameterSource(err.to_string())),
        }
    }
}

fn flatten(map: Map<String, Value>) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    let mut nested = Vec::new();

    for (name, value) in map {
        match value {
            Value::Object(inner) => nested.push(inner),
            value => {
                out.insert(name, value);
            }
        }
    }
    for inner in nested {
        for (name, value) in flatten(inner) {
            out.entry(name).or_insert(value);
        }
    }
    out
}

/// Resolver binds named SQL to its data, producing literal SQL.
#[derive(Clone)]
pub struct Resolver {
    dialect: Dialect,
    handler: ops::Handler,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("dialect", &self.dialect)
            .finish()
    }
}

impl Resolver {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            handler: ops::tracing_handler(),
        }
    }

    pub fn with_handler(self, handler: ops::Handler) -> Self {
        Self { handler, ..self }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Resolve `named_sql` against `data`, emitting an ops Event.
    pub fn to_sql<D: NamedData + ?Sized>(&self, named_sql: &str, data: &D) -> Result<String, Error> {
        let mut event = Event::begin(Op::Resolve, named_sql);
        let result = to_sql(self.dialect, named_sql, data);

        event.output = result.as_ref().ok().cloned();
        (self.handler)(&event.finish(result.as_ref().err()));

        result
    }
}

/// Collapse every run of whitespace into a single space, and trim.
pub fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize `named_sql` and replace each of its `:name` placeholders
/// with the literal of its value in `data`.
///
/// `::` is an escaped `:`, and `:=` is passed through. Text within quotes
/// or backticks is copied as-is.
pub fn to_sql<D: NamedData + ?Sized>(
    dialect: Dialect,
    named_sql: &str,
    data: &D,
) -> Result<String, Error> {
    let values = data.named_values()?;
    let sql = normalize(named_sql);

    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                out.push(c);
                while let Some((_, q)) = chars.next() {
                    out.push(q);
                    if q == '\\' && c != '`' {
                        if let Some((_, escaped)) = chars.next() {
                            out.push(escaped);
                        }
                    } else if q == c {
                        break;
                    }
                }
            }
            ':' => match chars.peek().map(|(_, next)| *next) {
                Some(':') => {
                    chars.next();
                    out.push(':');
                }
                Some('=') => {
                    chars.next();
                    out.push_str(":=");
                }
                _ => {
                    let mut name = String::new();
                    while let Some(&(_, n)) = chars.peek() {
                        if !is_name_char(n) {
                            break;
                        }
                        name.push(n);
                        chars.next();
                    }
                    if name.is_empty() {
                        return Err(Error::ParameterSyntax {
                            offset,
                            reason: "expected a parameter name after `:`",
                        });
                    }
                    if let Some(&(offset, ':')) = chars.peek() {
                        return Err(Error::ParameterSyntax {
                            offset,
                            reason: "unexpected `:` while reading a parameter name",
                        });
                    }
                    let Some(value) = values.get(&name) else {
                        return Err(missing(name, &values));
                    };
                    out.push_str(&dialect.literal(value));
                }
            },
            c => out.push(c),
        }
    }
    Ok(out)
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}

fn missing(name: String, values: &BTreeMap<String, Value>) -> Error {
    let closest = values
        .keys()
        .map(|key| (strsim::osa_distance(&name, key), key))
        .filter(|(distance, _)| *distance <= 3)
        .min()
        .map(|(_, key)| key.clone());

    Error::ParameterMissing { name, closest }
}
