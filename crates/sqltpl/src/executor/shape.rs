use crate::Error;
use serde::de::{
    self, value::MapDeserializer, value::SeqDeserializer, DeserializeOwned, IntoDeserializer,
    Visitor,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Row maps column names to stringified values. NULL is "".
pub type Row = BTreeMap<String, String>;
/// ResultSet is the rows of a single statement.
pub type ResultSet = Vec<Row>;

/// Result of a mutating statement.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

/// Shaped is the result of a query, shaped by how many result sets
/// and rows it produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Shaped {
    /// A single result set without rows.
    Empty,
    /// A single result set.
    Rows(ResultSet),
    /// A result set for each statement of a batch.
    Sets(Vec<ResultSet>),
}

impl Shaped {
    pub fn from_sets(mut sets: Vec<ResultSet>) -> Self {
        match sets.len() {
            0 => Shaped::Empty,
            1 => match sets.pop() {
                Some(rows) if !rows.is_empty() => Shaped::Rows(rows),
                _ => Shaped::Empty,
            },
            _ => Shaped::Sets(sets),
        }
    }

    /// The lone value of a single-row, single-column result.
    pub fn scalar(&self) -> Option<&str> {
        match self {
            Shaped::Rows(rows) if rows.len() == 1 && rows[0].len() == 1 => {
                rows[0].values().next().map(String::as_str)
            }
            _ => None,
        }
    }
}

/// Outcome of an execution, decoded into a caller's type with
/// [`Outcome::decode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Affected(ExecResult),
    Selected(Arc<Shaped>),
}

impl Outcome {
    /// Decode the Outcome into `T`. The shape of `T` selects how the
    /// result is read:
    ///
    /// * Scalars read the lone value of a single-row, single-column query,
    ///   parsing it as needed. From a mutating statement, integers read its
    ///   last insert ID if non-zero, and its rows affected otherwise.
    /// * Structs and maps read the first row, or `rows_affected` and
    ///   `last_insert_id` of a mutating statement.
    /// * Sequences read every row, or every result set of a batch.
    /// * `Option` reads None from a query without rows or from an empty value.
    /// * `()` discards the Outcome.
    ///
    /// Reading a scalar, struct, or map from a query without rows fails
    /// with [`Error::RecordNotFound`].
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let node = match self {
            Outcome::Affected(result) => Node::Affected(*result),
            Outcome::Selected(shaped) => match shaped.as_ref() {
                Shaped::Empty => Node::Empty,
                Shaped::Rows(rows) => Node::Rows { rows, unwrap: true },
                Shaped::Sets(sets) => Node::Sets(sets),
            },
        };
        T::deserialize(node).map_err(Into::into)
    }

    pub fn exec_result(&self) -> Option<ExecResult> {
        match self {
            Outcome::Affected(result) => Some(*result),
            Outcome::Selected(_) => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum DecodeError {
    NotFound,
    Custom(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::NotFound => f.write_str("record not found"),
            DecodeError::Custom(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for DecodeError {}

impl de::Error for DecodeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        DecodeError::Custom(msg.to_string())
    }
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::NotFound => Error::RecordNotFound,
            DecodeError::Custom(msg) => Error::Decode(msg),
        }
    }
}

// A position within an Outcome being deserialized.
#[derive(Debug, Clone, Copy)]
enum Node<'a> {
    Affected(ExecResult),
    Count(u64),
    Empty,
    Str(&'a str),
    Row(&'a Row),
    // `unwrap` marks the top-level result set, which deserializes as its
    // lone value when it has exactly one row and column.
    Rows { rows: &'a [Row], unwrap: bool },
    Sets(&'a [ResultSet]),
}

impl<'a> Node<'a> {
    // Integer view of a mutation: its insert ID, else its affected rows.
    fn counted(self) -> Self {
        match self {
            Node::Affected(r) if r.last_insert_id != 0 => Node::Count(r.last_insert_id),
            Node::Affected(r) => Node::Count(r.rows_affected),
            node => node,
        }
    }

    fn scalar(self) -> Result<&'a str, DecodeError> {
        match self {
            Node::Str(s) => Ok(s),
            Node::Empty => Err(DecodeError::NotFound),
            Node::Rows { rows, .. } if rows.is_empty() => Err(DecodeError::NotFound),
            Node::Row(row) if row.len() == 1 => Ok(lone(row)),
            Node::Rows { rows, .. } if rows.len() == 1 && rows[0].len() == 1 => Ok(lone(&rows[0])),
            node => Err(de::Error::custom(format!(
                "expected a single value, got {}",
                node.describe()
            ))),
        }
    }

    fn first_row(self) -> Result<&'a Row, DecodeError> {
        match self {
            Node::Row(row) => Ok(row),
            Node::Rows { rows, .. } => rows.first().ok_or(DecodeError::NotFound),
            Node::Sets(sets) => sets
                .first()
                .and_then(|rows| rows.first())
                .ok_or(DecodeError::NotFound),
            Node::Empty => Err(DecodeError::NotFound),
            node => Err(de::Error::custom(format!(
                "expected a row, got {}",
                node.describe()
            ))),
        }
    }

    fn describe(&self) -> String {
        match self {
            Node::Affected(_) | Node::Count(_) => "the result of a mutating statement".to_string(),
            Node::Empty => "no rows".to_string(),
            Node::Str(s) => format!("value {s:?}"),
            Node::Row(row) => format!("a row of {} columns", row.len()),
            Node::Rows { rows, .. } => format!("{} rows", rows.len()),
            Node::Sets(sets) => format!("{} result sets", sets.len()),
        }
    }
}

fn lone(row: &Row) -> &str {
    row.values().next().map(String::as_str).unwrap_or_default()
}

fn parse_i64(s: &str) -> Result<i64, DecodeError> {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Ok(i);
    }
    match s.parse::<f64>() {
        Ok(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => Ok(f as i64),
        _ => Err(de::Error::custom(format!("cannot parse {s:?} as an integer"))),
    }
}

fn parse_u64(s: &str) -> Result<u64, DecodeError> {
    let s = s.trim();
    if let Ok(u) = s.parse::<u64>() {
        return Ok(u);
    }
    match s.parse::<f64>() {
        Ok(f) if f.fract() == 0.0 && f >= 0.0 && f <= u64::MAX as f64 => Ok(f as u64),
        _ => Err(de::Error::custom(format!(
            "cannot parse {s:?} as an unsigned integer"
        ))),
    }
}

fn parse_bool(s: &str) -> Result<bool, DecodeError> {
    match s.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        s if s.eq_ignore_ascii_case("true") => Ok(true),
        s if s.eq_ignore_ascii_case("false") => Ok(false),
        s => Err(de::Error::custom(format!("cannot parse {s:?} as a bool"))),
    }
}

impl<'a> IntoDeserializer<'a, DecodeError> for Node<'a> {
    type Deserializer = Self;

    fn into_deserializer(self) -> Self {
        self
    }
}

macro_rules! deserialize_signed {
    ($l:lifetime; $($method:ident),*) => {$(
        fn $method<V: Visitor<$l>>(self, visitor: V) -> Result<V::Value, DecodeError> {
            match self.counted() {
                Node::Count(n) => visitor.visit_u64(n),
                node => visitor.visit_i64(parse_i64(node.scalar()?)?),
            }
        }
    )*};
}

macro_rules! deserialize_unsigned {
    ($l:lifetime; $($method:ident),*) => {$(
        fn $method<V: Visitor<$l>>(self, visitor: V) -> Result<V::Value, DecodeError> {
            match self.counted() {
                Node::Count(n) => visitor.visit_u64(n),
                node => visitor.visit_u64(parse_u64(node.scalar()?)?),
            }
        }
    )*};
}

impl<'a> de::Deserializer<'a> for Node<'a> {
    type Error = DecodeError;

    fn deserialize_any<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        match self {
            Node::Affected(_) => self.deserialize_map(visitor),
            Node::Count(n) => visitor.visit_u64(n),
            Node::Empty => visitor.visit_unit(),
            Node::Str(s) => visitor.visit_borrowed_str(s),
            Node::Row(_) => self.deserialize_map(visitor),
            Node::Rows { rows, unwrap: true } if rows.len() == 1 && rows[0].len() == 1 => {
                visitor.visit_borrowed_str(lone(&rows[0]))
            }
            Node::Rows { .. } | Node::Sets(_) => self.deserialize_seq(visitor),
        }
    }

    deserialize_signed!('a; deserialize_i8, deserialize_i16, deserialize_i32, deserialize_i64);
    deserialize_unsigned!('a; deserialize_u8, deserialize_u16, deserialize_u32, deserialize_u64);

    fn deserialize_bool<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        match self.counted() {
            Node::Count(n) => visitor.visit_bool(n != 0),
            node => visitor.visit_bool(parse_bool(node.scalar()?)?),
        }
    }

    fn deserialize_f32<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        self.deserialize_f64(visitor)
    }

    fn deserialize_f64<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        match self.counted() {
            Node::Count(n) => visitor.visit_u64(n),
            node => {
                let s = node.scalar()?;
                let f = s.trim().parse::<f64>().map_err(|_| {
                    <DecodeError as de::Error>::custom(format!("cannot parse {s:?} as a float"))
                })?;
                visitor.visit_f64(f)
            }
        }
    }

    fn deserialize_char<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        self.deserialize_str(visitor)
    }

    fn deserialize_str<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        match self.counted() {
            Node::Count(n) => visitor.visit_string(n.to_string()),
            node => visitor.visit_borrowed_str(node.scalar()?),
        }
    }

    fn deserialize_string<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        visitor.visit_borrowed_bytes(self.scalar()?.as_bytes())
    }

    fn deserialize_byte_buf<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        match self {
            Node::Empty => visitor.visit_none(),
            node if matches!(node.scalar(), Ok("")) => visitor.visit_none(),
            node => visitor.visit_some(node),
        }
    }

    fn deserialize_unit<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'a>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, DecodeError> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'a>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, DecodeError> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        match self {
            Node::Empty => visitor.visit_seq(SeqDeserializer::<_, DecodeError>::new(std::iter::empty::<Node>())),
            Node::Rows { rows, .. } => {
                let mut seq = SeqDeserializer::<_, DecodeError>::new(rows.iter().map(Node::Row));
                let out = visitor.visit_seq(&mut seq)?;
                seq.end()?;
                Ok(out)
            }
            Node::Sets(sets) => {
                let mut seq = SeqDeserializer::<_, DecodeError>::new(sets.iter().map(|rows| Node::Rows {
                    rows,
                    unwrap: false,
                }));
                let out = visitor.visit_seq(&mut seq)?;
                seq.end()?;
                Ok(out)
            }
            Node::Row(row) => {
                let mut seq = SeqDeserializer::<_, DecodeError>::new(row.values().map(|v| Node::Str(v)));
                let out = visitor.visit_seq(&mut seq)?;
                seq.end()?;
                Ok(out)
            }
            node => Err(de::Error::custom(format!(
                "expected rows, got {}",
                node.describe()
            ))),
        }
    }

    fn deserialize_tuple<V: Visitor<'a>>(
        self,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, DecodeError> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'a>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, DecodeError> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        if let Node::Affected(r) = self {
            let mut map = MapDeserializer::<_, DecodeError>::new(
                [
                    ("rows_affected", Node::Count(r.rows_affected)),
                    ("last_insert_id", Node::Count(r.last_insert_id)),
                ]
                .into_iter(),
            );
            let out = visitor.visit_map(&mut map)?;
            map.end()?;
            return Ok(out);
        }
        let row = self.first_row()?;

        let mut map = MapDeserializer::<_, DecodeError>::new(row.iter().map(|(k, v)| (k.as_str(), Node::Str(v))));
        let out = visitor.visit_map(&mut map)?;
        map.end()?;
        Ok(out)
    }

    fn deserialize_struct<V: Visitor<'a>>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, DecodeError> {
        self.deserialize_map(visitor)
    }

    fn deserialize_enum<V: Visitor<'a>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, DecodeError> {
        let s: &'a str = self.scalar()?;
        visitor.visit_enum(s.into_deserializer())
    }

    fn deserialize_identifier<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        self.deserialize_str(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'a>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        visitor.visit_unit()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn selected(sets: Vec<ResultSet>) -> Outcome {
        Outcome::Selected(Arc::new(Shaped::from_sets(sets)))
    }

    #[derive(Deserialize, Debug, PartialEq)]
    #[serde(rename_all = "PascalCase")]
    struct User {
        fid: i64,
        fname: String,
        #[serde(default)]
        fnote: Option<String>,
    }

    #[test]
    fn test_shaping() {
        assert_eq!(Shaped::from_sets(vec![]), Shaped::Empty);
        assert_eq!(Shaped::from_sets(vec![vec![]]), Shaped::Empty);
        assert_eq!(
            Shaped::from_sets(vec![vec![row(&[("a", "1")])]]).scalar(),
            Some("1")
        );
        assert!(matches!(
            Shaped::from_sets(vec![vec![], vec![]]),
            Shaped::Sets(sets) if sets.len() == 2
        ));
    }

    #[test]
    fn test_decode_scalars() {
        let one = selected(vec![vec![row(&[("count(*)", "42")])]]);

        assert_eq!(one.decode::<i64>().unwrap(), 42);
        assert_eq!(one.decode::<u8>().unwrap(), 42);
        assert_eq!(one.decode::<f64>().unwrap(), 42.0);
        assert_eq!(one.decode::<String>().unwrap(), "42");
        assert_eq!(one.decode::<Option<i32>>().unwrap(), Some(42));
        assert_eq!(one.decode::<serde_json::Value>().unwrap(), json!("42"));
        assert_eq!(one.decode::<Vec<i64>>().unwrap(), vec![42]);

        let float = selected(vec![vec![row(&[("sum", "7.0")])]]);
        assert_eq!(float.decode::<i64>().unwrap(), 7);
        let flag = selected(vec![vec![row(&[("ok", "1")])]]);
        assert!(flag.decode::<bool>().unwrap());

        let null = selected(vec![vec![row(&[("max(id)", "")])]]);
        assert_eq!(null.decode::<Option<i64>>().unwrap(), None);

        let word = selected(vec![vec![row(&[("a", "abc")])]]);
        assert!(matches!(word.decode::<i64>(), Err(Error::Decode(_))));
        assert!(matches!(word.decode::<u8>(), Err(Error::Decode(_))));
    }

    #[test]
    fn test_decode_rows() {
        let rows = selected(vec![vec![
            row(&[("Fid", "1"), ("Fname", "张三"), ("Fnote", "")]),
            row(&[("Fid", "2"), ("Fname", "李四"), ("Fnote", "vip")]),
        ]]);

        let users: Vec<User> = rows.decode().unwrap();
        assert_eq!(
            users,
            vec![
                User {
                    fid: 1,
                    fname: "张三".to_string(),
                    fnote: None
                },
                User {
                    fid: 2,
                    fname: "李四".to_string(),
                    fnote: Some("vip".to_string())
                },
            ]
        );

        let first: User = rows.decode().unwrap();
        assert_eq!(first.fid, 1);

        let first: BTreeMap<String, String> = rows.decode().unwrap();
        assert_eq!(first.get("Fname").map(String::as_str), Some("张三"));

        assert!(matches!(rows.decode::<i64>(), Err(Error::Decode(_))));
        assert_eq!(
            rows.decode::<serde_json::Value>().unwrap(),
            json!([
                {"Fid": "1", "Fname": "张三", "Fnote": ""},
                {"Fid": "2", "Fname": "李四", "Fnote": "vip"},
            ])
        );
    }

    #[test]
    fn test_decode_empty() {
        let empty = selected(vec![vec![]]);

        assert!(matches!(empty.decode::<i64>(), Err(Error::RecordNotFound)));
        assert!(matches!(empty.decode::<User>(), Err(Error::RecordNotFound)));
        assert!(matches!(
            empty.decode::<BTreeMap<String, String>>(),
            Err(Error::RecordNotFound)
        ));
        assert_eq!(empty.decode::<Option<User>>().unwrap(), None);
        assert_eq!(empty.decode::<Vec<User>>().unwrap(), vec![]);
        empty.decode::<()>().unwrap();
    }

    #[test]
    fn test_decode_sets() {
        let sets = selected(vec![
            vec![row(&[("n", "1")])],
            vec![row(&[("n", "2")]), row(&[("n", "3")])],
        ]);

        let nested: Vec<Vec<i64>> = sets.decode().unwrap();
        assert_eq!(nested, vec![vec![1], vec![2, 3]]);

        assert_eq!(
            sets.decode::<serde_json::Value>().unwrap(),
            json!([[{"n": "1"}], [{"n": "2"}, {"n": "3"}]])
        );
    }

    #[test]
    fn test_decode_affected() {
        let insert = Outcome::Affected(ExecResult {
            rows_affected: 1,
            last_insert_id: 17,
        });
        let update = Outcome::Affected(ExecResult {
            rows_affected: 3,
            last_insert_id: 0,
        });

        assert_eq!(insert.decode::<u64>().unwrap(), 17);
        assert_eq!(update.decode::<i32>().unwrap(), 3);
        assert_eq!(update.decode::<String>().unwrap(), "3");
        assert!(update.decode::<bool>().unwrap());
        assert_eq!(insert.decode::<ExecResultOut>().unwrap().last_insert_id, 17);
        assert_eq!(
            update.decode::<serde_json::Value>().unwrap(),
            json!({"rows_affected": 3, "last_insert_id": 0})
        );
        assert!(matches!(update.decode::<Vec<User>>(), Err(Error::Decode(_))));
        update.decode::<()>().unwrap();
    }

    #[derive(Deserialize)]
    struct ExecResultOut {
        last_insert_id: u64,
    }

    #[test]
    fn test_decode_enum() {
        #[derive(Deserialize, Debug, PartialEq)]
        #[serde(rename_all = "lowercase")]
        enum Status {
            Active,
            Disabled,
        }
        let status = selected(vec![vec![row(&[("status", "disabled")])]]);
        assert_eq!(status.decode::<Status>().unwrap(), Status::Disabled);

        let bad = selected(vec![vec![row(&[("status", "gone")])]]);
        assert!(matches!(bad.decode::<Status>(), Err(Error::Decode(_))));
    }
}
