//! Typed tree of MI values.
//!
//! A tuple is an ordered sequence of `(name, value)` pairs, not a map: names
//! may repeat and every lookup is a linear scan in declaration order. When a
//! name repeats at the same level, single-value lookups return the first
//! occurrence and `find_all` returns every occurrence.

use std::{fmt, num::IntErrorKind};

use crate::error::FieldAccessError;

/// One MI value: a constant string, a tuple, or a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Const(String),
    Tuple(Tuple),
    List(List),
}

impl Value {
    /// The string content if this is a constant.
    #[must_use]
    pub fn as_const(&self) -> Option<&str> {
        match self {
            Self::Const(s) => Some(s),
            _ => None,
        }
    }

    /// The tuple if this is a tuple.
    #[must_use]
    pub const fn as_tuple(&self) -> Option<&Tuple> {
        match self {
            Self::Tuple(t) => Some(t),
            _ => None,
        }
    }

    /// The list if this is a list.
    #[must_use]
    pub const fn as_list(&self) -> Option<&List> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }
}

/// A `name=value` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedValue {
    pub name: String,
    pub value: Value,
}

impl NamedValue {
    /// Create a named value.
    #[must_use]
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// An ordered sequence of named values: `{a="1",b={...}}`.
///
/// Result records and async records carry their payload as a `Tuple`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tuple {
    entries: Vec<NamedValue>,
}

/// A list, either of bare values (`["a","b"]`, `[{..},{..}]`) or of named
/// values (`[frame={..},frame={..}]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum List {
    Values(Vec<Value>),
    Results(Vec<NamedValue>),
}

fn find_in<'a>(entries: &'a [NamedValue], name: &str) -> Option<&'a Value> {
    entries.iter().find(|e| e.name == name).map(|e| &e.value)
}

fn find_all_in<'a>(entries: &'a [NamedValue], name: &'a str) -> impl Iterator<Item = &'a Value> {
    entries
        .iter()
        .filter(move |e| e.name == name)
        .map(|e| &e.value)
}

impl Tuple {
    /// Create a tuple from its entries, preserving their order.
    #[must_use]
    pub const fn new(entries: Vec<NamedValue>) -> Self {
        Self { entries }
    }

    /// Append an entry.
    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.entries.push(NamedValue::new(name, value));
    }

    /// Entries in declaration order.
    #[must_use]
    pub fn entries(&self) -> &[NamedValue] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedValue> {
        self.entries.iter()
    }

    /// First value named `name`.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Value> {
        find_in(&self.entries, name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Every value named `name`, in order.
    pub fn find_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Value> {
        find_all_in(&self.entries, name)
    }

    /// Number of entries named `name`.
    #[must_use]
    pub fn count_of(&self, name: &str) -> usize {
        self.find_all(name).count()
    }

    /// First value named `name`, failing if absent.
    ///
    /// # Errors
    /// `FieldAccessError::Missing` if no entry has that name.
    pub fn get(&self, name: &str) -> Result<&Value, FieldAccessError> {
        self.find(name).ok_or_else(|| FieldAccessError::Missing {
            name: name.to_string(),
        })
    }

    /// String content of the constant named `name`.
    ///
    /// # Errors
    /// `Missing` if absent, `WrongType` if the value is a tuple or list.
    pub fn find_str(&self, name: &str) -> Result<&str, FieldAccessError> {
        let value = self.get(name)?;
        value.as_const().ok_or_else(|| wrong_type(name, "string"))
    }

    /// Lenient variant of [`find_str`](Self::find_str): empty when absent or
    /// not a constant.
    #[must_use]
    pub fn try_find_str(&self, name: &str) -> &str {
        self.find(name).and_then(Value::as_const).unwrap_or_default()
    }

    /// # Errors
    /// `Missing` if absent, `WrongType` if the value is not a tuple.
    pub fn find_tuple(&self, name: &str) -> Result<&Self, FieldAccessError> {
        let value = self.get(name)?;
        value.as_tuple().ok_or_else(|| wrong_type(name, "tuple"))
    }

    #[must_use]
    pub fn try_find_tuple(&self, name: &str) -> Option<&Self> {
        self.find(name).and_then(Value::as_tuple)
    }

    /// # Errors
    /// `Missing` if absent, `WrongType` if the value is not a list.
    pub fn find_list(&self, name: &str) -> Result<&List, FieldAccessError> {
        let value = self.get(name)?;
        value.as_list().ok_or_else(|| wrong_type(name, "list"))
    }

    #[must_use]
    pub fn try_find_list(&self, name: &str) -> Option<&List> {
        self.find(name).and_then(Value::as_list)
    }

    /// # Errors
    /// `Missing`, `WrongType`, `Invalid` (not a number) or `Overflow`.
    pub fn find_u32(&self, name: &str) -> Result<u32, FieldAccessError> {
        self.find_number(name)
    }

    /// # Errors
    /// `WrongType`, `Invalid` or `Overflow` when present; `Ok(None)` when absent.
    pub fn try_find_u32(&self, name: &str) -> Result<Option<u32>, FieldAccessError> {
        self.try_find_number(name)
    }

    /// # Errors
    /// `Missing`, `WrongType`, `Invalid` (not a number) or `Overflow`.
    pub fn find_i32(&self, name: &str) -> Result<i32, FieldAccessError> {
        self.find_number(name)
    }

    /// # Errors
    /// `WrongType`, `Invalid` or `Overflow` when present; `Ok(None)` when absent.
    pub fn try_find_i32(&self, name: &str) -> Result<Option<i32>, FieldAccessError> {
        self.try_find_number(name)
    }

    /// Read an address (`0x`-prefixed hex or decimal).
    ///
    /// # Errors
    /// `Missing`, `WrongType`, `Invalid` (not a number) or `Overflow`.
    pub fn find_addr(&self, name: &str) -> Result<u64, FieldAccessError> {
        self.find_number(name)
    }

    /// # Errors
    /// `WrongType`, `Invalid` or `Overflow` when present; `Ok(None)` when absent.
    pub fn try_find_addr(&self, name: &str) -> Result<Option<u64>, FieldAccessError> {
        self.try_find_number(name)
    }

    fn find_number<T: MiInteger>(&self, name: &str) -> Result<T, FieldAccessError> {
        let text = self.find_str(name)?;
        parse_integer(name, text)
    }

    fn try_find_number<T: MiInteger>(&self, name: &str) -> Result<Option<T>, FieldAccessError> {
        if !self.contains(name) {
            return Ok(None);
        }
        self.find_number(name).map(Some)
    }

    /// Build a new tuple holding `required` names (all must exist) followed by
    /// whichever `optional` names exist.
    ///
    /// # Errors
    /// `FieldAccessError::Missing` for the first absent required name.
    pub fn subset(&self, required: &[&str], optional: &[&str]) -> Result<Self, FieldAccessError> {
        let mut entries = Vec::with_capacity(required.len() + optional.len());
        for name in required {
            entries.push(NamedValue::new(*name, self.get(name)?.clone()));
        }
        for name in optional {
            if let Some(value) = self.find(name) {
                entries.push(NamedValue::new(*name, value.clone()));
            }
        }
        Ok(Self::new(entries))
    }
}

impl From<Vec<NamedValue>> for Tuple {
    fn from(entries: Vec<NamedValue>) -> Self {
        Self::new(entries)
    }
}

impl<'a> IntoIterator for &'a Tuple {
    type Item = &'a NamedValue;
    type IntoIter = std::slice::Iter<'a, NamedValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl List {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Values(v) => v.len(),
            Self::Results(r) => r.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element values in order, ignoring names for named lists.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            Self::Values(v) => Box::new(v.iter()),
            Self::Results(r) => Box::new(r.iter().map(|e| &e.value)),
        }
    }

    /// Elements that are tuples, e.g. each frame of `[frame={..},frame={..}]`.
    pub fn tuples(&self) -> impl Iterator<Item = &Tuple> {
        self.iter().filter_map(Value::as_tuple)
    }

    /// Elements that are constants.
    #[must_use]
    pub fn as_strings(&self) -> Vec<&str> {
        self.iter().filter_map(Value::as_const).collect()
    }

    /// First element named `name`. Always `None` for a list of bare values.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Values(_) => None,
            Self::Results(r) => find_in(r, name),
        }
    }

    /// Every element named `name`.
    pub fn find_all<'a>(&'a self, name: &'a str) -> Box<dyn Iterator<Item = &'a Value> + 'a> {
        match self {
            Self::Values(_) => Box::new(std::iter::empty()),
            Self::Results(r) => Box::new(find_all_in(r, name)),
        }
    }

    #[must_use]
    pub fn count_of(&self, name: &str) -> usize {
        self.find_all(name).count()
    }
}

fn wrong_type(name: &str, expected: &'static str) -> FieldAccessError {
    FieldAccessError::WrongType {
        name: name.to_string(),
        expected,
    }
}

trait MiInteger: Sized {
    const TYPE_NAME: &'static str;
    fn from_radix(text: &str, radix: u32) -> Result<Self, std::num::ParseIntError>;
}

macro_rules! mi_integer {
    ($($ty:ty),*) => {
        $(impl MiInteger for $ty {
            const TYPE_NAME: &'static str = stringify!($ty);
            fn from_radix(text: &str, radix: u32) -> Result<Self, std::num::ParseIntError> {
                <$ty>::from_str_radix(text, radix)
            }
        })*
    };
}

mi_integer!(u32, i32, u64);

/// Parse decimal or `0x`-prefixed hexadecimal text.
fn parse_integer<T: MiInteger>(name: &str, text: &str) -> Result<T, FieldAccessError> {
    let (digits, radix) = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (text, 10),
    };
    T::from_radix(digits, radix).map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => FieldAccessError::Overflow {
            name: name.to_string(),
            value: text.to_string(),
            expected: T::TYPE_NAME,
        },
        _ => FieldAccessError::Invalid {
            name: name.to_string(),
            value: text.to_string(),
            expected: T::TYPE_NAME,
        },
    })
}

/// Escape text for use inside an MI C-string (without the surrounding quotes).
#[must_use]
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

fn write_entries(f: &mut fmt::Formatter<'_>, entries: &[NamedValue]) -> fmt::Result {
    for (i, entry) in entries.iter().enumerate() {
        if i != 0 {
            f.write_str(",")?;
        }
        write!(f, "{entry}")?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Const(s) => write!(f, "\"{}\"", escape(s)),
            Self::Tuple(t) => t.fmt(f),
            Self::List(l) => l.fmt(f),
        }
    }
}

impl fmt::Display for NamedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        write_entries(f, &self.entries)?;
        f.write_str("}")
    }
}

impl fmt::Display for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        match self {
            Self::Values(values) => {
                for (i, value) in values.iter().enumerate() {
                    if i != 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{value}")?;
                }
            }
            Self::Results(entries) => write_entries(f, entries)?,
        }
        f.write_str("]")
    }
}
