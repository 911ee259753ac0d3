//! Typed attribute dictionary.

use std::fmt;

/// A signed rational number, as used for frame rates and aspect ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    /// Numerator.
    pub num: i64,
    /// Denominator.
    pub den: u64,
}

impl Rational {
    /// Create a rational.
    pub const fn new(num: i64, den: u64) -> Self {
        Self { num, den }
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Value of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Presence-only marker.
    Void,
    /// Boolean.
    Bool(bool),
    /// Unsigned integer.
    Unsigned(u64),
    /// Signed integer.
    Int(i64),
    /// Rational.
    Rational(Rational),
    /// Floating-point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Opaque octets.
    Opaque(Vec<u8>),
}

impl Value {
    /// Name of the value's kind, for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Bool(_) => "bool",
            Value::Unsigned(_) => "unsigned",
            Value::Int(_) => "int",
            Value::Rational(_) => "rational",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Opaque(_) => "opaque",
        }
    }
}

/// Key→typed-value dictionary.
///
/// Attribute order is irrelevant: two dictionaries holding the same set of
/// attributes compare equal. A lookup for an absent name, or for a name
/// holding a value of another kind, returns `None`.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    entries: Vec<(String, Value)>,
}

impl Dictionary {
    /// Create an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty dictionary with room for `capacity` attributes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the dictionary is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an attribute.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Set an attribute, replacing any previous value of any kind.
    pub fn set(&mut self, name: &str, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| k == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name.to_owned(), value)),
        }
    }

    /// Remove an attribute. Returns whether it was present.
    pub fn delete(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != name);
        self.entries.len() != before
    }

    /// Iterate over attributes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy every attribute of `other` into this dictionary.
    pub fn merge(&mut self, other: &Dictionary) {
        for (name, value) in other.iter() {
            self.set(name, value.clone());
        }
    }

    /// Whether a void attribute is present.
    pub fn get_void(&self, name: &str) -> bool {
        matches!(self.get(name), Some(Value::Void))
    }

    /// Get a boolean attribute.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Get an unsigned attribute.
    pub fn get_unsigned(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            Value::Unsigned(v) => Some(*v),
            _ => None,
        }
    }

    /// Get a signed attribute.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Get a rational attribute.
    pub fn get_rational(&self, name: &str) -> Option<Rational> {
        match self.get(name)? {
            Value::Rational(v) => Some(*v),
            _ => None,
        }
    }

    /// Get a float attribute.
    pub fn get_float(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Get a string attribute.
    pub fn get_string(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    /// Get an opaque attribute.
    pub fn get_opaque(&self, name: &str) -> Option<&[u8]> {
        match self.get(name)? {
            Value::Opaque(v) => Some(v),
            _ => None,
        }
    }
}

impl PartialEq for Dictionary {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}
