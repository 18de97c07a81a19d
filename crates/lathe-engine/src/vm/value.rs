//! Runtime value representation.
//!
//! A value is one 8-byte payload plus a small tag. Inline tags (numbers,
//! booleans, `undef`, geometry handles) are copied freely; heap tags
//! (strings, vectors, ranges) are reference-counted, so copying a value
//! bumps a refcount and dropping one releases it. A reference count of one
//! licenses in-place mutation for `append`/`concat`, which keeps list
//! building linear.

use std::fmt;
use std::rc::Rc;

/// A numeric range `[begin : step : end]`, end-inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeValue {
    /// First value produced.
    pub begin: f64,
    /// Increment between values. A step of zero produces the start value
    /// exactly once.
    pub step: f64,
    /// Inclusive upper bound.
    pub end: f64,
}

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// IEEE-754 double
    Number(f64),
    /// Boolean
    Boolean(bool),
    /// The undefined value
    Undef,
    /// Opaque geometry handle provided by the host; `0` is the empty
    /// geometry
    Geometry(i64),
    /// Immutable string
    Str(Rc<str>),
    /// Heterogeneous ordered sequence
    Vector(Rc<Vec<Value>>),
    /// Numeric range
    Range(Rc<RangeValue>),
}

impl Value {
    /// A string value from borrowed text.
    pub fn string(text: &str) -> Value {
        Value::Str(Rc::from(text))
    }

    /// An empty vector.
    pub fn empty_vector() -> Value {
        Value::Vector(Rc::new(Vec::new()))
    }

    /// A vector from elements.
    pub fn vector(elems: Vec<Value>) -> Value {
        Value::Vector(Rc::new(elems))
    }

    /// True when this value is the sole holder of its heap object. Inline
    /// values are trivially unique.
    pub fn is_unique(&self) -> bool {
        match self {
            Value::Str(rc) => Rc::strong_count(rc) == 1,
            Value::Vector(rc) => Rc::strong_count(rc) == 1,
            Value::Range(rc) => Rc::strong_count(rc) == 1,
            _ => true,
        }
    }

    /// Appends `rhs` onto a vector, mutating in place when the vector is
    /// uniquely held and copying otherwise. Non-vectors yield `Undef`.
    pub fn append(self, rhs: Value) -> Value {
        match self {
            Value::Vector(rc) => {
                let mut elems = match Rc::try_unwrap(rc) {
                    Ok(owned) => owned,
                    Err(shared) => (*shared).clone(),
                };
                elems.push(rhs);
                Value::Vector(Rc::new(elems))
            }
            _ => Value::Undef,
        }
    }

    /// Concatenates two vectors, mutating the left side in place when
    /// uniquely held. Anything else yields `Undef`.
    pub fn concat(self, rhs: Value) -> Value {
        match (self, rhs) {
            (Value::Vector(lhs), Value::Vector(rhs)) => {
                let mut elems = match Rc::try_unwrap(lhs) {
                    Ok(owned) => owned,
                    Err(shared) => (*shared).clone(),
                };
                elems.extend(rhs.iter().cloned());
                Value::Vector(Rc::new(elems))
            }
            _ => Value::Undef,
        }
    }

    /// Indexes a vector with a number; anything out of range, negative or
    /// mistyped yields `Undef`.
    pub fn index(self, index: Value) -> Value {
        match (self, index) {
            (Value::Vector(elems), Value::Number(n)) => {
                if n < 0.0 || n.is_nan() {
                    return Value::Undef;
                }
                match elems.get(n as usize) {
                    Some(elem) => elem.clone(),
                    None => Value::Undef,
                }
            }
            _ => Value::Undef,
        }
    }
}

/// Formats a number the way `echo` prints it: `nan`, `inf`/`-inf`, else the
/// shortest round-trip decimal form.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "inf" } else { "-inf" }.to_string()
    } else {
        value.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Undef => f.write_str("undef"),
            Value::Geometry(handle) => write!(f, "geometry(#{handle})"),
            Value::Str(s) => f.write_str(s),
            Value::Vector(elems) => {
                f.write_str("[")?;
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{elem}")?;
                }
                f.write_str("]")
            }
            Value::Range(range) => write!(
                f,
                "[{} : {} : {}]",
                format_number(range.begin),
                format_number(range.step),
                format_number(range.end)
            ),
        }
    }
}
