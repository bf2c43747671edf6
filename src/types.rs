use std::cmp::Ordering;
use std::fmt;

use rust_decimal::Decimal;

/// Minimum bounding rectangle for geometry values.
///
/// Comparison of geometries orders by (min_x, min_y, max_x, max_y) so that
/// geometry columns can participate in ordered structures; spatial lookups
/// go through `intersects` instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mbr {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Mbr {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Mbr {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn intersects(&self, other: &Mbr) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &Mbr) -> Mbr {
        Mbr {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn area(&self) -> f64 {
        (self.max_x - self.min_x).max(0.0) * (self.max_y - self.min_y).max(0.0)
    }

    /// Area increase needed to cover `other`.
    pub fn enlargement(&self, other: &Mbr) -> f64 {
        self.union(other).area() - self.area()
    }

    fn cmp_key(&self) -> [f64; 4] {
        [self.min_x, self.min_y, self.max_x, self.max_y]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i32),
    BigInt(i64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Geometry(Mbr),
    Row(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v as i64),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_mbr(&self) -> Option<&Mbr> {
        match self {
            Value::Geometry(m) => Some(m),
            _ => None,
        }
    }

    /// Render as a SQL literal for error messages.
    pub fn to_sql(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Int(v) => v.to_string(),
            Value::BigInt(v) => v.to_string(),
            Value::Decimal(v) => v.to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Bytes(b) => {
                let mut s = String::with_capacity(3 + b.len() * 2);
                s.push_str("X'");
                for byte in b {
                    s.push_str(&format!("{:02x}", byte));
                }
                s.push('\'');
                s
            }
            Value::Geometry(m) => {
                format!("MBR({}, {}, {}, {})", m.min_x, m.min_y, m.max_x, m.max_y)
            }
            Value::Row(vs) => {
                let inner: Vec<String> = vs.iter().map(|v| v.to_sql()).collect();
                format!("({})", inner.join(", "))
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::BigInt(v) => write!(f, "{}", v),
            Value::Decimal(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<binary {} bytes>", b.len()),
            Value::Geometry(m) => {
                write!(f, "MBR({}, {}, {}, {})", m.min_x, m.min_y, m.max_x, m.max_y)
            }
            Value::Row(vs) => {
                write!(f, "(")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int,
    BigInt,
    Decimal,
    Text,
    Bytes,
    Geometry,
    Row,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Int => write!(f, "INT"),
            DataType::BigInt => write!(f, "BIGINT"),
            DataType::Decimal => write!(f, "DECIMAL"),
            DataType::Text => write!(f, "TEXT"),
            DataType::Bytes => write!(f, "BYTES"),
            DataType::Geometry => write!(f, "GEOMETRY"),
            DataType::Row => write!(f, "ROW"),
        }
    }
}

/// Compare two values. NULL sorts before everything. Numeric types compare
/// across widths by widening Int -> BigInt -> Decimal. Mixed non-numeric
/// types order by a fixed type rank so the comparison is total.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Int(_) | Value::BigInt(_) | Value::Decimal(_) => 1,
            Value::Text(_) => 2,
            Value::Bytes(_) => 3,
            Value::Geometry(_) => 4,
            Value::Row(_) => 5,
        }
    }

    fn as_decimal(v: &Value) -> Option<Decimal> {
        match v {
            Value::Int(n) => Some(Decimal::from(*n)),
            Value::BigInt(n) => Some(Decimal::from(*n)),
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::BigInt(x), Value::BigInt(y)) => x.cmp(y),
        (Value::Int(x), Value::BigInt(y)) => (*x as i64).cmp(y),
        (Value::BigInt(x), Value::Int(y)) => x.cmp(&(*y as i64)),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        (Value::Geometry(x), Value::Geometry(y)) => x
            .cmp_key()
            .partial_cmp(&y.cmp_key())
            .unwrap_or(Ordering::Equal),
        (Value::Row(x), Value::Row(y)) => {
            for (xv, yv) in x.iter().zip(y.iter()) {
                match compare_values(xv, yv) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        _ => match (as_decimal(a), as_decimal(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => rank(a).cmp(&rank(b)),
        },
    }
}
