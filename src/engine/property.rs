//! Property keys and attributes
//!
//! Keys are [`Atom`]s: canonical array indices or names. They are interned
//! into engine atoms only for the duration of a single property operation.

use std::fmt;
use std::rc::Rc;

/// Largest integer usable as an array-index atom
pub const MAX_INDEX_ATOM: u32 = u32::MAX - 1;

/// Property key
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Atom {
    /// Canonical array index
    Index(u32),
    /// Any other string key
    Name(Rc<str>),
}

impl Atom {
    /// Build an atom from a string, canonicalizing numeric strings
    pub fn new(name: &str) -> Self {
        if let Some(idx) = parse_index(name) {
            return Atom::Index(idx);
        }
        Atom::Name(Rc::from(name))
    }

    /// Build an atom from a 64-bit integer key
    pub fn from_i64(key: i64) -> Self {
        match u32::try_from(key) {
            Ok(idx) if idx <= MAX_INDEX_ATOM => Atom::Index(idx),
            _ => Atom::Name(Rc::from(key.to_string())),
        }
    }

    /// Build an atom from a 32-bit unsigned key
    pub fn from_u32(key: u32) -> Self {
        if key <= MAX_INDEX_ATOM {
            Atom::Index(key)
        } else {
            Atom::Name(Rc::from(key.to_string()))
        }
    }

    /// Index payload for array-index atoms
    #[inline]
    pub fn as_index(&self) -> Option<u32> {
        match self {
            Atom::Index(i) => Some(*i),
            Atom::Name(_) => None,
        }
    }

    /// Check if this atom is the given name
    #[inline]
    pub fn is_name(&self, name: &str) -> bool {
        matches!(self, Atom::Name(n) if &**n == name)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Index(i) => write!(f, "{}", i),
            Atom::Name(n) => f.write_str(n),
        }
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string())
    }
}

impl From<&str> for Atom {
    fn from(name: &str) -> Self {
        Atom::new(name)
    }
}

/// Parse a canonical array index ("0", "17"; not "01" or "-1")
fn parse_index(s: &str) -> Option<u32> {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() > 10 || !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    if bytes.len() > 1 && bytes[0] == b'0' {
        return None;
    }
    let idx: u64 = s.parse().ok()?;
    if idx <= MAX_INDEX_ATOM as u64 {
        Some(idx as u32)
    } else {
        None
    }
}

/// Property attribute flags, bit-compatible with the engine's `JS_PROP_*`
pub mod flags {
    pub const CONFIGURABLE: u8 = 1 << 0;
    pub const WRITABLE: u8 = 1 << 1;
    pub const ENUMERABLE: u8 = 1 << 2;
    /// Default attributes for properties created by assignment
    pub const C_W_E: u8 = CONFIGURABLE | WRITABLE | ENUMERABLE;
    /// Default attributes for methods and internal slots
    pub const C_W: u8 = CONFIGURABLE | WRITABLE;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs_sys as qjs;

    #[test]
    fn test_atom_canonicalization() {
        assert_eq!(Atom::new("12"), Atom::Index(12));
        assert_eq!(Atom::new("012"), Atom::Name(Rc::from("012")));
        assert_eq!(Atom::new("-1"), Atom::Name(Rc::from("-1")));
        assert_eq!(Atom::from_i64(-1), Atom::Name(Rc::from("-1")));
        assert_eq!(Atom::from_i64(1 << 40), Atom::Name(Rc::from("1099511627776")));
        assert_eq!(Atom::from_u32(u32::MAX), Atom::Name(Rc::from("4294967295")));
        assert_eq!(Atom::from_i64(7), Atom::from_u32(7));
    }

    #[test]
    fn test_atom_display() {
        assert_eq!(Atom::new("name").to_string(), "name");
        assert_eq!(Atom::Index(3).to_string(), "3");
        assert_eq!(format!("{:?}", Atom::Index(3)), "\"3\"");
        assert!(Atom::new("then").is_name("then"));
        assert_eq!(Atom::new("4").as_index(), Some(4));
    }

    #[test]
    fn test_flags_match_engine() {
        assert_eq!(flags::CONFIGURABLE as u32, qjs::JS_PROP_CONFIGURABLE);
        assert_eq!(flags::WRITABLE as u32, qjs::JS_PROP_WRITABLE);
        assert_eq!(flags::ENUMERABLE as u32, qjs::JS_PROP_ENUMERABLE);
        assert_eq!(flags::C_W_E as u32, qjs::JS_PROP_C_W_E);
    }
}
