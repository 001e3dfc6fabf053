use std::cmp::Ordering;
use std::fmt;
use std::mem;
use std::sync::Arc;

/// A key in a dictionary's key space, or one of the two infinity sentinels.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Key {
    NegativeInfinity,
    Bytes(Vec<u8>),
    PositiveInfinity,
}

impl Key {
    pub fn from_slice(bytes: &[u8]) -> Self {
        Key::Bytes(bytes.to_vec())
    }

    pub fn is_infinite(&self) -> bool {
        !matches!(self, Key::Bytes(_))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Key::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Heap bytes owned by this key.
    pub fn memory_size(&self) -> usize {
        self.as_bytes().map_or(0, <[u8]>::len)
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Key::from_slice(bytes)
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key::Bytes(bytes)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::NegativeInfinity => write!(f, "-inf"),
            Key::PositiveInfinity => write!(f, "+inf"),
            Key::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{:?}", s),
                _ => {
                    write!(f, "0x")?;
                    for b in bytes {
                        write!(f, "{:02x}", b)?;
                    }
                    Ok(())
                }
            },
        }
    }
}

/// Three-way comparison over `(descriptor, a, b)`.
pub type CompareFn = dyn Fn(&[u8], &[u8], &[u8]) -> Ordering + Send + Sync;

/// Orders keys of one dictionary.
///
/// The compare function is supplied by the storage layer; the descriptor blob is
/// passed through to it unexamined. Infinity sentinels are ordered here and never
/// reach the compare function.
#[derive(Clone)]
pub struct Comparator {
    cmp: Arc<CompareFn>,
    descriptor: Arc<Vec<u8>>,
}

impl Comparator {
    pub fn new<F>(cmp: F, descriptor: Vec<u8>) -> Self
    where
        F: Fn(&[u8], &[u8], &[u8]) -> Ordering + Send + Sync + 'static,
    {
        Self {
            cmp: Arc::new(cmp),
            descriptor: Arc::new(descriptor),
        }
    }

    /// Bytewise ordering, ignoring the descriptor.
    pub fn memcmp() -> Self {
        Self::new(|_desc, a, b| a.cmp(b), Vec::new())
    }

    pub fn descriptor(&self) -> &[u8] {
        &self.descriptor
    }

    pub fn set_descriptor(&mut self, descriptor: Vec<u8>) {
        self.descriptor = Arc::new(descriptor);
    }

    pub fn compare(&self, a: &Key, b: &Key) -> Ordering {
        match (a, b) {
            (Key::NegativeInfinity, Key::NegativeInfinity) => Ordering::Equal,
            (Key::PositiveInfinity, Key::PositiveInfinity) => Ordering::Equal,
            (Key::NegativeInfinity, _) => Ordering::Less,
            (_, Key::NegativeInfinity) => Ordering::Greater,
            (Key::PositiveInfinity, _) => Ordering::Greater,
            (_, Key::PositiveInfinity) => Ordering::Less,
            (Key::Bytes(a), Key::Bytes(b)) => (self.cmp)(&self.descriptor, a, b),
        }
    }
}

impl Default for Comparator {
    fn default() -> Self {
        Self::memcmp()
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Comparator")
            .field("descriptor_len", &self.descriptor.len())
            .finish()
    }
}

/// How two closed ranges relate to each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeComparison {
    Equals,
    LessThan,
    GreaterThan,
    Overlaps,
}

/// Closed interval `[left, right]` of keys.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyRange {
    left: Key,
    right: Key,
}

impl KeyRange {
    pub fn new(left: Key, right: Key) -> Self {
        Self { left, right }
    }

    pub fn point(key: Key) -> Self {
        Self {
            left: key.clone(),
            right: key,
        }
    }

    /// The range covering the whole key space.
    pub fn infinite() -> Self {
        Self {
            left: Key::NegativeInfinity,
            right: Key::PositiveInfinity,
        }
    }

    pub fn left(&self) -> &Key {
        &self.left
    }

    pub fn right(&self) -> &Key {
        &self.right
    }

    /// Bytes charged against the lock memory budget for holding this range.
    pub fn memory_size(&self) -> usize {
        mem::size_of::<KeyRange>() + self.left.memory_size() + self.right.memory_size()
    }

    pub fn is_valid(&self, cmp: &Comparator) -> bool {
        cmp.compare(&self.left, &self.right) != Ordering::Greater
    }

    pub fn compare(&self, cmp: &Comparator, other: &KeyRange) -> RangeComparison {
        if cmp.compare(&self.right, &other.left) == Ordering::Less {
            RangeComparison::LessThan
        } else if cmp.compare(&self.left, &other.right) == Ordering::Greater {
            RangeComparison::GreaterThan
        } else if cmp.compare(&self.left, &other.left) == Ordering::Equal
            && cmp.compare(&self.right, &other.right) == Ordering::Equal
        {
            RangeComparison::Equals
        } else {
            RangeComparison::Overlaps
        }
    }

    pub fn overlaps(&self, cmp: &Comparator, other: &KeyRange) -> bool {
        matches!(
            self.compare(cmp, other),
            RangeComparison::Equals | RangeComparison::Overlaps
        )
    }

    /// Grows this range so it also covers `other`.
    pub fn extend(&mut self, cmp: &Comparator, other: &KeyRange) {
        if cmp.compare(&other.left, &self.left) == Ordering::Less {
            self.left = other.left.clone();
        }
        if cmp.compare(&other.right, &self.right) == Ordering::Greater {
            self.right = other.right.clone();
        }
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?}]", self.left, self.right)
    }
}
