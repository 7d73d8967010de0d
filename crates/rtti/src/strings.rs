//! Process-wide string interner.
//!
//! Every name that flows through serialization (class names, property
//! names, enum options) is interned once and referenced by a small integer
//! handle afterwards. Interned strings live for the rest of the process;
//! the interner is insert-safe and lookup-safe under contention.

use std::collections::HashMap;
use std::fmt;
use std::sync::{OnceLock, RwLock};

/// Handle to an interned string. Index 0 is the empty string.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StringId(u32);

struct Interner {
    map: HashMap<&'static str, u32>,
    list: Vec<&'static str>,
}

fn interner() -> &'static RwLock<Interner> {
    static INTERNER: OnceLock<RwLock<Interner>> = OnceLock::new();
    INTERNER.get_or_init(|| {
        let mut map = HashMap::new();
        map.insert("", 0);
        RwLock::new(Interner {
            map,
            list: vec![""],
        })
    })
}

impl StringId {
    pub const EMPTY: StringId = StringId(0);

    /// Interns `text`, returning the existing handle when already known.
    pub fn intern(text: &str) -> StringId {
        if text.is_empty() {
            return StringId::EMPTY;
        }

        {
            let inner = interner().read().expect("interner lock poisoned");
            if let Some(&index) = inner.map.get(text) {
                return StringId(index);
            }
        }

        let mut inner = interner().write().expect("interner lock poisoned");
        if let Some(&index) = inner.map.get(text) {
            return StringId(index);
        }
        let leaked: &'static str = Box::leak(text.to_string().into_boxed_str());
        let index = inner.list.len() as u32;
        inner.list.push(leaked);
        inner.map.insert(leaked, index);
        StringId(index)
    }

    /// Looks `text` up without interning it.
    pub fn find(text: &str) -> Option<StringId> {
        let inner = interner().read().expect("interner lock poisoned");
        inner.map.get(text).map(|&index| StringId(index))
    }

    pub fn as_str(&self) -> &'static str {
        let inner = interner().read().expect("interner lock poisoned");
        inner.list[self.0 as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn index(&self) -> u32 {
        self.0
    }

    /// Rebuilds a handle from a raw index previously obtained from
    /// [`index`](Self::index). Unknown indices map to the empty string.
    pub fn from_index(index: u32) -> StringId {
        let inner = interner().read().expect("interner lock poisoned");
        if (index as usize) < inner.list.len() {
            StringId(index)
        } else {
            StringId::EMPTY
        }
    }
}

impl fmt::Display for StringId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for StringId {
    fn from(text: &str) -> Self {
        StringId::intern(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedupes() {
        let a = StringId::intern("interner.test.value");
        let b = StringId::intern("interner.test.value");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "interner.test.value");
    }

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(StringId::intern(""), StringId::EMPTY);
        assert!(StringId::EMPTY.is_empty());
        assert_eq!(StringId::EMPTY.as_str(), "");
    }

    #[test]
    fn test_find_does_not_intern() {
        assert_eq!(StringId::find("interner.test.never-interned"), None);
        let id = StringId::intern("interner.test.known");
        assert_eq!(StringId::find("interner.test.known"), Some(id));
    }

    #[test]
    fn test_concurrent_intern() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    (0..100)
                        .map(|i| StringId::intern(&format!("interner.test.thread.{i}")))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<StringId>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for other in &results[1..] {
            assert_eq!(&results[0], other);
        }
    }
}
