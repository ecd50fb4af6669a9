//! User-facing iterator over the index, resolving each key's current
//! position back to its value on demand.

use bytes::Bytes;

use crate::engine::Engine;
use crate::error::Result;
use crate::index::IndexIterator;
use crate::options::IteratorOptions;

/// A snapshot iterator over the engine's index, optionally filtered to keys
/// starting with a prefix. Holds no lock between calls; `value()` takes the
/// engine's read lock only for the duration of resolving one record.
pub struct EngineIterator<'e> {
    engine: &'e Engine,
    inner: Box<dyn IndexIterator>,
    options: IteratorOptions,
}

impl<'e> EngineIterator<'e> {
    pub(crate) fn new(engine: &'e Engine, options: IteratorOptions) -> Self {
        let mut inner = engine.index.iterator(options.reverse);
        inner.rewind();
        let mut iter = Self { engine, inner, options };
        iter.skip_to_next();
        iter
    }

    pub fn rewind(&mut self) {
        self.inner.rewind();
        self.skip_to_next();
    }

    pub fn seek(&mut self, target: &[u8]) {
        self.inner.seek(target);
        self.skip_to_next();
    }

    pub fn next(&mut self) {
        self.inner.next();
        self.skip_to_next();
    }

    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    pub fn key(&self) -> &[u8] {
        self.inner.key()
    }

    pub fn value(&self) -> Result<Bytes> {
        let state = self.engine.state.read().expect("engine lock poisoned");
        self.engine.read_value_at(&state, self.inner.value())
    }

    pub fn close(self) {}

    /// Advances past entries that don't start with the configured prefix.
    /// A no-op when the prefix is empty.
    fn skip_to_next(&mut self) {
        if self.options.prefix.is_empty() {
            return;
        }
        while self.inner.valid() && !self.inner.key().starts_with(&self.options.prefix) {
            self.inner.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;

    fn open_engine(dir: &tempfile::TempDir) -> Engine {
        let options = Options {
            dir_path: dir.path().to_path_buf(),
            ..Options::default()
        };
        Engine::open(options).expect("open engine")
    }

    #[test]
    fn iterates_all_keys_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = open_engine(&dir);
        engine.put(Bytes::from_static(b"b"), Bytes::from_static(b"2")).unwrap();
        engine.put(Bytes::from_static(b"a"), Bytes::from_static(b"1")).unwrap();
        engine.put(Bytes::from_static(b"c"), Bytes::from_static(b"3")).unwrap();

        let mut iter = engine.iter(IteratorOptions::default());
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.next();
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn prefix_filters_out_non_matching_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = open_engine(&dir);
        engine.put(Bytes::from_static(b"user:1"), Bytes::from_static(b"a")).unwrap();
        engine.put(Bytes::from_static(b"user:2"), Bytes::from_static(b"b")).unwrap();
        engine.put(Bytes::from_static(b"order:1"), Bytes::from_static(b"c")).unwrap();

        let options = IteratorOptions {
            prefix: b"user:".to_vec(),
            reverse: false,
        };
        let mut iter = engine.iter(options);
        let mut count = 0;
        while iter.valid() {
            assert!(iter.key().starts_with(b"user:"));
            count += 1;
            iter.next();
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn value_resolves_through_engine_read_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = open_engine(&dir);
        engine.put(Bytes::from_static(b"k"), Bytes::from_static(b"v")).unwrap();

        let mut iter = engine.iter(IteratorOptions::default());
        assert!(iter.valid());
        assert_eq!(iter.value().unwrap(), Bytes::from_static(b"v"));
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn reverse_iteration_visits_keys_descending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = open_engine(&dir);
        engine.put(Bytes::from_static(b"a"), Bytes::from_static(b"1")).unwrap();
        engine.put(Bytes::from_static(b"b"), Bytes::from_static(b"2")).unwrap();

        let options = IteratorOptions {
            prefix: Vec::new(),
            reverse: true,
        };
        let mut iter = engine.iter(options);
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.next();
        }
        assert_eq!(keys, vec![b"b".to_vec(), b"a".to_vec()]);
    }
}
