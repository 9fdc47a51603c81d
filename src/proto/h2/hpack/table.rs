//! HPACK indexing tables.

use std::collections::VecDeque;

/// The static table (RFC 7541, Appendix A). Index 0 is never addressable;
/// entries 1..=61 are fixed by the RFC.
pub(crate) const STATIC_TABLE: [(&str, &str); 62] = [
    ("", ""),
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Number of addressable static entries; dynamic indices start right
/// after, at 62.
pub(crate) const STATIC_TABLE_LEN: usize = 61;

const ENTRY_OVERHEAD: usize = 32;

fn entry_size(name: &str, value: &str) -> usize {
    ENTRY_OVERHEAD + name.len() + value.len()
}

/// The connection's dynamic table: a bounded FIFO of decoded
/// `(name, value)` pairs, newest first.
#[derive(Debug)]
pub(crate) struct DynamicTable {
    entries: VecDeque<(String, String)>,
    size: usize,
    capacity: usize,
    max_capacity: usize,
}

impl DynamicTable {
    pub(crate) fn new(capacity: usize) -> DynamicTable {
        DynamicTable {
            entries: VecDeque::new(),
            size: 0,
            capacity,
            max_capacity: capacity,
        }
    }

    /// The ceiling a table-size update may not exceed.
    pub(crate) fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Looks up an entry by 0-based distance from the newest insertion
    /// (absolute index 62 maps to distance 0).
    pub(crate) fn get(&self, rel: usize) -> Option<(&str, &str)> {
        self.entries
            .get(rel)
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn insert(&mut self, name: String, value: String) {
        let size = entry_size(&name, &value);
        // An entry larger than the whole table empties it and is dropped.
        if size > self.capacity {
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.size += size;
        self.entries.push_front((name, value));
        self.evict();
    }

    /// Applies a dynamic-table-size update instruction.
    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.evict();
    }

    fn evict(&mut self) {
        while self.size > self.capacity {
            let (name, value) = self
                .entries
                .pop_back()
                .expect("table size out of sync with entries");
            self.size -= entry_size(&name, &value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_shape() {
        assert_eq!(STATIC_TABLE.len(), STATIC_TABLE_LEN + 1);
        assert_eq!(STATIC_TABLE[1], (":authority", ""));
        assert_eq!(STATIC_TABLE[8], (":status", "200"));
        assert_eq!(STATIC_TABLE[61], ("www-authenticate", ""));
    }

    #[test]
    fn newest_entry_is_index_zero() {
        let mut t = DynamicTable::new(4096);
        t.insert("x-a".into(), "1".into());
        t.insert("x-b".into(), "2".into());
        assert_eq!(t.get(0), Some(("x-b", "2")));
        assert_eq!(t.get(1), Some(("x-a", "1")));
        assert_eq!(t.get(2), None);
    }

    #[test]
    fn eviction_keeps_size_bounded() {
        // Each "xxxx"/"yyyy" entry costs 32 + 4 + 4 = 40 bytes.
        let mut t = DynamicTable::new(100);
        for _ in 0..10 {
            t.insert("xxxx".into(), "yyyy".into());
            assert!(t.size() <= 100);
        }
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn capacity_update_evicts() {
        let mut t = DynamicTable::new(4096);
        for i in 0..8 {
            t.insert(format!("x-{i}"), "v".into());
        }
        t.set_capacity(40);
        assert!(t.size() <= 40);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(0), Some(("x-7", "v")));
    }

    #[test]
    fn oversized_entry_clears_table() {
        let mut t = DynamicTable::new(40);
        t.insert("a".into(), "b".into());
        t.insert("huge".into(), "x".repeat(64));
        assert_eq!(t.len(), 0);
        assert_eq!(t.size(), 0);
    }
}
