use crate::{row::Row, HashMap, Rc};

/// Row cache capacity floor in bytes.
pub const CACHE_FLOOR: usize = 256 * 1024;
/// Default row cache budget in bytes.
pub const CACHE_DEFAULT: usize = 1024 * 1024;

/// Per-table LRU cache of decoded rows, keyed by rowid.
///
/// The byte budget from the schema is converted to an entry budget of
/// `max(budget, CACHE_FLOOR) / row_bytes` rows. Both get and put count
/// as a touch; eviction removes the least recently touched entry, so
/// the eviction order is deterministic.
pub struct RowCache {
    map: HashMap<i64, (Rc<Row>, u64)>,
    stamp: u64,
    cap: usize,
}

impl RowCache {
    /// Construct with a byte budget and the table's slot size.
    pub fn new(cache_bytes: usize, row_bytes: usize) -> Self {
        let cap = (cache_bytes.max(CACHE_FLOOR) / row_bytes.max(1)).max(1);
        Self {
            map: HashMap::default(),
            stamp: 0,
            cap,
        }
    }

    /// Entry budget ( rows ).
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Cached row count.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Get a row, marking it most recently used.
    pub fn get(&mut self, id: i64) -> Option<Rc<Row>> {
        self.stamp += 1;
        let stamp = self.stamp;
        match self.map.get_mut(&id) {
            Some((row, s)) => {
                *s = stamp;
                Some(row.clone())
            }
            None => None,
        }
    }

    /// Insert or replace a row, evicting the least recently used
    /// entries once over capacity.
    pub fn put(&mut self, id: i64, row: Rc<Row>) {
        self.stamp += 1;
        self.map.insert(id, (row, self.stamp));
        while self.map.len() > self.cap {
            let mut victim = 0;
            let mut best = u64::MAX;
            for (k, (_, s)) in self.map.iter() {
                if *s < best {
                    best = *s;
                    victim = *k;
                }
            }
            self.map.remove(&victim);
            log::trace!("evicted row {} from cache", victim);
        }
    }

    /// Drop a row ( called before any write, update or delete ).
    pub fn remove(&mut self, id: i64) {
        self.map.remove(&id);
    }

    /// Drop everything ( rollback refresh ).
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// The row is currently cached ( does not touch ).
    pub fn contains(&self, id: i64) -> bool {
        self.map.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::Meta;

    fn row(info: &Rc<Meta>, id: i64) -> Rc<Row> {
        let mut r = Row::new(info.clone());
        r.id = id;
        Rc::new(r)
    }

    fn small_cache(cap_rows: usize) -> RowCache {
        let mut c = RowCache::new(0, 1);
        c.cap = cap_rows;
        c
    }

    #[test]
    fn floor_and_capacity() {
        let c = RowCache::new(0, 1024);
        assert_eq!(c.capacity(), CACHE_FLOOR / 1024);
        let c = RowCache::new(CACHE_DEFAULT, 100);
        assert_eq!(c.capacity(), CACHE_DEFAULT / 100);
    }

    #[test]
    fn lru_eviction_order() {
        let info = Rc::new(
            Meta::parse("CREATE TABLE t (a int, INDEX primary (a))").unwrap(),
        );
        let mut c = small_cache(4);
        // Fill rows 1..=8: with capacity 4, rows 1..=4 are evicted as 5..=8 arrive.
        for id in 1..=8 {
            c.put(id, row(&info, id));
        }
        for id in 1..=4 {
            assert!(!c.contains(id));
        }
        for id in 5..=8 {
            assert!(c.contains(id));
        }
        // Touch 5, then insert 9: the victim is 6 ( least recently touched ).
        assert!(c.get(5).is_some());
        c.put(9, row(&info, 9));
        assert!(c.contains(5));
        assert!(!c.contains(6));
        assert_eq!(c.len(), 4);
    }

    #[test]
    fn invalidation() {
        let info = Rc::new(
            Meta::parse("CREATE TABLE t (a int, INDEX primary (a))").unwrap(),
        );
        let mut c = small_cache(4);
        c.put(1, row(&info, 1));
        c.remove(1);
        assert!(c.get(1).is_none());
        c.put(2, row(&info, 2));
        c.clear();
        assert!(c.is_empty());
    }
}
