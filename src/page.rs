use crate::{util, Error, Result};

/// Null page id ( page 0 holds the tree header, so it never links ).
pub const NIL: i64 = 0;

/// Leaf page header: kind u8, count u16, prev u64, next u64.
const LEAF_HDR: usize = 19;
/// Internal page header: kind u8, count u16, first child u64.
const INT_HDR: usize = 11;

const KIND_LEAF: u8 = 0;
const KIND_INT: u8 = 1;

/// Keys a leaf page can hold.
pub fn leaf_cap(page_bytes: usize) -> usize {
    (page_bytes - LEAF_HDR) / 8
}

/// Entries an internal page can hold ( key + child pairs ).
pub fn int_cap(page_bytes: usize) -> usize {
    (page_bytes - INT_HDR) / 16
}

/// One B+Tree page, parsed.
///
/// Leaves hold sorted rowid keys and sibling links forming the scan
/// chain. Internal pages hold a first child plus ( separator, child )
/// entries; the subtree under `children[i]` holds keys ordered at or
/// after `keys[i]`.
pub struct BtPage {
    pub id: i64,
    pub leaf: bool,
    /// Previous leaf in the chain ( leaves only ).
    pub prev: i64,
    /// Next leaf in the chain ( leaves only ).
    pub next: i64,
    /// Leftmost child ( internal only ).
    pub first_child: i64,
    pub keys: Vec<i64>,
    /// Child page per key ( internal only ).
    pub children: Vec<i64>,
    pub dirty: bool,
    /// Cache recency stamp.
    pub stamp: u64,
}

impl BtPage {
    pub fn new_leaf(id: i64) -> Self {
        Self {
            id,
            leaf: true,
            prev: NIL,
            next: NIL,
            first_child: NIL,
            keys: Vec::new(),
            children: Vec::new(),
            dirty: true,
            stamp: 0,
        }
    }

    pub fn new_internal(id: i64, first_child: i64) -> Self {
        Self {
            id,
            leaf: false,
            prev: NIL,
            next: NIL,
            first_child,
            keys: Vec::new(),
            children: Vec::new(),
            dirty: true,
            stamp: 0,
        }
    }

    /// Parse a page from block data.
    pub fn decode(id: i64, data: &[u8]) -> Result<BtPage> {
        if data.len() < LEAF_HDR {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "short index page",
            )));
        }
        let kind = data[0];
        let count = util::getu16(data, 1) as usize;
        match kind {
            KIND_LEAF => {
                if LEAF_HDR + count * 8 > data.len() {
                    return Err(bad_page(id));
                }
                let mut keys = Vec::with_capacity(count);
                for i in 0..count {
                    keys.push(util::getu64(data, LEAF_HDR + i * 8) as i64);
                }
                Ok(BtPage {
                    id,
                    leaf: true,
                    prev: util::getu64(data, 3) as i64,
                    next: util::getu64(data, 11) as i64,
                    first_child: NIL,
                    keys,
                    children: Vec::new(),
                    dirty: false,
                    stamp: 0,
                })
            }
            KIND_INT => {
                if INT_HDR + count * 16 > data.len() {
                    return Err(bad_page(id));
                }
                let mut keys = Vec::with_capacity(count);
                let mut children = Vec::with_capacity(count);
                for i in 0..count {
                    keys.push(util::getu64(data, INT_HDR + i * 16) as i64);
                    children.push(util::getu64(data, INT_HDR + i * 16 + 8) as i64);
                }
                Ok(BtPage {
                    id,
                    leaf: false,
                    prev: NIL,
                    next: NIL,
                    first_child: util::getu64(data, 3) as i64,
                    keys,
                    children,
                    dirty: false,
                    stamp: 0,
                })
            }
            _ => Err(bad_page(id)),
        }
    }

    /// Serialize the page into a block image.
    pub fn encode(&self, page_bytes: usize) -> Vec<u8> {
        let mut data = vec![0; page_bytes];
        if self.leaf {
            data[0] = KIND_LEAF;
            util::setu16(&mut data, 1, self.keys.len() as u16);
            util::setu64(&mut data, 3, self.prev as u64);
            util::setu64(&mut data, 11, self.next as u64);
            for (i, k) in self.keys.iter().enumerate() {
                util::setu64(&mut data, LEAF_HDR + i * 8, *k as u64);
            }
        } else {
            data[0] = KIND_INT;
            util::setu16(&mut data, 1, self.keys.len() as u16);
            util::setu64(&mut data, 3, self.first_child as u64);
            for i in 0..self.keys.len() {
                util::setu64(&mut data, INT_HDR + i * 16, self.keys[i] as u64);
                util::setu64(&mut data, INT_HDR + i * 16 + 8, self.children[i] as u64);
            }
        }
        data
    }

    /// Page is at capacity for the given page size.
    pub fn full(&self, page_bytes: usize) -> bool {
        if self.leaf {
            self.keys.len() >= leaf_cap(page_bytes)
        } else {
            self.keys.len() >= int_cap(page_bytes)
        }
    }

    /// Child page for conceptual child slot ci ( 0 = first child ).
    pub fn child(&self, ci: usize) -> i64 {
        if ci == 0 {
            self.first_child
        } else {
            self.children[ci - 1]
        }
    }

    /// Insert an internal entry after child slot ci.
    pub fn insert_entry(&mut self, at: usize, key: i64, child: i64) {
        self.keys.insert(at, key);
        self.children.insert(at, child);
        self.dirty = true;
    }

    /// Remove internal entry at index ix, result is its ( key, child ).
    pub fn remove_entry(&mut self, ix: usize) -> (i64, i64) {
        let k = self.keys.remove(ix);
        let c = self.children.remove(ix);
        self.dirty = true;
        (k, c)
    }

    /// Split the upper half into a new page, result is ( separator slot, right page ).
    ///
    /// For a leaf the separator is the first key of the right page and
    /// every key is kept. For an internal page the middle entry's key
    /// moves up and its child becomes the right page's first child.
    pub fn split(&mut self, right_id: i64) -> (i64, BtPage) {
        self.dirty = true;
        if self.leaf {
            let at = self.keys.len() / 2;
            let mut right = BtPage::new_leaf(right_id);
            right.keys = self.keys.split_off(at);
            right.prev = self.id;
            right.next = self.next;
            self.next = right_id;
            (right.keys[0], right)
        } else {
            let at = self.keys.len() / 2;
            let sep = self.keys[at];
            let mut right = BtPage::new_internal(right_id, self.children[at]);
            right.keys = self.keys.split_off(at + 1);
            right.children = self.children.split_off(at + 1);
            self.keys.pop();
            self.children.pop();
            (sep, right)
        }
    }
}

fn bad_page(id: i64) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("corrupt index page {}", id),
    ))
}

#[test]
fn leaf_round_trip() {
    let mut p = BtPage::new_leaf(3);
    p.prev = 2;
    p.next = 4;
    p.keys = vec![10, 20, 30];
    let data = p.encode(256);
    let q = BtPage::decode(3, &data).unwrap();
    assert!(q.leaf);
    assert_eq!(q.prev, 2);
    assert_eq!(q.next, 4);
    assert_eq!(q.keys, vec![10, 20, 30]);
}

#[test]
fn internal_round_trip() {
    let mut p = BtPage::new_internal(7, 1);
    p.keys = vec![100, 200];
    p.children = vec![2, 3];
    let data = p.encode(256);
    let q = BtPage::decode(7, &data).unwrap();
    assert!(!q.leaf);
    assert_eq!(q.first_child, 1);
    assert_eq!(q.child(0), 1);
    assert_eq!(q.child(1), 2);
    assert_eq!(q.child(2), 3);
}

#[test]
fn leaf_split() {
    let mut p = BtPage::new_leaf(1);
    p.keys = (0..10).collect();
    let (sep, right) = p.split(2);
    assert_eq!(sep, 5);
    assert_eq!(p.keys, (0..5).collect::<Vec<i64>>());
    assert_eq!(right.keys, (5..10).collect::<Vec<i64>>());
    assert_eq!(p.next, 2);
    assert_eq!(right.prev, 1);
}

#[test]
fn internal_split() {
    let mut p = BtPage::new_internal(1, 10);
    p.keys = vec![1, 2, 3, 4, 5];
    p.children = vec![11, 12, 13, 14, 15];
    let (sep, right) = p.split(2);
    assert_eq!(sep, 3);
    assert_eq!(p.keys, vec![1, 2]);
    assert_eq!(p.children, vec![11, 12]);
    assert_eq!(right.first_child, 13);
    assert_eq!(right.keys, vec![4, 5]);
    assert_eq!(right.children, vec![14, 15]);
}

#[test]
fn corrupt_page() {
    assert!(BtPage::decode(1, &[9; 64]).is_err());
    assert!(BtPage::decode(1, &[0; 4]).is_err());
}
