//! In-memory stores, used by tests and by embedders that build working copies on the fly.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Component, Path};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::{BackingStore, OverlayStore, TreeEntry};
use crate::types::{InodeKind, InodeNumber, ObjectId, StoreError};

enum Object {
    Tree(Vec<TreeEntry>),
    Blob(Vec<u8>),
    Corrupt,
}

/// A [`BackingStore`] holding its objects in a hash map.
///
/// Availability and latency can be toggled at run time to exercise failure paths,
/// and the number of fetches served is counted.
pub struct MemoryBackingStore {
    objects: RwLock<HashMap<ObjectId, Object>>,
    next_id: AtomicU64,
    available: AtomicBool,
    fetch_delay: Mutex<Duration>,
    tree_fetches: AtomicUsize,
    blob_fetches: AtomicUsize,
}

impl Default for MemoryBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        MemoryBackingStore {
            objects: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
            fetch_delay: Mutex::new(Duration::ZERO),
            tree_fetches: AtomicUsize::new(0),
            blob_fetches: AtomicUsize::new(0),
        }
    }

    fn allocate_id(&self) -> ObjectId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut bytes = [0u8; ObjectId::LEN];
        bytes[ObjectId::LEN - 8..].copy_from_slice(&n.to_be_bytes());
        ObjectId::new(bytes)
    }

    fn insert(&self, object: Object) -> ObjectId {
        let id = self.allocate_id();
        self.objects.write().insert(id, object);
        id
    }

    pub fn add_blob(&self, content: impl Into<Vec<u8>>) -> ObjectId {
        self.insert(Object::Blob(content.into()))
    }

    pub fn add_tree(&self, entries: Vec<TreeEntry>) -> ObjectId {
        self.insert(Object::Tree(entries))
    }

    /// An object whose content fails verification when fetched.
    pub fn add_corrupt(&self) -> ObjectId {
        self.insert(Object::Corrupt)
    }

    /// Builds nested trees for a list of `(relative path, content)` pairs and
    /// returns the id of the top-level tree.
    pub fn build_tree<P, C>(&self, files: &[(P, C)]) -> ObjectId
    where
        P: AsRef<Path>,
        C: AsRef<[u8]>,
    {
        let mut root = BTreeMap::new();
        for (path, content) in files {
            let names: Vec<OsString> = path
                .as_ref()
                .components()
                .filter_map(|c| match c {
                    Component::Normal(name) => Some(name.to_os_string()),
                    _ => None,
                })
                .collect();
            insert_node(&mut root, &names, content.as_ref());
        }
        self.store_nodes(root)
    }

    fn store_nodes(&self, nodes: BTreeMap<OsString, Node>) -> ObjectId {
        let entries = nodes
            .into_iter()
            .map(|(name, node)| match node {
                Node::File(content) => TreeEntry {
                    name,
                    kind: InodeKind::File,
                    reference: self.add_blob(content),
                    executable: false,
                },
                Node::Dir(children) => TreeEntry {
                    name,
                    kind: InodeKind::Directory,
                    reference: self.store_nodes(children),
                    executable: false,
                },
            })
            .collect();
        self.add_tree(entries)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Every fetch sleeps for `delay` before answering.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn tree_fetch_count(&self) -> usize {
        self.tree_fetches.load(Ordering::SeqCst)
    }

    pub fn blob_fetch_count(&self) -> usize {
        self.blob_fetches.load(Ordering::SeqCst)
    }

    fn before_fetch(&self, reference: &ObjectId) -> Result<(), StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "backing store offline while fetching {}",
                reference
            )));
        }
        let delay = *self.fetch_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(())
    }
}

enum Node {
    File(Vec<u8>),
    Dir(BTreeMap<OsString, Node>),
}

fn insert_node(nodes: &mut BTreeMap<OsString, Node>, names: &[OsString], content: &[u8]) {
    match names {
        [] => {}
        [name] => {
            nodes.insert(name.clone(), Node::File(content.to_vec()));
        }
        [name, rest @ ..] => {
            let node = nodes
                .entry(name.clone())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            if let Node::File(_) = node {
                *node = Node::Dir(BTreeMap::new());
            }
            if let Node::Dir(children) = node {
                insert_node(children, rest, content);
            }
        }
    }
}

impl BackingStore for MemoryBackingStore {
    fn get_tree(&self, reference: &ObjectId) -> Result<Vec<TreeEntry>, StoreError> {
        self.before_fetch(reference)?;
        self.tree_fetches.fetch_add(1, Ordering::SeqCst);
        match self.objects.read().get(reference) {
            Some(Object::Tree(entries)) => Ok(entries.clone()),
            Some(Object::Blob(_)) => Err(StoreError::Corrupted(format!(
                "{} is a blob, expected a tree",
                reference
            ))),
            Some(Object::Corrupt) => Err(StoreError::Corrupted(format!(
                "tree {} failed verification",
                reference
            ))),
            None => Err(StoreError::Unavailable(format!("unknown tree {}", reference))),
        }
    }

    fn get_blob(&self, reference: &ObjectId) -> Result<Vec<u8>, StoreError> {
        self.before_fetch(reference)?;
        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        match self.objects.read().get(reference) {
            Some(Object::Blob(content)) => Ok(content.clone()),
            Some(Object::Tree(_)) => Err(StoreError::Corrupted(format!(
                "{} is a tree, expected a blob",
                reference
            ))),
            Some(Object::Corrupt) => Err(StoreError::Corrupted(format!(
                "blob {} failed verification",
                reference
            ))),
            None => Err(StoreError::Unavailable(format!("unknown blob {}", reference))),
        }
    }
}

/// An [`OverlayStore`] keeping modified content in memory.
pub struct MemoryOverlayStore {
    files: RwLock<HashMap<InodeNumber, Vec<u8>>>,
    available: AtomicBool,
    writes: AtomicUsize,
}

impl Default for MemoryOverlayStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOverlayStore {
    pub fn new() -> Self {
        MemoryOverlayStore {
            files: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, inode: InodeNumber) -> bool {
        self.files.read().contains_key(&inode)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("overlay offline".to_string()))
        }
    }
}

impl OverlayStore for MemoryOverlayStore {
    fn read_local(&self, inode: InodeNumber) -> Result<Vec<u8>, StoreError> {
        self.check_available()?;
        self.files
            .read()
            .get(&inode)
            .cloned()
            .ok_or_else(|| StoreError::Unavailable(format!("no local content for inode {}", inode)))
    }

    fn write_local(&self, inode: InodeNumber, content: &[u8]) -> Result<(), StoreError> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.files.write().insert(inode, content.to_vec());
        Ok(())
    }

    fn remove_local(&self, inode: InodeNumber) -> Result<(), StoreError> {
        self.check_available()?;
        self.files.write().remove(&inode);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_tree_nests_directories() {
        let store = MemoryBackingStore::new();
        let root = store.build_tree(&[("a/b.txt", "hello"), ("a/c/d", "x"), ("top", "")]);

        let entries = store.get_tree(&root).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec![OsString::from("a"), OsString::from("top")]);
        assert_eq!(entries[0].kind, InodeKind::Directory);

        let a = store.get_tree(&entries[0].reference).unwrap();
        assert_eq!(a.len(), 2);
        let b = a.iter().find(|e| e.name == "b.txt").unwrap();
        assert_eq!(store.get_blob(&b.reference).unwrap(), b"hello");
    }

    #[test]
    fn test_unavailable_store_fails_fetches() {
        let store = MemoryBackingStore::new();
        let blob = store.add_blob("x");
        store.set_available(false);
        assert!(matches!(store.get_blob(&blob), Err(StoreError::Unavailable(_))));
        store.set_available(true);
        assert_eq!(store.get_blob(&blob).unwrap(), b"x");
        assert_eq!(store.blob_fetch_count(), 1);
    }

    #[test]
    fn test_corrupt_and_mistyped_objects() {
        let store = MemoryBackingStore::new();
        let corrupt = store.add_corrupt();
        let blob = store.add_blob("x");
        assert!(matches!(store.get_blob(&corrupt), Err(StoreError::Corrupted(_))));
        assert!(matches!(store.get_tree(&blob), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn test_overlay_round_trip() {
        let overlay = MemoryOverlayStore::new();
        let ino = InodeNumber::from(7);
        assert!(overlay.read_local(ino).is_err());
        overlay.write_local(ino, b"local").unwrap();
        assert_eq!(overlay.read_local(ino).unwrap(), b"local");
        overlay.remove_local(ino).unwrap();
        assert!(!overlay.contains(ino));
    }
}
