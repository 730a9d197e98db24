use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, trace, warn};
use parking_lot::RwLock;

use super::inflight::InFlight;
use super::snapshot::{SerializedDirEntry, SerializedInode, SerializedInodeMap};
use crate::store::{BackingStore, TreeEntry};
use crate::types::*;

const DIRECTORY_PERM: u16 = 0o755;
const EXECUTABLE_PERM: u16 = 0o755;
const FILE_PERM: u16 = 0o644;

/// Point-in-time copy of an inode record, as returned by [`InodeMap::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub number: InodeNumber,
    pub kind: InodeKind,
    /// Non-owning link to the containing directory; `None` for the root and for unlinked inodes.
    pub parent: Option<InodeNumber>,
    pub name: OsString,
    /// Blob or tree in the backing store. `None` for entries created locally.
    pub content: Option<ObjectId>,
    /// Content (or listing) is owned by the overlay rather than the backing store.
    pub materialized: bool,
    pub size: Option<u64>,
    pub perm: u16,
    pub mtime: SystemTime,
    pub lookup_count: u64,
    pub open_count: u64,
    pub pin_count: u64,
}

/// A directory entry produced by [`InodeMap::list`], with its inode number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: OsString,
    pub inode: InodeNumber,
    pub kind: InodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ListingEntry {
    kind: InodeKind,
    content: Option<ObjectId>,
    executable: bool,
}

impl ListingEntry {
    fn from_tree(entry: &TreeEntry) -> Self {
        ListingEntry {
            kind: entry.kind,
            content: Some(entry.reference),
            executable: entry.executable,
        }
    }

    fn perm(&self) -> u16 {
        match (self.kind, self.executable) {
            (InodeKind::Directory, _) => DIRECTORY_PERM,
            (InodeKind::File, true) => EXECUTABLE_PERM,
            (InodeKind::File, false) => FILE_PERM,
        }
    }
}

type Listing = BTreeMap<OsString, ListingEntry>;

#[derive(Default)]
struct DirState {
    /// Entries of the directory. `None` until loaded from the backing tree.
    listing: Option<Listing>,
    /// Children that currently hold an inode number.
    children: HashMap<OsString, InodeNumber>,
}

enum Variant {
    File { size: Option<u64> },
    Directory(DirState),
}

struct InodeRecord {
    parent: Option<InodeNumber>,
    name: OsString,
    content: Option<ObjectId>,
    materialized: bool,
    perm: u16,
    mtime: SystemTime,
    lookup_count: u64,
    open_count: u64,
    pin_count: u64,
    variant: Variant,
}

impl InodeRecord {
    fn kind(&self) -> InodeKind {
        match self.variant {
            Variant::File { .. } => InodeKind::File,
            Variant::Directory(_) => InodeKind::Directory,
        }
    }

    fn is_referenced(&self) -> bool {
        self.lookup_count > 0 || self.open_count > 0 || self.pin_count > 0
    }

    fn view(&self, number: InodeNumber) -> Inode {
        Inode {
            number,
            kind: self.kind(),
            parent: self.parent,
            name: self.name.clone(),
            content: self.content,
            materialized: self.materialized,
            size: match self.variant {
                Variant::File { size } => size,
                Variant::Directory(_) => None,
            },
            perm: self.perm,
            mtime: self.mtime,
            lookup_count: self.lookup_count,
            open_count: self.open_count,
            pin_count: self.pin_count,
        }
    }
}

/// Outcome of one attempt at an operation that needs directory listings.
enum Step<R> {
    Done(R),
    /// The listing of this directory must be loaded before retrying.
    Load(InodeNumber),
}

struct MapState {
    inodes: HashMap<InodeNumber, InodeRecord>,
    next_inode: u64,
    /// Timestamp reported for content coming from the backing store.
    mount_time: SystemTime,
    /// Materialized files removed from the map whose overlay content can go.
    freed_local: Vec<InodeNumber>,
}

fn not_a_directory(ino: InodeNumber) -> FsError {
    FsError::new(
        ErrorKind::NotADirectory,
        format!("inode {} is not a directory", ino),
    )
}

fn check_name(name: &OsStr) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." || Path::new(name).components().count() != 1
    {
        return Err(FsError::invalid(format!("invalid entry name {:?}", name)));
    }
    Ok(())
}

impl MapState {
    fn record(&self, ino: InodeNumber) -> FsResult<&InodeRecord> {
        self.inodes.get(&ino).ok_or_else(|| FsError::stale(ino))
    }

    fn record_mut(&mut self, ino: InodeNumber) -> FsResult<&mut InodeRecord> {
        self.inodes.get_mut(&ino).ok_or_else(|| FsError::stale(ino))
    }

    fn dir(&self, ino: InodeNumber) -> FsResult<&DirState> {
        match &self.record(ino)?.variant {
            Variant::Directory(dir) => Ok(dir),
            Variant::File { .. } => Err(not_a_directory(ino)),
        }
    }

    fn dir_mut(&mut self, ino: InodeNumber) -> FsResult<&mut DirState> {
        match &mut self.record_mut(ino)?.variant {
            Variant::Directory(dir) => Ok(dir),
            Variant::File { .. } => Err(not_a_directory(ino)),
        }
    }

    fn listing(&self, ino: InodeNumber) -> FsResult<Option<&Listing>> {
        Ok(self.dir(ino)?.listing.as_ref())
    }

    fn listing_mut(&mut self, ino: InodeNumber) -> FsResult<Option<&mut Listing>> {
        Ok(self.dir_mut(ino)?.listing.as_mut())
    }

    fn next_number(&mut self) -> InodeNumber {
        let number = InodeNumber::from(self.next_inode);
        self.next_inode += 1;
        number
    }

    fn insert_child(
        &mut self,
        parent: InodeNumber,
        name: &OsStr,
        entry: &ListingEntry,
        lookup_count: u64,
    ) -> FsResult<InodeNumber> {
        self.dir(parent)?;
        let number = self.next_number();
        let local = entry.content.is_none();
        let variant = match entry.kind {
            InodeKind::File => Variant::File {
                size: if local { Some(0) } else { None },
            },
            InodeKind::Directory => Variant::Directory(DirState {
                listing: if local { Some(Listing::new()) } else { None },
                children: HashMap::new(),
            }),
        };
        let record = InodeRecord {
            parent: Some(parent),
            name: name.to_os_string(),
            content: entry.content,
            materialized: local,
            perm: entry.perm(),
            mtime: if local {
                SystemTime::now()
            } else {
                self.mount_time
            },
            lookup_count,
            open_count: 0,
            pin_count: 0,
            variant,
        };
        self.dir_mut(parent)?
            .children
            .insert(name.to_os_string(), number);
        self.inodes.insert(number, record);
        trace!("allocated inode {} for {:?} in {}", number, name, parent);
        Ok(number)
    }

    fn lookup_child(&mut self, parent: InodeNumber, name: &OsStr) -> FsResult<Step<InodeNumber>> {
        let dir = self.dir(parent)?;
        if let Some(&child) = dir.children.get(name) {
            self.record_mut(child)?.lookup_count += 1;
            return Ok(Step::Done(child));
        }
        let entry = match &dir.listing {
            None => return Ok(Step::Load(parent)),
            Some(listing) => listing.get(name).cloned().ok_or_else(|| {
                FsError::not_found(format!("{:?} in directory {}", name, parent))
            })?,
        };
        self.insert_child(parent, name, &entry, 1).map(Step::Done)
    }

    /// Returns the child's number, allocating one with no references if needed.
    fn child_or_scratch(
        &mut self,
        parent: InodeNumber,
        name: &OsStr,
        entry: &ListingEntry,
    ) -> FsResult<InodeNumber> {
        match self.dir(parent)?.children.get(name) {
            Some(&child) => Ok(child),
            None => self.insert_child(parent, name, entry, 0),
        }
    }

    /// Fails unless `dir` is an empty directory; asks for its listing if unknown.
    fn check_empty(&mut self, dir: InodeNumber) -> FsResult<Step<()>> {
        match self.listing(dir)? {
            None => Ok(Step::Load(dir)),
            Some(listing) if !listing.is_empty() => {
                self.maybe_remove(dir);
                Err(FsError::new(
                    ErrorKind::DirectoryNotEmpty,
                    format!("directory {} is not empty", dir),
                ))
            }
            Some(_) => Ok(Step::Done(())),
        }
    }

    fn touch_dir(&mut self, dir: InodeNumber) -> FsResult<()> {
        let record = self.record_mut(dir)?;
        record.materialized = true;
        record.mtime = SystemTime::now();
        Ok(())
    }

    /// Unlinks `name` from `parent`; its inode survives while referenced.
    fn remove_entry(&mut self, parent: InodeNumber, name: &OsStr) -> FsResult<()> {
        if let Some(listing) = self.listing_mut(parent)? {
            listing.remove(name);
        }
        self.touch_dir(parent)?;
        if let Some(child) = self.dir_mut(parent)?.children.remove(name) {
            self.detach(child);
        }
        Ok(())
    }

    fn detach(&mut self, child: InodeNumber) {
        if let Some(record) = self.inodes.get_mut(&child) {
            record.parent = None;
        }
        self.maybe_remove(child);
    }

    fn is_ancestor(&self, ancestor: InodeNumber, mut ino: InodeNumber) -> bool {
        loop {
            if ino == ancestor {
                return true;
            }
            match self.inodes.get(&ino).and_then(|record| record.parent) {
                Some(parent) => ino = parent,
                None => return false,
            }
        }
    }

    fn removable(&self, ino: InodeNumber) -> bool {
        if ino == ROOT_INODE {
            return false;
        }
        let Some(record) = self.inodes.get(&ino) else {
            return false;
        };
        if record.is_referenced() {
            return false;
        }
        // Local content of a linked inode is only reachable through its number.
        if record.materialized && record.parent.is_some() {
            return false;
        }
        match &record.variant {
            Variant::Directory(dir) => dir.children.is_empty(),
            Variant::File { .. } => true,
        }
    }

    /// Drops `ino` if nothing holds it any longer, then retries with its parent.
    fn maybe_remove(&mut self, ino: InodeNumber) {
        let mut current = Some(ino);
        while let Some(ino) = current.take() {
            if !self.removable(ino) {
                break;
            }
            let Some(record) = self.inodes.remove(&ino) else {
                break;
            };
            trace!("removed inode {}", ino);
            if record.materialized && record.kind() == InodeKind::File {
                self.freed_local.push(ino);
            }
            if let Some(parent) = record.parent {
                if let Ok(dir) = self.dir_mut(parent) {
                    if dir.children.get(&record.name) == Some(&ino) {
                        dir.children.remove(&record.name);
                    }
                }
                current = Some(parent);
            }
        }
    }

    fn install_listing(
        &mut self,
        dir: InodeNumber,
        tree: ObjectId,
        entries: &[TreeEntry],
    ) -> FsResult<bool> {
        let record = self.record(dir)?;
        if record.content != Some(tree) {
            return Ok(false);
        }
        if self.dir(dir)?.listing.is_some() {
            return Ok(true);
        }
        let listing: Listing = entries
            .iter()
            .map(|entry| (entry.name.clone(), ListingEntry::from_tree(entry)))
            .collect();

        // Children numbered before this listing was known (restore, tree change).
        let children: Vec<(OsString, InodeNumber)> = self
            .dir(dir)?
            .children
            .iter()
            .map(|(name, &ino)| (name.clone(), ino))
            .collect();
        for (name, child) in children {
            let keep = match listing.get(&name) {
                Some(entry) => self.refresh_child(child, entry),
                None => false,
            };
            if !keep {
                debug!("{:?} vanished from tree {}, detaching inode {}", name, tree, child);
                self.dir_mut(dir)?.children.remove(&name);
                self.detach(child);
            }
        }
        self.dir_mut(dir)?.listing = Some(listing);
        Ok(true)
    }

    /// Points an existing child at its entry in a fresh listing. Returns false
    /// if the child can no longer represent that entry.
    fn refresh_child(&mut self, child: InodeNumber, entry: &ListingEntry) -> bool {
        let Some(record) = self.inodes.get_mut(&child) else {
            return false;
        };
        if record.kind() != entry.kind {
            return false;
        }
        if record.materialized || record.content == entry.content {
            return true;
        }
        record.content = entry.content;
        record.perm = entry.perm();
        match &mut record.variant {
            Variant::File { size } => *size = None,
            Variant::Directory(dir) => dir.listing = None,
        }
        true
    }

    fn path_of(&self, ino: InodeNumber) -> FsResult<Option<PathBuf>> {
        let mut names = Vec::new();
        let mut current = ino;
        while current != ROOT_INODE {
            let record = self.record(current)?;
            match record.parent {
                Some(parent) => {
                    names.push(record.name.clone());
                    current = parent;
                }
                None => return Ok(None),
            }
        }
        let mut path = PathBuf::from("/");
        for name in names.iter().rev() {
            path.push(name);
        }
        Ok(Some(path))
    }
}

/// The registry of every inode known to the kernel for one mount session.
///
/// The map is the sole owner of inode records. Parent links are plain inode
/// numbers; a directory refers to its children by number too. Every mutation
/// goes through the methods below, which serialize on a single reader-writer
/// lock. Backing-store fetches happen outside that lock.
pub struct InodeMap {
    state: RwLock<MapState>,
    backing: Arc<dyn BackingStore>,
    tree_fetches: InFlight<ObjectId, Option<Arc<Vec<TreeEntry>>>>,
}

impl InodeMap {
    /// A map containing only the root, backed by `root_tree`.
    pub fn new(backing: Arc<dyn BackingStore>, root_tree: ObjectId) -> Self {
        let mount_time = SystemTime::now();
        let mut inodes = HashMap::new();
        inodes.insert(
            ROOT_INODE,
            InodeRecord {
                parent: None,
                name: OsString::new(),
                content: Some(root_tree),
                materialized: false,
                perm: DIRECTORY_PERM,
                mtime: mount_time,
                lookup_count: 1, // never forgotten
                open_count: 0,
                pin_count: 0,
                variant: Variant::Directory(DirState::default()),
            },
        );
        InodeMap {
            state: RwLock::new(MapState {
                inodes,
                next_inode: ROOT_INODE.as_raw() + 1,
                mount_time,
                freed_local: Vec::new(),
            }),
            backing,
            tree_fetches: InFlight::new(),
        }
    }

    /// Loads the listing of `dir` from the backing store if it is not cached.
    fn ensure_listing(&self, dir: InodeNumber) -> FsResult<()> {
        loop {
            let tree = {
                let state = self.state.read();
                let record = state.record(dir)?;
                let Variant::Directory(dir_state) = &record.variant else {
                    return Err(not_a_directory(dir));
                };
                if dir_state.listing.is_some() {
                    return Ok(());
                }
                record.content.ok_or_else(|| {
                    FsError::internal(format!("directory {} has neither listing nor tree", dir))
                })?
            };

            let fetched = self.tree_fetches.run(tree, || {
                if self.listing_settled(dir, tree) {
                    return Ok(None);
                }
                debug!("loading tree {} for inode {}", tree, dir);
                self.backing
                    .get_tree(&tree)
                    .map(|entries| Some(Arc::new(entries)))
                    .map_err(FsError::from)
            })?;

            if let Some(entries) = fetched {
                if self.state.write().install_listing(dir, tree, &entries)? {
                    return Ok(());
                }
            }
            // Loaded by someone else, or the tree reference changed meanwhile.
        }
    }

    fn listing_settled(&self, dir: InodeNumber, tree: ObjectId) -> bool {
        let state = self.state.read();
        match state.inodes.get(&dir) {
            Some(record) => {
                record.content != Some(tree)
                    || matches!(&record.variant, Variant::Directory(d) if d.listing.is_some())
            }
            None => true,
        }
    }

    fn with_listings<R>(
        &self,
        dirs: &[InodeNumber],
        mut op: impl FnMut(&mut MapState) -> FsResult<Step<R>>,
    ) -> FsResult<R> {
        let mut pending = dirs.to_vec();
        loop {
            for dir in pending.drain(..) {
                if let Err(e) = self.ensure_listing(dir) {
                    self.state.write().maybe_remove(dir);
                    return Err(e);
                }
            }
            let mut state = self.state.write();
            match op(&mut state)? {
                Step::Done(result) => return Ok(result),
                Step::Load(dir) => pending.push(dir),
            }
        }
    }

    /// Resolves `name` under `parent`, allocating an inode number on first use.
    ///
    /// Counts as one kernel reference, released by [`forget`](Self::forget).
    /// Concurrent lookups of the same name all observe the same number.
    pub fn lookup(&self, parent: InodeNumber, name: &OsStr) -> FsResult<InodeNumber> {
        if name == "." || name == ".." {
            let mut state = self.state.write();
            state.dir(parent)?;
            let target = if name == "." {
                parent
            } else {
                state.record(parent)?.parent.unwrap_or(parent)
            };
            state.record_mut(target)?.lookup_count += 1;
            return Ok(target);
        }
        check_name(name)?;
        self.with_listings(&[parent], |state| state.lookup_child(parent, name))
    }

    pub fn resolve(&self, ino: InodeNumber) -> FsResult<Inode> {
        let state = self.state.read();
        Ok(state.record(ino)?.view(ino))
    }

    pub fn contains(&self, ino: InodeNumber) -> bool {
        self.state.read().inodes.contains_key(&ino)
    }

    /// Creates a local entry `name` in `parent`, owned by the overlay.
    ///
    /// Counts as one kernel reference, like [`lookup`](Self::lookup).
    pub fn allocate(
        &self,
        kind: InodeKind,
        parent: InodeNumber,
        name: &OsStr,
    ) -> FsResult<InodeNumber> {
        check_name(name)?;
        self.with_listings(&[parent], |state| {
            let Some(listing) = state.listing_mut(parent)? else {
                return Ok(Step::Load(parent));
            };
            if listing.contains_key(name) {
                return Err(FsError::new(
                    ErrorKind::AlreadyExists,
                    format!("{:?} already exists in {}", name, parent),
                ));
            }
            let entry = ListingEntry {
                kind,
                content: None,
                executable: false,
            };
            listing.insert(name.to_os_string(), entry.clone());
            state.touch_dir(parent)?;
            state.insert_child(parent, name, &entry, 1).map(Step::Done)
        })
    }

    /// Drops `nlookup` kernel references.
    pub fn forget(&self, ino: InodeNumber, nlookup: u64) -> FsResult<()> {
        let mut state = self.state.write();
        let record = state.record_mut(ino)?;
        if record.lookup_count < nlookup {
            warn!(
                "forget of {} references on inode {} holding {}",
                nlookup, ino, record.lookup_count
            );
        }
        record.lookup_count = record.lookup_count.saturating_sub(nlookup);
        state.maybe_remove(ino);
        Ok(())
    }

    pub fn open(&self, ino: InodeNumber) -> FsResult<()> {
        self.state.write().record_mut(ino)?.open_count += 1;
        Ok(())
    }

    /// Drops one open handle. The record goes away once nothing references it.
    pub fn release(&self, ino: InodeNumber) -> FsResult<()> {
        let mut state = self.state.write();
        let record = state.record_mut(ino)?;
        if record.open_count == 0 {
            return Err(FsError::invalid(format!(
                "release of inode {} without open handle",
                ino
            )));
        }
        record.open_count -= 1;
        state.maybe_remove(ino);
        Ok(())
    }

    /// Releases pins taken by [`list`](Self::list).
    pub fn unpin(&self, pins: &[InodeNumber]) {
        let mut state = self.state.write();
        for &ino in pins {
            if let Some(record) = state.inodes.get_mut(&ino) {
                record.pin_count = record.pin_count.saturating_sub(1);
            }
            state.maybe_remove(ino);
        }
    }

    /// Lists `dir` starting at entry index `skip`, while `admit` accepts names.
    ///
    /// Every returned entry gets an inode number and is pinned, so it stays
    /// resolvable until [`unpin`](Self::unpin) even without kernel references.
    pub fn list(
        &self,
        dir: InodeNumber,
        skip: usize,
        mut admit: impl FnMut(&OsStr) -> bool,
    ) -> FsResult<Vec<ListedEntry>> {
        self.with_listings(&[dir], |state| {
            let Some(listing) = state.listing(dir)? else {
                return Ok(Step::Load(dir));
            };
            let mut chosen = Vec::new();
            for (name, entry) in listing.iter().skip(skip) {
                if !admit(name) {
                    break;
                }
                chosen.push((name.clone(), entry.clone()));
            }

            let mut listed = Vec::with_capacity(chosen.len());
            for (name, entry) in chosen {
                let inode = state.child_or_scratch(dir, &name, &entry)?;
                state.record_mut(inode)?.pin_count += 1;
                listed.push(ListedEntry {
                    name,
                    inode,
                    kind: entry.kind,
                });
            }
            Ok(Step::Done(listed))
        })
    }

    pub fn unlink(&self, parent: InodeNumber, name: &OsStr) -> FsResult<()> {
        check_name(name)?;
        self.with_listings(&[parent], |state| {
            let Some(listing) = state.listing(parent)? else {
                return Ok(Step::Load(parent));
            };
            let entry = listing
                .get(name)
                .ok_or_else(|| FsError::not_found(format!("{:?} in directory {}", name, parent)))?;
            if entry.kind == InodeKind::Directory {
                return Err(FsError::new(
                    ErrorKind::IsADirectory,
                    format!("{:?} is a directory", name),
                ));
            }
            state.remove_entry(parent, name)?;
            Ok(Step::Done(()))
        })
    }

    pub fn rmdir(&self, parent: InodeNumber, name: &OsStr) -> FsResult<()> {
        check_name(name)?;
        self.with_listings(&[parent], |state| {
            let Some(listing) = state.listing(parent)? else {
                return Ok(Step::Load(parent));
            };
            let entry = listing
                .get(name)
                .cloned()
                .ok_or_else(|| FsError::not_found(format!("{:?} in directory {}", name, parent)))?;
            if entry.kind != InodeKind::Directory {
                return Err(FsError::new(
                    ErrorKind::NotADirectory,
                    format!("{:?} is not a directory", name),
                ));
            }
            let child = state.child_or_scratch(parent, name, &entry)?;
            if let Step::Load(dir) = state.check_empty(child)? {
                return Ok(Step::Load(dir));
            }
            state.remove_entry(parent, name)?;
            Ok(Step::Done(()))
        })
    }

    /// Moves `parent/name` to `new_parent/new_name`, replacing a compatible target.
    pub fn rename(
        &self,
        parent: InodeNumber,
        name: &OsStr,
        new_parent: InodeNumber,
        new_name: &OsStr,
        flags: RenameFlags,
    ) -> FsResult<()> {
        check_name(name)?;
        check_name(new_name)?;
        if flags.contains(RenameFlags::EXCHANGE) {
            return Err(FsError::invalid("exchanging renames are not supported"));
        }
        self.with_listings(&[parent, new_parent], |state| {
            let Some(listing) = state.listing(parent)? else {
                return Ok(Step::Load(parent));
            };
            let source = listing
                .get(name)
                .cloned()
                .ok_or_else(|| FsError::not_found(format!("{:?} in directory {}", name, parent)))?;
            let Some(target_listing) = state.listing(new_parent)? else {
                return Ok(Step::Load(new_parent));
            };
            if parent == new_parent && name == new_name {
                return Ok(Step::Done(()));
            }
            let target = target_listing.get(new_name).cloned();

            if let Some(target) = &target {
                if flags.contains(RenameFlags::NOREPLACE) {
                    return Err(FsError::new(
                        ErrorKind::AlreadyExists,
                        format!("{:?} already exists in {}", new_name, new_parent),
                    ));
                }
                match (source.kind, target.kind) {
                    (InodeKind::File, InodeKind::Directory) => {
                        return Err(FsError::new(
                            ErrorKind::IsADirectory,
                            format!("{:?} is a directory", new_name),
                        ))
                    }
                    (InodeKind::Directory, InodeKind::File) => {
                        return Err(FsError::new(
                            ErrorKind::NotADirectory,
                            format!("{:?} is not a directory", new_name),
                        ))
                    }
                    (InodeKind::Directory, InodeKind::Directory) => {
                        let replaced = state.child_or_scratch(new_parent, new_name, target)?;
                        if let Step::Load(dir) = state.check_empty(replaced)? {
                            return Ok(Step::Load(dir));
                        }
                    }
                    (InodeKind::File, InodeKind::File) => {}
                }
            }

            let moved = state.dir(parent)?.children.get(name).copied();
            if let Some(moved) = moved {
                if source.kind == InodeKind::Directory && state.is_ancestor(moved, new_parent) {
                    return Err(FsError::invalid(format!(
                        "cannot move directory {} beneath itself",
                        moved
                    )));
                }
            }

            if target.is_some() {
                state.remove_entry(new_parent, new_name)?;
            }
            if let Some(listing) = state.listing_mut(parent)? {
                listing.remove(name);
            }
            state.touch_dir(parent)?;
            state.dir_mut(parent)?.children.remove(name);
            if let Some(listing) = state.listing_mut(new_parent)? {
                listing.insert(new_name.to_os_string(), source);
            }
            state.touch_dir(new_parent)?;
            if let Some(moved) = moved {
                state
                    .dir_mut(new_parent)?
                    .children
                    .insert(new_name.to_os_string(), moved);
                let record = state.record_mut(moved)?;
                record.parent = Some(new_parent);
                record.name = new_name.to_os_string();
            }
            Ok(Step::Done(()))
        })
    }

    /// Points `ino` at a new backing object, dropping cached content and listing.
    pub fn update_tree(&self, ino: InodeNumber, reference: ObjectId) -> FsResult<()> {
        let mut state = self.state.write();
        let record = state.record_mut(ino)?;
        if record.materialized {
            return Err(FsError::invalid(format!(
                "inode {} has local modifications",
                ino
            )));
        }
        if record.content == Some(reference) {
            return Ok(());
        }
        record.content = Some(reference);
        match &mut record.variant {
            Variant::File { size } => *size = None,
            Variant::Directory(dir) => dir.listing = None,
        }
        Ok(())
    }

    /// Records that the content of file `ino` now lives in the overlay.
    pub fn mark_materialized(&self, ino: InodeNumber, size: u64) -> FsResult<()> {
        let mut state = self.state.write();
        let record = state.record_mut(ino)?;
        match &mut record.variant {
            Variant::File { size: cached } => *cached = Some(size),
            Variant::Directory(_) => {
                return Err(FsError::new(
                    ErrorKind::IsADirectory,
                    format!("inode {} is a directory", ino),
                ))
            }
        }
        record.materialized = true;
        record.mtime = SystemTime::now();
        Ok(())
    }

    /// Caches the size of a file whose content was fetched.
    pub fn set_size(&self, ino: InodeNumber, size: u64) -> FsResult<()> {
        let mut state = self.state.write();
        if let Variant::File { size: cached } = &mut state.record_mut(ino)?.variant {
            *cached = Some(size);
        }
        Ok(())
    }

    pub fn set_mode(&self, ino: InodeNumber, perm: u16) -> FsResult<()> {
        self.state.write().record_mut(ino)?.perm = perm & 0o7777;
        Ok(())
    }

    pub fn set_mtime(&self, ino: InodeNumber, mtime: SystemTime) -> FsResult<()> {
        self.state.write().record_mut(ino)?.mtime = mtime;
        Ok(())
    }

    /// Absolute path of `ino`, or `None` if it has been unlinked.
    pub fn path_of(&self, ino: InodeNumber) -> FsResult<Option<PathBuf>> {
        self.state.read().path_of(ino)
    }

    /// Reverse lookup through numbered inodes only; never consults the backing store.
    pub fn inode_for_path(&self, path: &Path) -> Option<InodeNumber> {
        let state = self.state.read();
        let mut current = ROOT_INODE;
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    current = state.inodes.get(&current)?.parent.unwrap_or(ROOT_INODE);
                }
                Component::Normal(name) => {
                    current = *state.dir(current).ok()?.children.get(name)?;
                }
                Component::Prefix(_) => return None,
            }
        }
        Some(current)
    }

    /// Materialized files dropped from the map since the last call.
    pub fn drain_freed(&self) -> Vec<InodeNumber> {
        std::mem::take(&mut self.state.write().freed_local)
    }

    pub fn len(&self) -> usize {
        self.state.read().inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Captures every inode still referenced, or holding local state, plus
    /// their ancestors. Holds the write lock for the whole capture.
    pub fn snapshot(&self) -> FsResult<SerializedInodeMap> {
        let state = self.state.write();
        let mut keep = HashSet::new();
        for (&ino, record) in &state.inodes {
            let live = ino == ROOT_INODE
                || record.lookup_count > 0
                || record.open_count > 0
                || (record.materialized && record.parent.is_some());
            if !live {
                continue;
            }
            let mut current = Some(ino);
            while let Some(ino) = current {
                if !keep.insert(ino) {
                    break;
                }
                current = state.inodes.get(&ino).and_then(|record| record.parent);
            }
        }

        let mut inodes = Vec::with_capacity(keep.len());
        for ino in keep {
            let record = state.record(ino)?;
            let entries = match &record.variant {
                Variant::Directory(dir) if record.materialized => {
                    dir.listing.as_ref().map(|listing| {
                        listing
                            .iter()
                            .map(|(name, entry)| SerializedDirEntry {
                                name: name.clone(),
                                kind: entry.kind,
                                content: entry.content,
                                executable: entry.executable,
                            })
                            .collect()
                    })
                }
                _ => None,
            };
            let view = record.view(ino);
            inodes.push(SerializedInode {
                number: ino,
                path: state.path_of(ino)?,
                kind: view.kind,
                content: view.content,
                materialized: view.materialized,
                size: view.size,
                perm: view.perm,
                mtime: view.mtime,
                lookup_count: view.lookup_count,
                open_count: view.open_count,
                entries,
            });
        }
        inodes.sort_by_key(|inode| inode.number);
        Ok(SerializedInodeMap {
            next_inode: state.next_inode,
            inodes,
        })
    }

    /// Rebuilds a map from a snapshot, keeping every inode number as saved.
    pub fn restore(
        backing: Arc<dyn BackingStore>,
        snapshot: &SerializedInodeMap,
    ) -> FsResult<InodeMap> {
        let root = snapshot
            .get(ROOT_INODE)
            .ok_or_else(|| FsError::invalid("snapshot has no root inode"))?;

        let mut saved: Vec<&SerializedInode> = snapshot.inodes.iter().collect();
        saved.sort_by_key(|inode| {
            let depth = inode
                .path
                .as_ref()
                .map(|path| path.components().count())
                .unwrap_or(usize::MAX);
            (depth, inode.number)
        });

        let mut state = MapState {
            inodes: HashMap::new(),
            next_inode: 0,
            mount_time: root.mtime,
            freed_local: Vec::new(),
        };
        let mut by_path: HashMap<PathBuf, InodeNumber> = HashMap::new();

        for inode in saved {
            if state.inodes.contains_key(&inode.number) {
                return Err(FsError::invalid(format!(
                    "snapshot lists inode {} twice",
                    inode.number
                )));
            }
            let (parent, name) = match &inode.path {
                Some(_) if inode.number == ROOT_INODE => (None, OsString::new()),
                Some(path) => {
                    let parent_path = path.parent().ok_or_else(|| {
                        FsError::invalid(format!("snapshot path {} has no parent", path.display()))
                    })?;
                    let parent = *by_path.get(parent_path).ok_or_else(|| {
                        FsError::invalid(format!(
                            "snapshot misses the parent of {}",
                            path.display()
                        ))
                    })?;
                    let name = path.file_name().ok_or_else(|| {
                        FsError::invalid(format!("snapshot path {} has no name", path.display()))
                    })?;
                    (Some(parent), name.to_os_string())
                }
                None if inode.number == ROOT_INODE => {
                    return Err(FsError::invalid("snapshot root has no path"))
                }
                None => (None, OsString::new()),
            };

            let variant = match inode.kind {
                InodeKind::File => Variant::File { size: inode.size },
                InodeKind::Directory => {
                    let listing = match &inode.entries {
                        Some(entries) => Some(
                            entries
                                .iter()
                                .map(|entry| {
                                    (
                                        entry.name.clone(),
                                        ListingEntry {
                                            kind: entry.kind,
                                            content: entry.content,
                                            executable: entry.executable,
                                        },
                                    )
                                })
                                .collect(),
                        ),
                        None if inode.content.is_none() => Some(Listing::new()),
                        None => None,
                    };
                    Variant::Directory(DirState {
                        listing,
                        children: HashMap::new(),
                    })
                }
            };

            if let Some(parent) = parent {
                state
                    .dir_mut(parent)?
                    .children
                    .insert(name.clone(), inode.number);
            }
            state.inodes.insert(
                inode.number,
                InodeRecord {
                    parent,
                    name,
                    content: inode.content,
                    materialized: inode.materialized,
                    perm: inode.perm,
                    mtime: inode.mtime,
                    lookup_count: inode.lookup_count,
                    open_count: inode.open_count,
                    pin_count: 0,
                    variant,
                },
            );
            if let Some(path) = &inode.path {
                by_path.insert(path.clone(), inode.number);
            }
        }

        let highest = snapshot
            .inodes
            .iter()
            .map(|inode| inode.number.as_raw())
            .max()
            .unwrap_or(ROOT_INODE.as_raw());
        state.next_inode = snapshot.next_inode.max(highest + 1);
        debug!(
            "restored {} inodes, next inode {}",
            state.inodes.len(),
            state.next_inode
        );

        Ok(InodeMap {
            state: RwLock::new(state),
            backing,
            tree_fetches: InFlight::new(),
        })
    }
}
