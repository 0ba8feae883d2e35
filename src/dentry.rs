//! Directory entries and the tree operations over them.
//!
//! A dentry is one name of one inode under a specific parent. Children of a
//! directory are indexed by the two-level collation from [`crate::encoding`],
//! so an in-order walk of the index is the canonical child order.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::{Rc, Weak};

use crate::blob::BlobTable;
use crate::encoding::{
    self, encode_utf16, is_path_separator, utf16_to_string, CaseSensitivity, PATH_SEPARATOR,
};
use crate::error::Error;
use crate::inode::{new_inode_ref, FileAttributes, InodeRef};
use crate::Result;

pub type DentryRef = Rc<RefCell<Dentry>>;

/// Maximum directory nesting depth accepted when reading a tree.
pub const MAX_DIR_NESTING: usize = 16384;

/// Key of a directory's child index. Ordering is the two-level collation:
/// case-insensitive first, case-sensitive tie-break.
#[derive(Clone)]
pub struct ChildKey(pub(crate) Vec<u16>);

impl Ord for ChildKey {
    fn cmp(&self, other: &Self) -> Ordering {
        encoding::collate(&self.0, &other.0)
    }
}

impl PartialOrd for ChildKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ChildKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ChildKey {}

pub struct Dentry {
    pub inode: InodeRef,
    /// The parent dentry. The root (and any unlinked dentry) is its own
    /// parent.
    parent: Weak<RefCell<Dentry>>,
    name: Vec<u16>,
    short_name: Vec<u16>,
    /// Offset of this directory's children in the metadata resource. Only
    /// meaningful while reading or writing a tree.
    pub(crate) subdir_offset: u64,
    full_path: Option<String>,
    /// Name this dentry will be extracted under; planner-scoped.
    pub(crate) extraction_name: Option<Vec<u16>>,
    /// Scratch flag; always reset after use.
    pub(crate) tmp_flag: bool,
    pub(crate) is_orphan: bool,
    pub(crate) in_extraction_list: bool,
}

impl Dentry {
    pub fn name(&self) -> &[u16] {
        &self.name
    }

    pub fn name_string(&self) -> String {
        utf16_to_string(&self.name)
    }

    pub fn short_name(&self) -> &[u16] {
        &self.short_name
    }

    pub fn has_long_name(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn has_short_name(&self) -> bool {
        !self.short_name.is_empty()
    }

    pub fn parent(&self) -> Option<DentryRef> {
        self.parent.upgrade()
    }

    /// Set the long name. The short name is removed along with it, since it
    /// may not fit the new long name. Only valid on unlinked dentries; a
    /// linked dentry's name is owned by its parent's index.
    pub(crate) fn set_name_utf16(&mut self, name: &[u16]) {
        self.name = name.to_vec();
        self.short_name.clear();
        self.full_path = None;
    }

    pub(crate) fn set_short_name_utf16(&mut self, short_name: &[u16]) {
        self.short_name = short_name.to_vec();
    }

    /// Set the 8.3-style short name.
    pub fn set_short_name(&mut self, short_name: &str) {
        self.short_name = encode_utf16(short_name);
    }

    /// Put back a saved long name during journal rollback. Unlike
    /// [`Dentry::set_name_utf16`] this leaves the short name alone, since
    /// the journal restores it separately.
    pub(crate) fn restore_name(&mut self, name: Vec<u16>) {
        self.name = name;
        self.full_path = None;
    }

    pub fn extraction_name(&self) -> Option<String> {
        self.extraction_name.as_deref().map(utf16_to_string)
    }

    pub(crate) fn clear_extraction_state(&mut self) {
        self.extraction_name = None;
        self.in_extraction_list = false;
        self.tmp_flag = false;
    }
}

fn make_dentry(name: &[u16], inode: InodeRef) -> DentryRef {
    Rc::new_cyclic(|weak| {
        RefCell::new(Dentry {
            inode,
            parent: weak.clone(),
            name: name.to_vec(),
            short_name: Vec::new(),
            subdir_offset: 0,
            full_path: None,
            extraction_name: None,
            tmp_flag: false,
            is_orphan: false,
            in_extraction_list: false,
        })
    })
}

/// Create an unlinked dentry for an inode, from a raw UTF-16LE name.
pub(crate) fn new_dentry_with_inode_utf16(name: &[u16], inode: InodeRef) -> DentryRef {
    let dentry = make_dentry(name, inode.clone());
    inode.borrow_mut().add_alias(&dentry);
    dentry
}

/// Create an unlinked dentry with a brand-new inode.
pub fn new_dentry_with_new_inode(name: &str, set_timestamps: bool) -> DentryRef {
    let inode = new_inode_ref(set_timestamps);
    let dentry = make_dentry(&encode_utf16(name), inode);
    let inode = dentry.borrow().inode.clone();
    inode.borrow_mut().add_alias(&dentry);
    dentry
}

/// Create an unlinked dentry aliasing an existing inode (a hard link),
/// acquiring a reference to each of the inode's blobs.
pub fn new_dentry_with_existing_inode(name: &str, inode: InodeRef) -> DentryRef {
    let dentry = make_dentry(&encode_utf16(name), inode.clone());
    {
        let inode = inode.borrow();
        inode.ref_blobs();
    }
    inode.borrow_mut().add_alias(&dentry);
    dentry
}

/// Create an unnamed directory dentry with default metadata, used to fill in
/// path components that do not exist yet.
pub fn new_filler_directory() -> DentryRef {
    let dentry = new_dentry_with_new_inode("", true);
    dentry.borrow().inode.borrow_mut().attributes = FileAttributes::new().with_directory(true);
    dentry
}

/// Detach a dentry from any parent pointer without touching an index; used
/// when a tree root is unset.
pub(crate) fn make_self_parented(dentry: &DentryRef) {
    dentry.borrow_mut().parent = Rc::downgrade(dentry);
}

/// Whether the dentry is its own parent: true for the root of a tree and for
/// unlinked dentries.
pub fn dentry_is_root(dentry: &DentryRef) -> bool {
    let parent = dentry.borrow().parent.clone();
    match parent.upgrade() {
        Some(parent) => Rc::ptr_eq(&parent, dentry),
        None => true,
    }
}

pub fn dentry_is_directory(dentry: &DentryRef) -> bool {
    let inode = dentry.borrow().inode.clone();
    let is_dir = inode.borrow().is_directory();
    is_dir
}

pub fn dentry_has_children(dentry: &DentryRef) -> bool {
    let inode = dentry.borrow().inode.clone();
    let has = inode.borrow().has_children();
    has
}

/// Children of a directory, in collation order.
pub fn children_in_order(dir: &DentryRef) -> Vec<DentryRef> {
    let inode = dir.borrow().inode.clone();
    let children = inode.borrow().children.values().cloned().collect();
    children
}

/// Any one child of a directory, if it has one.
pub fn any_child(dir: &DentryRef) -> Option<DentryRef> {
    let inode = dir.borrow().inode.clone();
    let child = inode.borrow().children.values().next().cloned();
    child
}

/// Link `child` into the directory `parent`. Returns the pre-existing child
/// with the same case-sensitive name if there is one, in which case the tree
/// is unchanged.
pub fn add_child(parent: &DentryRef, child: &DentryRef) -> Option<DentryRef> {
    debug_assert!(!Rc::ptr_eq(parent, child));
    debug_assert!(dentry_is_directory(parent));

    let key = ChildKey(child.borrow().name.clone());
    let inode = parent.borrow().inode.clone();
    {
        let mut inode = inode.borrow_mut();
        if let Some(existing) = inode.children.get(&key) {
            return Some(existing.clone());
        }
        inode.children.insert(key, child.clone());
    }
    let mut child_mut = child.borrow_mut();
    child_mut.parent = Rc::downgrade(parent);
    child_mut.full_path = None;
    None
}

/// Unlink a dentry from its parent directory. No-op if it is the root or
/// already unlinked.
pub fn unlink(dentry: &DentryRef) {
    if dentry_is_root(dentry) {
        return;
    }
    let parent = match dentry.borrow().parent.upgrade() {
        Some(parent) => parent,
        None => return,
    };
    let key = ChildKey(dentry.borrow().name.clone());
    let parent_inode = parent.borrow().inode.clone();
    parent_inode.borrow_mut().children.remove(&key);
    dentry.borrow_mut().parent = Rc::downgrade(dentry);
}

/// Find the child of `dir` named `name`. A case-sensitive match always wins;
/// with case-insensitive behavior requested, an arbitrary case-insensitive
/// match is returned and an ambiguity warning is emitted when there are
/// several.
pub fn lookup_child(dir: &DentryRef, name: &[u16], case: CaseSensitivity) -> Option<DentryRef> {
    let key = ChildKey(name.to_vec());
    let inode = dir.borrow().inode.clone();
    let inode = inode.borrow();

    if let Some(exact) = inode.children.get(&key) {
        return Some(exact.clone());
    }

    if !encoding::will_ignore_case(case) {
        return None;
    }

    let ci_eq = |k: &ChildKey| encoding::cmp_utf16le(&k.0, name, true) == Ordering::Equal;
    let mut matches = Vec::new();
    for (k, d) in inode.children.range(..key.clone()).rev() {
        if !ci_eq(k) {
            break;
        }
        matches.push(d.clone());
    }
    matches.reverse();
    for (k, d) in inode.children.range(key.clone()..) {
        if !ci_eq(k) {
            break;
        }
        matches.push(d.clone());
    }
    drop(inode);

    let first = matches.first().cloned();
    if let Some(ref found) = first {
        if matches.len() > 1 {
            log::warn!(
                "Result of case-insensitive lookup is ambiguous (returning \"{}\" of {} possible files)",
                full_path(found),
                matches.len()
            );
        }
    }
    first
}

/// All children of `dentry`'s parent that share its case-insensitive name,
/// excluding `dentry` itself.
pub fn ci_matches(dentry: &DentryRef) -> Vec<DentryRef> {
    let parent = match dentry.borrow().parent.upgrade() {
        Some(parent) if !Rc::ptr_eq(&parent, dentry) => parent,
        _ => return Vec::new(),
    };
    let name = dentry.borrow().name.clone();
    let key = ChildKey(name.clone());
    let inode = parent.borrow().inode.clone();
    let inode = inode.borrow();
    let ci_eq = |k: &ChildKey| encoding::cmp_utf16le(&k.0, &name, true) == Ordering::Equal;

    let mut matches = Vec::new();
    for (k, d) in inode.children.range(..key.clone()).rev() {
        if !ci_eq(k) {
            break;
        }
        matches.push(d.clone());
    }
    for (k, d) in inode.children.range(key..) {
        if !ci_eq(k) {
            break;
        }
        matches.push(d.clone());
    }
    matches.retain(|d| !Rc::ptr_eq(d, dentry));
    matches
}

/// Resolve a path, relative to `root`, to a dentry.
///
/// Both `/` and `\` separate components; leading separators are skipped, so
/// the empty path names the root. Trailing separators constrain the result
/// to be a directory.
pub fn lookup_path(root: &DentryRef, path: &str, case: CaseSensitivity) -> Result<DentryRef> {
    let units = encode_utf16(path);
    let len = units.len();
    let mut pos = 0;
    let mut cur = root.clone();

    loop {
        if pos < len && !dentry_is_directory(&cur) {
            return Err(Error::NotADirectory(path.to_string()));
        }
        while pos < len && is_path_separator(units[pos]) {
            pos += 1;
        }
        if pos == len {
            return Ok(cur);
        }
        let start = pos;
        while pos < len && !is_path_separator(units[pos]) {
            pos += 1;
        }
        cur = lookup_child(&cur, &units[start..pos], case)
            .ok_or_else(|| Error::PathDoesNotExist(path.to_string()))?;
    }
}

/// The final component of a path, ignoring trailing separators.
pub fn path_basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    match trimmed.rfind(['/', '\\']) {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

/// The path with its final component removed.
pub fn path_parent(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    match trimmed.rfind(['/', '\\']) {
        Some(pos) => &trimmed[..pos],
        None => "",
    }
}

/// Call `visitor` on every dentry in the tree, parents before children,
/// siblings in collation order. The visitor must not change the structure of
/// the tree. The first error aborts the walk and is returned.
pub fn for_dentry_in_tree(
    root: &DentryRef,
    visitor: &mut dyn FnMut(&DentryRef) -> Result<()>,
) -> Result<()> {
    visitor(root)?;
    for child in children_in_order(root) {
        for_dentry_in_tree(&child, visitor)?;
    }
    Ok(())
}

/// Depth-first variant: children before their parent, so it is safe to tear
/// down the visited dentry.
pub fn for_dentry_in_tree_postorder(
    root: &DentryRef,
    visitor: &mut dyn FnMut(&DentryRef) -> Result<()>,
) -> Result<()> {
    for child in children_in_order(root) {
        for_dentry_in_tree_postorder(&child, visitor)?;
    }
    visitor(root)
}

/// The full path of the dentry from its tree's root, separator-joined and
/// cached. Ancestor mutations must invalidate the cache via
/// [`invalidate_full_paths`].
pub fn full_path(dentry: &DentryRef) -> String {
    if let Some(cached) = dentry.borrow().full_path.clone() {
        return cached;
    }
    let mut names = Vec::new();
    let mut cur = dentry.clone();
    while !dentry_is_root(&cur) {
        names.push(cur.borrow().name_string());
        let parent = cur.borrow().parent.upgrade();
        match parent {
            Some(parent) => cur = parent,
            None => break,
        }
    }
    let mut path = String::new();
    for name in names.iter().rev() {
        path.push(PATH_SEPARATOR);
        path.push_str(name);
    }
    if path.is_empty() {
        path.push(PATH_SEPARATOR);
    }
    dentry.borrow_mut().full_path = Some(path.clone());
    path
}

/// Drop the cached full paths of every dentry in the subtree.
pub fn invalidate_full_paths(root: &DentryRef) {
    let _ = for_dentry_in_tree(root, &mut |d| {
        d.borrow_mut().full_path = None;
        Ok(())
    });
}

/// Is `ancestor` a (possibly improper) ancestor of `dentry`?
pub fn is_ancestor(ancestor: &DentryRef, dentry: &DentryRef) -> bool {
    let mut cur = dentry.clone();
    loop {
        if Rc::ptr_eq(&cur, ancestor) {
            return true;
        }
        if dentry_is_root(&cur) {
            return false;
        }
        let parent = cur.borrow().parent.upgrade();
        match parent {
            Some(parent) => cur = parent,
            None => return false,
        }
    }
}

/// Tear down a whole tree: disassociate every dentry from its inode and,
/// when a blob table is given, release the blob references held through the
/// inodes' streams. The caller must have unlinked `root` already.
pub fn free_dentry_tree(root: &DentryRef, mut blob_table: Option<&mut BlobTable>) {
    let _ = for_dentry_in_tree_postorder(root, &mut |dentry| {
        let inode = dentry.borrow().inode.clone();
        {
            let inode = inode.borrow();
            if let Some(table) = blob_table.as_deref_mut() {
                inode.unref_blobs(table);
            }
        }
        let mut inode = inode.borrow_mut();
        inode.remove_alias(dentry);
        inode.children.clear();
        Ok(())
    });
}
