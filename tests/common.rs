//! Shared tree-building helpers for the integration tests.
#![allow(dead_code)]

use wimcore::blob::BlobTable;
use wimcore::dentry::{add_child, new_dentry_with_new_inode, DentryRef};
use wimcore::inode::{FileAttributes, StreamKind};

pub fn new_root() -> DentryRef {
    new_dir("")
}

pub fn new_dir(name: &str) -> DentryRef {
    let dentry = new_dentry_with_new_inode(name, false);
    dentry.borrow().inode.borrow_mut().attributes = FileAttributes::new().with_directory(true);
    dentry
}

pub fn new_file(name: &str, content: &[u8], table: &mut BlobTable) -> DentryRef {
    let dentry = new_dentry_with_new_inode(name, false);
    {
        let inode = dentry.borrow().inode.clone();
        let mut inode = inode.borrow_mut();
        inode.attributes = FileAttributes::new().with_normal(true);
        inode.add_stream_with_data(StreamKind::Data, &[], content, table);
    }
    dentry
}

pub fn attach(parent: &DentryRef, child: DentryRef) -> DentryRef {
    assert!(add_child(parent, &child).is_none());
    child
}
