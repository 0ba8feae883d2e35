//! Journaled image updates.
//!
//! High-level commands (add, delete, rename) decompose into primitive tree
//! mutations that can be undone in reverse order. A failing command rolls
//! back its own primitives; in atomic mode the whole batch unwinds.

use std::rc::Rc;

use crate::blob::BlobTable;
use crate::dentry::{
    add_child, any_child, dentry_has_children, dentry_is_directory, dentry_is_root,
    free_dentry_tree, full_path, invalidate_full_paths, is_ancestor, lookup_child, lookup_path,
    make_self_parented, new_filler_directory, path_basename, path_parent, unlink, DentryRef,
};
use crate::encoding::{encode_utf16, is_path_separator, CaseSensitivity};
use crate::error::Error;
use crate::Result;

/// One high-level mutation of an image tree.
pub enum UpdateCommand {
    /// Graft `branch` at `target_path`, creating filler directories along
    /// the way. Directories merge recursively; a non-directory target is
    /// replaced unless `no_replace` is set.
    Add {
        branch: DentryRef,
        target_path: String,
        no_replace: bool,
    },
    /// Remove the tree at `path`. `recursive` is required for directories;
    /// `force` suppresses the missing-path error.
    Delete {
        path: String,
        recursive: bool,
        force: bool,
    },
    Rename {
        from: String,
        to: String,
    },
}

enum UpdatePrimitive {
    Unlink {
        subject: DentryRef,
        parent: Option<DentryRef>,
    },
    Link {
        subject: DentryRef,
        parent: Option<DentryRef>,
    },
    ChangeName {
        subject: DentryRef,
        old_name: Vec<u16>,
    },
    ChangeShortName {
        subject: DentryRef,
        old_name: Vec<u16>,
    },
}

/// Records the primitives executed for each command of a batch, and owns
/// any trees currently unlinked from the image.
#[derive(Default)]
pub struct UpdateJournal {
    cmd_prims: Vec<Vec<UpdatePrimitive>>,
    cur_cmd: usize,
    orphans: Vec<DentryRef>,
}

fn do_link(
    subject: &DentryRef,
    parent: Option<&DentryRef>,
    root: &mut Option<DentryRef>,
) -> Result<()> {
    match parent {
        Some(parent) => {
            if let Some(duplicate) = add_child(parent, subject) {
                return Err(Error::NameCollision(full_path(&duplicate)));
            }
        }
        None => *root = Some(subject.clone()),
    }
    Ok(())
}

fn do_unlink(subject: &DentryRef, parent: Option<&DentryRef>, root: &mut Option<DentryRef>) {
    match parent {
        Some(_) => unlink(subject),
        None => *root = None,
    }
    make_self_parented(subject);
}

impl UpdateJournal {
    pub fn new(num_cmds: usize) -> Self {
        Self {
            cmd_prims: (0..num_cmds.max(1)).map(|_| Vec::new()).collect(),
            cur_cmd: 0,
            orphans: Vec::new(),
        }
    }

    fn record(&mut self, prim: UpdatePrimitive) {
        self.cmd_prims[self.cur_cmd].push(prim);
    }

    fn remove_orphan(&mut self, subject: &DentryRef) {
        self.orphans.retain(|orphan| !Rc::ptr_eq(orphan, subject));
        subject.borrow_mut().is_orphan = false;
    }

    fn add_orphan(&mut self, subject: &DentryRef) {
        self.orphans.push(subject.clone());
        subject.borrow_mut().is_orphan = true;
    }

    /// Link `subject` under `parent`, or set it as the image root when
    /// `parent` is `None`.
    pub fn link(
        &mut self,
        root: &mut Option<DentryRef>,
        subject: &DentryRef,
        parent: Option<&DentryRef>,
    ) -> Result<()> {
        do_link(subject, parent, root)?;
        self.record(UpdatePrimitive::Link {
            subject: subject.clone(),
            parent: parent.cloned(),
        });
        if subject.borrow().is_orphan {
            self.remove_orphan(subject);
        }
        Ok(())
    }

    /// Unlink `subject` from the image. The journal keeps the tree alive
    /// until commit or rollback decides its fate.
    pub fn unlink(&mut self, root: &mut Option<DentryRef>, subject: &DentryRef) {
        let parent = if dentry_is_root(subject) {
            None
        } else {
            subject.borrow().parent()
        };
        do_unlink(subject, parent.as_ref(), root);
        self.record(UpdatePrimitive::Unlink {
            subject: subject.clone(),
            parent,
        });
        self.add_orphan(subject);
    }

    /// Change the long name (clearing the short name, which may no longer
    /// fit).
    pub fn change_name(&mut self, subject: &DentryRef, new_name: &str) {
        let old_name = subject.borrow().name().to_vec();
        let old_short_name = subject.borrow().short_name().to_vec();
        subject.borrow_mut().set_name_utf16(&encode_utf16(new_name));
        self.record(UpdatePrimitive::ChangeName {
            subject: subject.clone(),
            old_name,
        });
        self.record(UpdatePrimitive::ChangeShortName {
            subject: subject.clone(),
            old_name: old_short_name,
        });
    }

    pub fn next_command(&mut self) {
        self.cur_cmd += 1;
        if self.cur_cmd == self.cmd_prims.len() {
            self.cmd_prims.push(Vec::new());
        }
    }

    fn rollback_one(&mut self, prim: UpdatePrimitive, root: &mut Option<DentryRef>) {
        match prim {
            UpdatePrimitive::Link { subject, parent } => {
                do_unlink(&subject, parent.as_ref(), root);
                self.add_orphan(&subject);
            }
            UpdatePrimitive::Unlink { subject, parent } => {
                // The subject was unlinked, so re-linking cannot collide.
                let _ = do_link(&subject, parent.as_ref(), root);
                self.remove_orphan(&subject);
            }
            UpdatePrimitive::ChangeName { subject, old_name } => {
                subject.borrow_mut().restore_name(old_name);
            }
            UpdatePrimitive::ChangeShortName { subject, old_name } => {
                subject.borrow_mut().set_short_name_utf16(&old_name);
            }
        }
    }

    /// Undo the primitives of the currently executing command.
    pub fn rollback_current(&mut self, root: &mut Option<DentryRef>) {
        let mut prims = std::mem::take(&mut self.cmd_prims[self.cur_cmd]);
        while let Some(prim) = prims.pop() {
            self.rollback_one(prim, root);
        }
    }

    /// Undo every command in the batch, most recent first.
    pub fn rollback_all(&mut self, root: &mut Option<DentryRef>) {
        for i in (0..=self.cur_cmd.min(self.cmd_prims.len() - 1)).rev() {
            let mut prims = std::mem::take(&mut self.cmd_prims[i]);
            while let Some(prim) = prims.pop() {
                self.rollback_one(prim, root);
            }
        }
    }

    /// Release the journal: trees still orphaned are gone for good, along
    /// with their blob references.
    pub fn finish(mut self, table: &mut BlobTable) {
        for orphan in std::mem::take(&mut self.orphans) {
            if orphan.borrow().is_orphan {
                orphan.borrow_mut().is_orphan = false;
                free_dentry_tree(&orphan, Some(table));
            }
        }
    }
}

fn path_components(path: &str) -> Vec<Vec<u16>> {
    let units = encode_utf16(path);
    let mut components = Vec::new();
    let mut current = Vec::new();
    for unit in units {
        if is_path_separator(unit) {
            if !current.is_empty() {
                components.push(std::mem::take(&mut current));
            }
        } else {
            current.push(unit);
        }
    }
    if !current.is_empty() {
        components.push(current);
    }
    components
}

/// Resolve the conflict between a branch being attached and an existing
/// dentry at the target path: merge directories recursively, or replace a
/// non-directory unless `no_replace` forbids it.
fn handle_conflict(
    journal: &mut UpdateJournal,
    root: &mut Option<DentryRef>,
    table: &mut BlobTable,
    branch: DentryRef,
    existing: DentryRef,
    no_replace: bool,
) -> Result<()> {
    let branch_is_dir = dentry_is_directory(&branch);
    let existing_is_dir = dentry_is_directory(&existing);

    if branch_is_dir != existing_is_dir {
        return if existing_is_dir {
            Err(Error::IsADirectory(full_path(&existing)))
        } else {
            Err(Error::NotADirectory(full_path(&existing)))
        };
    }

    if branch_is_dir {
        // Directory overlay: move each child over, one at a time.
        while let Some(new_child) = any_child(&branch) {
            let name = new_child.borrow().name().to_vec();
            let existing_child = lookup_child(&existing, &name, CaseSensitivity::Default);
            unlink(&new_child);
            let result = match existing_child {
                Some(existing_child) => handle_conflict(
                    journal,
                    root,
                    table,
                    new_child.clone(),
                    existing_child,
                    no_replace,
                ),
                None => journal.link(root, &new_child, Some(&existing)),
            };
            if let Err(err) = result {
                add_child(&branch, &new_child);
                return Err(err);
            }
        }
        free_dentry_tree(&branch, Some(table));
        Ok(())
    } else if no_replace {
        Err(Error::NameCollision(full_path(&existing)))
    } else {
        let parent = existing.borrow().parent();
        log::info!("Replacing file \"{}\"", full_path(&existing));
        journal.unlink(root, &existing);
        journal.link(root, &branch, parent.as_ref())
    }
}

/// Graft `branch` into the tree at `target_path`, journaled.
fn attach_branch(
    journal: &mut UpdateJournal,
    root: &mut Option<DentryRef>,
    table: &mut BlobTable,
    branch: DentryRef,
    target_path: &str,
    no_replace: bool,
) -> Result<()> {
    branch
        .borrow_mut()
        .set_name_utf16(&encode_utf16(path_basename(target_path)));

    let result = (|| {
        let components = path_components(target_path);
        let mut parent: Option<DentryRef> = None;
        let mut existing = root.clone();
        let mut cur_name: Vec<u16> = Vec::new();

        for component in &components {
            let dir = match existing {
                Some(dir) => {
                    if !dentry_is_directory(&dir) {
                        return Err(Error::NotADirectory(full_path(&dir)));
                    }
                    dir
                }
                None => {
                    // Make way with a filler directory.
                    let filler = new_filler_directory();
                    filler.borrow_mut().set_name_utf16(&cur_name);
                    journal.link(root, &filler, parent.as_ref())?;
                    filler
                }
            };
            existing = lookup_child(&dir, component, CaseSensitivity::Default);
            parent = Some(dir);
            cur_name.clone_from(component);
        }

        match existing {
            Some(existing) => handle_conflict(
                journal,
                root,
                table,
                branch.clone(),
                existing,
                no_replace,
            ),
            None => journal.link(root, &branch, parent.as_ref()),
        }
    })();

    if result.is_err() && dentry_is_root(&branch) && !branch.borrow().is_orphan {
        // The branch never made it into the tree.
        free_dentry_tree(&branch, Some(table));
    }
    result
}

fn execute_delete(
    journal: &mut UpdateJournal,
    root: &mut Option<DentryRef>,
    path: &str,
    recursive: bool,
    force: bool,
) -> Result<()> {
    let tree = match root {
        Some(r) => lookup_path(r, path, CaseSensitivity::Default).ok(),
        None => None,
    };
    let tree = match tree {
        Some(tree) => tree,
        None if force => return Ok(()),
        None => return Err(Error::PathDoesNotExist(path.to_string())),
    };
    if dentry_is_directory(&tree) && !recursive {
        return Err(Error::IsADirectory(path.to_string()));
    }
    journal.unlink(root, &tree);
    Ok(())
}

/// Rename a file or directory, following POSIX-like rules. With a journal,
/// the operation can be rolled back; without one, a replaced target tree is
/// freed immediately.
pub fn rename_path(
    root: &mut Option<DentryRef>,
    table: &mut BlobTable,
    from: &str,
    to: &str,
    case: CaseSensitivity,
    noreplace: bool,
    mut journal: Option<&mut UpdateJournal>,
) -> Result<()> {
    let root_dentry = root
        .clone()
        .ok_or_else(|| Error::PathDoesNotExist(from.to_string()))?;
    let src = lookup_path(&root_dentry, from, case)?;
    let dst = lookup_path(&root_dentry, to, case).ok();

    let parent_of_dst = match &dst {
        Some(dst) => {
            if noreplace {
                return Err(Error::NameCollision(to.to_string()));
            }
            if Rc::ptr_eq(dst, &src) {
                return Ok(());
            }
            if !dentry_is_directory(&src) {
                if dentry_is_directory(dst) {
                    return Err(Error::IsADirectory(to.to_string()));
                }
            } else {
                if !dentry_is_directory(dst) {
                    return Err(Error::NotADirectory(to.to_string()));
                }
                if dentry_has_children(dst) {
                    return Err(Error::NotEmpty(to.to_string()));
                }
            }
            match dst.borrow().parent() {
                Some(parent) => parent,
                None => return Err(Error::PathDoesNotExist(to.to_string())),
            }
        }
        None => {
            let parent = lookup_path(&root_dentry, path_parent(to), case)
                .map_err(|_| Error::PathDoesNotExist(to.to_string()))?;
            if !dentry_is_directory(&parent) {
                return Err(Error::NotADirectory(to.to_string()));
            }
            parent
        }
    };

    // Unlinking src and relinking it under its own descendant would detach
    // a loop from the tree.
    if is_ancestor(&src, &parent_of_dst) {
        return Err(Error::Busy(from.to_string()));
    }

    match journal.take() {
        Some(journal) => {
            if let Some(dst) = &dst {
                journal.unlink(root, dst);
            }
            journal.unlink(root, &src);
            journal.change_name(&src, path_basename(to));
            journal.link(root, &src, Some(&parent_of_dst))?;
        }
        None => {
            // Unlink before renaming; the child index is keyed by name.
            unlink(&src);
            src.borrow_mut()
                .set_name_utf16(&encode_utf16(path_basename(to)));
            if let Some(dst) = &dst {
                unlink(dst);
                free_dentry_tree(dst, Some(table));
            }
            if let Some(duplicate) = add_child(&parent_of_dst, &src) {
                return Err(Error::NameCollision(full_path(&duplicate)));
            }
        }
    }
    invalidate_full_paths(&src);
    Ok(())
}

/// Execute a batch of update commands against an image tree.
///
/// A failing command is rolled back and aborts the batch; with `atomic`
/// set, every already-executed command is rolled back with it.
pub fn execute_update_commands(
    root: &mut Option<DentryRef>,
    table: &mut BlobTable,
    commands: Vec<UpdateCommand>,
    atomic: bool,
) -> Result<()> {
    let mut journal = UpdateJournal::new(commands.len());

    for command in commands {
        let result = match command {
            UpdateCommand::Add {
                branch,
                target_path,
                no_replace,
            } => attach_branch(&mut journal, root, table, branch, &target_path, no_replace),
            UpdateCommand::Delete {
                path,
                recursive,
                force,
            } => execute_delete(&mut journal, root, &path, recursive, force),
            UpdateCommand::Rename { from, to } => rename_path(
                root,
                table,
                &from,
                &to,
                CaseSensitivity::Default,
                false,
                Some(&mut journal),
            ),
        };
        if let Err(err) = result {
            if atomic {
                journal.rollback_all(root);
            } else {
                journal.rollback_current(root);
            }
            journal.finish(table);
            return Err(err);
        }
        journal.next_command();
    }

    journal.finish(table);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dentry::{children_in_order, new_dentry_with_new_inode};
    use crate::inode::{FileAttributes, StreamKind};

    fn dir(name: &str) -> DentryRef {
        let d = new_dentry_with_new_inode(name, false);
        d.borrow().inode.borrow_mut().attributes = FileAttributes::new().with_directory(true);
        d
    }

    fn file(name: &str, content: &[u8], table: &mut BlobTable) -> DentryRef {
        let d = new_dentry_with_new_inode(name, false);
        {
            let inode = d.borrow().inode.clone();
            let mut inode = inode.borrow_mut();
            inode.attributes = FileAttributes::new().with_normal(true);
            inode.add_stream_with_data(StreamKind::Data, &[], content, table);
        }
        d
    }

    fn names_of(dir: &DentryRef) -> Vec<String> {
        children_in_order(dir)
            .iter()
            .map(|d| d.borrow().name_string())
            .collect()
    }

    #[test]
    fn add_creates_filler_directories() {
        let mut table = BlobTable::new();
        let mut root = Some(dir(""));
        let branch = file("ignored", b"payload", &mut table);
        execute_update_commands(
            &mut root,
            &mut table,
            vec![UpdateCommand::Add {
                branch,
                target_path: "/deep/nested/file.txt".into(),
                no_replace: false,
            }],
            false,
        )
        .unwrap();

        let root_dentry = root.unwrap();
        let found =
            lookup_path(&root_dentry, "/deep/nested/file.txt", CaseSensitivity::Sensitive)
                .unwrap();
        assert!(!dentry_is_directory(&found));
        assert_eq!(found.borrow().name_string(), "file.txt");
    }

    #[test]
    fn add_merges_directories() {
        let mut table = BlobTable::new();
        let root = dir("");
        let existing_dir = dir("etc");
        add_child(&root, &existing_dir);
        add_child(&existing_dir, &file("keep", b"old", &mut table));
        let mut root = Some(root);

        let branch = dir("ignored");
        add_child(&branch, &file("new", b"new", &mut table));

        execute_update_commands(
            &mut root,
            &mut table,
            vec![UpdateCommand::Add {
                branch,
                target_path: "/etc".into(),
                no_replace: false,
            }],
            false,
        )
        .unwrap();

        assert_eq!(names_of(&existing_dir), vec!["keep", "new"]);
    }

    #[test]
    fn add_no_replace_refuses_to_overwrite() {
        let mut table = BlobTable::new();
        let root = dir("");
        add_child(&root, &file("exists", b"x", &mut table));
        let mut root = Some(root);

        let branch = file("ignored", b"y", &mut table);
        let err = execute_update_commands(
            &mut root,
            &mut table,
            vec![UpdateCommand::Add {
                branch,
                target_path: "/exists".into(),
                no_replace: true,
            }],
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::NameCollision(_)));
        // The existing file's blob must still be referenced.
        assert!(table.lookup(&crate::blob::Sha1Hash::of(b"x")).is_some());
    }

    #[test]
    fn delete_requires_recursive_for_directories() {
        let mut table = BlobTable::new();
        let root = dir("");
        let sub = dir("sub");
        add_child(&root, &sub);
        let mut root = Some(root);

        let err = execute_update_commands(
            &mut root,
            &mut table,
            vec![UpdateCommand::Delete {
                path: "/sub".into(),
                recursive: false,
                force: false,
            }],
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::IsADirectory(_)));

        execute_update_commands(
            &mut root,
            &mut table,
            vec![UpdateCommand::Delete {
                path: "/sub".into(),
                recursive: true,
                force: false,
            }],
            false,
        )
        .unwrap();
        assert!(names_of(root.as_ref().unwrap()).is_empty());

        // force suppresses the missing-path error
        execute_update_commands(
            &mut root,
            &mut table,
            vec![UpdateCommand::Delete {
                path: "/sub".into(),
                recursive: true,
                force: true,
            }],
            false,
        )
        .unwrap();
    }

    #[test]
    fn rename_error_rules() {
        let mut table = BlobTable::new();
        let root = dir("");
        let sub = dir("sub");
        let inner = file("inner", b"i", &mut table);
        add_child(&root, &sub);
        add_child(&sub, &inner);
        add_child(&root, &file("plain", b"p", &mut table));
        let mut root = Some(root);

        // directory -> nonempty directory target
        let err = rename_path(
            &mut root,
            &mut table,
            "/plain",
            "/sub",
            CaseSensitivity::Sensitive,
            false,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::IsADirectory(_)));

        // loop check
        let err = rename_path(
            &mut root,
            &mut table,
            "/sub",
            "/sub/inner/x",
            CaseSensitivity::Sensitive,
            false,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotADirectory(_) | Error::Busy(_)));

        // successful rename with replacement
        rename_path(
            &mut root,
            &mut table,
            "/plain",
            "/sub/inner",
            CaseSensitivity::Sensitive,
            false,
            None,
        )
        .unwrap();
        let root_dentry = root.clone().unwrap();
        assert!(lookup_path(&root_dentry, "/plain", CaseSensitivity::Sensitive).is_err());
        let moved =
            lookup_path(&root_dentry, "/sub/inner", CaseSensitivity::Sensitive).unwrap();
        assert_eq!(moved.borrow().name_string(), "inner");
        // The replaced file's blob is gone from the table.
        assert!(table.lookup(&crate::blob::Sha1Hash::of(b"i")).is_none());
    }

    #[test]
    fn failed_batch_rolls_back_atomically() {
        let mut table = BlobTable::new();
        let root = dir("");
        let x = dir("x");
        add_child(&root, &x);
        add_child(&x, &file("original", b"o", &mut table));
        let mut root = Some(root);

        let branch = file("ignored", b"a", &mut table);
        let err = execute_update_commands(
            &mut root,
            &mut table,
            vec![
                UpdateCommand::Add {
                    branch,
                    target_path: "/x/a".into(),
                    no_replace: false,
                },
                UpdateCommand::Rename {
                    from: "/x/a".into(),
                    to: "/x/b".into(),
                },
                UpdateCommand::Delete {
                    path: "/x/missing".into(),
                    recursive: false,
                    force: false,
                },
            ],
            true,
        )
        .unwrap_err();
        assert!(matches!(err, Error::PathDoesNotExist(_)));

        // The tree is back to its original state.
        assert_eq!(names_of(&x), vec!["original"]);
        let root_dentry = root.unwrap();
        assert!(lookup_path(&root_dentry, "/x/a", CaseSensitivity::Sensitive).is_err());
        assert!(lookup_path(&root_dentry, "/x/b", CaseSensitivity::Sensitive).is_err());
    }

    #[test]
    fn non_atomic_failure_keeps_earlier_commands() {
        let mut table = BlobTable::new();
        let root = dir("");
        add_child(&root, &dir("x"));
        let mut root = Some(root);

        let branch = file("ignored", b"a", &mut table);
        let err = execute_update_commands(
            &mut root,
            &mut table,
            vec![
                UpdateCommand::Add {
                    branch,
                    target_path: "/x/a".into(),
                    no_replace: false,
                },
                UpdateCommand::Delete {
                    path: "/x/missing".into(),
                    recursive: false,
                    force: false,
                },
            ],
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::PathDoesNotExist(_)));

        // The add survives; only the failing delete was rolled back.
        let root_dentry = root.unwrap();
        assert!(lookup_path(&root_dentry, "/x/a", CaseSensitivity::Sensitive).is_ok());
    }
}
