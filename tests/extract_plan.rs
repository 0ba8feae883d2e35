//! Extraction planner tests: case-conflict naming, hard-link aliasing, and
//! root normalization, observed through a recording backend.

mod common;

use std::rc::Rc;

use common::{attach, new_dir, new_file, new_root};
use wimcore::blob::{BlobExtractionTarget, BlobRef, BlobTable, Sha1Hash};
use wimcore::dentry::DentryRef;
use wimcore::extract::{extract_trees, ExtractBackend, ExtractFlags, SupportedFeatures};
use wimcore::Result;

#[derive(Default)]
struct RecordingBackend {
    features: SupportedFeatures,
    /// Extraction names seen at structure-creation time, in list order.
    structure_names: Vec<Option<String>>,
    /// One entry per begin_blob: (blob hash, target count, target inode
    /// pointers).
    begin_events: Vec<(Sha1Hash, usize, Vec<usize>)>,
    bytes_received: u64,
    ended_blobs: usize,
    metadata_order: Vec<Option<String>>,
}

impl ExtractBackend for RecordingBackend {
    fn supported_features(&self) -> SupportedFeatures {
        self.features
    }

    fn create_file_structure(&mut self, dentries: &[DentryRef]) -> Result<()> {
        for dentry in dentries {
            self.structure_names.push(dentry.borrow().extraction_name());
        }
        Ok(())
    }

    fn begin_blob(&mut self, blob: &BlobRef, targets: &[BlobExtractionTarget]) -> Result<()> {
        let pointers = targets
            .iter()
            .map(|t| Rc::as_ptr(&t.inode) as usize)
            .collect();
        self.begin_events
            .push((blob.borrow().hash(), targets.len(), pointers));
        Ok(())
    }

    fn continue_blob(&mut self, _blob: &BlobRef, _offset: u64, chunk: &[u8]) -> Result<()> {
        self.bytes_received += chunk.len() as u64;
        Ok(())
    }

    fn end_blob(&mut self, _blob: &BlobRef) -> Result<()> {
        self.ended_blobs += 1;
        Ok(())
    }

    fn apply_metadata(&mut self, dentry: &DentryRef) -> Result<()> {
        self.metadata_order.push(dentry.borrow().extraction_name());
        Ok(())
    }
}

fn base_features() -> SupportedFeatures {
    SupportedFeatures {
        named_data_streams: true,
        case_sensitive_filenames: true,
        timestamps: true,
        security_descriptors: true,
        ..Default::default()
    }
}

#[test_log::test]
fn s2_case_conflict_gets_fabricated_name() {
    let mut table = BlobTable::new();
    let root = new_root();
    attach(&root, new_file("foo", b"lower", &mut table));
    attach(&root, new_file("FOO", b"upper", &mut table));

    let mut backend = RecordingBackend {
        features: SupportedFeatures {
            case_sensitive_filenames: false,
            ..base_features()
        },
        ..Default::default()
    };
    extract_trees(
        &mut table,
        vec![root.clone()],
        &mut backend,
        ExtractFlags {
            all_case_conflicts: true,
            ..Default::default()
        },
        None,
    )
    .unwrap();

    let mut names: Vec<String> = backend.structure_names.iter().flatten().cloned().collect();
    names.sort();
    assert_eq!(names, vec!["FOO (invalid filename #1)", "foo"]);
}

#[test_log::test]
fn s2_case_conflict_skips_subtree_without_flag() {
    let mut table = BlobTable::new();
    let root = new_root();
    attach(&root, new_file("foo", b"lower", &mut table));
    attach(&root, new_file("FOO", b"upper", &mut table));

    let mut backend = RecordingBackend {
        features: SupportedFeatures {
            case_sensitive_filenames: false,
            ..base_features()
        },
        ..Default::default()
    };
    extract_trees(
        &mut table,
        vec![root.clone()],
        &mut backend,
        ExtractFlags::default(),
        None,
    )
    .unwrap();

    // One of the pair is dropped; the other extracts under its real name.
    let names: Vec<String> = backend.structure_names.iter().flatten().cloned().collect();
    assert_eq!(names.len(), 1);
    assert!(names[0] == "foo" || names[0] == "FOO");
}

fn hard_link_tree(table: &mut BlobTable) -> DentryRef {
    let root = new_root();
    let dir_a = attach(&root, new_dir("a"));
    let dir_b = attach(&root, new_dir("b"));
    let link1 = attach(&dir_a, new_file("link1", b"7 bytes", table));
    let inode = link1.borrow().inode.clone();
    inode.borrow_mut().ino = 0x42;
    attach(
        &dir_b,
        wimcore::dentry::new_dentry_with_existing_inode("link2", inode),
    );
    root
}

#[test_log::test]
fn s3_hard_links_with_link_capable_backend() {
    let mut table = BlobTable::new();
    let root = hard_link_tree(&mut table);

    let mut backend = RecordingBackend {
        features: SupportedFeatures {
            hard_links: true,
            ..base_features()
        },
        ..Default::default()
    };
    extract_trees(
        &mut table,
        vec![root],
        &mut backend,
        ExtractFlags::default(),
        None,
    )
    .unwrap();

    // Exactly one begin_blob, carrying both aliases as targets of the same
    // inode; the data streams once.
    assert_eq!(backend.begin_events.len(), 1);
    let (hash, target_count, pointers) = &backend.begin_events[0];
    assert_eq!(*hash, Sha1Hash::of(b"7 bytes"));
    assert_eq!(*target_count, 2);
    assert_eq!(pointers[0], pointers[1]);
    assert_eq!(backend.bytes_received, 7);
    assert_eq!(backend.ended_blobs, 1);
}

#[test_log::test]
fn s3_hard_links_without_link_support() {
    let mut table = BlobTable::new();
    let root = hard_link_tree(&mut table);

    let mut backend = RecordingBackend {
        features: base_features(),
        ..Default::default()
    };
    extract_trees(
        &mut table,
        vec![root],
        &mut backend,
        ExtractFlags::default(),
        None,
    )
    .unwrap();

    // The blob is still streamed once; both aliases appear as targets so
    // each one is written independently.
    let total_targets: usize = backend.begin_events.iter().map(|(_, n, _)| n).sum();
    assert_eq!(total_targets, 2);
    assert!(backend.begin_events.len() == 1 || backend.begin_events.len() == 2);
}

#[test_log::test]
fn planner_deduplicates_roots_and_contained_trees() {
    let mut table = BlobTable::new();
    let root = new_root();
    let outer = attach(&root, new_dir("outer"));
    let inner = attach(&outer, new_dir("inner"));
    attach(&inner, new_file("leaf", b"data", &mut table));

    let mut backend = RecordingBackend {
        features: base_features(),
        ..Default::default()
    };
    extract_trees(
        &mut table,
        vec![outer.clone(), inner.clone(), outer.clone(), inner.clone()],
        &mut backend,
        ExtractFlags {
            no_preserve_dir_structure: true,
            ..Default::default()
        },
        None,
    )
    .unwrap();

    // outer, inner, leaf; each exactly once.
    assert_eq!(backend.structure_names.len(), 3);
    let mut names: Vec<String> = backend.structure_names.iter().flatten().cloned().collect();
    names.sort();
    assert_eq!(names, vec!["inner", "leaf", "outer"]);
}

#[test_log::test]
fn metadata_applies_children_before_parents() {
    let mut table = BlobTable::new();
    let root = new_root();
    let sub = attach(&root, new_dir("sub"));
    attach(&sub, new_file("leaf", b"x", &mut table));

    let mut backend = RecordingBackend {
        features: base_features(),
        ..Default::default()
    };
    extract_trees(
        &mut table,
        vec![root],
        &mut backend,
        ExtractFlags::default(),
        None,
    )
    .unwrap();

    let order: Vec<String> = backend.metadata_order.iter().flatten().cloned().collect();
    // The root has no extraction name; leaf must precede sub.
    assert_eq!(order, vec!["leaf", "sub"]);
}

#[test_log::test]
fn directories_contribute_no_unnamed_stream() {
    let mut table = BlobTable::new();
    let root = new_root();
    attach(&root, new_file("file", b"payload", &mut table));
    let sub = attach(&root, new_dir("sub"));
    attach(&sub, new_file("nested", b"nested data", &mut table));

    let mut backend = RecordingBackend {
        features: base_features(),
        ..Default::default()
    };
    extract_trees(
        &mut table,
        vec![root],
        &mut backend,
        ExtractFlags::default(),
        None,
    )
    .unwrap();

    // Two file blobs; directories contribute none.
    assert_eq!(backend.begin_events.len(), 2);
    assert_eq!(backend.bytes_received, 7 + 11);
}
