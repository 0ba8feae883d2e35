//! The extraction planner: turns a set of dentry trees into an ordered work
//! list honoring backend capabilities, blob deduplication, and hard-link
//! aliasing, then drives the blob streaming callbacks in a single pass.

use std::rc::Rc;

use crate::blob::{BlobExtractionTarget, BlobRef, BlobTable, Sha1Hash};
use crate::dentry::{
    ci_matches, dentry_is_root, for_dentry_in_tree, full_path, lookup_path, DentryRef,
};
use crate::encoding::CaseSensitivity;
use crate::error::Error;
use crate::inode::StreamKind;
use crate::pattern::{expand_pattern, is_wildcard_pattern};
use crate::Result;

/// Limit on how many extraction targets may be open at once. Blobs with a
/// wider fan-out are replayed once per target instead of being multiplexed.
pub const MAX_OPEN_FILES: u32 = 512;

const EXTRACT_CHUNK_SIZE: usize = 32768;

/// What the extraction backend can represent on its target.
#[derive(Debug, Clone, Copy, Default)]
pub struct SupportedFeatures {
    pub readonly_files: bool,
    pub hidden_files: bool,
    pub system_files: bool,
    pub archive_files: bool,
    pub compressed_files: bool,
    pub encrypted_files: bool,
    pub encrypted_directories: bool,
    pub not_content_indexed_files: bool,
    pub sparse_files: bool,
    pub named_data_streams: bool,
    pub hard_links: bool,
    pub reparse_points: bool,
    pub symlink_reparse_points: bool,
    pub security_descriptors: bool,
    pub short_names: bool,
    pub unix_data: bool,
    pub object_ids: bool,
    pub xattrs: bool,
    pub timestamps: bool,
    pub case_sensitive_filenames: bool,
}

/// Per-feature tallies over the dentries being extracted.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequiredFeatures {
    pub readonly_files: u64,
    pub hidden_files: u64,
    pub system_files: u64,
    pub archive_files: u64,
    pub compressed_files: u64,
    pub encrypted_files: u64,
    pub encrypted_directories: u64,
    pub not_content_indexed_files: u64,
    pub sparse_files: u64,
    pub named_data_streams: u64,
    pub hard_links: u64,
    pub reparse_points: u64,
    pub symlink_reparse_points: u64,
    pub other_reparse_points: u64,
    pub security_descriptors: u64,
    pub short_names: u64,
    pub unix_data: u64,
    pub object_ids: u64,
    pub xattrs: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractFlags {
    /// Do not pull uncovered ancestors into the dentry list; each selected
    /// tree lands directly in the target.
    pub no_preserve_dir_structure: bool,
    /// On a case-insensitive target, extract conflicting names under
    /// fabricated names instead of skipping the losing subtree.
    pub all_case_conflicts: bool,
    /// Extract files with invalid names under fabricated names instead of
    /// skipping them.
    pub replace_invalid_filenames: bool,
    /// Validate names against the Windows-forbidden character set, not just
    /// `/` and NUL.
    pub windows_names: bool,
    /// The blob table is not populated in advance; force-resolve streams.
    pub from_pipe: bool,
    pub strict_acls: bool,
    pub strict_symlinks: bool,
    pub strict_timestamps: bool,
    pub no_attributes: bool,
    /// Emit image-level instead of tree-level begin/end progress.
    pub image_mode: bool,
}

/// Progress messages emitted while planning and extracting.
#[derive(Debug, Clone)]
pub enum ProgressMsg {
    ExtractTreeBegin,
    ExtractTreeEnd,
    ExtractImageBegin,
    ExtractImageEnd,
    ExtractFileStructure { current: u64, end: u64 },
    ExtractStreams { completed_bytes: u64, total_bytes: u64 },
    ExtractMetadata { current: u64, end: u64 },
    ReplaceFileInWim { path: String },
    WimbootExclude { path: String },
}

/// The contract an extraction backend implements. The planner calls the
/// blob callbacks in strict begin → continue* → end order per blob, each
/// blob exactly once, and applies metadata children-before-parent.
pub trait ExtractBackend {
    fn supported_features(&self) -> SupportedFeatures;

    /// WIMBoot-style passthrough: `Ok(true)` means the backend will back
    /// the file from the archive itself, so its unnamed data stream need
    /// not be materialized.
    fn will_back_from_archive(&mut self, _dentry: &DentryRef) -> Result<bool> {
        Ok(false)
    }

    /// Create the file/directory skeleton for the listed dentries.
    fn create_file_structure(&mut self, _dentries: &[DentryRef]) -> Result<()> {
        Ok(())
    }

    fn begin_blob(&mut self, _blob: &BlobRef, _targets: &[BlobExtractionTarget]) -> Result<()> {
        Ok(())
    }

    fn continue_blob(&mut self, _blob: &BlobRef, _offset: u64, _chunk: &[u8]) -> Result<()> {
        Ok(())
    }

    fn end_blob(&mut self, _blob: &BlobRef) -> Result<()> {
        Ok(())
    }

    /// Apply per-file metadata (object id, xattrs, security, timestamps,
    /// attributes). Called in reverse list order so children finish before
    /// their directory.
    fn apply_metadata(&mut self, _dentry: &DentryRef) -> Result<()> {
        Ok(())
    }
}

struct ExtractOp<'a> {
    table: &'a mut BlobTable,
    flags: ExtractFlags,
    features: SupportedFeatures,
    dentry_list: Vec<DentryRef>,
    blob_list: Vec<BlobRef>,
    invalid_sequence: u32,
    total_bytes: u64,
    completed_bytes: u64,
    progress: Option<&'a mut dyn FnMut(&ProgressMsg) -> Result<()>>,
}

impl ExtractOp<'_> {
    fn progress(&mut self, msg: ProgressMsg) -> Result<()> {
        match self.progress.as_mut() {
            Some(callback) => callback(&msg),
            None => Ok(()),
        }
    }
}

/// Remove duplicate trees (by identity), keeping first occurrences.
fn remove_duplicate_trees(trees: &mut Vec<DentryRef>) {
    let mut kept: Vec<DentryRef> = Vec::new();
    for tree in trees.drain(..) {
        if !tree.borrow().tmp_flag {
            tree.borrow_mut().tmp_flag = true;
            kept.push(tree);
        }
    }
    for tree in &kept {
        tree.borrow_mut().tmp_flag = false;
    }
    *trees = kept;
}

/// Remove trees that are descendants of other trees in the set.
fn remove_contained_trees(trees: &mut Vec<DentryRef>) {
    for tree in trees.iter() {
        tree.borrow_mut().tmp_flag = true;
    }
    let mut kept: Vec<DentryRef> = Vec::new();
    for tree in trees.iter() {
        let mut contained = false;
        let mut cur = tree.clone();
        while !dentry_is_root(&cur) {
            let parent = match cur.borrow().parent() {
                Some(parent) => parent,
                None => break,
            };
            if parent.borrow().tmp_flag {
                contained = true;
                break;
            }
            cur = parent;
        }
        if contained {
            tree.borrow_mut().tmp_flag = false;
        } else {
            kept.push(tree.clone());
        }
    }
    for tree in &kept {
        tree.borrow_mut().tmp_flag = false;
    }
    *trees = kept;
}

/// Build the preliminary extraction list: each tree pre-order, and (unless
/// disabled) uncovered ancestors spliced in so every listed dentry's parent
/// chain appears before it.
fn build_dentry_list(trees: &[DentryRef], add_ancestors: bool) -> Vec<DentryRef> {
    let mut list: Vec<DentryRef> = Vec::new();
    for tree in trees {
        let _ = for_dentry_in_tree(tree, &mut |dentry| {
            dentry.borrow_mut().in_extraction_list = true;
            list.push(dentry.clone());
            Ok(())
        });
    }

    if add_ancestors {
        for tree in trees {
            if dentry_is_root(tree) {
                continue;
            }
            // Walk up collecting ancestors not yet in the list.
            let mut chain: Vec<DentryRef> = Vec::new();
            let mut nearest_listed: Option<DentryRef> = None;
            let mut cur = tree.clone();
            loop {
                if dentry_is_root(&cur) {
                    break;
                }
                let ancestor = match cur.borrow().parent() {
                    Some(ancestor) => ancestor,
                    None => break,
                };
                if ancestor.borrow().in_extraction_list {
                    nearest_listed = Some(ancestor);
                    break;
                }
                chain.push(ancestor.clone());
                cur = ancestor;
            }
            let insert_at = match nearest_listed {
                Some(listed) => {
                    list.iter()
                        .position(|d| Rc::ptr_eq(d, &listed))
                        .map(|pos| pos + 1)
                        .unwrap_or(0)
                }
                None => 0,
            };
            for ancestor in chain.iter().rev() {
                ancestor.borrow_mut().in_extraction_list = true;
            }
            list.splice(
                insert_at..insert_at,
                chain.iter().rev().cloned().collect::<Vec<_>>(),
            );
        }
    }
    list
}

fn tally_features(list: &[DentryRef]) -> RequiredFeatures {
    let mut features = RequiredFeatures::default();
    for dentry in list {
        if dentry.borrow().has_short_name() {
            features.short_names += 1;
        }
        let inode_ref = dentry.borrow().inode.clone();
        let mut inode = inode_ref.borrow_mut();
        if inode.visited {
            features.hard_links += 1;
            continue;
        }
        inode.visited = true;
        let attrs = inode.attributes;
        if attrs.readonly() {
            features.readonly_files += 1;
        }
        if attrs.hidden() {
            features.hidden_files += 1;
        }
        if attrs.system() {
            features.system_files += 1;
        }
        if attrs.archive() {
            features.archive_files += 1;
        }
        if attrs.compressed() {
            features.compressed_files += 1;
        }
        if attrs.encrypted() {
            if attrs.directory() {
                features.encrypted_directories += 1;
            } else {
                features.encrypted_files += 1;
            }
        }
        if attrs.not_content_indexed() {
            features.not_content_indexed_files += 1;
        }
        if attrs.sparse_file() {
            features.sparse_files += 1;
        }
        if inode.has_named_data_stream() {
            features.named_data_streams += 1;
        }
        if attrs.reparse_point() {
            features.reparse_points += 1;
            if inode.is_symlink() {
                features.symlink_reparse_points += 1;
            } else {
                features.other_reparse_points += 1;
            }
        }
        if inode.has_security_descriptor() {
            features.security_descriptors += 1;
        }
        if inode.has_unix_data() {
            features.unix_data += 1;
        }
        if inode.has_object_id() {
            features.object_ids += 1;
        }
        if inode.has_xattrs() {
            features.xattrs += 1;
        }
    }
    for dentry in list {
        let inode = dentry.borrow().inode.clone();
        inode.borrow_mut().visited = false;
    }
    features
}

/// Warn about present-but-unsupported features; fail when a strict flag
/// makes one critical.
fn do_feature_check(
    required: &RequiredFeatures,
    supported: &SupportedFeatures,
    flags: ExtractFlags,
) -> Result<()> {
    if required.encrypted_files > 0 && !supported.encrypted_files {
        log::warn!(
            "Ignoring EFS-encrypted data of {} files",
            required.encrypted_files
        );
    }
    if required.named_data_streams > 0 && !supported.named_data_streams {
        log::warn!(
            "Ignoring named data streams of {} files",
            required.named_data_streams
        );
    }
    if !flags.no_attributes {
        if required.readonly_files > 0 && !supported.readonly_files {
            log::warn!(
                "Ignoring readonly attribute of {} files",
                required.readonly_files
            );
        }
        if required.hidden_files > 0 && !supported.hidden_files {
            log::warn!("Ignoring hidden attribute of {} files", required.hidden_files);
        }
        if required.system_files > 0 && !supported.system_files {
            log::warn!("Ignoring system attribute of {} files", required.system_files);
        }
        if required.compressed_files > 0 && !supported.compressed_files {
            log::warn!(
                "Ignoring compressed attribute of {} files",
                required.compressed_files
            );
        }
        if required.sparse_files > 0 && !supported.sparse_files {
            log::warn!("Ignoring sparse attribute of {} files", required.sparse_files);
        }
    }
    if required.short_names > 0 && !supported.short_names {
        log::warn!("Ignoring short names of {} files", required.short_names);
    }
    if required.unix_data > 0 && !supported.unix_data {
        log::warn!("Ignoring UNIX metadata of {} files", required.unix_data);
    }
    if required.xattrs > 0 && !supported.xattrs {
        log::warn!(
            "Ignoring extended attributes of {} files",
            required.xattrs
        );
    }
    if required.object_ids > 0 && !supported.object_ids {
        log::warn!("Ignoring object IDs of {} files", required.object_ids);
    }
    if required.hard_links > 0 && !supported.hard_links {
        log::warn!(
            "Extracting {} hard links as independent copies",
            required.hard_links
        );
    }

    if required.security_descriptors > 0 && !supported.security_descriptors {
        if flags.strict_acls {
            return Err(Error::Unsupported(
                "security descriptors are not supported by the extraction target".into(),
            ));
        }
        log::warn!(
            "Ignoring security descriptors of {} files",
            required.security_descriptors
        );
    }
    if required.symlink_reparse_points > 0
        && !supported.reparse_points
        && !supported.symlink_reparse_points
    {
        if flags.strict_symlinks {
            return Err(Error::Unsupported(
                "symbolic links are not supported by the extraction target".into(),
            ));
        }
        log::warn!(
            "Ignoring {} symbolic links",
            required.symlink_reparse_points
        );
    }
    if required.other_reparse_points > 0 && !supported.reparse_points {
        log::warn!(
            "Ignoring {} reparse points",
            required.other_reparse_points
        );
    }
    if !supported.timestamps && flags.strict_timestamps {
        return Err(Error::Unsupported(
            "timestamps are not supported by the extraction target".into(),
        ));
    }
    Ok(())
}

fn name_valid(name: &[u16], windows_names: bool) -> bool {
    name.iter().all(|&c| char_valid(c, windows_names))
}

fn char_valid(c: u16, windows_names: bool) -> bool {
    if c == b'/' as u16 || c == 0 {
        return false;
    }
    if windows_names {
        const FORBIDDEN: &[u16] = &[
            b'<' as u16,
            b'>' as u16,
            b':' as u16,
            b'"' as u16,
            b'|' as u16,
            b'?' as u16,
            b'*' as u16,
        ];
        if c < 0x20 || FORBIDDEN.contains(&c) {
            return false;
        }
    }
    true
}

fn fabricate_name(name: &[u16], windows_names: bool, sequence: u32) -> Vec<u16> {
    let replacement = if windows_names { 0xFFFD } else { b'?' as u16 };
    let mut fixed: Vec<u16> = name
        .iter()
        .map(|&c| if char_valid(c, windows_names) { c } else { replacement })
        .collect();
    fixed.extend(format!(" (invalid filename #{sequence})").encode_utf16());
    fixed
}

fn skip_subtree(dentry: &DentryRef) {
    let _ = for_dentry_in_tree(dentry, &mut |d| {
        d.borrow_mut().in_extraction_list = false;
        Ok(())
    });
}

/// Compute the on-target name of every listed dentry, resolving
/// case-insensitive collisions and invalid characters per the flags.
fn calculate_extraction_names(op: &mut ExtractOp<'_>) -> Result<()> {
    let mut index = 0;
    'next_dentry: while index < op.dentry_list.len() {
        let dentry = op.dentry_list[index].clone();
        if !dentry.borrow().in_extraction_list {
            // A skipped subtree's descendants wash out of the list here.
            op.dentry_list.remove(index);
            continue;
        }
        if dentry_is_root(&dentry) {
            index += 1;
            continue;
        }

        let name = dentry.borrow().name().to_vec();

        if !op.features.case_sensitive_filenames {
            for other in ci_matches(&dentry) {
                // Only dentries that will land on the target under their
                // own name are conflicts; one of the pair keeps its name.
                let conflicts = {
                    let o = other.borrow();
                    o.in_extraction_list
                        && match &o.extraction_name {
                            Some(assigned) => assigned.as_slice() == o.name(),
                            None => true,
                        }
                };
                if conflicts {
                    if op.flags.all_case_conflicts {
                        log::warn!(
                            "\"{}\" has the same case-insensitive name as \"{}\"; extracting dummy name instead",
                            full_path(&dentry),
                            full_path(&other)
                        );
                        op.invalid_sequence += 1;
                        let fabricated =
                            fabricate_name(&name, op.flags.windows_names, op.invalid_sequence);
                        dentry.borrow_mut().extraction_name = Some(fabricated);
                        index += 1;
                        continue 'next_dentry;
                    } else {
                        log::warn!(
                            "Not extracting \"{}\": has same case-insensitive name as \"{}\"",
                            full_path(&dentry),
                            full_path(&other)
                        );
                        skip_subtree(&dentry);
                        op.dentry_list.remove(index);
                        continue 'next_dentry;
                    }
                }
            }
        }

        if name_valid(&name, op.flags.windows_names) {
            dentry.borrow_mut().extraction_name = Some(name);
            index += 1;
        } else if op.flags.replace_invalid_filenames {
            log::warn!(
                "\"{}\" has an invalid filename that is not supported on this platform; extracting dummy name instead",
                full_path(&dentry)
            );
            op.invalid_sequence += 1;
            let fabricated = fabricate_name(&name, op.flags.windows_names, op.invalid_sequence);
            dentry.borrow_mut().extraction_name = Some(fabricated);
            index += 1;
        } else {
            log::warn!(
                "Not extracting \"{}\": has an invalid filename that is not supported on this platform",
                full_path(&dentry)
            );
            skip_subtree(&dentry);
            op.dentry_list.remove(index);
        }
    }
    Ok(())
}

/// Resolve every listed inode's streams and zero the planner-scoped state
/// of each referenced blob.
fn resolve_streams(op: &mut ExtractOp<'_>) -> Result<()> {
    for dentry in &op.dentry_list {
        let inode = dentry.borrow().inode.clone();
        inode
            .borrow_mut()
            .resolve_streams(op.table, op.flags.from_pipe)?;
        for stream in inode.borrow().streams() {
            if let Some(blob) = stream.blob_resolved() {
                let mut blob = blob.borrow_mut();
                blob.out_refcnt = 0;
                blob.extraction_targets.clear();
            }
        }
    }
    Ok(())
}

fn build_alias_lists(op: &mut ExtractOp<'_>) {
    for dentry in &op.dentry_list {
        let inode = dentry.borrow().inode.clone();
        inode.borrow_mut().extraction_aliases.clear();
    }
    for dentry in &op.dentry_list {
        let inode = dentry.borrow().inode.clone();
        inode.borrow_mut().extraction_aliases.push(dentry.clone());
    }
}

/// Decide which streams of each listed inode are materialized and tally
/// them as extraction targets of their blobs.
fn ref_streams(op: &mut ExtractOp<'_>, backend: &mut dyn ExtractBackend) -> Result<()> {
    for index in 0..op.dentry_list.len() {
        let dentry = op.dentry_list[index].clone();
        let inode_ref = dentry.borrow().inode.clone();

        struct StreamInfo {
            stream_id: u32,
            kind: StreamKind,
            named: bool,
        }
        let (stream_infos, is_dir, is_encrypted, is_symlink, visited) = {
            let inode = inode_ref.borrow();
            let infos: Vec<StreamInfo> = inode
                .streams()
                .iter()
                .map(|s| StreamInfo {
                    stream_id: s.stream_id(),
                    kind: s.kind,
                    named: s.is_named(),
                })
                .collect();
            (
                infos,
                inode.attributes.directory(),
                inode.is_encrypted(),
                inode.is_symlink(),
                inode.visited,
            )
        };

        for info in &stream_infos {
            let need_stream = match info.kind {
                StreamKind::Data if info.named => op.features.named_data_streams,
                StreamKind::Data => {
                    if is_dir
                        || is_encrypted
                        || (is_symlink
                            && !op.features.reparse_points
                            && op.features.symlink_reparse_points)
                    {
                        false
                    } else {
                        // Skip the unnamed data stream of files the backend
                        // backs from the archive itself.
                        !backend.will_back_from_archive(&dentry)?
                    }
                }
                StreamKind::ReparsePoint => {
                    op.features.reparse_points
                        || (is_symlink && op.features.symlink_reparse_points)
                }
                StreamKind::EfsrpcRawData => {
                    if is_dir {
                        op.features.encrypted_directories
                    } else {
                        op.features.encrypted_files
                    }
                }
                StreamKind::Unknown => false,
            };
            if !need_stream {
                continue;
            }

            let blob = {
                let inode = inode_ref.borrow();
                match inode.stream_by_id(info.stream_id) {
                    Some(stream) => stream.blob_resolved(),
                    None => None,
                }
            };
            let Some(blob) = blob else { continue };

            // Count the size once per actual materialization; hard-link
            // capable backends write a blob's data only for the first alias.
            if !(visited && op.features.hard_links) {
                op.total_bytes += blob.borrow().size;
            }

            // Every alias contributes a target, so backends without
            // hard-link support can write each alias independently and
            // backends with it can link the extras.
            let mut blob_mut = blob.borrow_mut();
            if blob_mut.out_refcnt == 0 {
                drop(blob_mut);
                op.blob_list.push(blob.clone());
                blob_mut = blob.borrow_mut();
            }
            blob_mut.extraction_targets.push(BlobExtractionTarget {
                inode: inode_ref.clone(),
                stream_id: info.stream_id,
            });
            blob_mut.out_refcnt += 1;
        }

        inode_ref.borrow_mut().visited = true;
    }

    for dentry in &op.dentry_list {
        let inode = dentry.borrow().inode.clone();
        inode.borrow_mut().visited = false;
    }
    Ok(())
}

/// Stream every planned blob to the backend, deduplicated: one begin /
/// continue* / end sequence per blob regardless of target count, except
/// that blobs fanning out past [`MAX_OPEN_FILES`] are replayed per target.
fn stream_blobs(op: &mut ExtractOp<'_>, backend: &mut dyn ExtractBackend) -> Result<()> {
    for blob_index in 0..op.blob_list.len() {
        let blob = op.blob_list[blob_index].clone();
        let (data, targets, out_refcnt, unhashed, expected_hash) = {
            let b = blob.borrow();
            (
                b.read_data()?,
                b.extraction_targets.clone(),
                b.out_refcnt,
                b.unhashed,
                if b.unhashed { Sha1Hash::ZERO } else { b.hash() },
            )
        };

        if !unhashed && Sha1Hash::of(&data) != expected_hash {
            log::warn!("Blob {expected_hash} is corrupted (SHA-1 mismatch); extracting anyway");
            blob.borrow_mut().corrupted = true;
        }

        // Bytes actually written: once per target, or once per distinct
        // inode when the backend hard-links the other aliases.
        let weight: u64 = if op.features.hard_links {
            let mut seen: Vec<*const core::cell::RefCell<crate::inode::Inode>> = Vec::new();
            for target in &targets {
                let ptr = Rc::as_ptr(&target.inode);
                if !seen.contains(&ptr) {
                    seen.push(ptr);
                }
            }
            seen.len() as u64
        } else {
            targets.len() as u64
        };

        if out_refcnt > MAX_OPEN_FILES {
            // Too many targets to keep open at once; replay the staged data
            // once per target.
            for target in &targets {
                let single = std::slice::from_ref(target);
                backend.begin_blob(&blob, single)?;
                stream_chunks(&blob, &data, backend)?;
                backend.end_blob(&blob)?;
            }
        } else {
            backend.begin_blob(&blob, &targets)?;
            stream_chunks(&blob, &data, backend)?;
            backend.end_blob(&blob)?;
        }

        op.completed_bytes += data.len() as u64 * weight.max(1);
        let msg = ProgressMsg::ExtractStreams {
            completed_bytes: op.completed_bytes.min(op.total_bytes),
            total_bytes: op.total_bytes,
        };
        op.progress(msg)?;
    }
    Ok(())
}

fn stream_chunks(blob: &BlobRef, data: &[u8], backend: &mut dyn ExtractBackend) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let mut offset = 0u64;
    for chunk in data.chunks(EXTRACT_CHUNK_SIZE) {
        backend.continue_blob(blob, offset, chunk)?;
        offset += chunk.len() as u64;
    }
    Ok(())
}

fn apply_metadata(op: &mut ExtractOp<'_>, backend: &mut dyn ExtractBackend) -> Result<()> {
    let end = op.dentry_list.len() as u64;
    op.progress(ProgressMsg::ExtractMetadata { current: 0, end })?;
    // Reverse order: every directory's children are finalized before the
    // directory itself, so directory timestamps survive.
    for index in (0..op.dentry_list.len()).rev() {
        let dentry = op.dentry_list[index].clone();
        backend.apply_metadata(&dentry)?;
    }
    op.progress(ProgressMsg::ExtractMetadata { current: end, end })?;
    Ok(())
}

fn do_extract(op: &mut ExtractOp<'_>, backend: &mut dyn ExtractBackend) -> Result<()> {
    let required = tally_features(&op.dentry_list);
    do_feature_check(&required, &op.features, op.flags)?;

    calculate_extraction_names(op)?;
    if op.dentry_list.is_empty() {
        log::warn!("There is nothing to extract!");
        return Ok(());
    }

    resolve_streams(op)?;
    build_alias_lists(op);
    ref_streams(op, backend)?;

    op.progress(if op.flags.image_mode {
        ProgressMsg::ExtractImageBegin
    } else {
        ProgressMsg::ExtractTreeBegin
    })?;

    let end = op.dentry_list.len() as u64;
    op.progress(ProgressMsg::ExtractFileStructure { current: 0, end })?;
    backend.create_file_structure(&op.dentry_list)?;
    op.progress(ProgressMsg::ExtractFileStructure { current: end, end })?;

    stream_blobs(op, backend)?;
    apply_metadata(op, backend)?;

    op.progress(if op.flags.image_mode {
        ProgressMsg::ExtractImageEnd
    } else {
        ProgressMsg::ExtractTreeEnd
    })?;
    Ok(())
}

/// Transient planner state must not outlive the operation, success or not.
fn cleanup(op: &mut ExtractOp<'_>) {
    for dentry in &op.dentry_list {
        dentry.borrow_mut().clear_extraction_state();
        let inode = dentry.borrow().inode.clone();
        inode.borrow_mut().clear_extraction_state();
    }
    for blob in &op.blob_list {
        let mut blob = blob.borrow_mut();
        blob.out_refcnt = 0;
        blob.extraction_targets.clear();
    }
}

/// Plan and run the extraction of a set of dentry trees.
pub fn extract_trees<'a>(
    table: &'a mut BlobTable,
    mut trees: Vec<DentryRef>,
    backend: &mut dyn ExtractBackend,
    flags: ExtractFlags,
    progress: Option<&'a mut dyn FnMut(&ProgressMsg) -> Result<()>>,
) -> Result<()> {
    remove_duplicate_trees(&mut trees);
    remove_contained_trees(&mut trees);

    let features = backend.supported_features();
    let dentry_list = build_dentry_list(&trees, !flags.no_preserve_dir_structure);

    let mut op = ExtractOp {
        table,
        flags,
        features,
        dentry_list,
        blob_list: Vec::new(),
        invalid_sequence: 0,
        total_bytes: 0,
        completed_bytes: 0,
        progress,
    };
    let result = do_extract(&mut op, backend);
    cleanup(&mut op);
    result
}

/// Expand each path (or wildcard pattern) under `root` and extract the
/// matched trees.
pub fn extract_paths<'a>(
    root: &DentryRef,
    table: &'a mut BlobTable,
    paths: &[&str],
    backend: &mut dyn ExtractBackend,
    flags: ExtractFlags,
    progress: Option<&'a mut dyn FnMut(&ProgressMsg) -> Result<()>>,
) -> Result<()> {
    let mut trees = Vec::new();
    for path in paths {
        if is_wildcard_pattern(path) {
            expand_pattern(root, path, &mut |dentry| {
                trees.push(dentry.clone());
                Ok(())
            })?;
        } else {
            trees.push(lookup_path(root, path, CaseSensitivity::Default)?);
        }
    }
    extract_trees(table, trees, backend, flags, progress)
}

/// Extract a whole image tree.
pub fn extract_image<'a>(
    root: &DentryRef,
    table: &'a mut BlobTable,
    backend: &mut dyn ExtractBackend,
    mut flags: ExtractFlags,
    progress: Option<&'a mut dyn FnMut(&ProgressMsg) -> Result<()>>,
) -> Result<()> {
    flags.image_mode = true;
    extract_trees(table, vec![root.clone()], backend, flags, progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dentry::{add_child, new_dentry_with_new_inode};
    use crate::inode::FileAttributes;

    fn dir(name: &str) -> DentryRef {
        let d = new_dentry_with_new_inode(name, false);
        d.borrow().inode.borrow_mut().attributes = FileAttributes::new().with_directory(true);
        d
    }

    fn file(name: &str) -> DentryRef {
        let d = new_dentry_with_new_inode(name, false);
        d.borrow().inode.borrow_mut().attributes = FileAttributes::new().with_normal(true);
        d
    }

    #[test]
    fn duplicate_and_contained_roots_are_pruned() {
        let root = dir("");
        let a = dir("a");
        let b = file("b");
        add_child(&root, &a);
        add_child(&a, &b);

        let mut trees = vec![a.clone(), b.clone(), a.clone()];
        remove_duplicate_trees(&mut trees);
        assert_eq!(trees.len(), 2);
        remove_contained_trees(&mut trees);
        assert_eq!(trees.len(), 1);
        assert!(Rc::ptr_eq(&trees[0], &a));
        assert!(!a.borrow().tmp_flag && !b.borrow().tmp_flag);
    }

    #[test]
    fn dentry_list_has_no_duplicates_and_no_contained_entries() {
        let root = dir("");
        let a = dir("a");
        let b = dir("b");
        let c = file("c");
        add_child(&root, &a);
        add_child(&a, &b);
        add_child(&b, &c);

        let mut trees = vec![b.clone(), c.clone(), b.clone()];
        remove_duplicate_trees(&mut trees);
        remove_contained_trees(&mut trees);
        let list = build_dentry_list(&trees, true);

        // b, c plus ancestors a and root, ancestors first.
        assert_eq!(list.len(), 4);
        let pos = |d: &DentryRef| list.iter().position(|x| Rc::ptr_eq(x, d)).unwrap();
        assert!(pos(&root) < pos(&a));
        assert!(pos(&a) < pos(&b));
        assert!(pos(&b) < pos(&c));
        for d in &list {
            d.borrow_mut().clear_extraction_state();
        }
    }

    #[test]
    fn invalid_names_are_fabricated_or_skipped() {
        assert!(name_valid(&crate::encoding::encode_utf16("normal.txt"), true));
        assert!(!name_valid(&crate::encoding::encode_utf16("a:b"), true));
        assert!(name_valid(&crate::encoding::encode_utf16("a:b"), false));
        let fixed = fabricate_name(&crate::encoding::encode_utf16("a:b"), false, 1);
        assert_eq!(
            String::from_utf16(&fixed).unwrap(),
            "a:b (invalid filename #1)"
        );
    }
}
