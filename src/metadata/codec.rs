//! Parsing and emission of the dentry-tree byte stream: dentry records,
//! extra stream entries, tagged items, and the offsets tying them together.
//!
//! Every record and extra stream entry starts on an 8-byte boundary. A
//! record whose length field is zero (really 8, the size of the field
//! itself) terminates a sibling list.

use std::collections::HashMap;
use std::io::{Cursor, Seek, SeekFrom};

use binrw::prelude::*;

use crate::binrw_util::prelude::{FileTime, SizedWideString};
use crate::blob::Sha1Hash;
use crate::dentry::{
    self, add_child, children_in_order, dentry_is_directory, for_dentry_in_tree, full_path,
    new_dentry_with_inode_utf16, DentryRef, MAX_DIR_NESTING,
};
use crate::error::Error;
use crate::inode::{new_inode_ref, FileAttributes, Inode, InodeRef, Stream, StreamKind};
use crate::metadata::security::SecurityData;
use crate::tagged_items::TaggedItems;
use crate::Result;

/// Size of the fixed-length prefix of a dentry record, up to and including
/// the file name length field.
pub const DENTRY_DISK_SIZE: u64 = 102;

/// Size of the fixed-length prefix of an extra stream entry.
pub const EXTRA_STREAM_DISK_SIZE: u64 = 38;

fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

#[binrw::binrw]
#[brw(little)]
struct DiskDentry {
    length: u64,
    attributes: FileAttributes,
    security_id: i32,
    subdir_offset: u64,
    unused_1: u64,
    unused_2: u64,
    creation_time: FileTime,
    last_access_time: FileTime,
    last_write_time: FileTime,
    main_hash: [u8; 20],
    unknown_0x54: u32,
    #[br(args { is_reparse: attributes.reparse_point() })]
    link_info: DentryLinkInfo,
    num_extra_streams: u16,
    short_name_nbytes: u16,
    name_nbytes: u16,
}

/// The 8-byte union following `unknown_0x54`: reparse information for
/// reparse points, the hard link group id for everything else. This is why
/// a reparse point cannot have hard links.
#[binrw::binrw]
#[brw(little)]
#[br(import { is_reparse: bool })]
enum DentryLinkInfo {
    #[br(pre_assert(is_reparse))]
    Reparse {
        tag: u32,
        reserved: u16,
        flags: u16,
    },
    #[br(pre_assert(!is_reparse))]
    HardLinkGroup { id: u64 },
}

#[binrw::binrw]
#[brw(little)]
struct DiskExtraStream {
    length: u64,
    reserved: u64,
    hash: [u8; 20],
    name_nbytes: u16,
}

fn read_u64_at(buf: &[u8], offset: u64) -> Result<u64> {
    let end = offset
        .checked_add(8)
        .filter(|&end| end <= buf.len() as u64)
        .ok_or(Error::InvalidMetadataResource("dentry offset out of range"))?;
    Ok(u64::from_le_bytes(
        buf[offset as usize..end as usize].try_into().unwrap(),
    ))
}

fn utf16_to_bytes(units: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(units.len() * 2);
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Read the extra stream entries following a dentry record and populate the
/// inode's stream array, then infer the stream types.
fn setup_inode_streams(
    buf: &[u8],
    inode: &mut Inode,
    num_extra_streams: u16,
    main_hash: Sha1Hash,
    offset: &mut u64,
) -> Result<()> {
    // The main hash provides the synthetic first stream.
    inode.add_stream_unresolved(StreamKind::Unknown, Vec::new(), main_hash);

    for _ in 0..num_extra_streams {
        let remaining = buf.len() as u64 - *offset;
        if remaining < EXTRA_STREAM_DISK_SIZE {
            return Err(Error::InvalidMetadataResource(
                "extra stream entry overruns the buffer",
            ));
        }
        let mut cursor = Cursor::new(&buf[*offset as usize..]);
        let disk_strm = DiskExtraStream::read(&mut cursor)?;
        let length = align8(disk_strm.length);
        if length < EXTRA_STREAM_DISK_SIZE || length > remaining {
            return Err(Error::InvalidMetadataResource(
                "extra stream entry has a bad length",
            ));
        }
        let name_nbytes = disk_strm.name_nbytes as u64;
        let name: Vec<u16> = if name_nbytes != 0 {
            if name_nbytes % 2 != 0 {
                return Err(Error::InvalidMetadataResource(
                    "extra stream name length is odd",
                ));
            }
            if EXTRA_STREAM_DISK_SIZE + name_nbytes > length {
                return Err(Error::InvalidMetadataResource(
                    "extra stream name overruns its entry",
                ));
            }
            SizedWideString::read_le_args(&mut cursor, (name_nbytes,))?.into()
        } else {
            Vec::new()
        };
        inode.add_stream_unresolved(StreamKind::Unknown, name, Sha1Hash(disk_strm.hash));
        *offset += length;
    }

    inode.assign_stream_types();
    Ok(())
}

/// Read one dentry record, including its extra stream entries, advancing
/// `offset` past all of it. Returns `None` at an end-of-directory marker.
fn read_dentry(buf: &[u8], offset: &mut u64) -> Result<Option<DentryRef>> {
    let length = align8(read_u64_at(buf, *offset)?);

    if length <= 8 {
        // End of a sibling list.
        return Ok(None);
    }
    if length < DENTRY_DISK_SIZE {
        return Err(Error::InvalidMetadataResource("dentry record too short"));
    }
    let record_end = offset
        .checked_add(length)
        .filter(|&end| end <= buf.len() as u64)
        .ok_or(Error::InvalidMetadataResource(
            "dentry record overruns the buffer",
        ))?;

    let mut cursor = Cursor::new(&buf[*offset as usize..record_end as usize]);
    let disk_dentry = DiskDentry::read(&mut cursor)?;

    let name_nbytes = disk_dentry.name_nbytes as u64;
    let short_name_nbytes = disk_dentry.short_name_nbytes as u64;
    if name_nbytes % 2 != 0 || short_name_nbytes % 2 != 0 {
        return Err(Error::InvalidMetadataResource("dentry name length is odd"));
    }
    let mut calculated_size = DENTRY_DISK_SIZE;
    if name_nbytes != 0 {
        calculated_size += name_nbytes + 2;
    }
    if short_name_nbytes != 0 {
        calculated_size += short_name_nbytes + 2;
    }
    if length < calculated_size {
        return Err(Error::InvalidMetadataResource(
            "dentry record too short for its names",
        ));
    }

    let inode_ref = new_inode_ref(false);
    {
        let mut inode = inode_ref.borrow_mut();
        inode.attributes = disk_dentry.attributes;
        inode.security_id = disk_dentry.security_id;
        inode.creation_time = disk_dentry.creation_time;
        inode.last_access_time = disk_dentry.last_access_time;
        inode.last_write_time = disk_dentry.last_write_time;
        inode.unknown_0x54 = disk_dentry.unknown_0x54;
        inode.unused = [disk_dentry.unused_1, disk_dentry.unused_2];
        match disk_dentry.link_info {
            DentryLinkInfo::Reparse {
                tag,
                reserved,
                flags,
            } => {
                inode.reparse_tag = tag;
                inode.rp_reserved = reserved;
                inode.rp_flags = flags;
                // The group id is not representable for reparse points.
            }
            DentryLinkInfo::HardLinkGroup { id } => inode.ino = id,
        }
    }

    // The cursor sits right after the fixed-length prefix, at the names.
    let mut pos = *offset + DENTRY_DISK_SIZE;
    let name: Vec<u16> = if name_nbytes != 0 {
        let name = SizedWideString::read_le_args(&mut cursor, (name_nbytes,))?;
        cursor.seek(SeekFrom::Current(2))?; // null terminator
        pos += name_nbytes + 2;
        name.into()
    } else {
        Vec::new()
    };
    let short_name: Vec<u16> = if short_name_nbytes != 0 {
        let short = SizedWideString::read_le_args(&mut cursor, (short_name_nbytes,))?;
        pos += short_name_nbytes + 2;
        short.into()
    } else {
        Vec::new()
    };

    // Whatever remains before the record end, after 8-byte alignment, is the
    // tagged item area.
    let extra_start = align8(pos);
    if extra_start < record_end {
        let raw = buf[extra_start as usize..record_end as usize].to_vec();
        inode_ref.borrow_mut().extra = Some(TaggedItems::from_raw(raw));
    }

    let dentry = new_dentry_with_inode_utf16(&name, inode_ref.clone());
    {
        let mut d = dentry.borrow_mut();
        d.set_short_name_utf16(&short_name);
        d.subdir_offset = disk_dentry.subdir_offset;
    }

    let mut stream_offset = record_end;
    setup_inode_streams(
        buf,
        &mut inode_ref.borrow_mut(),
        disk_dentry.num_extra_streams,
        Sha1Hash(disk_dentry.main_hash),
        &mut stream_offset,
    )?;

    *offset = stream_offset;
    Ok(Some(dentry))
}

fn name_is_dot_or_dotdot(name: &[u16]) -> bool {
    matches!(name, [c] if *c == b'.' as u16) || matches!(name, [a, b] if *a == b'.' as u16 && *b == b'.' as u16)
}

/// Dentries with no name, a "." or ".." name, or an embedded NUL could be
/// used for path traversal tricks; drop them with a warning.
fn should_ignore_dentry(dir: &DentryRef, dentry: &DentryRef) -> bool {
    let d = dentry.borrow();
    if !d.has_long_name() {
        log::warn!(
            "Ignoring unnamed file in directory \"{}\"",
            full_path(dir)
        );
        return true;
    }
    if name_is_dot_or_dotdot(d.name()) {
        log::warn!(
            "Ignoring file named \".\" or \"..\" in directory \"{}\"",
            full_path(dir)
        );
        return true;
    }
    if d.name().contains(&0) {
        log::warn!(
            "Ignoring filename with embedded null character in directory \"{}\"",
            full_path(dir)
        );
        return true;
    }
    false
}

fn read_dentry_tree_recursive(buf: &[u8], dir: &DentryRef, depth: usize) -> Result<()> {
    // Extremely deep nesting means a cycle or a hostile file.
    if depth >= MAX_DIR_NESTING {
        return Err(Error::InvalidMetadataResource("directory structure too deep"));
    }
    let mut cur_offset = dir.borrow().subdir_offset;

    loop {
        let child = match read_dentry(buf, &mut cur_offset)? {
            Some(child) => child,
            None => return Ok(()),
        };

        if should_ignore_dentry(dir, &child) {
            dentry::free_dentry_tree(&child, None);
            continue;
        }

        if let Some(duplicate) = add_child(dir, &child) {
            log::warn!(
                "Ignoring duplicate file \"{}\" (the image already contains a file at that path with the exact same name)",
                full_path(&duplicate)
            );
            dentry::free_dentry_tree(&child, None);
            continue;
        }

        if child.borrow().subdir_offset != 0 {
            if dentry_is_directory(&child) {
                read_dentry_tree_recursive(buf, &child, depth + 1)?;
            } else {
                log::warn!(
                    "Ignoring children of non-directory file \"{}\"",
                    full_path(&child)
                );
            }
        }
    }
}

/// Read a whole dentry tree. Returns `None` only when the tree starts with
/// an end-of-directory marker (an empty image).
fn read_dentry_tree(buf: &[u8], root_offset: u64) -> Result<Option<DentryRef>> {
    let mut offset = root_offset;
    let root = match read_dentry(buf, &mut offset)? {
        Some(root) => root,
        None => {
            log::warn!("The metadata resource has no directory entries; treating as an empty image");
            return Ok(None);
        }
    };

    {
        let mut r = root.borrow_mut();
        if r.has_long_name() || r.has_short_name() {
            log::warn!("The root directory has a nonempty name; removing it");
            r.set_name_utf16(&[]);
        }
    }
    if !dentry_is_directory(&root) {
        return Err(Error::InvalidMetadataResource(
            "the root of the image is not a directory",
        ));
    }
    if root.borrow().subdir_offset != 0 {
        read_dentry_tree_recursive(buf, &root, 0)?;
    }
    Ok(Some(root))
}

fn streams_equivalent(a: &[Stream], b: &[Stream]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(sa, sb)| sa.hash() == sb.hash() && sa.name() == sb.name())
}

/// Merge dentries that share a nonzero hard link group id onto a single
/// inode, and collect the image's inode list. Groups whose members disagree
/// about their metadata keep separate inodes, with a warning.
fn fixup_inodes(root: &DentryRef) -> Result<Vec<InodeRef>> {
    let mut inode_list: Vec<InodeRef> = Vec::new();
    let mut groups: HashMap<u64, InodeRef> = HashMap::new();

    for_dentry_in_tree(root, &mut |dentry| {
        let inode = dentry.borrow().inode.clone();
        let ino = inode.borrow().ino;
        let mergeable = ino != 0 && !inode.borrow().is_directory();
        if !mergeable {
            inode_list.push(inode);
            return Ok(());
        }
        match groups.get(&ino) {
            None => {
                groups.insert(ino, inode.clone());
                inode_list.push(inode);
            }
            Some(leader) => {
                let compatible = {
                    let leader = leader.borrow();
                    let candidate = inode.borrow();
                    leader.attributes == candidate.attributes
                        && leader.security_id == candidate.security_id
                        && streams_equivalent(leader.streams(), candidate.streams())
                };
                if compatible {
                    let leader = leader.clone();
                    inode.borrow_mut().remove_alias(dentry);
                    dentry.borrow_mut().inode = leader.clone();
                    leader.borrow_mut().add_alias(dentry);
                } else {
                    log::warn!(
                        "Hard link group {ino:#x} is inconsistent; not merging \"{}\"",
                        full_path(dentry)
                    );
                    inode_list.push(inode);
                }
            }
        }
        Ok(())
    })?;
    Ok(inode_list)
}

/// Reset out-of-range security ids to "none", with one aggregate warning.
fn fix_security_ids(inodes: &[InodeRef], num_entries: u32) {
    let mut invalid_count = 0u32;
    for inode in inodes {
        let mut inode = inode.borrow_mut();
        if inode.security_id >= 0 && inode.security_id as u32 >= num_entries {
            inode.security_id = -1;
            invalid_count += 1;
        }
    }
    if invalid_count != 0 {
        log::warn!("{invalid_count} inodes had invalid security IDs");
    }
}

/// Everything parsed out of one metadata resource.
pub struct DecodedMetadata {
    pub security_data: SecurityData,
    pub root: Option<DentryRef>,
    pub inodes: Vec<InodeRef>,
}

/// Parse an uncompressed metadata resource: security data, then the dentry
/// tree rooted right after it.
pub fn read_metadata_resource(buf: &[u8]) -> Result<DecodedMetadata> {
    let (security_data, root_offset) = SecurityData::read(buf)?;
    let root = read_dentry_tree(buf, root_offset as u64)?;
    let inodes = match &root {
        Some(root) => fixup_inodes(root)?,
        None => Vec::new(),
    };
    fix_security_ids(&inodes, security_data.num_entries());
    Ok(DecodedMetadata {
        security_data,
        root,
        inodes,
    })
}

fn stream_out_total_length(stream: &Stream) -> u64 {
    let mut len = EXTRA_STREAM_DISK_SIZE;
    if stream.is_named() {
        len += stream.name().len() as u64 * 2 + 2;
    }
    align8(len)
}

struct StreamLayout {
    main_hash: Sha1Hash,
    unnamed_hashes: Vec<Sha1Hash>,
    named_ids: Vec<u32>,
    num_extra_streams: u16,
}

/// Apply the DISM-compatible placement rules: a single unnamed stream's hash
/// rides in `main_hash`; any named stream, or a reparse/unnamed-data pair,
/// forces everything into extra stream entries (unnamed first, reparse
/// before unnamed data, named in their original order).
fn compute_stream_layout(inode: &Inode) -> StreamLayout {
    let mut unnamed_data_hash = Sha1Hash::ZERO;
    let mut reparse_hash = Sha1Hash::ZERO;
    let mut efsrpc_hash = Sha1Hash::ZERO;
    let mut named_ids = Vec::new();

    for stream in inode.streams() {
        match stream.kind {
            StreamKind::Data => {
                if stream.is_named() {
                    named_ids.push(stream.stream_id());
                } else {
                    unnamed_data_hash = stream.hash();
                }
            }
            StreamKind::ReparsePoint => reparse_hash = stream.hash(),
            StreamKind::EfsrpcRawData => efsrpc_hash = stream.hash(),
            StreamKind::Unknown => {}
        }
    }

    let mut unnamed_hashes = Vec::new();
    if inode.attributes.encrypted() {
        unnamed_hashes.push(efsrpc_hash);
        named_ids.clear();
    } else {
        if inode.attributes.reparse_point() {
            unnamed_hashes.push(reparse_hash);
        }
        if !inode.attributes.directory() {
            unnamed_hashes.push(unnamed_data_hash);
        }
    }

    if unnamed_hashes.len() <= 1 && named_ids.is_empty() {
        StreamLayout {
            main_hash: unnamed_hashes.first().copied().unwrap_or(Sha1Hash::ZERO),
            unnamed_hashes: Vec::new(),
            named_ids: Vec::new(),
            num_extra_streams: 0,
        }
    } else {
        let num = (unnamed_hashes.len() + named_ids.len()) as u16;
        StreamLayout {
            main_hash: Sha1Hash::ZERO,
            unnamed_hashes,
            named_ids,
            num_extra_streams: num,
        }
    }
}

fn dentry_base_length(dentry: &DentryRef) -> u64 {
    let d = dentry.borrow();
    let mut len = DENTRY_DISK_SIZE;
    if d.has_long_name() {
        len += d.name().len() as u64 * 2 + 2;
    }
    if d.has_short_name() {
        len += d.short_name().len() as u64 * 2 + 2;
    }
    let mut len = align8(len);
    if let Some(extra) = d.inode.borrow().extra.as_ref() {
        if !extra.is_empty() {
            len += align8(extra.as_bytes().len() as u64);
        }
    }
    len
}

/// Total on-disk bytes for a dentry: the record, its names, tagged items,
/// and all extra stream entries, with alignment.
pub fn dentry_out_total_length(dentry: &DentryRef) -> u64 {
    let mut len = dentry_base_length(dentry);
    let inode = dentry.borrow().inode.clone();
    let inode = inode.borrow();
    let layout = compute_stream_layout(&inode);
    len += layout.unnamed_hashes.len() as u64 * align8(EXTRA_STREAM_DISK_SIZE);
    for id in &layout.named_ids {
        if let Some(stream) = inode.stream_by_id(*id) {
            len += stream_out_total_length(stream);
        }
    }
    len
}

/// Compute the subdir offset of every directory in a single recursive pass.
/// `subdir_offset` starts at the position just past the root record and its
/// end-of-directory marker, and ends past the whole serialized tree.
pub fn calculate_subdir_offsets(root: &DentryRef, subdir_offset: &mut u64) {
    let _ = for_dentry_in_tree(root, &mut |dentry| {
        if dentry_is_directory(dentry) {
            dentry.borrow_mut().subdir_offset = *subdir_offset;
            for child in children_in_order(dentry) {
                *subdir_offset += dentry_out_total_length(&child);
            }
            // End-of-directory marker.
            *subdir_offset += 8;
        } else {
            dentry.borrow_mut().subdir_offset = 0;
        }
        Ok(())
    });
}

fn pad8(out: &mut Vec<u8>) {
    while out.len() % 8 != 0 {
        out.push(0);
    }
}

fn write_extra_stream_entry(out: &mut Vec<u8>, name: &[u16], hash: Sha1Hash) -> Result<()> {
    let start = out.len();
    let name_nbytes = name.len() as u64 * 2;
    let mut length = EXTRA_STREAM_DISK_SIZE;
    if name_nbytes != 0 {
        length += name_nbytes + 2;
    }
    let entry = DiskExtraStream {
        length: align8(length),
        reserved: 0,
        hash: hash.0,
        name_nbytes: name_nbytes as u16,
    };
    let mut cursor = Cursor::new(Vec::new());
    entry.write(&mut cursor)?;
    out.extend_from_slice(&cursor.into_inner());
    if name_nbytes != 0 {
        out.extend_from_slice(&utf16_to_bytes(name));
        out.extend_from_slice(&[0, 0]);
    }
    pad8(out);
    debug_assert_eq!((out.len() - start) as u64, align8(length));
    Ok(())
}

/// Serialize one dentry record plus its extra stream entries.
fn write_dentry(dentry: &DentryRef, out: &mut Vec<u8>) -> Result<()> {
    debug_assert!(out.len() % 8 == 0);
    let start = out.len();

    let inode_ref = dentry.borrow().inode.clone();
    let inode = inode_ref.borrow();
    let layout = compute_stream_layout(&inode);
    let length = dentry_base_length(dentry);

    let d = dentry.borrow();
    let link_info = if inode.attributes.reparse_point() {
        DentryLinkInfo::Reparse {
            tag: inode.reparse_tag,
            reserved: inode.rp_reserved,
            flags: inode.rp_flags,
        }
    } else {
        DentryLinkInfo::HardLinkGroup {
            // Lone files don't need a group id.
            id: if inode.nlink() == 1 { 0 } else { inode.ino },
        }
    };
    let disk_dentry = DiskDentry {
        length,
        attributes: inode.attributes,
        security_id: inode.security_id,
        subdir_offset: d.subdir_offset,
        unused_1: inode.unused[0],
        unused_2: inode.unused[1],
        creation_time: inode.creation_time,
        last_access_time: inode.last_access_time,
        last_write_time: inode.last_write_time,
        main_hash: layout.main_hash.0,
        unknown_0x54: inode.unknown_0x54,
        link_info,
        num_extra_streams: layout.num_extra_streams,
        short_name_nbytes: d.short_name().len() as u16 * 2,
        name_nbytes: d.name().len() as u16 * 2,
    };

    let mut cursor = Cursor::new(Vec::new());
    disk_dentry.write(&mut cursor)?;
    out.extend_from_slice(&cursor.into_inner());

    if d.has_long_name() {
        out.extend_from_slice(&utf16_to_bytes(d.name()));
        out.extend_from_slice(&[0, 0]);
    }
    if d.has_short_name() {
        out.extend_from_slice(&utf16_to_bytes(d.short_name()));
        out.extend_from_slice(&[0, 0]);
    }
    pad8(out);

    if let Some(extra) = inode.extra.as_ref() {
        if !extra.is_empty() {
            out.extend_from_slice(extra.as_bytes());
            pad8(out);
        }
    }
    debug_assert_eq!((out.len() - start) as u64, length);

    for hash in &layout.unnamed_hashes {
        write_extra_stream_entry(out, &[], *hash)?;
    }
    for id in &layout.named_ids {
        if let Some(stream) = inode.stream_by_id(*id) {
            write_extra_stream_entry(out, stream.name(), stream.hash())?;
        }
    }
    Ok(())
}

fn write_end_of_directory(out: &mut Vec<u8>) {
    out.extend_from_slice(&0u64.to_le_bytes());
}

/// Serialize a dentry tree on which [`calculate_subdir_offsets`] has been
/// run.
pub fn write_dentry_tree(root: &DentryRef, out: &mut Vec<u8>) -> Result<()> {
    write_dentry(root, out)?;
    write_end_of_directory(out);

    for_dentry_in_tree(root, &mut |dentry| {
        if dentry.borrow().subdir_offset != 0 {
            debug_assert_eq!(out.len() as u64, dentry.borrow().subdir_offset);
            for child in children_in_order(dentry) {
                write_dentry(&child, out)?;
            }
            write_end_of_directory(out);
        }
        Ok(())
    })
}

/// Build the complete uncompressed metadata resource for an image:
/// `[security data][root record][end marker][children...]`.
pub fn prepare_metadata_resource(security_data: &SecurityData, root: &DentryRef) -> Result<Vec<u8>> {
    // The first child of the root lands after the security data, the root
    // record, and an end-of-directory marker following the root record.
    let mut subdir_offset =
        security_data.total_length() as u64 + dentry_out_total_length(root) + 8;
    calculate_subdir_offsets(root, &mut subdir_offset);

    let mut out = Vec::with_capacity(subdir_offset as usize);
    security_data.write(&mut out);
    write_dentry_tree(root, &mut out)?;
    debug_assert_eq!(out.len() as u64, subdir_offset);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dentry::new_dentry_with_new_inode;

    fn new_root() -> DentryRef {
        let root = new_dentry_with_new_inode("", false);
        root.borrow().inode.borrow_mut().attributes =
            FileAttributes::new().with_directory(true);
        root
    }

    fn new_file(name: &str) -> DentryRef {
        let d = new_dentry_with_new_inode(name, false);
        {
            let inode = d.borrow().inode.clone();
            let mut inode = inode.borrow_mut();
            inode.attributes = FileAttributes::new().with_normal(true);
            inode.add_stream_unresolved(StreamKind::Data, Vec::new(), Sha1Hash::ZERO);
        }
        d
    }

    #[test]
    fn empty_image_round_trips() {
        let root = new_root();
        let buf = prepare_metadata_resource(&SecurityData::new(), &root).unwrap();
        assert_eq!(buf.len() % 8, 0);
        let decoded = read_metadata_resource(&buf).unwrap();
        let decoded_root = decoded.root.unwrap();
        assert!(dentry_is_directory(&decoded_root));
        assert!(!decoded_root.borrow().has_long_name());
        assert_eq!(decoded.inodes.len(), 1);
    }

    #[test]
    fn single_file_round_trips() {
        let root = new_root();
        add_child(&root, &new_file("hello"));
        let buf = prepare_metadata_resource(&SecurityData::new(), &root).unwrap();
        let decoded = read_metadata_resource(&buf).unwrap();
        let decoded_root = decoded.root.unwrap();
        let children = children_in_order(&decoded_root);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].borrow().name_string(), "hello");
        let kinds: Vec<_> = children[0]
            .borrow()
            .inode
            .borrow()
            .streams()
            .iter()
            .map(|s| s.kind)
            .collect();
        assert_eq!(kinds, vec![StreamKind::Data]);
    }

    #[test]
    fn records_are_eight_byte_aligned() {
        let root = new_root();
        for name in ["a", "bb", "ccc", "dddd"] {
            add_child(&root, &new_file(name));
        }
        let mut subdir_offset = 0;
        calculate_subdir_offsets(&root, &mut subdir_offset);
        let _ = for_dentry_in_tree(&root, &mut |d| {
            assert_eq!(d.borrow().subdir_offset % 8, 0);
            assert_eq!(dentry_out_total_length(d) % 8, 0);
            Ok(())
        });
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let root = new_root();
        add_child(&root, &new_file("hello"));
        let buf = prepare_metadata_resource(&SecurityData::new(), &root).unwrap();
        for len in [1, 7, 9, buf.len() - 1] {
            assert!(read_metadata_resource(&buf[..len]).is_err());
        }
    }

    #[test]
    fn nonzero_security_ids_are_clamped() {
        let root = new_root();
        let file = new_file("secured");
        file.borrow().inode.borrow_mut().security_id = 3;
        add_child(&root, &file);
        let buf = prepare_metadata_resource(&SecurityData::new(), &root).unwrap();
        let decoded = read_metadata_resource(&buf).unwrap();
        let child = children_in_order(&decoded.root.unwrap()).remove(0);
        // No security table entries exist, so the id resets to "none".
        assert_eq!(child.borrow().inode.borrow().security_id, -1);
    }
}
