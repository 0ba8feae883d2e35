//! Reparse point buffers: the fixed header, the symlink/junction body, and
//! the "rpfix" rewriting of absolute link targets.
//!
//! Only reparse *data* is stored as a blob; the 8-byte header is
//! reconstructed from fields kept on the inode.

use std::io::Cursor;

use binrw::prelude::*;

use crate::blob::BlobTable;
use crate::encoding::{encode_utf16, utf16_to_string};
use crate::error::Error;
use crate::inode::{Inode, StreamKind, WIM_RP_FLAG_NOT_FIXED};
use crate::Result;

pub const REPARSE_TAG_MOUNT_POINT: u32 = 0xA0000003;
pub const REPARSE_TAG_SYMLINK: u32 = 0xA000000C;
pub const REPARSE_TAG_DEDUP: u32 = 0x80000013;
pub const REPARSE_TAG_WOF: u32 = 0x80000017;

/// Flag in a symlink reparse body: the target is relative to the directory
/// containing the link.
pub const SYMBOLIC_LINK_RELATIVE: u32 = 0x00000001;

/// Size of the header preceding the reparse data.
pub const REPARSE_DATA_OFFSET: usize = 8;
/// Maximum size of a full reparse point buffer, header included.
pub const REPARSE_POINT_MAX_SIZE: usize = 16384;
/// Maximum size of the reparse data alone.
pub const REPARSE_DATA_MAX_SIZE: usize = REPARSE_POINT_MAX_SIZE - REPARSE_DATA_OFFSET;

const GUID_SIZE: u64 = 16;

const BACKSLASH: u16 = b'\\' as u16;

#[binrw::binrw]
#[brw(little)]
struct DiskReparseHeader {
    tag: u32,
    rpdatalen: u16,
    rpreserved: u16,
}

/// An in-memory reparse point buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReparseBuffer {
    pub tag: u32,
    pub rpreserved: u16,
    /// Length the header claims for the data that follows it.
    pub rpdatalen: u16,
    pub data: Vec<u8>,
}

impl ReparseBuffer {
    /// Reconstruct a full reparse buffer around blob data. The data length
    /// excludes a leading GUID when the tag's Microsoft bit is clear.
    pub fn complete(inode: &Inode, data: Vec<u8>) -> Result<Self> {
        if data.len() > REPARSE_DATA_MAX_SIZE {
            return Err(Error::InvalidReparseData("reparse data too large"));
        }
        let mut rpdatalen = data.len() as u64;
        if rpdatalen >= GUID_SIZE && (inode.reparse_tag & 0x80000000) == 0 {
            rpdatalen -= GUID_SIZE;
        }
        Ok(Self {
            tag: inode.reparse_tag,
            rpreserved: inode.rp_reserved,
            rpdatalen: rpdatalen as u16,
            data,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.data.len() > REPARSE_DATA_MAX_SIZE {
            return Err(Error::InvalidReparseData("reparse data too large"));
        }
        let mut cursor = Cursor::new(Vec::with_capacity(REPARSE_DATA_OFFSET + self.data.len()));
        DiskReparseHeader {
            tag: self.tag,
            rpdatalen: self.rpdatalen,
            rpreserved: self.rpreserved,
        }
        .write(&mut cursor)?;
        let mut out = cursor.into_inner();
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < REPARSE_DATA_OFFSET || buf.len() > REPARSE_POINT_MAX_SIZE {
            return Err(Error::InvalidReparseData("bad reparse buffer size"));
        }
        let header = DiskReparseHeader::read(&mut Cursor::new(buf))?;
        Ok(Self {
            tag: header.tag,
            rpreserved: header.rpreserved,
            rpdatalen: header.rpdatalen,
            data: buf[REPARSE_DATA_OFFSET..].to_vec(),
        })
    }
}

/// A parsed symbolic link or junction reparse point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkReparsePoint {
    pub tag: u32,
    pub rpreserved: u16,
    /// Only meaningful for SYMLINK tags.
    pub symlink_flags: u32,
    pub substitute_name: Vec<u16>,
    pub print_name: Vec<u16>,
}

impl LinkReparsePoint {
    pub fn is_relative(&self) -> bool {
        self.tag == REPARSE_TAG_SYMLINK && (self.symlink_flags & SYMBOLIC_LINK_RELATIVE) != 0
    }
}

fn read_u16(data: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([data[pos], data[pos + 1]])
}

/// Parse the body of a symbolic link or junction reparse point.
pub fn parse_link_reparse_point(rpbuf: &ReparseBuffer) -> Result<LinkReparsePoint> {
    if rpbuf.tag != REPARSE_TAG_SYMLINK && rpbuf.tag != REPARSE_TAG_MOUNT_POINT {
        return Err(Error::InvalidReparseData("not a symlink or junction"));
    }
    let data = &rpbuf.data;
    let names_offset = if rpbuf.tag == REPARSE_TAG_SYMLINK { 12 } else { 8 };
    if data.len() < names_offset {
        return Err(Error::InvalidReparseData("reparse buffer too small"));
    }

    let substitute_name_offset = read_u16(data, 0) as usize;
    let substitute_name_nbytes = read_u16(data, 2) as usize;
    let print_name_offset = read_u16(data, 4) as usize;
    let print_name_nbytes = read_u16(data, 6) as usize;

    // Names must be 2-byte sized and aligned.
    if ((substitute_name_offset | print_name_offset | substitute_name_nbytes | print_name_nbytes)
        & 1)
        != 0
    {
        return Err(Error::InvalidReparseData("misaligned reparse names"));
    }

    let symlink_flags = if rpbuf.tag == REPARSE_TAG_SYMLINK {
        u32::from_le_bytes([data[8], data[9], data[10], data[11]])
    } else {
        0
    };

    let name_area = &data[names_offset..];
    if substitute_name_offset + substitute_name_nbytes > name_area.len()
        || print_name_offset + print_name_nbytes > name_area.len()
    {
        return Err(Error::InvalidReparseData("reparse names overrun the buffer"));
    }

    let substitute_name = utf16_of(
        &name_area[substitute_name_offset..substitute_name_offset + substitute_name_nbytes],
    );
    let print_name =
        utf16_of(&name_area[print_name_offset..print_name_offset + print_name_nbytes]);

    Ok(LinkReparsePoint {
        tag: rpbuf.tag,
        rpreserved: rpbuf.rpreserved,
        symlink_flags,
        substitute_name,
        print_name,
    })
}

fn utf16_of(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

fn utf16_bytes(units: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(units.len() * 2 + 2);
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

/// Translate a [`LinkReparsePoint`] back into a reparse point buffer. Both
/// names are null-terminated in the name area, though the length fields do
/// not count the terminators.
pub fn make_link_reparse_point(link: &LinkReparsePoint) -> Result<ReparseBuffer> {
    if link.tag != REPARSE_TAG_SYMLINK && link.tag != REPARSE_TAG_MOUNT_POINT {
        return Err(Error::InvalidReparseData("not a symlink or junction"));
    }
    let names_offset = if link.tag == REPARSE_TAG_SYMLINK { 12 } else { 8 };
    let substitute_nbytes = link.substitute_name.len() * 2;
    let print_nbytes = link.print_name.len() * 2;
    if REPARSE_DATA_OFFSET + names_offset + substitute_nbytes + print_nbytes + 4
        > REPARSE_POINT_MAX_SIZE
    {
        return Err(Error::InvalidReparseData("reparse names too long"));
    }

    let mut data = Vec::with_capacity(names_offset + substitute_nbytes + print_nbytes + 4);
    data.extend_from_slice(&0u16.to_le_bytes()); // substitute_name_offset
    data.extend_from_slice(&(substitute_nbytes as u16).to_le_bytes());
    data.extend_from_slice(&((substitute_nbytes + 2) as u16).to_le_bytes()); // print_name_offset
    data.extend_from_slice(&(print_nbytes as u16).to_le_bytes());
    if link.tag == REPARSE_TAG_SYMLINK {
        data.extend_from_slice(&link.symlink_flags.to_le_bytes());
    }
    data.extend_from_slice(&utf16_bytes(&link.substitute_name));
    data.extend_from_slice(&[0, 0]);
    data.extend_from_slice(&utf16_bytes(&link.print_name));
    data.extend_from_slice(&[0, 0]);

    Ok(ReparseBuffer {
        tag: link.tag,
        rpreserved: link.rpreserved,
        rpdatalen: data.len() as u16,
        data,
    })
}

const NT_ROOT_DIRS: [&str; 3] = ["\\??\\", "\\DosDevices\\", "\\Device\\"];

/// Given an NT namespace path such as `\??\e:\Windows`, return the suffix
/// beginning with the device, such as `e:\Windows`.
pub fn skip_nt_toplevel_component(path: &[u16]) -> &[u16] {
    for dir in NT_ROOT_DIRS {
        let prefix = encode_utf16(dir);
        if path.len() >= prefix.len() && path[..prefix.len()] == prefix[..] {
            let mut rest = &path[prefix.len()..];
            while let Some((&first, tail)) = rest.split_first() {
                if first != BACKSLASH {
                    break;
                }
                rest = tail;
            }
            return rest;
        }
    }
    path
}

/// Given an NT namespace path, return the device-relative suffix, possibly
/// with leading backslashes, such as `\Windows`.
pub fn get_device_relative_path(path: &[u16]) -> &[u16] {
    let skipped = skip_nt_toplevel_component(path);
    if skipped.len() == path.len() {
        return path;
    }
    match skipped.iter().position(|&c| c == BACKSLASH) {
        Some(pos) => &skipped[pos..],
        None => &skipped[skipped.len()..],
    }
}

fn starts_with_target(substitute_name: &[u16], target_ntpath: &[u16]) -> bool {
    if target_ntpath.is_empty() || substitute_name.len() < target_ntpath.len() {
        return false;
    }
    if substitute_name[..target_ntpath.len()] != *target_ntpath {
        return false;
    }
    substitute_name.len() == target_ntpath.len()
        || substitute_name[target_ntpath.len()] == BACKSLASH
        || target_ntpath[target_ntpath.len() - 1] == BACKSLASH
}

/// Rewrite the absolute target of a link that was stored relativized, so it
/// points into the extraction destination named by `target_ntpath` (an NT
/// namespace path such as `\??\D:\out`).
///
/// Relative symlinks, unparsable buffers, and targets already under
/// `target_ntpath` are returned unchanged, which makes the rewrite
/// idempotent.
pub fn apply_rpfix(rpbuf: &ReparseBuffer, target_ntpath: &[u16]) -> ReparseBuffer {
    let link = match parse_link_reparse_point(rpbuf) {
        Ok(link) => link,
        Err(_) => return rpbuf.clone(),
    };
    if link.is_relative() {
        return rpbuf.clone();
    }
    if starts_with_target(&link.substitute_name, target_ntpath) {
        return rpbuf.clone();
    }

    let mut relpath = get_device_relative_path(&link.substitute_name);
    let mut target = target_ntpath;

    // A filesystem root like \??\C:\ already ends in a slash; don't stack
    // it on the slash leading 'relpath'. Windows is picky about doubled
    // separators in link targets.
    if !target.is_empty()
        && !relpath.is_empty()
        && target[target.len() - 1] == BACKSLASH
    {
        target = &target[..target.len() - 1];
    }
    while relpath.len() >= 2 && relpath[0] == BACKSLASH && relpath[1] == BACKSLASH {
        relpath = &relpath[1..];
    }

    let mut fixed_substitute_name = Vec::with_capacity(target.len() + relpath.len());
    fixed_substitute_name.extend_from_slice(target);
    fixed_substitute_name.extend_from_slice(relpath);

    let fixed_print_name = skip_nt_toplevel_component(&fixed_substitute_name).to_vec();

    let fixed = LinkReparsePoint {
        tag: link.tag,
        rpreserved: link.rpreserved,
        symlink_flags: link.symlink_flags,
        substitute_name: fixed_substitute_name,
        print_name: fixed_print_name,
    };
    match make_link_reparse_point(&fixed) {
        Ok(buf) => buf,
        Err(_) => rpbuf.clone(),
    }
}

/// Read an inode's reparse point buffer from its reparse stream. The
/// inode's streams must be resolved and the blob readable.
pub fn inode_get_reparse_point(inode: &Inode) -> Result<ReparseBuffer> {
    let stream = inode
        .get_unnamed_stream(StreamKind::ReparsePoint)
        .ok_or(Error::InvalidReparseData("inode has no reparse stream"))?;
    let data = match stream.blob_resolved() {
        Some(blob) => {
            let blob = blob.borrow();
            if blob.size as usize > REPARSE_DATA_MAX_SIZE {
                return Err(Error::InvalidReparseData("reparse data too large"));
            }
            blob.read_data()?
        }
        None => Vec::new(),
    };
    ReparseBuffer::complete(inode, data)
}

/// Get a UNIX-style symlink target from a symlink or junction inode.
///
/// Absolute NT targets lose their NT prefix and device name; when the link
/// was stored "fixed" and `altroot` is given, the target is re-rooted under
/// it. Separators are swapped (`\` ↔ `/`) so backslashes in UNIX targets
/// survive losslessly.
pub fn inode_readlink(inode: &Inode, altroot: Option<&str>) -> Result<String> {
    if !inode.is_symlink() {
        return Err(Error::InvalidReparseData("not a symbolic link"));
    }
    let rpbuf = inode_get_reparse_point(inode)?;
    let link = parse_link_reparse_point(&rpbuf)?;

    let mut target = link.substitute_name.clone();
    let mut rpfix_ok = false;
    if !link.is_relative() {
        let stripped = get_device_relative_path(&target).to_vec();
        if stripped.len() != target.len() {
            target = stripped;
        }
        if (inode.rp_flags & WIM_RP_FLAG_NOT_FIXED) == 0 {
            rpfix_ok = true;
        }
    }

    for unit in &mut target {
        if *unit == BACKSLASH {
            *unit = b'/' as u16;
        } else if *unit == b'/' as u16 {
            *unit = BACKSLASH;
        }
    }

    let mut result = String::new();
    match altroot {
        Some(altroot) if rpfix_ok => result.push_str(altroot),
        _ => {
            if target.is_empty() {
                // An absolute target relativized against its own directory
                // comes out empty; "/" keeps it a valid target.
                return Ok("/".to_string());
            }
        }
    }
    result.push_str(&utf16_to_string(&target));
    Ok(result)
}

/// Turn a UNIX-style symlink target into a reparse stream on the inode,
/// making the inode a symlink reparse point.
pub fn inode_set_symlink(inode: &mut Inode, target: &str, table: &mut BlobTable) -> Result<()> {
    let mut units = encode_utf16(target);
    for unit in &mut units {
        if *unit == b'/' as u16 {
            *unit = BACKSLASH;
        } else if *unit == BACKSLASH {
            *unit = b'/' as u16;
        }
    }

    let link = if units.first() == Some(&BACKSLASH) || units.is_empty() {
        // Absolute UNIX target. Represent it as a non-relative symlink
        // anchored at a dummy C: drive so that both WIMGAPI and this
        // library will rewrite it on extraction.
        let mut substitute_name = encode_utf16("\\??\\C:");
        substitute_name.extend_from_slice(&units);
        let print_name = substitute_name[4..].to_vec();
        LinkReparsePoint {
            tag: REPARSE_TAG_SYMLINK,
            rpreserved: 0,
            symlink_flags: 0,
            substitute_name,
            print_name,
        }
    } else {
        LinkReparsePoint {
            tag: REPARSE_TAG_SYMLINK,
            rpreserved: 0,
            symlink_flags: SYMBOLIC_LINK_RELATIVE,
            substitute_name: units.clone(),
            print_name: units,
        }
    };

    let rpbuf = make_link_reparse_point(&link)?;
    inode.add_stream_with_data(StreamKind::ReparsePoint, &[], &rpbuf.data, table);
    inode.reparse_tag = link.tag;
    inode.attributes.set_normal(false);
    inode.attributes.set_reparse_point(true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount_point(substitute: &str, print: &str) -> ReparseBuffer {
        make_link_reparse_point(&LinkReparsePoint {
            tag: REPARSE_TAG_MOUNT_POINT,
            rpreserved: 0,
            symlink_flags: 0,
            substitute_name: encode_utf16(substitute),
            print_name: encode_utf16(print),
        })
        .unwrap()
    }

    #[test]
    fn link_body_round_trips() {
        let rpbuf = mount_point("\\??\\C:\\Users\\Public", "C:\\Users\\Public");
        let parsed = parse_link_reparse_point(&rpbuf).unwrap();
        assert_eq!(parsed.substitute_name, encode_utf16("\\??\\C:\\Users\\Public"));
        assert_eq!(parsed.print_name, encode_utf16("C:\\Users\\Public"));

        let bytes = rpbuf.to_bytes().unwrap();
        let reread = ReparseBuffer::from_bytes(&bytes).unwrap();
        assert_eq!(reread, rpbuf);
    }

    #[test]
    fn device_relative_path_strips_prefix_and_device() {
        let path = encode_utf16("\\??\\C:\\Users\\Public");
        assert_eq!(
            get_device_relative_path(&path),
            &encode_utf16("\\Users\\Public")[..]
        );
        let plain = encode_utf16("\\Users\\Public");
        assert_eq!(get_device_relative_path(&plain), &plain[..]);
    }

    #[test]
    fn rpfix_rewrites_mount_point_target() {
        let rpbuf = mount_point("\\??\\C:\\Users\\Public", "C:\\Users\\Public");
        let fixed = apply_rpfix(&rpbuf, &encode_utf16("\\??\\D:\\out"));
        let link = parse_link_reparse_point(&fixed).unwrap();
        assert_eq!(
            link.substitute_name,
            encode_utf16("\\??\\D:\\out\\Users\\Public")
        );
        assert_eq!(link.print_name, encode_utf16("D:\\out\\Users\\Public"));
    }

    #[test]
    fn rpfix_is_idempotent() {
        let rpbuf = mount_point("\\??\\C:\\Users\\Public", "C:\\Users\\Public");
        let target = encode_utf16("\\??\\D:\\out");
        let once = apply_rpfix(&rpbuf, &target);
        let twice = apply_rpfix(&once, &target);
        assert_eq!(once, twice);
    }

    #[test]
    fn rpfix_leaves_relative_symlinks_alone() {
        let rpbuf = make_link_reparse_point(&LinkReparsePoint {
            tag: REPARSE_TAG_SYMLINK,
            rpreserved: 0,
            symlink_flags: SYMBOLIC_LINK_RELATIVE,
            substitute_name: encode_utf16("..\\sibling"),
            print_name: encode_utf16("..\\sibling"),
        })
        .unwrap();
        let fixed = apply_rpfix(&rpbuf, &encode_utf16("\\??\\D:\\out"));
        assert_eq!(fixed, rpbuf);
    }

    #[test]
    fn rpfix_avoids_double_separator_after_root_target() {
        let rpbuf = mount_point("\\??\\C:\\Users", "C:\\Users");
        let fixed = apply_rpfix(&rpbuf, &encode_utf16("\\??\\D:\\"));
        let link = parse_link_reparse_point(&fixed).unwrap();
        assert_eq!(link.substitute_name, encode_utf16("\\??\\D:\\Users"));
    }

    #[test]
    fn symlink_round_trip_through_unix_target() {
        let mut table = BlobTable::new();
        let mut inode = Inode::new(false);
        inode_set_symlink(&mut inode, "/usr/share/doc", &mut table).unwrap();
        assert!(inode.is_symlink());
        assert!(inode.attributes.reparse_point());
        assert_eq!(inode_readlink(&inode, None).unwrap(), "/usr/share/doc");

        let mut relative = Inode::new(false);
        inode_set_symlink(&mut relative, "../sibling", &mut table).unwrap();
        assert_eq!(inode_readlink(&relative, None).unwrap(), "../sibling");
    }

    #[test]
    fn readlink_honors_altroot_for_fixed_links() {
        let mut table = BlobTable::new();
        let mut inode = Inode::new(false);
        inode_set_symlink(&mut inode, "/Windows", &mut table).unwrap();
        assert_eq!(
            inode_readlink(&inode, Some("/mnt/extract")).unwrap(),
            "/mnt/extract/Windows"
        );
        // A link captured without fixups keeps its stored target.
        inode.rp_flags |= WIM_RP_FLAG_NOT_FIXED;
        assert_eq!(
            inode_readlink(&inode, Some("/mnt/extract")).unwrap(),
            "/Windows"
        );
    }
}
