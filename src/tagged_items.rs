//! Tagged metadata items: typed, variable-length annotations carried in the
//! trailing bytes of a dentry record (object IDs, UNIX metadata, extended
//! attributes).

use std::io::Cursor;

use binrw::prelude::*;

use crate::error::Error;
use crate::inode::Inode;
use crate::Result;

/// Object ID, as used by the NTFS object id index.
pub const TAG_OBJECT_ID: u32 = 0x00000001;
/// Extended attributes, preferred format (shared with WIMGAPI/DISM).
pub const TAG_XATTRS: u32 = 0x00000002;
/// Standard UNIX uid/gid/mode/rdev.
pub const TAG_UNIX_DATA: u32 = 0x337DD873;
/// Deprecated alignment-based extended attribute format.
pub const TAG_LINUX_XATTRS_LEGACY: u32 = 0x337DD874;

pub const XATTR_NAME_MAX: usize = 255;
pub const XATTR_SIZE_MAX: usize = 65535;

const ITEM_HEADER_SIZE: usize = 8;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// The raw item buffer. Items are kept in their serialized form so unknown
/// tags survive a round trip untouched.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TaggedItems {
    data: Vec<u8>,
}

impl TaggedItems {
    pub fn from_raw(data: Vec<u8>) -> Self {
        debug_assert!(data.len() % 8 == 0);
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Find the first item tagged `tag` holding at least `min_len` bytes of
    /// data. Returns the item's payload.
    pub fn get(&self, tag: u32, min_len: usize) -> Option<&[u8]> {
        let mut remaining = &self.data[..];
        while remaining.len() >= ITEM_HEADER_SIZE + min_len {
            let item_tag = u32::from_le_bytes(remaining[0..4].try_into().ok()?);
            let len = u32::from_le_bytes(remaining[4..8].try_into().ok()?) as usize;
            let full_len = ITEM_HEADER_SIZE + align8(len);
            if full_len < len || full_len > remaining.len() {
                // Length overflow; the item list is corrupted.
                return None;
            }
            if item_tag == tag && len >= min_len {
                return Some(&remaining[ITEM_HEADER_SIZE..ITEM_HEADER_SIZE + len]);
            }
            remaining = &remaining[full_len..];
        }
        None
    }

    /// Remove every item with the given tag.
    pub fn remove(&mut self, tag: u32) {
        let mut out = Vec::with_capacity(self.data.len());
        let mut remaining = &self.data[..];
        while remaining.len() >= ITEM_HEADER_SIZE {
            let item_tag = u32::from_le_bytes(remaining[0..4].try_into().unwrap());
            let len = u32::from_le_bytes(remaining[4..8].try_into().unwrap()) as usize;
            let full_len = ITEM_HEADER_SIZE + align8(len);
            if full_len < len || full_len > remaining.len() {
                break;
            }
            if item_tag != tag {
                out.extend_from_slice(&remaining[..full_len]);
            }
            remaining = &remaining[full_len..];
        }
        self.data = out;
    }

    /// Replace all items with the given tag by one item holding `payload`.
    pub fn set(&mut self, tag: u32, payload: &[u8]) {
        self.remove(tag);
        self.data.extend_from_slice(&tag.to_le_bytes());
        self.data
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.data.extend_from_slice(payload);
        self.data.resize(align8(self.data.len()), 0);
    }
}

impl std::fmt::Debug for TaggedItems {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaggedItems({} bytes)", self.data.len())
    }
}

/// Standard UNIX file metadata, stored as four little-endian u32s.
#[binrw::binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnixData {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rdev: u32,
}

const UNIX_DATA_SIZE: usize = 16;
const OBJECT_ID_SIZE: usize = 16;

/// One extended attribute in the preferred on-disk format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XattrEntry {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    pub flags: u8,
}

/// Parse a buffer of xattr entries (u16 value_len, u8 name_len, u8 flags,
/// NUL-terminated name, raw value, no inter-entry padding).
pub fn parse_xattrs(mut buf: &[u8]) -> Result<Vec<XattrEntry>> {
    let mut entries = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 4 {
            return Err(Error::InvalidXattr);
        }
        let value_len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        let name_len = buf[2] as usize;
        let flags = buf[3];
        let entry_size = 4 + name_len + 1 + value_len;
        if name_len == 0 || buf.len() < entry_size {
            return Err(Error::InvalidXattr);
        }
        let name = &buf[4..4 + name_len];
        if name.contains(&0) || buf[4 + name_len] != 0 {
            return Err(Error::InvalidXattr);
        }
        let value = &buf[4 + name_len + 1..entry_size];
        entries.push(XattrEntry {
            name: name.to_vec(),
            value: value.to_vec(),
            flags,
        });
        buf = &buf[entry_size..];
    }
    Ok(entries)
}

pub fn build_xattrs(entries: &[XattrEntry]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for entry in entries {
        if entry.name.is_empty()
            || entry.name.len() > XATTR_NAME_MAX
            || entry.name.contains(&0)
            || entry.value.len() > XATTR_SIZE_MAX
        {
            return Err(Error::InvalidXattr);
        }
        out.extend_from_slice(&(entry.value.len() as u16).to_le_bytes());
        out.push(entry.name.len() as u8);
        out.push(entry.flags);
        out.extend_from_slice(&entry.name);
        out.push(0);
        out.extend_from_slice(&entry.value);
    }
    Ok(out)
}

impl Inode {
    pub fn get_tagged_item(&self, tag: u32, min_len: usize) -> Option<&[u8]> {
        self.extra.as_ref()?.get(tag, min_len)
    }

    pub fn set_tagged_item(&mut self, tag: u32, payload: &[u8]) {
        self.extra
            .get_or_insert_with(TaggedItems::default)
            .set(tag, payload);
    }

    pub fn unix_data(&self) -> Option<UnixData> {
        let raw = self.get_tagged_item(TAG_UNIX_DATA, UNIX_DATA_SIZE)?;
        UnixData::read(&mut Cursor::new(raw)).ok()
    }

    pub fn set_unix_data(&mut self, unix_data: UnixData) {
        let mut raw = Cursor::new(Vec::with_capacity(UNIX_DATA_SIZE));
        // Writing four u32s to a Vec cannot fail.
        unix_data.write(&mut raw).unwrap();
        self.set_tagged_item(TAG_UNIX_DATA, &raw.into_inner());
    }

    pub fn has_unix_data(&self) -> bool {
        self.get_tagged_item(TAG_UNIX_DATA, UNIX_DATA_SIZE).is_some()
    }

    pub fn object_id(&self) -> Option<&[u8]> {
        self.get_tagged_item(TAG_OBJECT_ID, OBJECT_ID_SIZE)
    }

    pub fn set_object_id(&mut self, object_id: &[u8]) {
        self.set_tagged_item(TAG_OBJECT_ID, object_id);
    }

    pub fn has_object_id(&self) -> bool {
        self.object_id().is_some()
    }

    pub fn xattrs(&self) -> Option<Result<Vec<XattrEntry>>> {
        self.get_tagged_item(TAG_XATTRS, 0).map(parse_xattrs)
    }

    pub fn set_xattrs(&mut self, entries: &[XattrEntry]) -> Result<()> {
        let raw = build_xattrs(entries)?;
        self.set_tagged_item(TAG_XATTRS, &raw);
        Ok(())
    }

    pub fn has_xattrs(&self) -> bool {
        self.get_tagged_item(TAG_XATTRS, 0).is_some()
            || self.get_tagged_item(TAG_LINUX_XATTRS_LEGACY, 0).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_and_pads_to_eight() {
        let mut items = TaggedItems::default();
        items.set(TAG_OBJECT_ID, &[1; 16]);
        items.set(TAG_UNIX_DATA, &[2; 16]);
        items.set(TAG_OBJECT_ID, &[3; 16]);
        assert_eq!(items.as_bytes().len(), 2 * (8 + 16));
        assert_eq!(items.get(TAG_OBJECT_ID, 16), Some(&[3u8; 16][..]));
        assert_eq!(items.get(TAG_UNIX_DATA, 16), Some(&[2u8; 16][..]));
        assert_eq!(items.get(TAG_XATTRS, 0), None);
    }

    #[test]
    fn get_honors_min_len() {
        let mut items = TaggedItems::default();
        items.set(TAG_OBJECT_ID, &[0; 4]);
        assert!(items.get(TAG_OBJECT_ID, 16).is_none());
        assert!(items.get(TAG_OBJECT_ID, 4).is_some());
    }

    #[test]
    fn unix_data_round_trip() {
        let mut inode = Inode::new(false);
        let unix_data = UnixData {
            uid: 1000,
            gid: 100,
            mode: 0o100644,
            rdev: 0,
        };
        inode.set_unix_data(unix_data);
        assert!(inode.has_unix_data());
        assert_eq!(inode.unix_data(), Some(unix_data));
    }

    #[test]
    fn xattr_entries_round_trip() {
        let entries = vec![
            XattrEntry {
                name: b"user.comment".to_vec(),
                value: b"hello".to_vec(),
                flags: 0,
            },
            XattrEntry {
                name: b"security.selinux".to_vec(),
                value: b"system_u:object_r:etc_t".to_vec(),
                flags: 0,
            },
        ];
        let raw = build_xattrs(&entries).unwrap();
        assert_eq!(parse_xattrs(&raw).unwrap(), entries);
    }

    #[test]
    fn xattr_rejects_embedded_nul_and_truncation() {
        assert!(build_xattrs(&[XattrEntry {
            name: b"bad\0name".to_vec(),
            value: Vec::new(),
            flags: 0,
        }])
        .is_err());

        let raw = build_xattrs(&[XattrEntry {
            name: b"user.a".to_vec(),
            value: b"v".to_vec(),
            flags: 0,
        }])
        .unwrap();
        assert!(parse_xattrs(&raw[..raw.len() - 1]).is_err());
    }
}
