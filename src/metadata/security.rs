//! The security data block at the head of a metadata resource: a table of
//! self-relative security descriptors, referenced by index from inodes.

use crate::error::Error;
use crate::Result;

/// The image's security descriptor table. Descriptors are opaque blobs to
/// the core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityData {
    pub descriptors: Vec<Vec<u8>>,
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

impl SecurityData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_entries(&self) -> u32 {
        self.descriptors.len() as u32
    }

    /// Serialized length: `u32 total_length + u32 num_entries + u64 sizes +
    /// descriptors`, rounded up to 8 bytes. Never less than 8.
    pub fn total_length(&self) -> usize {
        let len = 8
            + self.descriptors.len() * 8
            + self
                .descriptors
                .iter()
                .map(|descriptor| descriptor.len())
                .sum::<usize>();
        align8(len)
    }

    /// Parse the security data from the start of a metadata resource.
    /// Returns the table and the offset of the first byte after it (which is
    /// where the root dentry record lives).
    pub fn read(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 8 {
            return Err(Error::InvalidMetadataResource(
                "buffer too small for security data header",
            ));
        }
        let total_length = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let num_entries = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;

        // A zero total length means "no entries"; the 8-byte header is
        // implicit and the dentry tree starts right after it.
        if total_length == 0 {
            if num_entries != 0 {
                return Err(Error::InvalidMetadataResource(
                    "security data has entries but no length",
                ));
            }
            return Ok((Self::new(), 8));
        }

        let total_length = align8(total_length);
        if total_length > buf.len() {
            return Err(Error::InvalidMetadataResource(
                "security data overruns the metadata resource",
            ));
        }
        let sizes_end = 8usize
            .checked_add(num_entries.checked_mul(8).ok_or(
                Error::InvalidMetadataResource("security entry count overflows"),
            )?)
            .ok_or(Error::InvalidMetadataResource(
                "security entry count overflows",
            ))?;
        if sizes_end > total_length {
            return Err(Error::InvalidMetadataResource(
                "security data sizes overrun their block",
            ));
        }

        let mut descriptors = Vec::with_capacity(num_entries);
        let mut offset = sizes_end;
        for i in 0..num_entries {
            let size_pos = 8 + i * 8;
            let size = u64::from_le_bytes(buf[size_pos..size_pos + 8].try_into().unwrap());
            let size = usize::try_from(size).map_err(|_| {
                Error::InvalidMetadataResource("security descriptor size overflows")
            })?;
            let end = offset.checked_add(size).ok_or(Error::InvalidMetadataResource(
                "security descriptor size overflows",
            ))?;
            if end > total_length {
                return Err(Error::InvalidMetadataResource(
                    "security descriptor overruns its block",
                ));
            }
            descriptors.push(buf[offset..end].to_vec());
            offset = end;
        }

        Ok((Self { descriptors }, total_length))
    }

    /// Serialize the table, 8-byte padded.
    pub fn write(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&(self.total_length() as u32).to_le_bytes());
        out.extend_from_slice(&self.num_entries().to_le_bytes());
        for descriptor in &self.descriptors {
            out.extend_from_slice(&(descriptor.len() as u64).to_le_bytes());
        }
        for descriptor in &self.descriptors {
            out.extend_from_slice(descriptor);
        }
        out.resize(start + self.total_length(), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_is_eight_bytes() {
        let sd = SecurityData::new();
        assert_eq!(sd.total_length(), 8);
        let mut out = Vec::new();
        sd.write(&mut out);
        assert_eq!(out, vec![8, 0, 0, 0, 0, 0, 0, 0]);
        let (parsed, consumed) = SecurityData::read(&out).unwrap();
        assert_eq!(parsed, sd);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn zero_total_length_means_implicit_header() {
        let buf = [0u8; 16];
        let (parsed, consumed) = SecurityData::read(&buf).unwrap();
        assert!(parsed.descriptors.is_empty());
        assert_eq!(consumed, 8);
    }

    #[test]
    fn round_trip_with_descriptors() {
        let sd = SecurityData {
            descriptors: vec![vec![1, 2, 3], vec![4; 20]],
        };
        let mut out = Vec::new();
        sd.write(&mut out);
        assert_eq!(out.len() % 8, 0);
        assert_eq!(out.len(), sd.total_length());
        let (parsed, consumed) = SecurityData::read(&out).unwrap();
        assert_eq!(parsed, sd);
        assert_eq!(consumed, out.len());
    }

    #[test]
    fn truncated_descriptor_is_rejected() {
        let sd = SecurityData {
            descriptors: vec![vec![7; 64]],
        };
        let mut out = Vec::new();
        sd.write(&mut out);
        // Claim a longer descriptor than the block holds.
        out[8] = 0xFF;
        assert!(SecurityData::read(&out).is_err());
    }
}
