//! Per-image metadata containers and the archive-level operations over
//! them: selection and lazy loading, updates, export, iteration.

use std::cell::RefCell;
use std::rc::Rc;

use crate::blob::{BlobDescriptor, BlobLocation, BlobRef, BlobTable, Sha1Hash};
use crate::dentry::{
    children_in_order, free_dentry_tree, lookup_path, new_filler_directory, DentryRef,
};
use crate::encoding::CaseSensitivity;
use crate::error::Error;
use crate::inode::InodeRef;
use crate::journal::{execute_update_commands, UpdateCommand};
use crate::metadata::{prepare_metadata_resource, read_metadata_resource, SecurityData};
use crate::Result;

/// Cap on the number of images in one archive, standing in for the image
/// count kept in the archive's XML document.
pub const MAX_IMAGES: usize = 65535;

pub type ImageMetadataRef = Rc<RefCell<ImageMetadata>>;

/// The in-memory state of one image: its directory tree and the image-level
/// bookkeeping around it.
///
/// A clean image is loaded from its metadata resource on demand when
/// selected, and may be unloaded again while clean and unselected. A dirty
/// image (scratch metadata blob) stays loaded.
pub struct ImageMetadata {
    /// Root of the tree, or `None` for a completely empty image.
    pub root_dentry: Option<DentryRef>,
    /// `None` while the image is not loaded.
    pub security_data: Option<SecurityData>,
    /// Descriptor for the image's serialized metadata resource. A scratch
    /// (`NoData`) descriptor marks the image dirty.
    pub metadata_blob: BlobRef,
    pub inode_list: Vec<InodeRef>,
    /// Blobs referenced by this image whose digests are not yet computed.
    pub unhashed_blobs: Vec<BlobRef>,
    /// Number of archives referencing this image; > 1 after an export.
    pub refcnt: u32,
    /// Number of archives that currently have this image selected.
    pub selected_refcnt: u32,
    pub stats_outdated: bool,
}

impl ImageMetadata {
    /// A new scratch image: loaded, empty, dirty.
    pub fn new_empty() -> Self {
        let mut blob = BlobDescriptor::new(Sha1Hash::ZERO);
        blob.is_metadata = true;
        Self {
            root_dentry: None,
            security_data: Some(SecurityData::new()),
            metadata_blob: Rc::new(RefCell::new(blob)),
            inode_list: Vec::new(),
            unhashed_blobs: Vec::new(),
            refcnt: 1,
            selected_refcnt: 0,
            stats_outdated: false,
        }
    }

    /// An image backed by a serialized metadata resource, loaded lazily on
    /// first selection.
    pub fn from_metadata_buffer(buf: Vec<u8>) -> Self {
        let mut blob = BlobDescriptor::new(Sha1Hash::of(&buf));
        blob.is_metadata = true;
        blob.size = buf.len() as u64;
        blob.location = BlobLocation::InAttachedBuffer(buf);
        Self {
            root_dentry: None,
            security_data: None,
            metadata_blob: Rc::new(RefCell::new(blob)),
            inode_list: Vec::new(),
            unhashed_blobs: Vec::new(),
            refcnt: 1,
            selected_refcnt: 0,
            stats_outdated: false,
        }
    }

    /// Dirty means not backed by stored metadata; never auto-unloaded.
    pub fn is_dirty(&self) -> bool {
        matches!(self.metadata_blob.borrow().location, BlobLocation::NoData)
    }

    /// `security_data` rather than `root_dentry` decides, since an empty
    /// image has no root while loaded.
    pub fn is_loaded(&self) -> bool {
        self.security_data.is_some()
    }

    pub fn can_unload(&self) -> bool {
        self.selected_refcnt == 0 && !self.is_dirty()
    }

    /// Note a tree change: the stored metadata no longer matches.
    pub fn mark_dirty(&mut self) {
        self.metadata_blob.borrow_mut().release_location();
        self.stats_outdated = true;
    }

    fn load(&mut self) -> Result<()> {
        let (buf, expected_hash) = {
            let blob = self.metadata_blob.borrow();
            (blob.read_data()?, blob.hash())
        };
        if Sha1Hash::of(&buf) != expected_hash {
            log::error!("Metadata resource is corrupted (invalid SHA-1 message digest)!");
            return Err(Error::InvalidMetadataResource("checksum mismatch"));
        }
        let decoded = read_metadata_resource(&buf)?;
        self.root_dentry = decoded.root;
        self.security_data = Some(decoded.security_data);
        self.inode_list = decoded.inodes;
        self.unhashed_blobs = Vec::new();
        Ok(())
    }

    fn unload(&mut self) {
        if let Some(root) = self.root_dentry.take() {
            free_dentry_tree(&root, None);
        }
        self.security_data = None;
        self.inode_list.clear();
    }
}

/// Flags for [`Wim::iterate_dir_tree`].
#[derive(Debug, Clone, Copy, Default)]
pub struct IterateFlags {
    /// Recurse into subdirectories.
    pub recursive: bool,
    /// Iterate over the children of the path instead of the path itself.
    pub children: bool,
}

/// An open archive, reduced to the parts the core owns: a blob table and
/// the per-image metadata.
#[derive(Default)]
pub struct Wim {
    pub blob_table: BlobTable,
    images: Vec<ImageMetadataRef>,
    current_image: Option<usize>,
}

impl Wim {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    fn image_ref(&self, image: usize) -> Result<ImageMetadataRef> {
        if image == 0 || image > self.images.len() {
            return Err(Error::InvalidImage(image));
        }
        Ok(self.images[image - 1].clone())
    }

    pub fn image(&self, image: usize) -> Result<ImageMetadataRef> {
        self.image_ref(image)
    }

    fn append_image(&mut self, imd: ImageMetadataRef) -> Result<usize> {
        if self.images.len() >= MAX_IMAGES {
            return Err(Error::ImageCountOverflow);
        }
        self.images.push(imd);
        Ok(self.images.len())
    }

    /// Append a new, empty, scratch image. Returns its 1-based index.
    pub fn add_empty_image(&mut self) -> Result<usize> {
        self.append_image(Rc::new(RefCell::new(ImageMetadata::new_empty())))
    }

    /// Append an image backed by a serialized metadata resource.
    pub fn add_image_from_buffer(&mut self, buf: Vec<u8>) -> Result<usize> {
        self.append_image(Rc::new(RefCell::new(ImageMetadata::from_metadata_buffer(
            buf,
        ))))
    }

    pub fn current_image(&self) -> Option<usize> {
        self.current_image.map(|index| index + 1)
    }

    /// Select an image, loading its metadata resource if needed. The
    /// previously selected image may be unloaded if clean and unselected.
    pub fn select_image(&mut self, image: usize) -> Result<()> {
        if self.current_image == Some(image.wrapping_sub(1)) {
            return Ok(());
        }
        let imd = self.image_ref(image)?;
        if !imd.borrow().is_loaded() {
            imd.borrow_mut().load()?;
        }
        self.deselect_current();
        self.current_image = Some(image - 1);
        imd.borrow_mut().selected_refcnt += 1;
        Ok(())
    }

    /// Deselect the current image, unloading it when permitted.
    pub fn deselect_current(&mut self) {
        if let Some(index) = self.current_image.take() {
            let imd = self.images[index].clone();
            let mut imd = imd.borrow_mut();
            imd.selected_refcnt -= 1;
            if imd.can_unload() {
                imd.unload();
            }
        }
    }

    pub fn current_metadata(&self) -> Result<ImageMetadataRef> {
        self.current_image
            .map(|index| self.images[index].clone())
            .ok_or(Error::InvalidImage(0))
    }

    pub fn current_root(&self) -> Result<Option<DentryRef>> {
        Ok(self.current_metadata()?.borrow().root_dentry.clone())
    }

    /// Drop an image from the archive. The metadata is torn down only when
    /// no other archive still references it.
    pub fn delete_image(&mut self, image: usize) -> Result<()> {
        let imd = self.image_ref(image)?;
        if let Some(current) = self.current_image {
            if current == image - 1 {
                self.deselect_current();
            } else if current > image - 1 {
                self.current_image = Some(current - 1);
            }
        }
        self.images.remove(image - 1);

        let mut imd_mut = imd.borrow_mut();
        imd_mut.refcnt -= 1;
        if imd_mut.refcnt == 0 {
            if let Some(root) = imd_mut.root_dentry.take() {
                free_dentry_tree(&root, Some(&mut self.blob_table));
            }
            imd_mut.security_data = None;
            imd_mut.inode_list.clear();
            imd_mut.unhashed_blobs.clear();
        }
        Ok(())
    }

    /// Run a batch of update commands against the currently selected image.
    pub fn update_image(&mut self, commands: Vec<UpdateCommand>, atomic: bool) -> Result<()> {
        let imd = self.current_metadata()?;
        let mut imd = imd.borrow_mut();
        let mut root = imd.root_dentry.take();
        let result = execute_update_commands(&mut root, &mut self.blob_table, commands, atomic);
        imd.root_dentry = root;
        match &result {
            Ok(()) => imd.mark_dirty(),
            Err(_) if !atomic => {
                // Earlier commands of the batch stuck; the tree changed.
                imd.mark_dirty();
            }
            Err(_) => {}
        }
        imd.inode_list = collect_inodes(&imd.root_dentry);
        result
    }

    /// Serialize the selected image's metadata resource and re-point its
    /// metadata blob at the result.
    pub fn write_metadata_resource(&mut self, image: usize) -> Result<Vec<u8>> {
        self.select_image(image)?;
        let imd = self.current_metadata()?;
        let mut imd = imd.borrow_mut();
        if imd.root_dentry.is_none() {
            // An empty image still serializes with a dummy root directory.
            imd.root_dentry = Some(new_filler_directory());
        }
        let security_data = imd.security_data.clone().unwrap_or_default();
        let root = imd.root_dentry.clone().ok_or(Error::InvalidParameter("no root"))?;
        let buf = prepare_metadata_resource(&security_data, &root)?;

        let mut blob = imd.metadata_blob.borrow_mut();
        blob.set_hashed(Sha1Hash::of(&buf));
        blob.size = buf.len() as u64;
        blob.location = BlobLocation::InAttachedBuffer(buf.clone());
        drop(blob);
        imd.stats_outdated = false;
        Ok(buf)
    }

    /// Compute the digests of any unhashed blobs in the selected image,
    /// joining duplicates already present in the blob table.
    pub fn checksum_unhashed_blobs(&mut self) -> Result<()> {
        let imd = self.current_metadata()?;
        let unhashed = std::mem::take(&mut imd.borrow_mut().unhashed_blobs);
        for blob in unhashed {
            let (data, provenance) = {
                let b = blob.borrow();
                if !b.unhashed {
                    continue;
                }
                (b.read_data()?, b.provenance.as_ref().map(|p| (p.back_inode.clone(), p.back_stream_id)))
            };
            let hash = Sha1Hash::of(&data);
            match self.blob_table.lookup(&hash) {
                Some(existing) => {
                    // Join with the duplicate: move the reference over.
                    let refs = blob.borrow().refcnt;
                    existing.borrow_mut().refcnt += refs;
                    if let Some((back_inode, stream_id)) = provenance {
                        if let Some(inode) = back_inode.upgrade() {
                            let mut inode = inode.borrow_mut();
                            for stream in inode.streams_mut() {
                                if stream.stream_id() == stream_id {
                                    stream.set_blob(Some(existing.clone()));
                                }
                            }
                        }
                    }
                }
                None => {
                    blob.borrow_mut().set_hashed(hash);
                    self.blob_table.insert(blob);
                }
            }
        }
        Ok(())
    }

    /// Iterate over the dentries at `path` in the selected image.
    pub fn iterate_dir_tree(
        &mut self,
        path: &str,
        flags: IterateFlags,
        callback: &mut dyn FnMut(&DentryRef) -> Result<()>,
    ) -> Result<()> {
        let root = self
            .current_root()?
            .ok_or_else(|| Error::PathDoesNotExist(path.to_string()))?;
        let dentry = lookup_path(&root, path, CaseSensitivity::Default)?;

        fn visit(
            dentry: &DentryRef,
            recursive: bool,
            callback: &mut dyn FnMut(&DentryRef) -> Result<()>,
        ) -> Result<()> {
            callback(dentry)?;
            if recursive {
                for child in children_in_order(dentry) {
                    visit(&child, recursive, callback)?;
                }
            }
            Ok(())
        }

        if flags.children {
            for child in children_in_order(&dentry) {
                visit(&child, flags.recursive, callback)?;
            }
            Ok(())
        } else {
            visit(&dentry, flags.recursive, callback)
        }
    }
}

fn collect_inodes(root: &Option<DentryRef>) -> Vec<InodeRef> {
    let mut inodes: Vec<InodeRef> = Vec::new();
    if let Some(root) = root {
        let _ = crate::dentry::for_dentry_in_tree(root, &mut |dentry| {
            let inode = dentry.borrow().inode.clone();
            if !inodes.iter().any(|known| Rc::ptr_eq(known, &inode)) {
                inodes.push(inode);
            }
            Ok(())
        });
    }
    inodes
}

/// Export an image from one archive into another. The image metadata is
/// shared; the blob descriptors its streams reference are cloned into the
/// destination blob table. A failure rolls the destination table back.
pub fn export_image(src: &mut Wim, src_image: usize, dest: &mut Wim) -> Result<()> {
    let imd = src.image_ref(src_image)?;

    // A single archive cannot hold the same image twice.
    if dest.images.iter().any(|other| Rc::ptr_eq(other, &imd)) {
        return Err(Error::InvalidParameter(
            "image was already exported into the destination archive",
        ));
    }
    if dest.images.len() >= MAX_IMAGES {
        return Err(Error::ImageCountOverflow);
    }

    // Blob digests must be known before references can cross archives.
    src.select_image(src_image)?;
    src.checksum_unhashed_blobs()?;

    // Reset rollback state in the destination table.
    for blob in dest.blob_table.iter() {
        let mut blob = blob.borrow_mut();
        blob.out_refcnt = 0;
        blob.was_exported = false;
    }

    let result = (|| -> Result<()> {
        for inode in &imd.borrow().inode_list {
            let inode = inode.borrow();
            let nlink = inode.nlink().max(1);
            for stream in inode.streams() {
                let hash = stream.hash();
                if hash.is_zero() {
                    continue;
                }
                let dest_blob = match dest.blob_table.lookup(&hash) {
                    Some(blob) => blob,
                    None => {
                        let src_blob = src
                            .blob_table
                            .lookup(&hash)
                            .ok_or(Error::BlobNotFound(hash))?;
                        let clone = Rc::new(RefCell::new(src_blob.borrow().clone_for_export()));
                        dest.blob_table.insert(clone.clone());
                        clone
                    }
                };
                let mut dest_blob = dest_blob.borrow_mut();
                dest_blob.refcnt += nlink;
                dest_blob.out_refcnt += nlink;
            }
        }
        Ok(())
    })();

    if let Err(err) = result {
        // Undo the references this export added.
        let mut to_remove = Vec::new();
        for blob in dest.blob_table.iter() {
            let mut b = blob.borrow_mut();
            b.refcnt -= b.out_refcnt;
            b.out_refcnt = 0;
            if b.was_exported {
                to_remove.push(b.hash());
            }
        }
        for hash in to_remove {
            dest.blob_table.remove(&hash);
        }
        return Err(err);
    }

    for blob in dest.blob_table.iter() {
        blob.borrow_mut().out_refcnt = 0;
    }
    imd.borrow_mut().refcnt += 1;
    dest.images.push(imd);
    Ok(())
}
