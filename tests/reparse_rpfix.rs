//! Reparse point extraction: reconstructing the buffer from the inode and
//! blob, and rewriting absolute targets for the extraction location.

mod common;

use common::{attach, new_root};
use wimcore::blob::BlobTable;
use wimcore::dentry::new_dentry_with_new_inode;
use wimcore::encoding::encode_utf16;
use wimcore::inode::{StreamKind, WIM_RP_FLAG_NOT_FIXED};
use wimcore::reparse::{
    apply_rpfix, inode_get_reparse_point, make_link_reparse_point, parse_link_reparse_point,
    LinkReparsePoint, REPARSE_TAG_MOUNT_POINT,
};

fn junction_to(substitute: &str, print: &str) -> wimcore::reparse::ReparseBuffer {
    make_link_reparse_point(&LinkReparsePoint {
        tag: REPARSE_TAG_MOUNT_POINT,
        rpreserved: 0,
        symlink_flags: 0,
        substitute_name: encode_utf16(substitute),
        print_name: encode_utf16(print),
    })
    .unwrap()
}

#[test_log::test]
fn s4_mount_point_target_is_rewritten_for_the_extraction_volume() {
    let mut table = BlobTable::new();
    let root = new_root();
    let junction = attach(&root, new_dentry_with_new_inode("junction", false));

    // Store the junction the way capture does: reparse data as a blob,
    // header fields on the inode.
    let rpbuf = junction_to("\\??\\C:\\Users\\Public", "C:\\Users\\Public");
    {
        let inode = junction.borrow().inode.clone();
        let mut inode = inode.borrow_mut();
        inode.add_stream_with_data(StreamKind::ReparsePoint, &[], &rpbuf.data, &mut table);
        inode.reparse_tag = REPARSE_TAG_MOUNT_POINT;
        inode.attributes.set_reparse_point(true);
        assert_eq!(inode.rp_flags & WIM_RP_FLAG_NOT_FIXED, 0);
    }

    // Extraction side: materialize the buffer and fix it up for a target
    // volume whose NT path is \??\D:\out.
    let inode = junction.borrow().inode.clone();
    let materialized = inode_get_reparse_point(&inode.borrow()).unwrap();
    assert_eq!(materialized.tag, REPARSE_TAG_MOUNT_POINT);
    assert_eq!(materialized.rpdatalen as usize, rpbuf.data.len());

    let fixed = apply_rpfix(&materialized, &encode_utf16("\\??\\D:\\out"));
    let link = parse_link_reparse_point(&fixed).unwrap();
    assert_eq!(
        link.substitute_name,
        encode_utf16("\\??\\D:\\out\\Users\\Public")
    );
    assert_eq!(link.print_name, encode_utf16("D:\\out\\Users\\Public"));
}

#[test_log::test]
fn rpfix_applied_twice_is_a_fixed_point() {
    let rpbuf = junction_to("\\??\\C:\\ProgramData", "C:\\ProgramData");
    let target = encode_utf16("\\??\\E:\\restore");
    let once = apply_rpfix(&rpbuf, &target);
    let twice = apply_rpfix(&once, &target);
    assert_eq!(once, twice);

    let link = parse_link_reparse_point(&twice).unwrap();
    assert_eq!(
        link.substitute_name,
        encode_utf16("\\??\\E:\\restore\\ProgramData")
    );
}

#[test_log::test]
fn not_fixed_links_are_left_alone_by_readlink_rerooting() {
    let mut table = BlobTable::new();
    let mut inode = wimcore::inode::Inode::new(false);
    wimcore::reparse::inode_set_symlink(&mut inode, "/opt/app", &mut table).unwrap();
    inode.rp_flags |= WIM_RP_FLAG_NOT_FIXED;
    assert_eq!(
        wimcore::reparse::inode_readlink(&inode, Some("/new/root")).unwrap(),
        "/opt/app"
    );
}
