use sitepack_core::archive::{extract, pack, ArchiveType, ContainerEntry};
use sitepack_core::bucket::MemoryBucket;
use sitepack_core::path_safety::PathPolicy;
use sitepack_core::zip::ZipWriter;
use std::fs::{self, File};

fn archive_with(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    let p = dir.join("site.tar");
    let entries = vec![ContainerEntry { payload: MemoryBucket::shared(b"hello".to_vec()), name: name.into() }];
    pack(&entries, ArchiveType::Tar, File::create(&p).unwrap()).unwrap();
    p
}

#[cfg(target_family = "unix")]
#[test]
fn extract_rejects_symlink_by_default_allows_with_flag_when_contained() {
    let tmp = tempfile::tempdir().unwrap();
    let archive = archive_with(tmp.path(), "safe/file.txt");
    let dest = tmp.path().join("dest");
    fs::create_dir_all(dest.join("target")).unwrap();
    std::os::unix::fs::symlink(dest.join("target"), dest.join("safe")).unwrap();

    let err = extract(&archive, ArchiveType::Tar, &dest, PathPolicy::default()).unwrap_err();
    assert!(format!("{:#}", err).contains("symlink"), "unexpected error: {:#}", err);

    let policy = PathPolicy { follow_symlinks: true };
    extract(&archive, ArchiveType::Tar, &dest, policy).unwrap();
    assert_eq!(fs::read(dest.join("target/file.txt")).unwrap(), b"hello");
}

#[cfg(target_family = "unix")]
#[test]
fn followed_symlink_may_not_leave_destination() {
    let tmp = tempfile::tempdir().unwrap();
    let archive = archive_with(tmp.path(), "out/file.txt");
    let dest = tmp.path().join("dest");
    let outside = tmp.path().join("outside");
    fs::create_dir_all(&dest).unwrap();
    fs::create_dir_all(&outside).unwrap();
    std::os::unix::fs::symlink(&outside, dest.join("out")).unwrap();

    let err = extract(&archive, ArchiveType::Tar, &dest, PathPolicy { follow_symlinks: true }).unwrap_err();
    assert!(format!("{:#}", err).contains("escapes root"), "unexpected error: {:#}", err);
    assert!(!outside.join("file.txt").exists());
}

#[test]
fn extract_rejects_traversal_names() {
    let tmp = tempfile::tempdir().unwrap();
    for bad in ["../evil.txt", "/abs.txt", "a//b.txt"] {
        let p = tmp.path().join("bad.zip");
        let mut zw = ZipWriter::new(File::create(&p).unwrap());
        zw.append(bad, &mut &b"x"[..]).unwrap();
        zw.finish().unwrap();
        let dest = tmp.path().join("dest");
        assert!(extract(&p, ArchiveType::Zip, &dest, PathPolicy::default()).is_err(), "{bad} accepted");
    }
    assert!(!tmp.path().join("evil.txt").exists());
}
