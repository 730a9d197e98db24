mod common;

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use common::Mount;
use lazy_fuser::core::TakeoverData;
use lazy_fuser::protocol::Operation;
use lazy_fuser::types::*;
use lazy_fuser::{RequestChannel, Session};
use tempfile::TempDir;

#[test]
fn test_open_file_survives_takeover() {
    let mut files = vec![("a/b.txt".to_string(), "takeover payload".to_string())];
    for i in 3..10 {
        files.push((format!("a/f{}", i), format!("filler {}", i)));
    }
    let files: Vec<(&str, &str)> = files
        .iter()
        .map(|(path, content)| (path.as_str(), content.as_str()))
        .collect();
    let mount = Mount::new(&files);

    // Numbers follow lookup order: a=2, f3..f9=3..9, b.txt=10
    let a = InodeNumber::from(mount.lookup(ROOT_INODE, "a").nodeid);
    assert_eq!(a.as_raw(), 2);
    for i in 3..10 {
        let entry = mount.lookup(a, &format!("f{}", i));
        assert_eq!(entry.nodeid, i);
    }
    let file = InodeNumber::from(mount.lookup(a, "b.txt").nodeid);
    assert_eq!(file.as_raw(), 10);
    let fh = mount.open(file, OpenFlags::READ_ONLY);

    // The old daemon stops reading and writes its state out
    let backing = mount.backing.clone();
    let overlay = mount.overlay.clone();
    let config = mount.session.config().clone();
    let (channel, kernel, next_unique) = mount.stop_reader();
    let parts = channel.into_takeover().unwrap();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("takeover.json");
    parts.data.write_to(File::create(&path).unwrap()).unwrap();
    let data = TakeoverData::read_from(File::open(&path).unwrap()).unwrap();
    assert_eq!(data, parts.data);

    // The successor resumes on the same connection
    let session = Arc::new(Session::restore(config, backing.clone(), overlay.clone(), &data).unwrap());
    assert_eq!(
        session.inodes().path_of(file).unwrap(),
        Some(PathBuf::from("/a/b.txt"))
    );
    let channel = RequestChannel::resume(parts.transport, session, data.connection);
    let mount = Mount::attach(kernel, backing, overlay, channel, next_unique);

    // The handle the kernel still holds keeps working
    assert_eq!(mount.read(file, fh, 0, 100), b"takeover payload");
    let inode = mount.session.inodes().resolve(file).unwrap();
    assert_eq!(inode.open_count, 1);
    assert_eq!(inode.lookup_count, 1);

    // New numbers continue after the restored ones
    let reply = mount.call(
        a,
        Operation::Create {
            name: "c.txt".into(),
            flags: OpenFlags::READ_WRITE,
            mode: 0o644,
            umask: 0,
        },
    );
    let (created, created_fh) = reply.create(mount.layout).unwrap();
    assert_eq!(created.nodeid, 11);
    mount.release(InodeNumber::from(created.nodeid), created_fh);

    mount.release(file, fh);
    let inode = mount.session.inodes().resolve(file).unwrap();
    assert_eq!(inode.open_count, 0);
    mount.shutdown();
}

#[test]
fn test_restore_rejects_handles_for_missing_inodes() {
    let mount = Mount::new(&[("x.txt", "x")]);
    let file = InodeNumber::from(mount.lookup(ROOT_INODE, "x.txt").nodeid);
    let _fh = mount.open(file, OpenFlags::READ_ONLY);

    let backing = mount.backing.clone();
    let overlay = mount.overlay.clone();
    let config = mount.session.config().clone();
    let (channel, _kernel, _) = mount.stop_reader();
    let mut data = channel.into_takeover().unwrap().data;

    data.inode_map.inodes.retain(|inode| inode.number != file);
    let error = Session::restore(config, backing, overlay, &data)
        .err()
        .unwrap();
    assert_eq!(error.kind(), ErrorKind::InvalidArgument);
}
