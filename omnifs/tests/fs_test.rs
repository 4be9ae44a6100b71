use omnifs::{Config, EntryType, FsError, OmniFs, Role};
use tempfile::NamedTempFile;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn small_config() -> Config {
    Config::default()
        .with_total_size(512 * 1024)
        .with_block_size(1024)
        .with_max_users(8)
}

fn login_admin(fs: &OmniFs) -> String {
    let index = fs.admin_index().expect("admin missing");
    fs.login(index, "password123").unwrap().session_id
}

#[test]
fn can_initialize_and_reopen_container() {
    init_logging();
    let tf = NamedTempFile::new().unwrap();

    // Prepare the container with a filesystem layout.
    let fs = OmniFs::format(tf.path(), &small_config()).unwrap();
    let admin_index = fs.admin_index().unwrap();
    drop(fs);

    // Open it again and verify the layout.
    let fs = OmniFs::mount(tf.path()).unwrap();
    assert_eq!(fs.admin_index(), Some(admin_index));
    assert_eq!(fs.header().max_users, 8);
    assert_eq!(fs.header().block_size, 1024);
}

#[test]
fn unformatted_container_fails_to_open() {
    let tf = NamedTempFile::new().unwrap();
    assert!(matches!(OmniFs::mount(tf.path()), Err(FsError::Io(_))));

    std::fs::write(tf.path(), vec![0u8; 64 * 1024]).unwrap();
    assert!(matches!(OmniFs::mount(tf.path()), Err(FsError::Io(_))));
}

#[test]
fn two_users_and_an_admin() {
    init_logging();
    let tf = NamedTempFile::new().unwrap();
    let fs = OmniFs::format(tf.path(), &Config::default().with_max_users(100)).unwrap();
    let admin = login_admin(&fs);

    let alice_idx = fs
        .user_create(&admin, "alice", "pass_alice", Role::Normal)
        .unwrap();
    let bob_idx = fs.user_create(&admin, "bob", "pass_bob", Role::Normal).unwrap();
    assert_ne!(alice_idx, bob_idx);

    let users = fs.user_list(&admin).unwrap();
    assert_eq!(users.len(), 3);
    assert!(users
        .iter()
        .any(|u| u.index == alice_idx && u.username == "alice" && u.active));
    assert!(users
        .iter()
        .any(|u| u.index == bob_idx && u.username == "bob" && u.active));

    fs.dir_create(&admin, "/shared").unwrap();

    let alice = fs.login(alice_idx, "pass_alice").unwrap().session_id;
    fs.file_create(&alice, "/notes.txt", b"hi").unwrap();

    let meta = fs.get_metadata(&admin, "/users/alice/notes.txt").unwrap();
    assert_eq!(meta.path, "/users/alice/notes.txt");
    assert_eq!(meta.entry.size, 2);
    assert_eq!(meta.entry.owner, "alice");
    assert_eq!(meta.entry.entry_type, EntryType::File);
    assert_eq!(meta.blocks_used, 1);

    let bob = fs.login(bob_idx, "pass_bob").unwrap().session_id;
    assert!(matches!(
        fs.file_read(&bob, "/users/alice/notes.txt"),
        Err(FsError::PermissionDenied)
    ));
    assert_eq!(fs.file_read(&admin, "/users/alice/notes.txt").unwrap(), b"hi");
    assert_eq!(fs.file_read(&alice, "/notes.txt").unwrap(), b"hi");
    assert!(fs.check_invariants());
}

#[test]
fn paths_are_jailed_per_role() {
    let tf = NamedTempFile::new().unwrap();
    let fs = OmniFs::format(tf.path(), &small_config()).unwrap();
    let admin = login_admin(&fs);
    let idx = fs.user_create(&admin, "alice", "pw", Role::Normal).unwrap();
    let alice = fs.login(idx, "pw").unwrap().session_id;

    fs.dir_create(&alice, "/docs").unwrap();
    fs.file_create(&alice, "/docs/a.txt", b"alice").unwrap();
    fs.dir_create(&admin, "/docs").unwrap();
    fs.file_create(&admin, "/docs/a.txt", b"admin").unwrap();

    assert_eq!(
        fs.get_metadata(&admin, "/users/alice/docs/a.txt").unwrap().path,
        "/users/alice/docs/a.txt"
    );
    assert_eq!(fs.get_metadata(&admin, "/docs/a.txt").unwrap().path, "/docs/a.txt");
    assert_eq!(fs.file_read(&alice, "/docs/a.txt").unwrap(), b"alice");
    assert_eq!(fs.file_read(&admin, "/docs/a.txt").unwrap(), b"admin");

    // Alice's listing of "/" is her home.
    let names: Vec<String> = fs
        .dir_list(&alice, "/")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["docs"]);

    // Writing into somebody else's home is refused.
    assert!(matches!(
        fs.file_create(&alice, "/users/admin/x", b"x"),
        Err(FsError::PermissionDenied)
    ));
    assert!(matches!(
        fs.file_create(&alice, "/../x", b"x"),
        Err(FsError::InvalidPath(_))
    ));
}

#[test]
fn round_trip_and_edit() {
    let tf = NamedTempFile::new().unwrap();
    let fs = OmniFs::format(tf.path(), &small_config()).unwrap();
    let admin = login_admin(&fs);

    let original: Vec<u8> = (0..5000u32).map(|i| (i % 97) as u8).collect();
    fs.file_create(&admin, "/data.bin", &original).unwrap();
    assert_eq!(fs.file_read(&admin, "/data.bin").unwrap(), original);

    let patch = vec![0xEE; 1500];
    fs.file_edit(&admin, "/data.bin", &patch, 900).unwrap();

    let mut expected = original.clone();
    expected[900..2400].copy_from_slice(&patch);
    assert_eq!(fs.file_read(&admin, "/data.bin").unwrap(), expected);
    assert_eq!(fs.get_metadata(&admin, "/data.bin").unwrap().entry.size, 5000);
}

#[test]
fn duplicate_create_leaves_tree_unchanged() {
    let tf = NamedTempFile::new().unwrap();
    let fs = OmniFs::format(tf.path(), &small_config()).unwrap();
    let admin = login_admin(&fs);
    let free = fs.free_blocks();

    fs.file_create(&admin, "/a", b"first").unwrap();
    assert!(matches!(
        fs.file_create(&admin, "/a", b"second"),
        Err(FsError::FileExists)
    ));
    assert!(matches!(fs.dir_create(&admin, "/a"), Err(FsError::FileExists)));
    assert_eq!(fs.file_read(&admin, "/a").unwrap(), b"first");
    assert_eq!(fs.free_blocks(), free - 1);
}

#[test]
fn non_empty_directory_survives_delete() {
    let tf = NamedTempFile::new().unwrap();
    let fs = OmniFs::format(tf.path(), &small_config()).unwrap();
    let admin = login_admin(&fs);

    fs.dir_create(&admin, "/d").unwrap();
    fs.file_create(&admin, "/d/f", b"x").unwrap();
    assert!(matches!(
        fs.dir_delete(&admin, "/d"),
        Err(FsError::DirectoryNotEmpty)
    ));
    assert!(fs.file_exists(&admin, "/d/f").unwrap());

    fs.file_delete(&admin, "/d/f").unwrap();
    fs.dir_delete(&admin, "/d").unwrap();
    assert!(!fs.dir_exists(&admin, "/d").unwrap());
    assert!(fs.dir_delete(&admin, "/").is_err());
}

#[test]
fn create_without_space_rolls_back() {
    let tf = NamedTempFile::new().unwrap();
    // Header, a 4 record table and the gap, followed by exactly four blocks.
    let data_offset = 4096 + 4 * 128 + 1024;
    let config = Config::default()
        .with_block_size(512)
        .with_max_users(4)
        .with_total_size(data_offset + 4 * 512);
    let fs = OmniFs::format(tf.path(), &config).unwrap();
    let admin = login_admin(&fs);
    assert_eq!(fs.free_blocks(), 4);

    assert!(matches!(
        fs.file_create(&admin, "/big", &[1; 3000]),
        Err(FsError::NoSpace)
    ));
    assert!(!fs.file_exists(&admin, "/big").unwrap());
    assert_eq!(fs.free_blocks(), 4);

    fs.file_create(&admin, "/fits", &[1; 2048]).unwrap();
    assert_eq!(fs.free_blocks(), 0);
}

#[test]
fn rename_moves_between_directories() {
    let tf = NamedTempFile::new().unwrap();
    let fs = OmniFs::format(tf.path(), &small_config()).unwrap();
    let admin = login_admin(&fs);
    let idx = fs.user_create(&admin, "alice", "pw", Role::Normal).unwrap();
    let alice = fs.login(idx, "pw").unwrap().session_id;

    fs.file_create(&alice, "/notes.txt", b"hello").unwrap();
    fs.dir_create(&alice, "/archive").unwrap();
    fs.file_rename(&alice, "/notes.txt", "/archive/old.txt").unwrap();

    assert!(!fs.file_exists(&alice, "/notes.txt").unwrap());
    assert_eq!(fs.file_read(&alice, "/archive/old.txt").unwrap(), b"hello");

    fs.file_create(&alice, "/other.txt", b"x").unwrap();
    assert!(matches!(
        fs.file_rename(&alice, "/other.txt", "/archive/old.txt"),
        Err(FsError::FileExists)
    ));
    assert!(matches!(
        fs.file_rename(&alice, "/archive", "/archive/inner"),
        Err(FsError::InvalidOperation(_))
    ));
    assert!(fs.check_invariants());
}

#[test]
fn users_persist_across_reopen() {
    let tf = NamedTempFile::new().unwrap();
    let fs = OmniFs::format(tf.path(), &small_config()).unwrap();
    let admin = login_admin(&fs);
    let carol = fs.user_create(&admin, "carol", "pw_carol", Role::Normal).unwrap();
    let dave = fs.user_create(&admin, "dave", "pw_dave", Role::Normal).unwrap();
    fs.user_delete(&admin, dave).unwrap();
    drop(fs);

    let fs = OmniFs::mount(tf.path()).unwrap();
    let admin = login_admin(&fs);
    let session = fs.login(carol, "pw_carol").unwrap();
    assert!(session.user.last_login > 0);
    assert!(matches!(fs.login(carol, "wrong"), Err(FsError::PermissionDenied)));
    assert!(matches!(fs.login(dave, "pw_dave"), Err(FsError::NotFound)));
    assert!(fs.dir_exists(&admin, "/users/carol").unwrap());
    assert_eq!(fs.user_list(&admin).unwrap().len(), 2);
}

#[test]
fn deleted_user_loses_sessions() {
    let tf = NamedTempFile::new().unwrap();
    let fs = OmniFs::format(tf.path(), &small_config()).unwrap();
    let admin = login_admin(&fs);
    let idx = fs.user_create(&admin, "bob", "pw", Role::Normal).unwrap();
    let bob = fs.login(idx, "pw").unwrap().session_id;

    assert!(matches!(fs.user_list(&bob), Err(FsError::PermissionDenied)));
    fs.user_delete(&admin, idx).unwrap();
    assert!(matches!(fs.get_stats(&bob), Err(FsError::InvalidSession)));
    assert!(matches!(
        fs.user_delete(&admin, fs.admin_index().unwrap()),
        Err(FsError::InvalidOperation(_))
    ));

    // The name is free again and the old home is reused.
    let idx = fs.user_create(&admin, "bob", "pw2", Role::Normal).unwrap();
    assert!(fs.login(idx, "pw2").is_ok());
}

#[test]
fn user_table_is_bounded() {
    let tf = NamedTempFile::new().unwrap();
    let fs = OmniFs::format(tf.path(), &small_config().with_max_users(3)).unwrap();
    let admin = login_admin(&fs);

    fs.user_create(&admin, "u1", "pw", Role::Normal).unwrap();
    fs.user_create(&admin, "u2", "pw", Role::Admin).unwrap();
    assert!(matches!(
        fs.user_create(&admin, "u3", "pw", Role::Normal),
        Err(FsError::NoSpace)
    ));
    assert!(matches!(
        fs.user_create(&admin, "u1", "pw", Role::Normal),
        Err(FsError::NoSpace)
    ));
}

#[test]
fn stats_and_logout() {
    let tf = NamedTempFile::new().unwrap();
    let fs = OmniFs::format(tf.path(), &small_config()).unwrap();
    let admin = login_admin(&fs);

    fs.dir_create(&admin, "/d").unwrap();
    fs.file_create(&admin, "/d/f", &[0; 1500]).unwrap();

    let stats = fs.get_stats(&admin).unwrap();
    // users, users/admin and d.
    assert_eq!(stats.total_directories, 3);
    assert_eq!(stats.total_files, 1);
    assert_eq!(stats.used_space, 1500);
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.free_space, fs.free_blocks() as u64 * 1024);
    assert!(stats.fragmentation > 0.0);

    fs.logout(&admin).unwrap();
    assert!(matches!(fs.logout(&admin), Err(FsError::InvalidSession)));
    assert!(matches!(fs.get_stats(&admin), Err(FsError::InvalidSession)));
}

#[test]
fn disabled_auth_skips_password_check() {
    let tf = NamedTempFile::new().unwrap();
    let mut config = small_config();
    config.security.require_auth = false;
    let fs = OmniFs::format(tf.path(), &config).unwrap();

    let index = fs.admin_index().unwrap();
    assert!(fs.login(index, "anything").is_ok());
    assert!(matches!(fs.login(1, "anything"), Err(FsError::NotFound)));
}

#[test]
fn home_directories_cannot_be_removed_or_moved() {
    let tf = NamedTempFile::new().unwrap();
    let fs = OmniFs::format(tf.path(), &small_config()).unwrap();
    let admin = login_admin(&fs);
    let idx = fs.user_create(&admin, "alice", "pw", Role::Normal).unwrap();
    let alice = fs.login(idx, "pw").unwrap().session_id;

    // Alice's "/" is her home.
    assert!(matches!(
        fs.dir_delete(&alice, "/"),
        Err(FsError::InvalidOperation(_))
    ));
    assert!(matches!(
        fs.file_rename(&alice, "/", "/elsewhere"),
        Err(FsError::InvalidOperation(_))
    ));
    assert!(matches!(
        fs.dir_delete(&admin, "/users/alice"),
        Err(FsError::InvalidOperation(_))
    ));
    assert!(matches!(
        fs.file_rename(&admin, "/users", "/people"),
        Err(FsError::InvalidOperation(_))
    ));
    assert!(fs.dir_exists(&admin, "/users/alice").unwrap());

    fs.file_create(&alice, "/notes.txt", b"still here").unwrap();
    assert_eq!(fs.file_read(&alice, "/notes.txt").unwrap(), b"still here");

    // Once alice is gone her old home is an ordinary directory.
    fs.file_delete(&alice, "/notes.txt").unwrap();
    fs.user_delete(&admin, idx).unwrap();
    fs.dir_delete(&admin, "/users/alice").unwrap();
}

#[test]
fn failed_home_directory_rolls_back_user() {
    let tf = NamedTempFile::new().unwrap();
    let fs = OmniFs::format(tf.path(), &small_config()).unwrap();
    let admin = login_admin(&fs);

    // A file squats on carol's home directory name.
    fs.file_create(&admin, "/users/carol", b"x").unwrap();
    assert!(matches!(
        fs.user_create(&admin, "carol", "pw", Role::Normal),
        Err(FsError::Io(_))
    ));

    let users = fs.user_list(&admin).unwrap();
    assert_eq!(users.len(), 1);
    assert!(users.iter().all(|u| u.username != "carol"));
    assert!(fs.file_exists(&admin, "/users/carol").unwrap());

    assert!(matches!(
        fs.user_create(&admin, "..", "pw", Role::Normal),
        Err(FsError::InvalidOperation(_))
    ));
}
