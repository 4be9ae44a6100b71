use omnifs::{Config, OmniFs, Role};

pub fn main() {
    env_logger::init();
    let tmp = tempfile::NamedTempFile::new().expect("Could not create container file.");

    let fs = OmniFs::format(tmp.path(), &Config::default()).expect("should format");
    let index = fs.admin_index().expect("admin is bootstrapped");
    let admin = fs.login(index, "password123").unwrap().session_id;

    let alice_idx = fs
        .user_create(&admin, "alice", "pass_alice", Role::Normal)
        .unwrap();
    let alice = fs.login(alice_idx, "pass_alice").unwrap().session_id;

    fs.file_create(&alice, "/notes.txt", b"hello from alice").unwrap();
    fs.file_edit(&alice, "/notes.txt", b"HELLO", 0).unwrap();
    let data = fs.file_read(&admin, "/users/alice/notes.txt").unwrap();
    println!("{}", String::from_utf8_lossy(&data));

    for entry in fs.dir_list(&admin, "/users").unwrap() {
        println!("{:?} {} ({})", entry.entry_type, entry.name, entry.owner);
    }
    println!("{:#?}", fs.get_stats(&admin).unwrap());
}
