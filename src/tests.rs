// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Integration tests: the full client (worker thread included) against an
//! in-process 9P2000 server on a real TCP socket.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::{Read as _, Write as _};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::message::Reader;
use crate::{Client, Config, DirEntry, FileKind, OpenFlags, WalkKind};

// ---------------------------------------------------------------------------
// In-process 9P2000 server
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

impl Node {
    fn is_dir(&self) -> bool {
        matches!(self, Node::Dir)
    }
}

/// Numeric fields of the last Twstat received, for asserting the
/// "all-ones means don't change" convention.
#[derive(Clone, Default)]
struct WstatSeen {
    name: String,
    uid: String,
    gid: String,
    muid: String,
    typ: u16,
    dev: u32,
    mode: u32,
    atime: u32,
    mtime: u32,
    length: u64,
}

#[derive(Default)]
struct ServerState {
    nodes: HashMap<String, Node>,
    fids: HashMap<u32, String>,
    /// Every fid named in a Tclunk, in arrival order.
    clunks: Vec<u32>,
    last_create_perm: Option<u32>,
    last_wstat: Option<WstatSeen>,
}

#[derive(Clone, Copy, Default)]
struct ServerOptions {
    /// Deliver the Rversion reply in two TCP writes to exercise the
    /// client's partial-frame deferral.
    fragment_handshake: bool,
}

struct TestServer {
    port: u16,
    state: Arc<Mutex<ServerState>>,
}

impl TestServer {
    fn start() -> Self {
        Self::start_with(ServerOptions::default())
    }

    fn start_with(opts: ServerOptions) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind test server");
        let port = listener.local_addr().unwrap().port();

        let mut state = ServerState::default();
        state.nodes.insert(String::new(), Node::Dir);
        let state = Arc::new(Mutex::new(state));

        let conn_state = state.clone();
        thread::spawn(move || loop {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            serve_connection(stream, &conn_state, opts);
        });

        TestServer { port, state }
    }

    fn add_dir(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .nodes
            .insert(path.to_string(), Node::Dir);
    }

    fn add_file(&self, path: &str, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .nodes
            .insert(path.to_string(), Node::File(data.to_vec()));
    }

    fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().unwrap().nodes.get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    fn clunks_of(&self, fid: u32) -> usize {
        self.state
            .lock()
            .unwrap()
            .clunks
            .iter()
            .filter(|&&f| f == fid)
            .count()
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}/{name}")
    }
}

fn parent_and_name(path: &str) -> (&str, &str) {
    path.rsplit_once('/').unwrap_or(("", path))
}

fn qid_bytes(path: &str, is_dir: bool) -> [u8; 13] {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    let mut qid = [0u8; 13];
    qid[0] = if is_dir { 0x80 } else { 0x00 };
    qid[5..13].copy_from_slice(&hasher.finish().to_le_bytes());
    qid
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn reply(typ: u8, tag: u16, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7 + body.len());
    frame.extend_from_slice(&((7 + body.len()) as u32).to_le_bytes());
    frame.push(typ);
    frame.extend_from_slice(&tag.to_le_bytes());
    frame.extend_from_slice(body);
    frame
}

fn rerror(tag: u16, msg: &str) -> Vec<u8> {
    let mut body = Vec::new();
    push_str(&mut body, msg);
    reply(107, tag, &body)
}

fn stat_record(path: &str, node: &Node) -> Vec<u8> {
    let (_, name) = parent_and_name(path);
    let length = match node {
        Node::File(data) => data.len() as u64,
        Node::Dir => 0,
    };
    let strings = [name, "sys", "sys", "sys"];
    let inner = 41 + strings.iter().map(|s| 2 + s.len()).sum::<usize>();

    let mut rec = Vec::with_capacity(inner);
    rec.extend_from_slice(&((inner - 2) as u16).to_le_bytes());
    rec.extend_from_slice(&0u16.to_le_bytes()); // type
    rec.extend_from_slice(&0u32.to_le_bytes()); // dev
    rec.extend_from_slice(&qid_bytes(path, node.is_dir()));
    rec.extend_from_slice(&0o644u32.to_le_bytes()); // mode
    rec.extend_from_slice(&1111u32.to_le_bytes()); // atime
    rec.extend_from_slice(&2222u32.to_le_bytes()); // mtime
    rec.extend_from_slice(&length.to_le_bytes());
    for s in strings {
        push_str(&mut rec, s);
    }
    rec
}

fn dir_blob(state: &ServerState, path: &str) -> Vec<u8> {
    let mut children: Vec<&String> = state
        .nodes
        .keys()
        .filter(|k| !k.is_empty() && parent_and_name(k).0 == path)
        .collect();
    children.sort();
    let mut blob = Vec::new();
    for child in children {
        blob.extend_from_slice(&stat_record(child, &state.nodes[child]));
    }
    blob
}

fn serve_connection(mut stream: TcpStream, state: &Arc<Mutex<ServerState>>, opts: ServerOptions) {
    loop {
        let mut hdr = [0u8; 4];
        if stream.read_exact(&mut hdr).is_err() {
            return;
        }
        let len = u32::from_le_bytes(hdr) as usize;
        if len < 7 {
            return;
        }
        let mut frame = vec![0u8; len];
        frame[..4].copy_from_slice(&hdr);
        if stream.read_exact(&mut frame[4..]).is_err() {
            return;
        }

        let typ = frame[4];
        let tag = u16::from_le_bytes([frame[5], frame[6]]);
        let mut r = Reader::new(&frame[7..]);

        let resp: Vec<u8> = match typ {
            // Tversion
            100 => {
                let msize = r.u32().unwrap().min(8192);
                let mut body = Vec::new();
                body.extend_from_slice(&msize.to_le_bytes());
                push_str(&mut body, "9P2000");
                let resp = reply(101, tag, &body);
                if opts.fragment_handshake {
                    stream.write_all(&resp[..3]).unwrap();
                    stream.flush().unwrap();
                    thread::sleep(Duration::from_millis(20));
                    stream.write_all(&resp[3..]).unwrap();
                    continue;
                }
                resp
            }

            // Tattach
            104 => {
                let fid = r.u32().unwrap();
                state.lock().unwrap().fids.insert(fid, String::new());
                reply(105, tag, &qid_bytes("", true))
            }

            // Twalk
            110 => {
                let fid = r.u32().unwrap();
                let newfid = r.u32().unwrap();
                let nwname = r.u16().unwrap();
                let names: Vec<String> =
                    (0..nwname).map(|_| r.str().unwrap().to_string()).collect();
                let first = names.first().map(String::as_str);

                if first == Some("__drop__") {
                    // simulate the server going away mid-session
                    return;
                }
                if first == Some("hold") {
                    // deliberately never answered; used for exhaustion tests
                    continue;
                }
                if first == Some("oversize") {
                    // a frame longer than the negotiated msize, all junk
                    let mut junk = vec![0xaau8; 9000];
                    junk[..4].copy_from_slice(&9000u32.to_le_bytes());
                    stream.write_all(&junk).unwrap();
                }

                let mut st = state.lock().unwrap();
                let Some(base) = st.fids.get(&fid).cloned() else {
                    drop(st);
                    stream.write_all(&rerror(tag, "unknown fid")).unwrap();
                    continue;
                };
                let mut path = base;
                let mut qids: Vec<[u8; 13]> = Vec::new();
                for name in &names {
                    let next = join(&path, name);
                    match st.nodes.get(&next) {
                        Some(node) => {
                            qids.push(qid_bytes(&next, node.is_dir()));
                            path = next;
                        }
                        None => break,
                    }
                }
                if !names.is_empty() && qids.is_empty() {
                    drop(st);
                    stream.write_all(&rerror(tag, "file not found")).unwrap();
                    continue;
                }
                if qids.len() == names.len() {
                    st.fids.insert(newfid, path);
                }
                let mut body = Vec::new();
                body.extend_from_slice(&(qids.len() as u16).to_le_bytes());
                for qid in &qids {
                    body.extend_from_slice(qid);
                }
                reply(111, tag, &body)
            }

            // Topen
            112 => {
                let fid = r.u32().unwrap();
                let st = state.lock().unwrap();
                match st
                    .fids
                    .get(&fid)
                    .and_then(|p| st.nodes.get(p).map(|n| (p.clone(), n.is_dir())))
                {
                    Some((path, is_dir)) => {
                        let mut body = qid_bytes(&path, is_dir).to_vec();
                        body.extend_from_slice(&0u32.to_le_bytes()); // iounit
                        reply(113, tag, &body)
                    }
                    None => rerror(tag, "unknown fid"),
                }
            }

            // Tcreate
            114 => {
                let fid = r.u32().unwrap();
                let name = r.str().unwrap().to_string();
                let perm = r.u32().unwrap();
                let _mode = r.u8().unwrap();

                let mut st = state.lock().unwrap();
                st.last_create_perm = Some(perm);
                let Some(parent) = st.fids.get(&fid).cloned() else {
                    drop(st);
                    stream.write_all(&rerror(tag, "unknown fid")).unwrap();
                    continue;
                };
                let path = join(&parent, &name);
                let node = if perm & 0x8000_0000 != 0 {
                    Node::Dir
                } else {
                    Node::File(Vec::new())
                };
                let is_dir = node.is_dir();
                st.nodes.insert(path.clone(), node);
                st.fids.insert(fid, path.clone());

                let mut body = qid_bytes(&path, is_dir).to_vec();
                body.extend_from_slice(&0u32.to_le_bytes()); // iounit
                reply(115, tag, &body)
            }

            // Tread
            116 => {
                let fid = r.u32().unwrap();
                let offset = r.u64().unwrap() as usize;
                let count = r.u32().unwrap() as usize;

                let st = state.lock().unwrap();
                let data = st.fids.get(&fid).and_then(|path| {
                    st.nodes.get(path).map(|node| match node {
                        Node::File(data) => data.clone(),
                        Node::Dir => dir_blob(&st, path),
                    })
                });
                match data {
                    Some(data) => {
                        let end = (offset + count).min(data.len());
                        let slice = if offset < data.len() {
                            &data[offset..end]
                        } else {
                            &[]
                        };
                        let mut body = Vec::with_capacity(4 + slice.len());
                        body.extend_from_slice(&(slice.len() as u32).to_le_bytes());
                        body.extend_from_slice(slice);
                        reply(117, tag, &body)
                    }
                    None => rerror(tag, "unknown fid"),
                }
            }

            // Twrite
            118 => {
                let fid = r.u32().unwrap();
                let offset = r.u64().unwrap() as usize;
                let count = r.u32().unwrap() as usize;
                let data = r.bytes(count).unwrap();

                let mut st = state.lock().unwrap();
                let path = st.fids.get(&fid).cloned();
                let contents = match path {
                    Some(p) => match st.nodes.get_mut(&p) {
                        Some(Node::File(contents)) => Some(contents),
                        _ => None,
                    },
                    None => None,
                };
                match contents {
                    Some(contents) => {
                        if contents.len() < offset + count {
                            contents.resize(offset + count, 0);
                        }
                        contents[offset..offset + count].copy_from_slice(data);
                        reply(119, tag, &(count as u32).to_le_bytes())
                    }
                    None => rerror(tag, "not a file"),
                }
            }

            // Tclunk
            120 => {
                let fid = r.u32().unwrap();
                let mut st = state.lock().unwrap();
                st.clunks.push(fid);
                if st.fids.remove(&fid).is_some() {
                    reply(121, tag, &[])
                } else {
                    rerror(tag, "unknown fid")
                }
            }

            // Tremove
            122 => {
                let fid = r.u32().unwrap();
                let mut st = state.lock().unwrap();
                match st.fids.remove(&fid) {
                    Some(path) => {
                        let prefix = format!("{path}/");
                        st.nodes
                            .retain(|k, _| k != &path && !k.starts_with(&prefix));
                        reply(123, tag, &[])
                    }
                    None => rerror(tag, "unknown fid"),
                }
            }

            // Tstat
            124 => {
                let fid = r.u32().unwrap();
                let st = state.lock().unwrap();
                match st
                    .fids
                    .get(&fid)
                    .and_then(|p| st.nodes.get(p).map(|n| stat_record(p, n)))
                {
                    Some(rec) => {
                        let mut body = Vec::with_capacity(2 + rec.len());
                        body.extend_from_slice(&(rec.len() as u16).to_le_bytes());
                        body.extend_from_slice(&rec);
                        reply(125, tag, &body)
                    }
                    None => rerror(tag, "unknown fid"),
                }
            }

            // Twstat
            126 => {
                let fid = r.u32().unwrap();
                let _outer = r.u16().unwrap();
                let _size = r.u16().unwrap();
                let typ = r.u16().unwrap();
                let dev = r.u32().unwrap();
                let _qid = r.bytes(13).unwrap();
                let mode = r.u32().unwrap();
                let atime = r.u32().unwrap();
                let mtime = r.u32().unwrap();
                let length = r.u64().unwrap();
                let name = r.str().unwrap().to_string();
                let uid = r.str().unwrap().to_string();
                let gid = r.str().unwrap().to_string();
                let muid = r.str().unwrap().to_string();
                let seen = WstatSeen {
                    name,
                    uid,
                    gid,
                    muid,
                    typ,
                    dev,
                    mode,
                    atime,
                    mtime,
                    length,
                };

                let mut st = state.lock().unwrap();
                let path = st.fids.get(&fid).cloned();
                let resp = match path {
                    Some(old) => {
                        if !seen.name.is_empty() {
                            let (parent, _) = parent_and_name(&old);
                            let new = join(parent, &seen.name);
                            let prefix = format!("{old}/");
                            let moved: Vec<(String, Node)> = st
                                .nodes
                                .iter()
                                .filter(|(k, _)| **k == old || k.starts_with(&prefix))
                                .map(|(k, v)| (k.replacen(old.as_str(), &new, 1), v.clone()))
                                .collect();
                            st.nodes
                                .retain(|k, _| *k != old && !k.starts_with(&prefix));
                            st.nodes.extend(moved);
                            for target in st.fids.values_mut() {
                                if *target == old || target.starts_with(&prefix) {
                                    *target = target.replacen(old.as_str(), &new, 1);
                                }
                            }
                        }
                        reply(127, tag, &[])
                    }
                    None => rerror(tag, "unknown fid"),
                };
                st.last_wstat = Some(seen);
                resp
            }

            _ => rerror(tag, "not supported"),
        };

        if stream.write_all(&resp).is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Blocking helpers around the request/poll/collect API
// ---------------------------------------------------------------------------

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn connect(server: &TestServer) -> Client {
    let client = Client::start(Config::new(Ipv4Addr::LOCALHOST, server.port));
    assert!(
        wait_until(Duration::from_secs(5), || client.mounted()),
        "client failed to mount"
    );
    client
}

fn wait_tag(client: &Client, tag: u16) -> bool {
    wait_until(Duration::from_secs(2), || client.tag_response(tag))
}

fn walk(client: &Client, path: &str, kind: WalkKind) -> u32 {
    let tag = client.request_walk(path, kind).expect("walk request");
    assert!(wait_tag(client, tag), "walk timed out");
    client.walk_result(tag)
}

fn open(client: &Client, fid: u32, flags: OpenFlags) -> bool {
    let tag = client.request_open(fid, flags).expect("open request");
    assert!(wait_tag(client, tag), "open timed out");
    client.open_result(tag)
}

fn create(client: &Client, fid: u32, name: &str, is_dir: bool) -> bool {
    let tag = client
        .request_create(fid, name, is_dir)
        .expect("create request");
    assert!(wait_tag(client, tag), "create timed out");
    client.create_result(tag)
}

fn read(client: &Client, fid: u32, offset: u64, count: u32, buf: &mut [u8]) -> i32 {
    let tag = client
        .request_file_read(fid, offset, count)
        .expect("read request");
    assert!(wait_tag(client, tag), "read timed out");
    client.file_read_result(tag, buf)
}

fn write(client: &Client, fid: u32, offset: u64, data: &[u8]) -> i32 {
    let tag = client.request_write(fid, offset, data).expect("write request");
    assert!(wait_tag(client, tag), "write timed out");
    client.write_result(tag)
}

fn write_all(client: &Client, fid: u32, data: &[u8]) {
    let mut offset = 0usize;
    while offset < data.len() {
        let n = write(client, fid, offset as u64, &data[offset..]);
        assert!(n > 0, "write failed at offset {offset}");
        offset += n as usize;
    }
}

fn read_all(client: &Client, fid: u32, chunk: u32) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; chunk as usize];
    let mut offset = 0u64;
    loop {
        let n = read(client, fid, offset, chunk, &mut buf);
        assert!(n >= 0, "read failed at offset {offset}");
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n as usize]);
        offset += n as u64;
    }
}

fn remove(client: &Client, fid: u32) -> bool {
    let tag = client.request_remove(fid).expect("remove request");
    assert!(wait_tag(client, tag), "remove timed out");
    client.remove_result(tag)
}

fn stat(client: &Client, fid: u32) -> Option<crate::FileStat> {
    let tag = client.request_stat(fid).expect("stat request");
    assert!(wait_tag(client, tag), "stat timed out");
    client.stat_result(tag)
}

fn list_dir(client: &Client, fid: u32) -> Vec<DirEntry> {
    let mut entries = Vec::new();
    let mut offset = 0u64;
    loop {
        let tag = client.request_dir_read(fid, offset).expect("dir read request");
        assert!(wait_tag(client, tag), "dir read timed out");
        let mut entry = DirEntry::default();
        let n = client.dir_read_result(tag, &mut entry);
        assert!(n >= 0, "dir read failed");
        if n == 0 {
            return entries;
        }
        entries.push(entry);
        offset += n as u64;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn mounts_over_a_fragmented_handshake() {
    let server = TestServer::start_with(ServerOptions {
        fragment_handshake: true,
    });
    // drive the explicit-connector constructor while we're at it
    let addr = std::net::SocketAddrV4::new(Ipv4Addr::LOCALHOST, server.port);
    let client = Client::with_connector(Box::new(crate::TcpConnector::new(addr)));
    assert!(
        wait_until(Duration::from_secs(5), || client.mounted()),
        "client failed to mount"
    );
    assert_eq!(client.max_read_len(), 8192 - 11);
    assert_eq!(client.max_write_len(), 8192 - 23);
}

#[test]
fn walk_resolves_kinds() {
    let server = TestServer::start();
    server.add_dir("data");
    server.add_file("data/log.bin", b"abc");
    let client = connect(&server);

    // two-hop walk to a file
    let fid = walk(&client, "data/log.bin", WalkKind::File);
    assert_ne!(fid, 0);
    client.release(fid);

    // kind mismatches report 0
    assert_eq!(walk(&client, "data", WalkKind::File), 0);
    assert_eq!(walk(&client, "data/log.bin", WalkKind::Directory), 0);

    // missing path reports 0
    assert_eq!(walk(&client, "missing", WalkKind::Any), 0);
    assert_eq!(walk(&client, "data/missing", WalkKind::Any), 0);

    // zero-hop walk reaches the root, which is only ever a directory
    let root = walk(&client, "", WalkKind::Directory);
    assert_ne!(root, 0);
    client.release(root);
    assert_eq!(walk(&client, "", WalkKind::File), 0);
}

#[test]
fn reads_a_file_in_chunks() {
    let server = TestServer::start();
    server.add_dir("data");
    let contents: Vec<u8> = (0..10000u32).map(|i| (i % 251) as u8).collect();
    server.add_file("data/log.bin", &contents);
    let client = connect(&server);

    let fid = walk(&client, "data/log.bin", WalkKind::File);
    assert_ne!(fid, 0);
    assert!(open(&client, fid, OpenFlags::RDONLY));

    let back = read_all(&client, fid, 4096);
    assert_eq!(back, contents);
    client.release(fid);
}

#[test]
fn create_directory_sets_dmdir_permissions() {
    let server = TestServer::start();
    let client = connect(&server);

    let fid = walk(&client, "", WalkKind::Directory);
    assert_ne!(fid, 0);
    assert!(create(&client, fid, "sub", true));
    client.release(fid);

    assert_eq!(
        server.state.lock().unwrap().last_create_perm,
        Some(0x8000_01ff)
    );
    let sub = walk(&client, "sub", WalkKind::Directory);
    assert_ne!(sub, 0);
    client.release(sub);
}

#[test]
fn create_write_read_round_trip() {
    let server = TestServer::start();
    let client = connect(&server);

    let dir = walk(&client, "", WalkKind::Directory);
    assert!(create(&client, dir, "x", false));
    client.release(dir);

    let payload: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 256) as u8).collect();
    let fid = walk(&client, "x", WalkKind::File);
    assert_ne!(fid, 0);
    assert!(open(&client, fid, OpenFlags::RDWR));
    write_all(&client, fid, &payload);

    let back = read_all(&client, fid, 4096);
    assert_eq!(back, payload);
    client.release(fid);

    assert_eq!(server.file_contents("x").as_deref(), Some(&payload[..]));
}

#[test]
fn write_clamps_to_the_negotiated_msize() {
    let server = TestServer::start();
    server.add_file("big", b"");
    let client = connect(&server);

    let fid = walk(&client, "big", WalkKind::File);
    assert!(open(&client, fid, OpenFlags::WRONLY));

    let data = vec![0x5au8; 20000];
    let n = write(&client, fid, 0, &data);
    assert_eq!(n as u32, client.max_write_len());

    write_all(&client, fid, &data);
    assert_eq!(server.file_contents("big").as_deref(), Some(&data[..]));
    client.release(fid);
}

#[test]
fn directory_listing() {
    let server = TestServer::start();
    server.add_dir("logs");
    server.add_file("logs/a.bin", b"aa");
    server.add_file("logs/b.bin", b"bbbb");
    server.add_dir("logs/old");
    let client = connect(&server);

    let fid = walk(&client, "logs", WalkKind::Directory);
    assert!(open(&client, fid, OpenFlags::RDONLY));
    let entries = list_dir(&client, fid);
    client.release(fid);

    let mut names: Vec<(String, FileKind)> = entries
        .into_iter()
        .map(|e| (e.name, e.kind.expect("entry kind")))
        .collect();
    names.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        names,
        vec![
            ("a.bin".to_string(), FileKind::Regular),
            ("b.bin".to_string(), FileKind::Regular),
            ("old".to_string(), FileKind::Directory),
        ]
    );
}

#[test]
fn stat_reports_size_kind_and_times() {
    let server = TestServer::start();
    server.add_file("ten", b"0123456789");
    server.add_dir("d");
    let client = connect(&server);

    let fid = walk(&client, "ten", WalkKind::File);
    let st = stat(&client, fid).expect("stat");
    assert_eq!(st.size, 10);
    assert_eq!(st.kind, FileKind::Regular);
    assert_eq!(st.atime, 1111);
    assert_eq!(st.mtime, 2222);
    client.release(fid);

    let fid = walk(&client, "d", WalkKind::Directory);
    let st = stat(&client, fid).expect("stat dir");
    assert_eq!(st.kind, FileKind::Directory);
    client.release(fid);
}

#[test]
fn rename_via_wstat() {
    let server = TestServer::start();
    server.add_file("old.txt", b"content");
    let client = connect(&server);

    let fid = walk(&client, "old.txt", WalkKind::File);
    let tag = client.request_rename(fid, "new.txt").expect("rename request");
    assert!(wait_tag(&client, tag));
    assert!(client.stat_update_result(tag));
    client.release(fid);

    // everything but the name reads "don't change"
    let seen = server.state.lock().unwrap().last_wstat.clone().unwrap();
    assert_eq!(seen.name, "new.txt");
    assert_eq!(seen.uid, "");
    assert_eq!(seen.gid, "");
    assert_eq!(seen.muid, "");
    assert_eq!(seen.typ, u16::MAX);
    assert_eq!(seen.dev, u32::MAX);
    assert_eq!(seen.mode, u32::MAX);
    assert_eq!(seen.atime, u32::MAX);
    assert_eq!(seen.mtime, u32::MAX);
    assert_eq!(seen.length, u64::MAX);

    assert_eq!(walk(&client, "old.txt", WalkKind::Any), 0);
    let fid = walk(&client, "new.txt", WalkKind::File);
    assert_ne!(fid, 0);
    client.release(fid);
}

#[test]
fn set_mtime_via_wstat() {
    let server = TestServer::start();
    server.add_file("t", b"");
    let client = connect(&server);

    let fid = walk(&client, "t", WalkKind::File);
    let tag = client.request_set_mtime(fid, 1234567).expect("set_mtime");
    assert!(wait_tag(&client, tag));
    assert!(client.stat_update_result(tag));
    client.release(fid);

    let seen = server.state.lock().unwrap().last_wstat.clone().unwrap();
    assert_eq!(seen.name, "");
    assert_eq!(seen.mtime, 1234567);
    assert_eq!(seen.atime, u32::MAX);
}

#[test]
fn remove_deletes_and_consumes_the_fid() {
    let server = TestServer::start();
    server.add_file("doomed", b"x");
    let client = connect(&server);

    let fid = walk(&client, "doomed", WalkKind::File);
    assert!(remove(&client, fid));
    assert_eq!(walk(&client, "doomed", WalkKind::Any), 0);

    // the handle died with the remove: no clunk was (or can be) issued
    let errors_before = client.flow_errors();
    client.release(fid);
    assert_eq!(server.clunks_of(fid), 0);
    assert!(client.flow_errors() > errors_before);
}

#[test]
fn release_is_idempotent() {
    let server = TestServer::start();
    server.add_file("f", b"x");
    let client = connect(&server);

    let fid = walk(&client, "f", WalkKind::File);
    client.release(fid);
    client.release(fid);
    // give the lone Tclunk time to land
    assert!(wait_until(Duration::from_secs(2), || server.clunks_of(fid) > 0));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(server.clunks_of(fid), 1);
}

#[test]
fn tag_exhaustion_and_recovery() {
    let server = TestServer::start();
    server.add_dir("hold");
    let client = connect(&server);

    // Fill the whole table with walks the server never answers
    let tags: Vec<u16> = (0..16)
        .map(|_| {
            client
                .request_walk("hold/x", WalkKind::Any)
                .expect("walk request")
        })
        .collect();
    assert_eq!(tags.len(), 16);

    // the 17th gets no tag
    assert!(client.request_walk("hold/x", WalkKind::Any).is_none());

    // abandoning any one frees a slot (the walked fid stays leaked, which is
    // the documented cost of abandoning a walk)
    client.clear_tag(tags[0]);
    assert!(client.request_walk("hold/x", WalkKind::Any).is_some());
}

#[test]
fn reconnects_after_the_server_drops() {
    let server = TestServer::start();
    server.add_file("f", b"x");
    let client = connect(&server);

    let fid = walk(&client, "f", WalkKind::File);
    assert_ne!(fid, 0);

    // the server hangs up mid-session
    let tag = client.request_walk("__drop__", WalkKind::Any).expect("walk");
    assert!(wait_until(Duration::from_secs(5), || !client.mounted()));
    // the dropped session took every slot with it
    assert_eq!(client.walk_result(tag), 0);

    // and comes back on its own
    assert!(wait_until(Duration::from_secs(5), || client.mounted()));

    // handles from the previous session are dead
    assert!(client.request_open(fid, OpenFlags::RDONLY).is_none());

    // but the tree is reachable again
    let fid = walk(&client, "f", WalkKind::File);
    assert_ne!(fid, 0);
    client.release(fid);
}

#[test]
fn oversized_frames_are_skipped_without_losing_the_session() {
    let server = TestServer::start();
    server.add_file("f", b"x");
    let client = connect(&server);

    // the server precedes its reply with a 9000-byte frame, which exceeds
    // the negotiated msize of 8192 and must be discarded
    assert_eq!(walk(&client, "oversize/x", WalkKind::Any), 0);
    assert!(client.flow_errors() > 0);

    // the session survived and later frames parse fine
    assert!(client.mounted());
    let fid = walk(&client, "f", WalkKind::File);
    assert_ne!(fid, 0);
    let st = stat(&client, fid).expect("stat");
    assert_eq!(st.size, 1);
    client.release(fid);
}

#[test]
fn collecting_with_the_wrong_accessor_fails_cleanly() {
    let server = TestServer::start();
    server.add_file("f", b"abcd");
    let client = connect(&server);

    let fid = walk(&client, "f", WalkKind::File);
    assert!(open(&client, fid, OpenFlags::RDONLY));

    let tag = client.request_file_read(fid, 0, 4).expect("read request");
    assert!(wait_tag(&client, tag));
    // a file read drained through the directory accessor is refused and the
    // slot is released either way
    let mut entry = DirEntry::default();
    assert_eq!(client.dir_read_result(tag, &mut entry), -1);
    assert!(!client.tag_response(tag));
    client.release(fid);
}

#[test]
fn disabled_client_opens_no_socket() {
    let client = Client::start(Config::default());
    thread::sleep(Duration::from_millis(100));
    assert!(!client.mounted());
    assert!(client.request_walk("x", WalkKind::Any).is_none());
}
