#![allow(dead_code, missing_docs, clippy::unwrap_used)]
//! Shared harness: a scripted host framework and wire-format builders.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use fuse_bridge::fsext::{HostBridge, InternalRequest, InternalResponse, Transact, VolumeParams};
use fuse_bridge::instance::Instance;
use fuse_bridge::proto::{FuseAttr, Opcode, REQ_SIZEMIN, RequestHeader};
use fuse_bridge::status::Status;

/// Host framework double: requests are scripted in, responses collected out.
#[derive(Default)]
pub struct MockHost {
    requests: Mutex<VecDeque<InternalRequest>>,
    responses: Mutex<Vec<InternalResponse>>,
    transport_error: Mutex<Option<Status>>,
}

impl MockHost {
    pub fn new() -> Arc<MockHost> {
        Arc::new(MockHost::default())
    }

    pub fn queue_request(&self, request: InternalRequest) {
        self.requests.lock().unwrap().push_back(request);
    }

    pub fn take_responses(&self) -> Vec<InternalResponse> {
        std::mem::take(&mut self.responses.lock().unwrap())
    }

    /// Make the next bridge call fail with `status`.
    pub fn fail_next(&self, status: Status) {
        *self.transport_error.lock().unwrap() = Some(status);
    }
}

impl HostBridge for MockHost {
    fn forward_response(&self, response: InternalResponse) -> Result<(), Status> {
        if let Some(status) = self.transport_error.lock().unwrap().take() {
            return Err(status);
        }
        self.responses.lock().unwrap().push(response);
        Ok(())
    }

    fn next_request(&self) -> Result<Option<InternalRequest>, Status> {
        if let Some(status) = self.transport_error.lock().unwrap().take() {
            return Err(status);
        }
        Ok(self.requests.lock().unwrap().pop_front())
    }
}

pub struct Harness {
    pub host: Arc<MockHost>,
    pub instance: Instance,
}

pub fn harness() -> Harness {
    let host = MockHost::new();
    let mut volume_params = VolumeParams::default();
    let instance =
        Instance::init(Arc::clone(&host) as Arc<dyn HostBridge>, &mut volume_params).unwrap();
    Harness { host, instance }
}

/// Run a request-only transact call and return the emitted wire request.
pub fn pull_request(instance: &Instance) -> (RequestHeader, Vec<u8>) {
    let mut out = vec![0u8; REQ_SIZEMIN];
    let information = instance.transact(Transact::new(&[], &mut out)).unwrap();
    let header = RequestHeader::parse(&out).unwrap();
    assert_ne!(header.len, 0, "expected a request to be emitted");
    assert_eq!(
        header.len as usize, information,
        "information must echo the request len"
    );
    (header, out)
}

/// Run a request-only transact call expecting no request to come out.
pub fn pull_nothing(instance: &Instance) {
    let mut out = vec![0u8; REQ_SIZEMIN];
    let information = instance.transact(Transact::new(&[], &mut out)).unwrap();
    assert_eq!(information, 0);
}

/// Deliver a wire response with no output buffer.
pub fn push_response(instance: &Instance, response: &[u8]) {
    instance.transact(Transact::new(response, &mut [])).unwrap();
}

/// Drive the handshake to completion against a daemon speaking
/// `daemon_minor`.
pub fn complete_init(harness: &Harness, daemon_minor: u32) {
    let (header, _) = pull_request(&harness.instance);
    assert_eq!(header.opcode, Opcode::Init as u32);
    push_response(
        &harness.instance,
        &init_response(header.unique, 7, daemon_minor),
    );
    assert_eq!(harness.instance.version().0, 7);
}

fn header_bytes(len: u32, error: i32, unique: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(len as usize);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&error.to_le_bytes());
    buf.extend_from_slice(&unique.to_le_bytes());
    buf
}

/// A header-only response carrying a negative errno.
pub fn error_response(unique: u64, errno: i32) -> Vec<u8> {
    header_bytes(16, -errno.abs(), unique)
}

/// An `INIT` response in the pre-7.23 24-byte form.
pub fn init_response(unique: u64, major: u32, minor: u32) -> Vec<u8> {
    let mut buf = header_bytes(16 + 24, 0, unique);
    buf.extend_from_slice(&major.to_le_bytes());
    buf.extend_from_slice(&minor.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // max_readahead
    buf.extend_from_slice(&0u32.to_le_bytes()); // flags
    buf.extend_from_slice(&0u16.to_le_bytes()); // max_background
    buf.extend_from_slice(&0u16.to_le_bytes()); // congestion_threshold
    buf.extend_from_slice(&0u32.to_le_bytes()); // max_write
    buf
}

pub fn attr_bytes(attr: &FuseAttr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(88);
    buf.extend_from_slice(&attr.ino.to_le_bytes());
    buf.extend_from_slice(&attr.size.to_le_bytes());
    buf.extend_from_slice(&attr.blocks.to_le_bytes());
    buf.extend_from_slice(&attr.atime.to_le_bytes());
    buf.extend_from_slice(&attr.mtime.to_le_bytes());
    buf.extend_from_slice(&attr.ctime.to_le_bytes());
    buf.extend_from_slice(&attr.atimensec.to_le_bytes());
    buf.extend_from_slice(&attr.mtimensec.to_le_bytes());
    buf.extend_from_slice(&attr.ctimensec.to_le_bytes());
    buf.extend_from_slice(&attr.mode.to_le_bytes());
    buf.extend_from_slice(&attr.nlink.to_le_bytes());
    buf.extend_from_slice(&attr.uid.to_le_bytes());
    buf.extend_from_slice(&attr.gid.to_le_bytes());
    buf.extend_from_slice(&attr.rdev.to_le_bytes());
    buf.extend_from_slice(&attr.blksize.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // padding
    buf
}

fn entry_bytes(nodeid: u64, generation: u64, entry_valid: u64, attr: &FuseAttr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(&nodeid.to_le_bytes());
    buf.extend_from_slice(&generation.to_le_bytes());
    buf.extend_from_slice(&entry_valid.to_le_bytes());
    buf.extend_from_slice(&entry_valid.to_le_bytes()); // attr_valid
    buf.extend_from_slice(&0u32.to_le_bytes()); // entry_valid_nsec
    buf.extend_from_slice(&0u32.to_le_bytes()); // attr_valid_nsec
    buf.extend_from_slice(&attr_bytes(attr));
    buf
}

/// A `LOOKUP`/`MKNOD` entry response.
pub fn entry_response(unique: u64, nodeid: u64, entry_valid: u64, attr: &FuseAttr) -> Vec<u8> {
    let mut buf = header_bytes(16 + 128, 0, unique);
    buf.extend_from_slice(&entry_bytes(nodeid, 1, entry_valid, attr));
    buf
}

/// A `GETATTR` response.
pub fn attr_response(unique: u64, attr: &FuseAttr) -> Vec<u8> {
    let mut buf = header_bytes(16 + 104, 0, unique);
    buf.extend_from_slice(&60u64.to_le_bytes()); // attr_valid
    buf.extend_from_slice(&0u32.to_le_bytes()); // attr_valid_nsec
    buf.extend_from_slice(&0u32.to_le_bytes()); // dummy
    buf.extend_from_slice(&attr_bytes(attr));
    buf
}

/// An `OPEN`/`OPENDIR` response.
pub fn open_response(unique: u64, fh: u64) -> Vec<u8> {
    let mut buf = header_bytes(16 + 16, 0, unique);
    buf.extend_from_slice(&fh.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // open_flags
    buf.extend_from_slice(&0u32.to_le_bytes()); // padding
    buf
}

/// A `CREATE` response: entry followed by open.
pub fn create_response(unique: u64, nodeid: u64, attr: &FuseAttr, fh: u64) -> Vec<u8> {
    let mut buf = header_bytes(16 + 128 + 16, 0, unique);
    buf.extend_from_slice(&entry_bytes(nodeid, 1, 60, attr));
    buf.extend_from_slice(&fh.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf
}

/// A regular-file attribute block.
pub fn regular_attr(ino: u64, size: u64) -> FuseAttr {
    FuseAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: 1_700_000_000,
        mtime: 1_700_000_100,
        ctime: 1_700_000_200,
        mode: libc::S_IFREG as u32 | 0o644,
        nlink: 1,
        uid: 1000,
        gid: 1000,
        blksize: 4096,
        ..FuseAttr::default()
    }
}

/// A directory attribute block.
pub fn dir_attr(ino: u64) -> FuseAttr {
    FuseAttr {
        mode: libc::S_IFDIR as u32 | 0o755,
        nlink: 2,
        ..regular_attr(ino, 0)
    }
}
