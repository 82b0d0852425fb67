#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::time::{Duration, Instant};

use bytes::Bytes;
use common::{
    Harness, complete_init, dir_attr, entry_response, error_response, harness, init_response,
    open_response, pull_nothing, pull_request, push_response, regular_attr,
};
use fuse_bridge::fsext::{
    AccessMask, InternalRequest, RequestKind, RequestOp, Transact, attr_to_file_info,
};
use fuse_bridge::proto::{
    BATCH_FORGET_IN_SIZE, EntryOut, FORGET_ONE_SIZE, Opcode, Origin, REQ_HEADER_SIZE, REQ_SIZEMIN,
};
use fuse_bridge::status::Status;
use fuse_bridge::sync::CancelToken;

fn lookup_request(hint: u64, parent: u64, name: &'static [u8]) -> InternalRequest {
    InternalRequest {
        hint,
        origin: Origin {
            uid: 1000,
            gid: 1000,
            pid: 4242,
        },
        op: RequestOp::Lookup {
            parent,
            name: Bytes::from_static(name),
        },
    }
}

fn open_request(hint: u64, parent: u64, name: &'static [u8], access: AccessMask) -> InternalRequest {
    InternalRequest {
        hint,
        origin: Origin {
            uid: 1000,
            gid: 1000,
            pid: 4242,
        },
        op: RequestOp::Open {
            parent,
            name: Bytes::from_static(name),
            granted_access: access,
        },
    }
}

fn seed_cache_entry(harness: &Harness, parent: u64, name: &[u8], ino: u64, entry_valid: u64) {
    let attr = regular_attr(ino, 64);
    harness.instance.cache().insert(
        parent,
        name,
        &EntryOut {
            nodeid: ino,
            generation: 1,
            entry_valid,
            attr_valid: entry_valid,
            entry_valid_nsec: 0,
            attr_valid_nsec: 0,
            attr,
        },
    );
}

#[test]
fn cold_init_emits_handshake_request() {
    let harness = harness();
    let (header, payload) = pull_request(&harness.instance);
    assert_eq!(header.opcode, Opcode::Init as u32);
    assert_ne!(header.unique, 0);
    let major = u32::from_le_bytes(payload[40..44].try_into().unwrap());
    assert_eq!(major, 7);
    assert_eq!(harness.instance.ioq().processing_count(), 1);
}

#[test]
fn init_completion_populates_versions_and_unblocks() {
    let harness = harness();
    let (header, _) = pull_request(&harness.instance);
    push_response(&harness.instance, &init_response(header.unique, 7, 29));
    assert_eq!(harness.instance.ioq().processing_count(), 0);
    assert_eq!(harness.instance.version(), (7, 29));
    // Request half-steps no longer block on the init event.
    pull_nothing(&harness.instance);
}

#[test]
fn init_negotiates_down_to_daemon_minor() {
    let harness = harness();
    let (header, _) = pull_request(&harness.instance);
    push_response(&harness.instance, &init_response(header.unique, 7, 15));
    assert_eq!(harness.instance.version(), (7, 15));
}

#[test]
fn init_caps_minor_at_our_own() {
    let harness = harness();
    let (header, _) = pull_request(&harness.instance);
    push_response(&harness.instance, &init_response(header.unique, 7, 40));
    assert_eq!(harness.instance.version(), (7, 29));
}

#[test]
fn init_major_mismatch_denies_all_requests() {
    let harness = harness();
    let (header, _) = pull_request(&harness.instance);
    push_response(&harness.instance, &init_response(header.unique, 8, 29));
    let mut out = vec![0u8; REQ_SIZEMIN];
    assert_eq!(
        harness.instance.transact(Transact::new(&[], &mut out)),
        Err(Status::AccessDenied)
    );
}

#[test]
fn init_wire_error_denies_all_requests() {
    let harness = harness();
    let (header, _) = pull_request(&harness.instance);
    push_response(&harness.instance, &error_response(header.unique, libc::EIO));
    let mut out = vec![0u8; REQ_SIZEMIN];
    assert_eq!(
        harness.instance.transact(Transact::new(&[], &mut out)),
        Err(Status::AccessDenied)
    );
}

#[test]
fn pre_init_wait_is_cancellable() {
    let harness = harness();
    // Consume the INIT request so pending is empty and the handshake is
    // still incomplete.
    pull_request(&harness.instance);
    let cancel = CancelToken::new();
    cancel.cancel();
    let mut out = vec![0u8; REQ_SIZEMIN];
    assert_eq!(
        harness
            .instance
            .transact(Transact::with_cancel(&[], &mut out, cancel)),
        Err(Status::Cancelled)
    );
}

#[test]
fn lookup_success_maps_attributes() {
    let harness = harness();
    complete_init(&harness, 29);

    harness.host.queue_request(lookup_request(0x1000, 1, b"foo"));
    let (header, payload) = pull_request(&harness.instance);
    assert_eq!(header.opcode, Opcode::Lookup as u32);
    assert_eq!(header.nodeid, 1);
    assert_eq!(header.uid, 1000);
    assert_eq!(&payload[40..44], b"foo\0");

    let attr = regular_attr(42, 1234);
    push_response(&harness.instance, &entry_response(header.unique, 42, 60, &attr));

    let responses = harness.host.take_responses();
    assert_eq!(responses.len(), 1);
    let response = &responses[0];
    assert_eq!(response.kind, Some(RequestKind::Lookup));
    assert_eq!(response.hint, 0x1000);
    assert_eq!(response.status, Status::Success);
    assert_eq!(
        response.file_info,
        Some(attr_to_file_info(&attr, harness.instance.volume_params()))
    );
    assert_eq!(harness.instance.cache().entry_count(), 1);
    assert_eq!(harness.instance.ioq().processing_count(), 0);
}

#[test]
fn lookup_enoent_maps_to_name_not_found() {
    let harness = harness();
    complete_init(&harness, 29);

    harness.host.queue_request(lookup_request(0x2000, 1, b"gone"));
    let (header, _) = pull_request(&harness.instance);
    push_response(&harness.instance, &error_response(header.unique, libc::ENOENT));

    let responses = harness.host.take_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, Status::ObjectNameNotFound);
    assert_eq!(responses[0].hint, 0x2000);
    assert!(responses[0].file_info.is_none());
    assert_eq!(harness.instance.cache().entry_count(), 0);
    assert_eq!(harness.instance.ioq().processing_count(), 0);
}

#[test]
fn lookup_negative_entry_maps_to_name_not_found() {
    let harness = harness();
    complete_init(&harness, 29);

    harness.host.queue_request(lookup_request(0x2100, 1, b"neg"));
    let (header, _) = pull_request(&harness.instance);
    // error == 0 but nodeid == 0: a cacheable negative entry.
    let attr = regular_attr(0, 0);
    push_response(&harness.instance, &entry_response(header.unique, 0, 60, &attr));

    let responses = harness.host.take_responses();
    assert_eq!(responses[0].status, Status::ObjectNameNotFound);
    assert_eq!(harness.instance.cache().entry_count(), 0);
}

#[test]
fn getattr_success_maps_attributes() {
    let harness = harness();
    complete_init(&harness, 29);

    harness.host.queue_request(InternalRequest {
        hint: 0x3000,
        origin: Origin::default(),
        op: RequestOp::GetAttr { ino: 5 },
    });
    let (header, _) = pull_request(&harness.instance);
    assert_eq!(header.opcode, Opcode::Getattr as u32);
    assert_eq!(header.nodeid, 5);

    let attr = regular_attr(5, 999);
    push_response(&harness.instance, &common::attr_response(header.unique, &attr));

    let responses = harness.host.take_responses();
    assert_eq!(responses[0].kind, Some(RequestKind::GetAttr));
    assert_eq!(responses[0].status, Status::Success);
    assert_eq!(
        responses[0].file_info,
        Some(attr_to_file_info(&attr, harness.instance.volume_params()))
    );
}

#[test]
fn open_cold_runs_lookup_then_open() {
    let harness = harness();
    complete_init(&harness, 29);

    harness
        .host
        .queue_request(open_request(0x4000, 1, b"bar", AccessMask::READ_DATA));

    let (lookup, payload) = pull_request(&harness.instance);
    assert_eq!(lookup.opcode, Opcode::Lookup as u32);
    assert_eq!(&payload[40..44], b"bar\0");

    let attr = regular_attr(77, 100);
    push_response(&harness.instance, &entry_response(lookup.unique, 77, 60, &attr));
    // The context suspends between exchanges; no host response yet.
    assert!(harness.host.take_responses().is_empty());

    let (open, payload) = pull_request(&harness.instance);
    assert_eq!(open.opcode, Opcode::Open as u32);
    assert_eq!(open.nodeid, 77);
    assert_eq!(open.unique, lookup.unique, "one context, one correlation id");
    let flags = u32::from_le_bytes(payload[40..44].try_into().unwrap());
    assert_eq!(flags, libc::O_RDONLY as u32);

    push_response(&harness.instance, &open_response(open.unique, 5050));
    let responses = harness.host.take_responses();
    assert_eq!(responses.len(), 1);
    let response = &responses[0];
    assert_eq!(response.kind, Some(RequestKind::Open));
    assert_eq!(response.status, Status::Success);
    let file_id = response.file_id.unwrap();
    let file = harness.instance.file_table().get(file_id).unwrap();
    assert_eq!(file.fh, 5050);
    assert_eq!(file.ino, 77);
    assert!(!file.is_dir);
}

#[test]
fn open_warm_cache_hit_skips_lookup() {
    let harness = harness();
    complete_init(&harness, 29);
    seed_cache_entry(&harness, 1, b"hot", 88, 60);

    harness
        .host
        .queue_request(open_request(0x5000, 1, b"hot", AccessMask::READ_DATA | AccessMask::WRITE_DATA));

    let (header, payload) = pull_request(&harness.instance);
    assert_eq!(header.opcode, Opcode::Open as u32, "cache hit must skip the lookup");
    assert_eq!(header.nodeid, 88);
    let flags = u32::from_le_bytes(payload[40..44].try_into().unwrap());
    assert_eq!(flags, libc::O_RDWR as u32);

    push_response(&harness.instance, &open_response(header.unique, 6060));
    let responses = harness.host.take_responses();
    assert_eq!(responses[0].status, Status::Success);
}

#[test]
fn open_directory_uses_opendir() {
    let harness = harness();
    complete_init(&harness, 29);

    harness
        .host
        .queue_request(open_request(0x6000, 1, b"dir", AccessMask::READ_DATA));

    let (lookup, _) = pull_request(&harness.instance);
    push_response(
        &harness.instance,
        &entry_response(lookup.unique, 90, 60, &dir_attr(90)),
    );

    let (open, _) = pull_request(&harness.instance);
    assert_eq!(open.opcode, Opcode::Opendir as u32);
    push_response(&harness.instance, &open_response(open.unique, 7));

    let responses = harness.host.take_responses();
    let file = harness
        .instance
        .file_table()
        .get(responses[0].file_id.unwrap())
        .unwrap();
    assert!(file.is_dir);
    let info = responses[0].file_info.unwrap();
    assert!(
        info.file_attributes
            .contains(fuse_bridge::fsext::FileAttributes::DIRECTORY)
    );
}

#[test]
fn open_enoent_fails_without_file_object() {
    let harness = harness();
    complete_init(&harness, 29);

    harness
        .host
        .queue_request(open_request(0x6500, 1, b"nope", AccessMask::READ_DATA));
    let (lookup, _) = pull_request(&harness.instance);
    push_response(&harness.instance, &error_response(lookup.unique, libc::ENOENT));

    let responses = harness.host.take_responses();
    assert_eq!(responses[0].status, Status::ObjectNameNotFound);
    assert!(responses[0].file_id.is_none());
    assert!(harness.instance.file_table().is_empty());
}

#[test]
fn create_success_is_a_single_exchange() {
    let harness = harness();
    complete_init(&harness, 29);

    harness.host.queue_request(InternalRequest {
        hint: 0x7000,
        origin: Origin::default(),
        op: RequestOp::Create {
            parent: 1,
            name: Bytes::from_static(b"new"),
            mode: 0o644,
            umask: 0o022,
            granted_access: AccessMask::READ_DATA | AccessMask::WRITE_DATA,
        },
    });

    let (header, payload) = pull_request(&harness.instance);
    assert_eq!(header.opcode, Opcode::Create as u32);
    assert_eq!(header.len as usize, REQ_HEADER_SIZE + 16 + 4);
    let flags = u32::from_le_bytes(payload[40..44].try_into().unwrap());
    assert_eq!(flags, libc::O_RDWR as u32 | libc::O_CREAT as u32);
    assert_eq!(&payload[56..60], b"new\0");

    let attr = regular_attr(101, 0);
    push_response(
        &harness.instance,
        &common::create_response(header.unique, 101, &attr, 8080),
    );

    let responses = harness.host.take_responses();
    assert_eq!(responses[0].kind, Some(RequestKind::Create));
    assert_eq!(responses[0].status, Status::Success);
    let file = harness
        .instance
        .file_table()
        .get(responses[0].file_id.unwrap())
        .unwrap();
    assert_eq!(file.fh, 8080);
    // The created entry is now cached.
    assert!(harness.instance.cache().lookup(1, b"new").is_some());
}

#[test]
fn create_enosys_falls_back_to_mknod_and_open() {
    let harness = harness();
    complete_init(&harness, 29);

    harness.host.queue_request(InternalRequest {
        hint: 0x8000,
        origin: Origin::default(),
        op: RequestOp::Create {
            parent: 1,
            name: Bytes::from_static(b"fb"),
            mode: 0o600,
            umask: 0o022,
            granted_access: AccessMask::WRITE_DATA,
        },
    });

    let (create, _) = pull_request(&harness.instance);
    assert_eq!(create.opcode, Opcode::Create as u32);
    push_response(&harness.instance, &error_response(create.unique, libc::ENOSYS));

    let (mknod, payload) = pull_request(&harness.instance);
    assert_eq!(mknod.opcode, Opcode::Mknod as u32);
    let mode = u32::from_le_bytes(payload[40..44].try_into().unwrap());
    assert_eq!(mode, 0o600);
    let attr = regular_attr(102, 0);
    push_response(&harness.instance, &entry_response(mknod.unique, 102, 60, &attr));

    let (open, payload) = pull_request(&harness.instance);
    assert_eq!(open.opcode, Opcode::Open as u32);
    assert_eq!(open.nodeid, 102);
    let flags = u32::from_le_bytes(payload[40..44].try_into().unwrap());
    assert_eq!(flags, libc::O_WRONLY as u32);
    push_response(&harness.instance, &open_response(open.unique, 9090));

    let responses = harness.host.take_responses();
    assert_eq!(responses[0].status, Status::Success);
    assert_eq!(responses[0].hint, 0x8000);
}

#[test]
fn batched_forget_drains_in_capacity_chunks() {
    let harness = harness();
    complete_init(&harness, 29);

    let per_message = (REQ_SIZEMIN - REQ_HEADER_SIZE - BATCH_FORGET_IN_SIZE) / FORGET_ONE_SIZE;
    let total = per_message + 11;
    for i in 0..total {
        let name = format!("entry-{i}");
        seed_cache_entry(&harness, 1, name.as_bytes(), 100 + i as u64, 1);
    }
    harness
        .instance
        .expiration_routine(Instant::now() + Duration::from_secs(10));
    assert_eq!(harness.instance.cache().entry_count(), 0);

    let (first, payload) = pull_request(&harness.instance);
    assert_eq!(first.opcode, Opcode::BatchForget as u32);
    let count = u32::from_le_bytes(payload[40..44].try_into().unwrap());
    assert_eq!(count as usize, per_message);

    let (second, payload) = pull_request(&harness.instance);
    assert_eq!(second.opcode, Opcode::BatchForget as u32);
    let count = u32::from_le_bytes(payload[40..44].try_into().unwrap());
    assert_eq!(count as usize, 11);

    // Queue drained; nothing further is produced.
    pull_nothing(&harness.instance);
    assert_eq!(harness.instance.ioq().pending_count(), 0);
}

#[test]
fn old_daemons_get_single_forgets() {
    let harness = harness();
    complete_init(&harness, 15);

    for (i, name) in [b"a".as_slice(), b"b", b"c"].into_iter().enumerate() {
        seed_cache_entry(&harness, 1, name, 200 + i as u64, 1);
    }
    harness
        .instance
        .expiration_routine(Instant::now() + Duration::from_secs(10));

    let mut forgotten = Vec::new();
    for _ in 0..3 {
        let (header, _) = pull_request(&harness.instance);
        assert_eq!(header.opcode, Opcode::Forget as u32);
        forgotten.push(header.nodeid);
    }
    forgotten.sort_unstable();
    assert_eq!(forgotten, vec![200, 201, 202]);
    pull_nothing(&harness.instance);
}

#[test]
fn spurious_response_is_ignored_and_request_half_still_runs() {
    let harness = harness();
    complete_init(&harness, 29);

    harness.host.queue_request(lookup_request(0x9000, 1, b"x"));
    let spurious = error_response(0xdead_beef, 0);
    let mut out = vec![0u8; REQ_SIZEMIN];
    let information = harness
        .instance
        .transact(Transact::new(&spurious, &mut out))
        .unwrap();
    assert_ne!(information, 0, "the request half must still emit");
    let header = fuse_bridge::proto::RequestHeader::parse(&out).unwrap();
    assert_eq!(header.opcode, Opcode::Lookup as u32);
    assert_eq!(harness.instance.ioq().processing_count(), 1);
}

#[test]
fn oversized_name_short_circuits_to_early_failure() {
    let harness = harness();
    complete_init(&harness, 29);

    let name: &'static [u8] = Box::leak(vec![b'a'; REQ_SIZEMIN].into_boxed_slice());
    harness.host.queue_request(lookup_request(0xa000, 1, name));

    pull_nothing(&harness.instance);
    let responses = harness.host.take_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, Status::ObjectNameInvalid);
    assert_eq!(responses[0].kind, Some(RequestKind::Lookup));
    assert_eq!(responses[0].hint, 0xa000);
    assert_eq!(harness.instance.ioq().processing_count(), 0);
}

#[test]
fn transport_error_surfaces_from_transact() {
    let harness = harness();
    complete_init(&harness, 29);

    harness.host.queue_request(lookup_request(0xb000, 1, b"t"));
    let (header, _) = pull_request(&harness.instance);

    harness.host.fail_next(Status::IoDeviceError);
    let attr = regular_attr(7, 1);
    let response = entry_response(header.unique, 7, 60, &attr);
    assert_eq!(
        harness.instance.transact(Transact::new(&response, &mut [])),
        Err(Status::IoDeviceError)
    );
    // The context was destroyed despite the transport failure.
    assert_eq!(harness.instance.ioq().processing_count(), 0);
    assert_eq!(harness.instance.ioq().pending_count(), 0);
}

#[test]
fn output_buffer_boundaries() {
    let harness = harness();
    let mut small = vec![0u8; REQ_SIZEMIN - 1];
    assert_eq!(
        harness.instance.transact(Transact::new(&[], &mut small)),
        Err(Status::BufferTooSmall)
    );
    // Exactly the minimum is accepted (and emits the INIT request).
    let mut exact = vec![0u8; REQ_SIZEMIN];
    let information = harness
        .instance
        .transact(Transact::new(&[], &mut exact))
        .unwrap();
    assert_ne!(information, 0);
}

#[test]
fn response_length_boundaries() {
    let harness = harness();

    // A header-only response (len == 16) is valid; unknown unique, no-op.
    let ok = error_response(0xffff, 0);
    assert_eq!(harness.instance.transact(Transact::new(&ok, &mut [])), Ok(0));

    // Shorter than a header.
    let short = vec![0u8; 15];
    assert_eq!(
        harness.instance.transact(Transact::new(&short, &mut [])),
        Err(Status::InvalidParameter)
    );

    // len field below the header size.
    let mut bad_len = error_response(0xffff, 0);
    bad_len[0] = 8;
    assert_eq!(
        harness.instance.transact(Transact::new(&bad_len, &mut [])),
        Err(Status::InvalidParameter)
    );

    // len field larger than the buffer.
    let mut too_long = error_response(0xffff, 0);
    too_long[0] = 17;
    assert_eq!(
        harness.instance.transact(Transact::new(&too_long, &mut [])),
        Err(Status::InvalidParameter)
    );
}

#[test]
fn fini_drains_in_flight_contexts() {
    let harness = harness();
    complete_init(&harness, 29);

    harness.host.queue_request(lookup_request(0xc000, 1, b"q"));
    pull_request(&harness.instance);
    assert_eq!(harness.instance.ioq().processing_count(), 1);

    let Harness { instance, .. } = harness;
    instance.fini();
}
