//! Stateless builders for outgoing requests.
//!
//! Each `fill_*` routine writes one complete request (header + payload) into
//! the front of a caller-supplied buffer and returns the total length it
//! wrote. The correlation ID is stamped from the caller's ticket; nothing
//! here allocates or keeps state.
//!
//! Size enforcement is split deliberately: the transact loop guarantees the
//! buffer is at least [`REQ_SIZEMIN`] long, and context construction
//! guarantees names fit, so the builders only `debug_assert` those bounds.

use bytes::BufMut;

use super::{
    BATCH_FORGET_IN_SIZE, CREATE_IN_SIZE, FORGET_IN_SIZE, FORGET_ONE_SIZE, GETATTR_IN_SIZE,
    INIT_IN_SIZE, KERNEL_MINOR_VERSION, KERNEL_VERSION, MKNOD_IN_SIZE, OPEN_IN_SIZE, Opcode,
    Origin, REQ_HEADER_SIZE, REQ_SIZEMIN,
};

fn put_header(buf: &mut &mut [u8], len: u32, opcode: Opcode, unique: u64, nodeid: u64, origin: Origin) {
    buf.put_u32_le(len);
    buf.put_u32_le(opcode as u32);
    buf.put_u64_le(unique);
    buf.put_u64_le(nodeid);
    buf.put_u32_le(origin.uid);
    buf.put_u32_le(origin.gid);
    buf.put_u32_le(origin.pid);
    buf.put_u32_le(0); // padding
}

/// Fill an `INIT` request. Readahead and capability flags are sent as zero;
/// this side negotiates versions only.
pub fn fill_init(buf: &mut [u8], unique: u64) -> usize {
    debug_assert!(buf.len() >= REQ_SIZEMIN);
    let len = REQ_HEADER_SIZE + INIT_IN_SIZE;
    let mut b = &mut buf[..len];
    put_header(&mut b, len as u32, Opcode::Init, unique, 0, Origin::default());
    b.put_u32_le(KERNEL_VERSION);
    b.put_u32_le(KERNEL_MINOR_VERSION);
    b.put_u32_le(0); // max_readahead
    b.put_u32_le(0); // flags
    len
}

/// Fill a `LOOKUP` request for `name` under `parent`. The name is
/// NUL-terminated on the wire.
pub fn fill_lookup(buf: &mut [u8], unique: u64, parent: u64, name: &[u8], origin: Origin) -> usize {
    let len = REQ_HEADER_SIZE + name.len() + 1;
    debug_assert!(len <= REQ_SIZEMIN);
    debug_assert!(buf.len() >= REQ_SIZEMIN);
    let mut b = &mut buf[..len];
    put_header(&mut b, len as u32, Opcode::Lookup, unique, parent, origin);
    b.put_slice(name);
    b.put_u8(0);
    len
}

/// Fill a `GETATTR` request for `ino`.
pub fn fill_getattr(buf: &mut [u8], unique: u64, ino: u64, origin: Origin) -> usize {
    debug_assert!(buf.len() >= REQ_SIZEMIN);
    let len = REQ_HEADER_SIZE + GETATTR_IN_SIZE;
    let mut b = &mut buf[..len];
    put_header(&mut b, len as u32, Opcode::Getattr, unique, ino, origin);
    b.put_u32_le(0); // getattr_flags
    b.put_u32_le(0); // dummy
    b.put_u64_le(0); // fh
    len
}

/// Fill an `OPEN` request for `ino` with the given open flags.
pub fn fill_open(buf: &mut [u8], unique: u64, ino: u64, flags: u32, origin: Origin) -> usize {
    fill_open_common(buf, Opcode::Open, unique, ino, flags, origin)
}

/// Fill an `OPENDIR` request for `ino`.
pub fn fill_opendir(buf: &mut [u8], unique: u64, ino: u64, origin: Origin) -> usize {
    fill_open_common(buf, Opcode::Opendir, unique, ino, 0, origin)
}

fn fill_open_common(
    buf: &mut [u8],
    opcode: Opcode,
    unique: u64,
    ino: u64,
    flags: u32,
    origin: Origin,
) -> usize {
    debug_assert!(buf.len() >= REQ_SIZEMIN);
    let len = REQ_HEADER_SIZE + OPEN_IN_SIZE;
    let mut b = &mut buf[..len];
    put_header(&mut b, len as u32, opcode, unique, ino, origin);
    b.put_u32_le(flags);
    b.put_u32_le(0); // unused
    len
}

/// Fill a `FORGET` request dropping one reference on `ino`.
pub fn fill_forget(buf: &mut [u8], unique: u64, ino: u64) -> usize {
    debug_assert!(buf.len() >= REQ_SIZEMIN);
    let len = REQ_HEADER_SIZE + FORGET_IN_SIZE;
    let mut b = &mut buf[..len];
    put_header(&mut b, len as u32, Opcode::Forget, unique, ino, Origin::default());
    b.put_u64_le(1); // nlookup
    len
}

/// Fill a `BATCH_FORGET` request, drawing inodes from `next` until the
/// message is full or the source is dry. Never consumes an inode it cannot
/// fit. Returns the written length and the packed tuple count.
pub fn fill_batch_forget(
    buf: &mut [u8],
    unique: u64,
    mut next: impl FnMut() -> Option<u64>,
) -> (usize, u32) {
    let budget = buf.len().min(REQ_SIZEMIN);
    let fixed = REQ_HEADER_SIZE + BATCH_FORGET_IN_SIZE;
    debug_assert!(budget >= fixed + FORGET_ONE_SIZE);
    let capacity = (budget - fixed) / FORGET_ONE_SIZE;

    let mut count = 0usize;
    {
        let mut b = &mut buf[fixed..budget];
        while count < capacity {
            let Some(ino) = next() else { break };
            b.put_u64_le(ino);
            b.put_u64_le(1); // nlookup
            count += 1;
        }
    }

    let len = fixed + count * FORGET_ONE_SIZE;
    let mut b = &mut buf[..fixed];
    put_header(
        &mut b,
        len as u32,
        Opcode::BatchForget,
        unique,
        0,
        Origin::default(),
    );
    b.put_u32_le(count as u32);
    b.put_u32_le(0); // dummy
    (len, count as u32)
}

/// Fill a `CREATE` request for `name` under `parent`.
pub fn fill_create(
    buf: &mut [u8],
    unique: u64,
    parent: u64,
    name: &[u8],
    flags: u32,
    mode: u32,
    umask: u32,
    origin: Origin,
) -> usize {
    let len = REQ_HEADER_SIZE + CREATE_IN_SIZE + name.len() + 1;
    debug_assert!(len <= REQ_SIZEMIN);
    debug_assert!(buf.len() >= REQ_SIZEMIN);
    let mut b = &mut buf[..len];
    put_header(&mut b, len as u32, Opcode::Create, unique, parent, origin);
    b.put_u32_le(flags);
    b.put_u32_le(mode);
    b.put_u32_le(umask);
    b.put_u32_le(0); // open_flags
    b.put_slice(name);
    b.put_u8(0);
    len
}

/// Fill a `MKNOD` request for `name` under `parent`.
pub fn fill_mknod(
    buf: &mut [u8],
    unique: u64,
    parent: u64,
    name: &[u8],
    mode: u32,
    umask: u32,
    origin: Origin,
) -> usize {
    let len = REQ_HEADER_SIZE + MKNOD_IN_SIZE + name.len() + 1;
    debug_assert!(len <= REQ_SIZEMIN);
    debug_assert!(buf.len() >= REQ_SIZEMIN);
    let mut b = &mut buf[..len];
    put_header(&mut b, len as u32, Opcode::Mknod, unique, parent, origin);
    b.put_u32_le(mode);
    b.put_u32_le(0); // rdev
    b.put_u32_le(umask);
    b.put_u32_le(0); // padding
    b.put_slice(name);
    b.put_u8(0);
    len
}
