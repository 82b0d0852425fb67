//! The FUSE wire protocol: constants, message layouts, and parsers.
//!
//! Everything on the wire is little-endian. A request is a 40-byte header
//! followed by an opcode-specific payload; a response is a 16-byte header
//! followed by its payload. This module knows the *shape* of messages; the
//! stateless per-opcode builders live in [`codec`].

pub mod codec;

use bytes::Buf;

/// Protocol major version spoken by this side.
pub const KERNEL_VERSION: u32 = 7;
/// Protocol minor version spoken by this side.
pub const KERNEL_MINOR_VERSION: u32 = 29;

/// Size of the request header: `(len, opcode, unique, nodeid, uid, gid, pid, padding)`.
pub const REQ_HEADER_SIZE: usize = 40;
/// Size of the response header: `(len, error, unique)`.
pub const RSP_HEADER_SIZE: usize = 16;
/// Minimum size of a request buffer. Every request the engine emits fits in
/// this many bytes, and the host must never offer less.
pub const REQ_SIZEMIN: usize = 8192;

/// First protocol minor version that understands `BATCH_FORGET`.
pub const BATCH_FORGET_MINOR_VERSION: u32 = 16;

/// The root inode number.
pub const ROOT_ID: u64 = 1;

/// Size of a serialized [`FuseAttr`].
pub const ATTR_SIZE: usize = 88;
/// Size of a serialized [`EntryOut`].
pub const ENTRY_OUT_SIZE: usize = 40 + ATTR_SIZE;
/// Size of a serialized [`AttrOut`].
pub const ATTR_OUT_SIZE: usize = 16 + ATTR_SIZE;
/// Size of a serialized [`OpenOut`].
pub const OPEN_OUT_SIZE: usize = 16;
/// Size of the `init` request payload.
pub const INIT_IN_SIZE: usize = 16;
/// Size of the `getattr` request payload.
pub const GETATTR_IN_SIZE: usize = 16;
/// Size of the `open`/`opendir` request payload.
pub const OPEN_IN_SIZE: usize = 8;
/// Size of the fixed part of the `create` request payload.
pub const CREATE_IN_SIZE: usize = 16;
/// Size of the fixed part of the `mknod` request payload.
pub const MKNOD_IN_SIZE: usize = 16;
/// Size of the `forget` request payload.
pub const FORGET_IN_SIZE: usize = 8;
/// Size of the fixed part of the `batch_forget` request payload.
pub const BATCH_FORGET_IN_SIZE: usize = 8;
/// Size of one `(nodeid, nlookup)` tuple in a `batch_forget` payload.
pub const FORGET_ONE_SIZE: usize = 16;

/// The protocol opcodes this core speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    /// Resolve a name under a parent inode.
    Lookup = 1,
    /// Drop a kernel reference on an inode. No reply.
    Forget = 2,
    /// Fetch attributes for an inode.
    Getattr = 3,
    /// Create a filesystem node (fallback when `Create` is unsupported).
    Mknod = 8,
    /// Open a regular file.
    Open = 14,
    /// Protocol handshake.
    Init = 26,
    /// Open a directory.
    Opendir = 27,
    /// Atomically create and open a regular file.
    Create = 35,
    /// Drop kernel references on many inodes at once. No reply.
    BatchForget = 42,
}

/// An opcode value that this core does not speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownOpcode(pub u32);

impl TryFrom<u32> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(raw: u32) -> Result<Self, UnknownOpcode> {
        match raw {
            1 => Ok(Opcode::Lookup),
            2 => Ok(Opcode::Forget),
            3 => Ok(Opcode::Getattr),
            8 => Ok(Opcode::Mknod),
            14 => Ok(Opcode::Open),
            26 => Ok(Opcode::Init),
            27 => Ok(Opcode::Opendir),
            35 => Ok(Opcode::Create),
            42 => Ok(Opcode::BatchForget),
            other => Err(UnknownOpcode(other)),
        }
    }
}

/// Credentials of the thread that originated an operation, stamped into
/// every request header. Self-generated operations use the zero origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Origin {
    /// Originating user.
    pub uid: u32,
    /// Originating group.
    pub gid: u32,
    /// Originating process.
    pub pid: u32,
}

/// POSIX attributes as the daemon reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FuseAttr {
    /// Inode number.
    pub ino: u64,
    /// File size in bytes.
    pub size: u64,
    /// Allocated 512-byte blocks.
    pub blocks: u64,
    /// Access time, seconds since the epoch.
    pub atime: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: u64,
    /// Status-change time, seconds since the epoch.
    pub ctime: u64,
    /// Access time, nanosecond remainder.
    pub atimensec: u32,
    /// Modification time, nanosecond remainder.
    pub mtimensec: u32,
    /// Status-change time, nanosecond remainder.
    pub ctimensec: u32,
    /// File mode, including the type bits.
    pub mode: u32,
    /// Hard link count.
    pub nlink: u32,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Device number for special files.
    pub rdev: u32,
    /// Preferred I/O block size.
    pub blksize: u32,
}

/// Parsed request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Total message length, header included.
    pub len: u32,
    /// Raw opcode value.
    pub opcode: u32,
    /// Correlation ID matching the eventual response.
    pub unique: u64,
    /// Inode the operation targets.
    pub nodeid: u64,
    /// Originating user.
    pub uid: u32,
    /// Originating group.
    pub gid: u32,
    /// Originating process.
    pub pid: u32,
}

/// Parsed response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Total message length, header included.
    pub len: u32,
    /// Negative errno, or zero on success.
    pub error: i32,
    /// Correlation ID of the request this answers.
    pub unique: u64,
}

/// Parsed `init` response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOut {
    /// Daemon's major protocol version.
    pub major: u32,
    /// Daemon's minor protocol version.
    pub minor: u32,
}

/// Parsed `entry` response payload (lookup, create, mknod).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOut {
    /// Resolved inode number.
    pub nodeid: u64,
    /// Daemon-side inode generation.
    pub generation: u64,
    /// Seconds the name→inode binding stays valid.
    pub entry_valid: u64,
    /// Seconds the attributes stay valid.
    pub attr_valid: u64,
    /// Nanosecond remainder of `entry_valid`.
    pub entry_valid_nsec: u32,
    /// Nanosecond remainder of `attr_valid`.
    pub attr_valid_nsec: u32,
    /// Attributes of the resolved inode.
    pub attr: FuseAttr,
}

/// Parsed `attr` response payload (getattr).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrOut {
    /// Seconds the attributes stay valid.
    pub attr_valid: u64,
    /// Nanosecond remainder of `attr_valid`.
    pub attr_valid_nsec: u32,
    /// The attributes.
    pub attr: FuseAttr,
}

/// Parsed `open` response payload (open, opendir, create).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOut {
    /// Daemon-side file handle.
    pub fh: u64,
    /// Daemon open flags (`FOPEN_*`).
    pub open_flags: u32,
}

impl RequestHeader {
    /// Parse a request header from the front of `buf`.
    ///
    /// Returns `None` if `buf` is shorter than [`REQ_HEADER_SIZE`].
    #[must_use]
    pub fn parse(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < REQ_HEADER_SIZE {
            return None;
        }
        let header = RequestHeader {
            len: buf.get_u32_le(),
            opcode: buf.get_u32_le(),
            unique: buf.get_u64_le(),
            nodeid: buf.get_u64_le(),
            uid: buf.get_u32_le(),
            gid: buf.get_u32_le(),
            pid: buf.get_u32_le(),
        };
        Some(header)
    }
}

impl ResponseHeader {
    /// Parse a response header from the front of `buf`.
    ///
    /// Returns `None` if `buf` is shorter than [`RSP_HEADER_SIZE`].
    #[must_use]
    pub fn parse(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < RSP_HEADER_SIZE {
            return None;
        }
        Some(ResponseHeader {
            len: buf.get_u32_le(),
            error: buf.get_i32_le(),
            unique: buf.get_u64_le(),
        })
    }
}

fn get_attr(buf: &mut &[u8]) -> FuseAttr {
    let attr = FuseAttr {
        ino: buf.get_u64_le(),
        size: buf.get_u64_le(),
        blocks: buf.get_u64_le(),
        atime: buf.get_u64_le(),
        mtime: buf.get_u64_le(),
        ctime: buf.get_u64_le(),
        atimensec: buf.get_u32_le(),
        mtimensec: buf.get_u32_le(),
        ctimensec: buf.get_u32_le(),
        mode: buf.get_u32_le(),
        nlink: buf.get_u32_le(),
        uid: buf.get_u32_le(),
        gid: buf.get_u32_le(),
        rdev: buf.get_u32_le(),
        blksize: buf.get_u32_le(),
    };
    buf.advance(4); // padding
    attr
}

impl InitOut {
    /// Parse an `init` response payload. Only the version pair is consumed;
    /// trailing negotiation fields from newer daemons are ignored.
    #[must_use]
    pub fn parse(mut payload: &[u8]) -> Option<Self> {
        if payload.len() < 8 {
            return None;
        }
        Some(InitOut {
            major: payload.get_u32_le(),
            minor: payload.get_u32_le(),
        })
    }
}

impl EntryOut {
    /// Parse an `entry` response payload.
    #[must_use]
    pub fn parse(mut payload: &[u8]) -> Option<Self> {
        if payload.len() < ENTRY_OUT_SIZE {
            return None;
        }
        Some(EntryOut {
            nodeid: payload.get_u64_le(),
            generation: payload.get_u64_le(),
            entry_valid: payload.get_u64_le(),
            attr_valid: payload.get_u64_le(),
            entry_valid_nsec: payload.get_u32_le(),
            attr_valid_nsec: payload.get_u32_le(),
            attr: get_attr(&mut payload),
        })
    }
}

impl AttrOut {
    /// Parse an `attr` response payload.
    #[must_use]
    pub fn parse(mut payload: &[u8]) -> Option<Self> {
        if payload.len() < ATTR_OUT_SIZE {
            return None;
        }
        let attr_valid = payload.get_u64_le();
        let attr_valid_nsec = payload.get_u32_le();
        payload.advance(4); // dummy
        Some(AttrOut {
            attr_valid,
            attr_valid_nsec,
            attr: get_attr(&mut payload),
        })
    }
}

impl OpenOut {
    /// Parse an `open` response payload.
    #[must_use]
    pub fn parse(mut payload: &[u8]) -> Option<Self> {
        if payload.len() < OPEN_OUT_SIZE {
            return None;
        }
        Some(OpenOut {
            fh: payload.get_u64_le(),
            open_flags: payload.get_u32_le(),
        })
    }
}
