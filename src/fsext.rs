//! Types shared with the host filesystem framework.
//!
//! The host framework (the "fsext provider" side of the kernel) hands the
//! engine *internal requests* and consumes *internal responses*; both are
//! distinct from the FUSE wire messages the daemon sees. This module defines
//! those records, the volume parameter block, the transact packet, and the
//! attribute mapping between the two worlds.

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::proto::{FuseAttr, Origin};
use crate::status::Status;
use crate::sync::CancelToken;

bitflags! {
    /// Host-side file attribute bits carried in [`FileInfo`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileAttributes: u32 {
        /// The file is a directory.
        const DIRECTORY = 0x0000_0010;
        /// The file is a reparse point; [`FileInfo::reparse_tag`] says which kind.
        const REPARSE_POINT = 0x0000_0400;
    }
}

bitflags! {
    /// Access rights the host framework granted to an operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessMask: u32 {
        /// Read file data.
        const READ_DATA = 0x0000_0001;
        /// Write file data.
        const WRITE_DATA = 0x0000_0002;
    }
}

/// Reparse tag for special files surfaced through NFS-style reparse points.
pub const IO_REPARSE_TAG_NFS: u32 = 0x8000_0014;
/// Reparse tag for symbolic links.
pub const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

/// Major function code a transact packet must carry.
pub const FILE_SYSTEM_CONTROL: u8 = 13;
/// Minor function code a transact packet must carry.
pub const USER_FS_REQUEST: u8 = 0;
/// The device control code for the transact channel. The low two bits are
/// zero: buffered I/O.
pub const FUSE_FSCTL_TRANSACT: u32 = (0x9 << 16) | (0x800 << 2);

/// Volume parameters, fixed at instance init.
///
/// Deserializable so hosts can carry them in configuration; fields the
/// bridge depends on are overwritten by [`VolumeParams::normalize`]
/// regardless of what the host asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeParams {
    /// Sector size in bytes.
    pub sector_size: u16,
    /// Allocation unit, in sectors.
    pub sectors_per_allocation_unit: u16,
    /// Name lookups distinguish case.
    pub case_sensitive_search: bool,
    /// Names keep the case they were created with.
    pub case_preserved_names: bool,
    /// ACLs persist across mounts.
    pub persistent_acls: bool,
    /// Reparse points are surfaced.
    pub reparse_points: bool,
    /// Reparse point traversal is access-checked.
    pub reparse_points_access_check: bool,
    /// Named streams are supported.
    pub named_streams: bool,
    /// The volume rejects writes.
    pub read_only_volume: bool,
    /// Cleanup is posted only for modified files.
    pub post_cleanup_when_modified_only: bool,
    /// Directory queries carry the file name.
    pub pass_query_directory_file_name: bool,
    /// Device control requests are passed through.
    pub device_control: bool,
    /// Directory markers are interpreted as next-entry offsets.
    pub directory_marker_as_next_offset: bool,
}

impl Default for VolumeParams {
    fn default() -> Self {
        VolumeParams {
            sector_size: 512,
            sectors_per_allocation_unit: 1,
            case_sensitive_search: true,
            case_preserved_names: true,
            persistent_acls: true,
            reparse_points: true,
            reparse_points_access_check: false,
            named_streams: false,
            read_only_volume: false,
            post_cleanup_when_modified_only: true,
            pass_query_directory_file_name: true,
            device_control: true,
            directory_marker_as_next_offset: true,
        }
    }
}

impl VolumeParams {
    /// Force the fields the bridge depends on, leaving sector geometry alone
    /// (except that zero geometry is corrected so allocation rounding stays
    /// well-defined).
    pub fn normalize(&mut self) {
        self.case_sensitive_search = true;
        self.case_preserved_names = true;
        self.persistent_acls = true;
        self.reparse_points = true;
        self.reparse_points_access_check = false;
        self.named_streams = false;
        self.read_only_volume = false;
        self.post_cleanup_when_modified_only = true;
        self.pass_query_directory_file_name = true;
        self.device_control = true;
        self.directory_marker_as_next_offset = true;
        if self.sector_size == 0 {
            self.sector_size = 512;
        }
        if self.sectors_per_allocation_unit == 0 {
            self.sectors_per_allocation_unit = 1;
        }
    }

    /// The allocation unit in bytes.
    #[must_use]
    pub fn allocation_unit(&self) -> u64 {
        u64::from(self.sector_size) * u64::from(self.sectors_per_allocation_unit)
    }
}

/// What an internal request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Resolve a name to an inode and its attributes.
    Lookup,
    /// Fetch attributes for a known inode.
    GetAttr,
    /// Open an existing file or directory by name.
    Open,
    /// Create and open a new regular file.
    Create,
}

/// Operation payload of an internal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOp {
    /// Resolve `name` under `parent`.
    Lookup {
        /// Parent inode.
        parent: u64,
        /// Child name, raw bytes as the host received them.
        name: Bytes,
    },
    /// Fetch attributes of `ino`.
    GetAttr {
        /// Target inode.
        ino: u64,
    },
    /// Open `name` under `parent` with the granted rights.
    Open {
        /// Parent inode.
        parent: u64,
        /// Child name.
        name: Bytes,
        /// Rights the host granted.
        granted_access: AccessMask,
    },
    /// Create `name` under `parent` and open it.
    Create {
        /// Parent inode.
        parent: u64,
        /// Child name.
        name: Bytes,
        /// File mode for the new node.
        mode: u32,
        /// Umask in effect for the creating process.
        umask: u32,
        /// Rights the host granted.
        granted_access: AccessMask,
    },
}

impl RequestOp {
    /// The kind tag matching this payload.
    #[must_use]
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestOp::Lookup { .. } => RequestKind::Lookup,
            RequestOp::GetAttr { .. } => RequestKind::GetAttr,
            RequestOp::Open { .. } => RequestKind::Open,
            RequestOp::Create { .. } => RequestKind::Create,
        }
    }
}

/// An operation admitted from the host framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalRequest {
    /// Opaque completion cookie; echoed verbatim in the response.
    pub hint: u64,
    /// Credentials of the originating thread.
    pub origin: Origin,
    /// What to do.
    pub op: RequestOp,
}

/// A completion delivered back to the host framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalResponse {
    /// Kind of the request this answers; `None` for self-generated
    /// operations, whose `hint` carries the wire opcode instead.
    pub kind: Option<RequestKind>,
    /// The request's completion cookie.
    pub hint: u64,
    /// Final status of the operation.
    pub status: Status,
    /// Mapped file information, when the operation produced attributes.
    pub file_info: Option<FileInfo>,
    /// File-object id registered in the file table, for open-style operations.
    pub file_id: Option<u64>,
}

impl InternalResponse {
    /// A response answering `request` with `status` and no payload.
    #[must_use]
    pub fn from_status(request: &InternalRequest, status: Status) -> Self {
        InternalResponse {
            kind: Some(request.op.kind()),
            hint: request.hint,
            status,
            file_info: None,
            file_id: None,
        }
    }
}

/// Host-side file information, the target of the attribute mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileInfo {
    /// Attribute bits.
    pub file_attributes: FileAttributes,
    /// Reparse tag, zero when not a reparse point.
    pub reparse_tag: u32,
    /// File size in bytes.
    pub file_size: u64,
    /// Size rounded up to the volume's allocation unit.
    pub allocation_size: u64,
    /// Creation time, host file time.
    pub creation_time: u64,
    /// Last access time, host file time.
    pub last_access_time: u64,
    /// Last write time, host file time.
    pub last_write_time: u64,
    /// Change time, host file time.
    pub change_time: u64,
    /// Inode number.
    pub index_number: u64,
    /// Hard link count; unreported, always zero.
    pub hard_links: u32,
    /// Extended attribute size; unreported, always zero.
    pub ea_size: u32,
}

/// The two calls the engine makes back into the host framework. These are
/// the forward- and pull-forms of the host's provider transact entry.
pub trait HostBridge: Send + Sync {
    /// Deliver a completed internal response upward.
    ///
    /// # Errors
    ///
    /// A transport failure; surfaced verbatim from the transact call.
    fn forward_response(&self, response: InternalResponse) -> Result<(), Status>;

    /// Pull the next internal request, if the host has one ready.
    ///
    /// # Errors
    ///
    /// A transport failure; surfaced verbatim from the transact call.
    fn next_request(&self) -> Result<Option<InternalRequest>, Status>;
}

/// One buffered transact exchange: at most one FUSE response in, at most one
/// FUSE request out.
#[derive(Debug)]
pub struct Transact<'a> {
    /// Major function code; must be [`FILE_SYSTEM_CONTROL`].
    pub major_function: u8,
    /// Minor function code; must be [`USER_FS_REQUEST`].
    pub minor_function: u8,
    /// Device control code; must be [`FUSE_FSCTL_TRANSACT`].
    pub fs_control_code: u32,
    /// FUSE response from the daemon; empty means none.
    pub input: &'a [u8],
    /// Receives the next FUSE request; empty means the caller wants none.
    pub output: &'a mut [u8],
    /// Cancellation source for the packet.
    pub cancel: CancelToken,
}

impl<'a> Transact<'a> {
    /// A well-formed transact packet over the given buffers.
    pub fn new(input: &'a [u8], output: &'a mut [u8]) -> Self {
        Transact {
            major_function: FILE_SYSTEM_CONTROL,
            minor_function: USER_FS_REQUEST,
            fs_control_code: FUSE_FSCTL_TRANSACT,
            input,
            output,
            cancel: CancelToken::new(),
        }
    }

    /// As [`Transact::new`], with an externally owned cancel token.
    pub fn with_cancel(input: &'a [u8], output: &'a mut [u8], cancel: CancelToken) -> Self {
        Transact {
            cancel,
            ..Transact::new(input, output)
        }
    }
}

/// Seconds between the Windows and Unix epochs, in 100ns host file time units.
const UNIX_EPOCH_AS_FILE_TIME: u64 = 116_444_736_000_000_000;

/// Convert a Unix `(seconds, nanoseconds)` timestamp to host file time
/// (100ns intervals since 1601-01-01).
#[must_use]
pub fn unix_time_to_file_time(sec: u64, nsec: u32) -> u64 {
    sec * 10_000_000 + u64::from(nsec) / 100 + UNIX_EPOCH_AS_FILE_TIME
}

/// Map POSIX attributes onto host file information.
///
/// Directories become the directory attribute; FIFOs, sockets, and device
/// nodes become NFS-tagged reparse points; symlinks become symlink-tagged
/// reparse points. A symlink whose target is a directory should also carry
/// the directory bit, but the target type is not known here; known gap.
/// The change time doubles as the creation time because POSIX has no birth
/// time.
#[must_use]
pub fn attr_to_file_info(attr: &FuseAttr, volume_params: &VolumeParams) -> FileInfo {
    let allocation_unit = volume_params.allocation_unit();

    let (file_attributes, reparse_tag) = match attr.mode & (libc::S_IFMT as u32) {
        m if m == libc::S_IFDIR as u32 => (FileAttributes::DIRECTORY, 0),
        m if m == libc::S_IFIFO as u32
            || m == libc::S_IFCHR as u32
            || m == libc::S_IFBLK as u32
            || m == libc::S_IFSOCK as u32 =>
        {
            (FileAttributes::REPARSE_POINT, IO_REPARSE_TAG_NFS)
        }
        m if m == libc::S_IFLNK as u32 => (FileAttributes::REPARSE_POINT, IO_REPARSE_TAG_SYMLINK),
        _ => (FileAttributes::empty(), 0),
    };

    let change_time = unix_time_to_file_time(attr.ctime, attr.ctimensec);
    FileInfo {
        file_attributes,
        reparse_tag,
        file_size: attr.size,
        allocation_size: attr.size.div_ceil(allocation_unit) * allocation_unit,
        creation_time: change_time,
        last_access_time: unix_time_to_file_time(attr.atime, attr.atimensec),
        last_write_time: unix_time_to_file_time(attr.mtime, attr.mtimensec),
        change_time,
        index_number: attr.ino,
        hard_links: 0,
        ea_size: 0,
    }
}
