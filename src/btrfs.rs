//! btrfs ioctl bindings
//!
//! the clone and sync ioctls exist on any btrfs; the transaction-bracket
//! pair and the user-transaction vector ioctl only on kernels carrying the
//! corresponding patches. callers probe at mount and fall back to plain
//! POSIX when an ioctl is absent (ENOTTY).

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::{ioctl_none, ioctl_write_int_bad, ioctl_write_ptr, request_code_write};

pub const BTRFS_IOCTL_MAGIC: u8 = 0x94;

// op vector opcodes understood by the user-transaction ioctl
pub const UT_OP_OPEN: u32 = 1;
pub const UT_OP_CLOSE: u32 = 2;
pub const UT_OP_PWRITE: u32 = 3;
pub const UT_OP_UNLINK: u32 = 4;
pub const UT_OP_LINK: u32 = 5;
pub const UT_OP_MKDIR: u32 = 6;
pub const UT_OP_RMDIR: u32 = 7;
pub const UT_OP_TRUNCATE: u32 = 8;
pub const UT_OP_SETXATTR: u32 = 9;
pub const UT_OP_REMOVEXATTR: u32 = 10;
pub const UT_OP_CLONERANGE: u32 = 11;

// op record flag bits
pub const UT_FLAG_FD_SAVE: u32 = 1 << 0;
pub const UT_FLAG_FD_ARG0: u32 = 1 << 1;
pub const UT_FLAG_FD_ARG1: u32 = 1 << 2;
pub const UT_FLAG_FD_ARG2: u32 = 1 << 3;
pub const UT_FLAG_FD_ARG3: u32 = 1 << 4;
pub const UT_FLAG_FD_ARG4: u32 = 1 << 5;

/// one record in the user-transaction op vector
///
/// `args` meanings depend on `op`; any arg slot may instead name an entry
/// in the call's fd table via the FD_ARG bits, and OPEN stores its result
/// fd into slot `fd_num` when FD_SAVE is set. pointers in `args` must stay
/// valid until the ioctl returns.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UsertransOp {
    pub op: u32,
    pub flags: u32,
    pub fd_num: u32,
    pub args: [u64; 5],
}

/// header handed to the user-transaction ioctl
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UsertransArgs {
    pub num_ops: u64,
    pub num_fds: u64,
    pub metadata_ops: u64,
    pub data_bytes: u64,
    pub ops_ptr: u64,
    pub flags: u64,
    pub ops_completed: u64,
}

ioctl_write_int_bad!(
    ioc_clone,
    request_code_write!(
        BTRFS_IOCTL_MAGIC,
        9,
        std::mem::size_of::<std::os::raw::c_int>()
    )
);

/// range-clone argument block
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CloneRangeArgs {
    pub src_fd: i64,
    pub src_offset: u64,
    pub src_length: u64,
    pub dest_offset: u64,
}

ioctl_write_ptr!(ioc_clone_range, BTRFS_IOCTL_MAGIC, 13, CloneRangeArgs);
ioctl_none!(ioc_trans_start, BTRFS_IOCTL_MAGIC, 6);
ioctl_none!(ioc_trans_end, BTRFS_IOCTL_MAGIC, 7);
ioctl_none!(ioc_sync, BTRFS_IOCTL_MAGIC, 8);
ioctl_write_ptr!(ioc_usertrans, BTRFS_IOCTL_MAGIC, 16, UsertransArgs);

/// clone the whole of `src_fd` over `dst_fd`
pub fn clone(dst_fd: RawFd, src_fd: RawFd) -> Result<(), Errno> {
    unsafe { ioc_clone(dst_fd, src_fd) }.map(drop)
}

/// clone `len` bytes at `offset` of `src_fd` to the same offset of `dst_fd`
pub fn clone_range(dst_fd: RawFd, src_fd: RawFd, offset: u64, len: u64) -> Result<(), Errno> {
    let args = CloneRangeArgs {
        src_fd: src_fd as i64,
        src_offset: offset,
        src_length: len,
        dest_offset: offset,
    };
    unsafe { ioc_clone_range(dst_fd, &args) }.map(drop)
}

pub fn trans_start(fd: RawFd) -> Result<(), Errno> {
    unsafe { ioc_trans_start(fd) }.map(drop)
}

pub fn trans_end(fd: RawFd) -> Result<(), Errno> {
    unsafe { ioc_trans_end(fd) }.map(drop)
}

/// filesystem-wide commit of the volume holding `fd`
pub fn sync_fs(fd: RawFd) -> Result<(), Errno> {
    unsafe { ioc_sync(fd) }.map(drop)
}

/// apply a vector of ops as one kernel transaction
///
/// # Safety
/// every pointer reachable from `args` (the op vector and any path, name
/// or buffer address inside it) must be valid for the duration of the call.
pub unsafe fn usertrans(fd: RawFd, args: &mut UsertransArgs) -> Result<(), Errno> {
    ioc_usertrans(fd, args).map(drop)
}
