//! Syscall and path tables backing the named policy presets.

use chef_common::AccessMask;

/// Process exit, basic file I/O, stat/access, directory reads, memory,
/// time, signals, polling, ioctl, futex, fcntl: enough to run a static
/// binary that touches nothing it should not.
pub(crate) const MINIMAL_SYSCALLS: &[&str] = &[
    "exit",
    "exit_group",
    "read",
    "write",
    "readv",
    "writev",
    "pread64",
    "pwrite64",
    "open",
    "openat",
    "close",
    "lseek",
    "stat",
    "fstat",
    "lstat",
    "newfstatat",
    "statx",
    "access",
    "faccessat",
    "faccessat2",
    "getdents64",
    "getcwd",
    "chdir",
    "brk",
    "mmap",
    "munmap",
    "mprotect",
    "mremap",
    "madvise",
    "clock_gettime",
    "clock_getres",
    "clock_nanosleep",
    "gettimeofday",
    "nanosleep",
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "sigaltstack",
    "kill",
    "tgkill",
    "select",
    "pselect6",
    "poll",
    "ppoll",
    "epoll_create1",
    "epoll_ctl",
    "epoll_wait",
    "epoll_pwait",
    "ioctl",
    "futex",
    "fcntl",
    "dup",
    "dup3",
    "pipe2",
    "getpid",
    "gettid",
    "getuid",
    "geteuid",
    "getgid",
    "getegid",
    "arch_prctl",
    "set_tid_address",
    "set_robust_list",
    "rseq",
    "prlimit64",
    "getrandom",
];

/// Build adds process creation, IPC, filesystem mutation, xattrs,
/// capability get/set, mount/umount, statfs, and the sync family.
pub(crate) const BUILD_SYSCALLS: &[&str] = &[
    // process creation and reaping
    "fork",
    "vfork",
    "clone",
    "clone3",
    "execve",
    "execveat",
    "wait4",
    "waitid",
    "setsid",
    "setpgid",
    "prctl",
    // IPC
    "shmget",
    "shmat",
    "shmdt",
    "shmctl",
    "semget",
    "semop",
    "semctl",
    "msgget",
    "msgsnd",
    "msgrcv",
    "msgctl",
    "memfd_create",
    "eventfd2",
    "signalfd4",
    "timerfd_create",
    "timerfd_settime",
    "timerfd_gettime",
    // filesystem mutation
    "mkdir",
    "mkdirat",
    "rmdir",
    "unlink",
    "unlinkat",
    "rename",
    "renameat",
    "renameat2",
    "link",
    "linkat",
    "symlink",
    "symlinkat",
    "readlink",
    "readlinkat",
    "chmod",
    "fchmod",
    "fchmodat",
    "chown",
    "fchown",
    "lchown",
    "fchownat",
    "truncate",
    "ftruncate",
    "fallocate",
    "utimensat",
    "mknod",
    "mknodat",
    "umask",
    // extended attributes
    "getxattr",
    "lgetxattr",
    "fgetxattr",
    "setxattr",
    "lsetxattr",
    "fsetxattr",
    "listxattr",
    "llistxattr",
    "flistxattr",
    "removexattr",
    "lremovexattr",
    "fremovexattr",
    // capabilities, mounts, fs stats, sync
    "capget",
    "capset",
    "mount",
    "umount2",
    "statfs",
    "fstatfs",
    "sync",
    "syncfs",
    "fsync",
    "fdatasync",
    "sync_file_range",
];

/// Network adds the socket family.
pub(crate) const NETWORK_SYSCALLS: &[&str] = &[
    "socket",
    "socketpair",
    "connect",
    "accept",
    "accept4",
    "bind",
    "listen",
    "getsockname",
    "getpeername",
    "setsockopt",
    "getsockopt",
    "sendto",
    "recvfrom",
    "sendmsg",
    "recvmsg",
    "sendmmsg",
    "recvmmsg",
    "shutdown",
];

/// Read+exec paths every profile needs for the dynamic loader and the
/// handful of device nodes a build consumes.
pub(crate) fn minimal_allow_paths() -> Vec<(String, AccessMask)> {
    const READ_EXEC: &[&str] = &[
        "/lib",
        "/lib64",
        "/usr/lib",
        "/etc/ld.so.*",
        "/dev/null",
        "/dev/zero",
        "/dev/urandom",
        "/dev/random",
        "/dev/tty",
        "/proc/self",
        "/sys/devices/system/cpu",
    ];
    READ_EXEC
        .iter()
        .map(|path| (path.to_string(), AccessMask::READ | AccessMask::EXEC))
        .collect()
}
