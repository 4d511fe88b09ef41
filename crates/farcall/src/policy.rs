//! The shape of a confinement policy: an allow-list of syscalls, a set of
//! read-only paths, and bounded tmpfs mounts. What the identifiers mean and
//! how they are enforced is the isolation engine's business; this module
//! only assembles the description it consumes.

use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmpfsMount {
    pub path: PathBuf,
    pub max_size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyBuilder {
    syscalls: BTreeSet<String>,
    readable_paths: Vec<PathBuf>,
    tmpfs: Vec<TmpfsMount>,
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_syscall(mut self, name: impl Into<String>) -> Self {
        self.syscalls.insert(name.into());
        self
    }

    pub fn allow_syscalls<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.syscalls.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn add_readable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.readable_paths.push(path.into());
        self
    }

    pub fn add_tmpfs(mut self, path: impl Into<PathBuf>, max_size: u64) -> Self {
        self.tmpfs.push(TmpfsMount {
            path: path.into(),
            max_size,
        });
        self
    }

    pub fn build(self) -> Policy {
        Policy {
            syscalls: self.syscalls,
            readable_paths: self.readable_paths,
            tmpfs: self.tmpfs,
        }
    }
}

/// An assembled allow-list, opaque to everything but the engine.
#[derive(Debug, Clone)]
pub struct Policy {
    syscalls: BTreeSet<String>,
    readable_paths: Vec<PathBuf>,
    tmpfs: Vec<TmpfsMount>,
}

impl Policy {
    pub fn allows_syscall(&self, name: &str) -> bool {
        self.syscalls.contains(name)
    }

    pub fn syscalls(&self) -> impl Iterator<Item = &str> {
        self.syscalls.iter().map(String::as_str)
    }

    pub fn readable_paths(&self) -> &[PathBuf] {
        &self.readable_paths
    }

    pub fn tmpfs(&self) -> &[TmpfsMount] {
        &self.tmpfs
    }
}

/// The safety-net allow-list. Covers the needs of a typical
/// single-threaded library: process exit, basic i/o, memory management,
/// signal handling, time, randomness, and read-only access to a small
/// fixed set of paths, plus a bounded scratch tmpfs.
pub fn default_policy() -> PolicyBuilder {
    PolicyBuilder::new()
        .allow_syscalls([
            "read",
            "write",
            "close",
            "lseek",
            "open",
            "openat",
            "stat",
            "fstat",
            "lstat",
            "readlink",
            "fcntl",
            "mmap",
            "munmap",
            "mremap",
            "brk",
            "futex",
            "exit",
            "exit_group",
            "rt_sigaction",
            "rt_sigprocmask",
            "rt_sigreturn",
            "sigaltstack",
            "kill",
            "tkill",
            "tgkill",
            "clock_gettime",
            "clock_nanosleep",
            "nanosleep",
            "gettimeofday",
            "getrandom",
            "getpid",
            "getppid",
            "gettid",
            "getrlimit",
            "recvmsg",
            "sendmsg",
            "uname",
            "arch_prctl",
        ])
        .add_readable_path("/etc/localtime")
        .add_tmpfs("/tmp", 1 << 30)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_covers_the_basics() {
        let policy = default_policy().build();
        for name in ["read", "write", "exit_group", "sendmsg", "recvmsg"] {
            assert!(policy.allows_syscall(name), "missing {name}");
        }
        assert!(!policy.allows_syscall("execve"));
        assert!(!policy.allows_syscall("ptrace"));

        assert_eq!(policy.readable_paths(), [PathBuf::from("/etc/localtime")]);
        assert_eq!(
            policy.tmpfs(),
            [TmpfsMount {
                path: "/tmp".into(),
                max_size: 1 << 30,
            }]
        );
    }

    #[test]
    fn customizations_extend_the_safety_net() {
        let policy = default_policy()
            .allow_syscall("ioctl")
            .add_readable_path("/usr/share/fonts")
            .add_tmpfs("/scratch", 4096)
            .build();

        assert!(policy.allows_syscall("ioctl"));
        assert!(policy.allows_syscall("read"));
        assert_eq!(policy.readable_paths().len(), 2);
        assert_eq!(policy.tmpfs().len(), 2);
    }

    #[test]
    fn duplicate_syscalls_collapse() {
        let policy = default_policy().allow_syscall("read").build();
        assert_eq!(policy.syscalls().filter(|s| *s == "read").count(), 1);
    }
}
