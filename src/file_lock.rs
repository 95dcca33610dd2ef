use crate::error::Error;
use anyhow::anyhow;
use std::fs::File;
use syscalls::{syscall2, Errno, Sysno};

pub(crate) enum LockMode {
    Shared,
    Exclusive,
}

pub(crate) trait FileLock: Sized {
    fn lock(self, mode: LockMode) -> anyhow::Result<Self>;
}

#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
impl FileLock for File {
    fn lock(self, mode: LockMode) -> anyhow::Result<Self> {
        let fd = self.as_raw_fd();
        const LOCK_SH: usize = 0x1;
        const LOCK_EX: usize = 0x2;
        const LOCK_NB: usize = 0x4;
        let op = match mode {
            LockMode::Shared => LOCK_SH,
            LockMode::Exclusive => LOCK_EX,
        } | LOCK_NB;
        let result = unsafe { syscall2(Sysno::flock, fd as usize, op) };
        match result {
            Ok(_) => Ok(self),
            // EWOULDBLOCK is EAGAIN on linux
            Err(err) if err == Errno::EAGAIN => Err(Error::Locked.into()),
            Err(err) => Err(anyhow!("cannot lock file {fd} errno={err}")),
        }
    }
}
