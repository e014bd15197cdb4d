//! Machine-wide lock held for the whole of an install or uninstall run.

use std::path::Path;

use crate::error::ValidationError;

/// Released on drop.
#[derive(Debug)]
pub struct InstallLock {
    _guard: imp::Guard,
}

pub fn acquire(app_id: &str, locks_dir: &Path) -> Result<InstallLock, ValidationError> {
    let guard = imp::acquire(&clean_id(app_id), locks_dir).map_err(|err| match err {
        imp::Failure::Held => ValidationError::AlreadyRunning {
            app_id: app_id.to_string(),
        },
        imp::Failure::Io(path, source) => ValidationError::PermissionDenied { path, source },
    })?;
    Ok(InstallLock { _guard: guard })
}

fn clean_id(app_id: &str) -> String {
    app_id
        .trim()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' { ch } else { '_' })
        .collect()
}

#[cfg(windows)]
mod imp {
    use std::{ffi::OsStr, iter::once, os::windows::ffi::OsStrExt, path::Path, path::PathBuf};
    use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, ERROR_ALREADY_EXISTS};
    use windows_sys::Win32::System::Threading::CreateMutexW;

    pub enum Failure {
        Held,
        Io(PathBuf, std::io::Error),
    }

    #[derive(Debug)]
    pub struct Guard {
        handle: isize,
    }

    /// The mutex name carries the state directory so separate roots do not
    /// block each other.
    pub fn acquire(id: &str, locks_dir: &Path) -> Result<Guard, Failure> {
        let scope = crate::fs_ops::sha256_bytes(
            locks_dir.to_string_lossy().to_lowercase().as_bytes(),
        );
        let name = format!("Global\\Shipwright-{id}-{}", &scope[..12]);
        let wide: Vec<u16> = OsStr::new(&name).encode_wide().chain(once(0)).collect();
        let handle = unsafe { CreateMutexW(std::ptr::null_mut(), 0, wide.as_ptr()) };
        if handle == 0 {
            return Err(Failure::Io(PathBuf::from(name), std::io::Error::last_os_error()));
        }
        let last_error = unsafe { GetLastError() };
        if last_error == ERROR_ALREADY_EXISTS {
            unsafe { CloseHandle(handle) };
            return Err(Failure::Held);
        }
        Ok(Guard { handle })
    }

    impl Drop for Guard {
        fn drop(&mut self) {
            if self.handle != 0 {
                unsafe { CloseHandle(self.handle) };
            }
        }
    }
}

#[cfg(unix)]
mod imp {
    use std::{
        fs::{self, File},
        io::{self, Write},
        os::unix::io::AsRawFd,
        path::{Path, PathBuf},
    };

    pub enum Failure {
        Held,
        Io(PathBuf, io::Error),
    }

    /// The kernel releases the lock when the descriptor closes, also when
    /// the process dies. The file itself stays behind.
    #[derive(Debug)]
    pub struct Guard {
        _file: File,
    }

    pub fn acquire(id: &str, locks_dir: &Path) -> Result<Guard, Failure> {
        fs::create_dir_all(locks_dir).map_err(|err| Failure::Io(locks_dir.to_path_buf(), err))?;
        let path = locks_dir.join(format!("{id}.lock"));
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| Failure::Io(path.clone(), err))?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(code) if code == libc::EWOULDBLOCK => Failure::Held,
                _ => Failure::Io(path, err),
            });
        }
        // holder pid, informational only
        let _ = file
            .set_len(0)
            .and_then(|()| write!(file, "{}", std::process::id()));
        Ok(Guard { _file: file })
    }
}
