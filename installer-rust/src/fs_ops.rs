use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

pub fn retry<F>(mut op: F, attempts: usize) -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    let attempts = attempts.max(1);
    let mut delay = Duration::from_millis(200);
    for i in 0..attempts {
        match op() {
            Ok(()) => return Ok(()),
            Err(err) => {
                if i + 1 == attempts {
                    return Err(err);
                }
            }
        }
        std::thread::sleep(delay);
        delay = std::cmp::min(delay * 2, Duration::from_secs(2));
    }
    Ok(())
}

fn temp_path_for(dest: &Path) -> Result<PathBuf> {
    let parent = dest.parent().context("dest has no parent")?;
    let name = dest
        .file_name()
        .context("dest has no filename")?
        .to_string_lossy();
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_millis(0))
        .as_nanos();
    Ok(parent.join(format!(".{name}.tmp-{nonce}")))
}

fn write_bytes_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_path_for(dest)?;
    let result = (|| -> Result<()> {
        fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
        if dest.exists() {
            fs::remove_file(dest).with_context(|| format!("remove {}", dest.display()))?;
        }
        fs::rename(&tmp, dest)
            .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

pub fn write_bytes_with_retry(dest: &Path, bytes: &[u8], attempts: usize) -> Result<()> {
    retry(|| write_bytes_atomic(dest, bytes), attempts)
}

pub fn remove_file_with_retry(path: &Path, attempts: usize) -> Result<()> {
    retry(
        || match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
        },
        attempts,
    )
}

/// Removes `path` if it is an empty directory. Missing directories count as
/// removed.
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    let mut entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(err).with_context(|| format!("read_dir {}", path.display())),
    };
    if entries.next().is_some() {
        return Ok(false);
    }
    fs::remove_dir(path).with_context(|| format!("remove {}", path.display()))?;
    Ok(true)
}

/// Creates every missing ancestor of `dir` (and `dir` itself), returning the
/// directories this call created, outermost first.
pub fn create_dirs_recording(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut missing = Vec::new();
    let mut cur = Some(dir);
    while let Some(d) = cur {
        if d.as_os_str().is_empty() || d.exists() {
            break;
        }
        missing.push(d.to_path_buf());
        cur = d.parent();
    }

    let mut created = Vec::new();
    for d in missing.into_iter().rev() {
        match fs::create_dir(&d) {
            Ok(()) => created.push(d),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists && d.is_dir() => {}
            Err(err) => {
                return Err(err).with_context(|| format!("create {}", d.display()));
            }
        }
    }
    Ok(created)
}

pub fn file_mtime_unix(path: &Path) -> Result<u64> {
    let meta = fs::metadata(path).with_context(|| format!("metadata {}", path.display()))?;
    let mtime = meta.modified().context("modified time")?;
    Ok(mtime
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs())
}

pub fn set_mtime_unix(path: &Path, secs: u64) -> Result<()> {
    let file = fs::File::options()
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
        .with_context(|| format!("set mtime {}", path.display()))?;
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Closest ancestor of `path` (itself included) that exists.
pub fn nearest_existing(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| !p.as_os_str().is_empty() && p.exists())
}

/// Proves that files can be created where `dir` is or will be.
pub fn probe_writable(dir: &Path) -> io::Result<()> {
    let existing = nearest_existing(dir).ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "no existing ancestor directory")
    })?;
    let probe = tempfile::Builder::new()
        .prefix(".shipwright-probe-")
        .tempfile_in(existing)?;
    probe.close()
}

/// Free bytes available to the current user on the volume holding `path`.
pub fn available_space(path: &Path) -> Result<u64> {
    let existing = nearest_existing(path)
        .with_context(|| format!("no existing ancestor of {}", path.display()))?;
    volume_free_bytes(existing)
}

#[cfg(unix)]
fn volume_free_bytes(path: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path contains NUL: {}", path.display()))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error()).with_context(|| format!("statvfs {}", path.display()));
    }
    #[allow(clippy::unnecessary_cast)]
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(windows)]
fn volume_free_bytes(path: &Path) -> Result<u64> {
    use std::iter::once;
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Storage::FileSystem::GetDiskFreeSpaceExW;

    let wide: Vec<u16> = path.as_os_str().encode_wide().chain(once(0)).collect();
    let mut free_to_caller: u64 = 0;
    let ok = unsafe {
        GetDiskFreeSpaceExW(
            wide.as_ptr(),
            &mut free_to_caller,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("GetDiskFreeSpaceExW {}", path.display()));
    }
    Ok(free_to_caller)
}

#[cfg(not(any(unix, windows)))]
fn volume_free_bytes(_path: &Path) -> Result<u64> {
    Ok(u64::MAX)
}
