use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tandem_core::{process::pid_is_alive, RelayRegistryEntry};
use tracing::{debug, warn};

pub fn registration_path(dir: &Path, port: u16) -> PathBuf {
    dir.join(format!("relay-{port}.json"))
}

/// Machine-local record of a running relay. The file is removed when the
/// registration is dropped.
#[derive(Debug)]
pub struct RelayRegistration {
    path: PathBuf,
    entry: RelayRegistryEntry,
}

impl RelayRegistration {
    pub fn register(dir: &Path, entry: RelayRegistryEntry) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = registration_path(dir, entry.port);
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            let body = serde_json::to_vec_pretty(&entry)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(Self { path, entry })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry(&self) -> &RelayRegistryEntry {
        &self.entry
    }
}

impl Drop for RelayRegistration {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(event = "registration_removed", path = %self.path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                event = "registration_remove_failed",
                path = %self.path.display(),
                error = %err
            ),
        }
    }
}

/// Registered relays whose process is still running, ordered by port.
/// Unreadable files and dead registrations are skipped.
pub fn live_entries(dir: &Path) -> Vec<RelayRegistryEntry> {
    let read_dir = match fs::read_dir(dir) {
        Ok(value) => value,
        Err(_) => return Vec::new(),
    };
    let mut entries = Vec::new();
    for item in read_dir.flatten() {
        let path = item.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(_) => continue,
        };
        let entry: RelayRegistryEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(event = "registration_invalid", path = %path.display(), error = %err);
                continue;
            }
        };
        let alive = i32::try_from(entry.pid).map(pid_is_alive).unwrap_or(false);
        if !alive {
            debug!(event = "registration_dead", port = entry.port, pid = entry.pid);
            continue;
        }
        entries.push(entry);
    }
    entries.sort_by_key(|entry| entry.port);
    entries.dedup_by_key(|entry| entry.port);
    entries
}
