//! Version controllers stamping flushed memtables, deletions and merges

use crate::Result;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Versions reserved on disk per persisted step
pub const SAVE_INTERVAL: u64 = 100;

const FILE_PREFIX: &str = "version-";

/// Source of monotonically increasing versions
pub trait VersionController: Send + Sync {
    /// Next version, strictly greater than every version handed out before
    fn next_version(&self) -> Result<u64>;

    /// Last version handed out
    fn current_version(&self) -> u64;
}

/// Version controller persisting an upper bound in a `version-<n>` file.
///
/// After a restart versions resume from the persisted bound, so at most
/// `SAVE_INTERVAL` versions are skipped and none are reused.
pub struct SimpleFileVersionController {
    dir: PathBuf,
    state: Mutex<VersionState>,
}

struct VersionState {
    current: u64,
    upper: u64,
}

impl SimpleFileVersionController {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut found: Option<u64> = None;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(upper) = name
                .to_str()
                .and_then(|n| n.strip_prefix(FILE_PREFIX))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            match found {
                Some(prev) if prev >= upper => fs::remove_file(entry.path())?,
                Some(prev) => {
                    fs::remove_file(dir.join(format!("{}{}", FILE_PREFIX, prev)))?;
                    found = Some(upper);
                }
                None => found = Some(upper),
            }
        }

        let upper = match found {
            Some(upper) => upper,
            None => {
                fs::File::create(dir.join(format!("{}{}", FILE_PREFIX, 0)))?;
                0
            }
        };
        debug!("Version controller in {:?} resumes from {}", dir, upper);

        let controller = Self {
            dir,
            state: Mutex::new(VersionState {
                current: upper,
                upper,
            }),
        };
        {
            let mut state = controller.state.lock();
            controller.reserve(&mut state)?;
        }
        Ok(controller)
    }

    fn reserve(&self, state: &mut VersionState) -> Result<()> {
        let next_upper = state.current + SAVE_INTERVAL;
        fs::rename(
            self.dir.join(format!("{}{}", FILE_PREFIX, state.upper)),
            self.dir.join(format!("{}{}", FILE_PREFIX, next_upper)),
        )?;
        state.upper = next_upper;
        Ok(())
    }
}

impl VersionController for SimpleFileVersionController {
    fn next_version(&self) -> Result<u64> {
        let mut state = self.state.lock();
        if state.current + 1 >= state.upper {
            self.reserve(&mut state)?;
        }
        state.current += 1;
        Ok(state.current)
    }

    fn current_version(&self) -> u64 {
        self.state.lock().current
    }
}
