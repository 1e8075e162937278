//! Desktop side effects: notifications and opening the destination folder.
//!
//! Both shell out to whatever the platform provides, found with `which`.
//! Every launch runs on its own task with a timeout and is killed if it
//! overstays; nothing here can fail a move.

use docket_library::{Effects, MoveRecord, Notifier, Outcome};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace, warn};

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(5);
const TITLE: &str = "docket";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Launch {
    program: PathBuf,
    args: Vec<OsString>,
}

impl Launch {
    fn find(candidates: &[&str], args: Vec<OsString>) -> Option<Self> {
        let program = candidates.iter().find_map(|name| which::which(name).ok())?;
        Some(Self { program, args })
    }

    /// Fire and forget. Needs a tokio runtime; without one the launch is skipped.
    fn spawn(self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(program = %self.program.display(), "no runtime; not launching");
            return;
        };
        runtime.spawn(async move {
            let mut child = match Command::new(&self.program).args(&self.args).kill_on_drop(true).spawn() {
                Ok(child) => child,
                Err(err) => {
                    warn!(program = %self.program.display(), error = %err, "could not launch");
                    return;
                },
            };
            match tokio::time::timeout(LAUNCH_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => trace!(program = %self.program.display(), %status, "launch finished"),
                Ok(Err(err)) => warn!(program = %self.program.display(), error = %err, "launch failed"),
                Err(_) => warn!(program = %self.program.display(), "launch timed out; killed"),
            }
        });
    }
}

fn notification(summary: &str, body: &str) -> Option<Launch> {
    if cfg!(target_os = "macos") {
        let script = format!("display notification {body:?} with title {TITLE:?} subtitle {summary:?}");
        Launch::find(&["osascript"], vec!["-e".into(), script.into()])
    } else if cfg!(windows) {
        None
    } else {
        let args = vec!["--app-name".into(), TITLE.into(), summary.into(), body.into()];
        Launch::find(&["notify-send"], args)
    }
}

fn open_folder(directory: &Path) -> Option<Launch> {
    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &["open"]
    } else if cfg!(windows) {
        &["explorer.exe", "explorer"]
    } else {
        &["xdg-open"]
    };
    Launch::find(candidates, vec![directory.as_os_str().to_os_string()])
}

/// Headline and body for a record worth telling the user about.
fn describe(record: &MoveRecord) -> Option<(String, String)> {
    let name = record.source.file_name()?.to_string_lossy().into_owned();
    match record.outcome {
        Outcome::Success => {
            let folder = record.destination.as_deref().and_then(Path::parent).map(|p| p.display().to_string());
            Some(("File organized".to_string(), format!("{name} → {}", folder.unwrap_or_default())))
        },
        Outcome::Failed => Some(("Could not organize file".to_string(), format!("{name}: {}", record.reason))),
        Outcome::Skipped => None,
    }
}

/// The [`Notifier`] used by the binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct Desktop;

impl Notifier for Desktop {
    fn recorded(&self, record: &MoveRecord, effects: Effects) {
        if effects.notify
            && let Some((summary, body)) = describe(record)
        {
            match notification(&summary, &body) {
                Some(launch) => launch.spawn(),
                None => debug!("no notification tool available"),
            }
        }
        if effects.open_folder
            && record.outcome == Outcome::Success
            && let Some(directory) = record.destination.as_deref().and_then(Path::parent)
        {
            match open_folder(directory) {
                Some(launch) => launch.spawn(),
                None => debug!("no folder opener available"),
            }
        }
    }

    fn warning(&self, message: &str) {
        if let Some(launch) = notification("Attention needed", message) {
            launch.spawn();
        }
    }
}
