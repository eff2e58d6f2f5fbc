//! Process specifications.
//!
//! A [`ProcessSpec`] is the static half of a process record: everything the
//! supervisor needs to launch (and relaunch) a child. The dynamic half, the
//! running child and its lifecycle state, lives in the daemon.

use std::path::PathBuf;

/// Marker argument appended to a respawned child's command line so the
/// child can tell a fresh boot from a restart.
pub const RESTART_MARKER: &str = "--process-restarted";

/// Exit code by which a privileged child signals it was aborted by its own
/// controller and the whole fleet should shut down if nothing else is up.
pub const CONTROLLER_ABORT_EXIT: i32 = 99;

/// Exit code by which a privileged child requests that the supervisor exit
/// with the same code so an outer wrapper script restarts everything.
pub const RESTART_REQUESTED_EXIT: i32 = 10;

/// Static launch description for one process record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Unique record name within the fleet.
    pub name: String,
    /// Program and arguments; `command[0]` is the executable.
    pub command: Vec<String>,
    /// Environment entries merged over the supervisor's own environment.
    pub env: Vec<(String, String)>,
    /// Working directory for the child, if different from the daemon's.
    pub working_dir: Option<PathBuf>,
    /// Whether the supervisor respawns this record on unexpected exit.
    pub respawn: bool,
    /// Whether this record is the fleet's single control-capable process.
    pub privileged: bool,
}

impl ProcessSpec {
    /// Start building a spec for `name` running `program`.
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: vec![program.into()],
            env: Vec::new(),
            working_dir: None,
            respawn: false,
            privileged: false,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.command.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add one environment entry.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the child's working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Mark the record for respawn on unexpected exit.
    #[must_use]
    pub const fn with_respawn(mut self, respawn: bool) -> Self {
        self.respawn = respawn;
        self
    }

    /// Mark the record as the fleet's privileged process.
    #[must_use]
    pub const fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// The executable path, i.e. `command[0]`.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.command[0]
    }

    /// Arguments after the executable.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.command[1..]
    }

    /// Whether the command line already carries [`RESTART_MARKER`].
    #[must_use]
    pub fn has_restart_marker(&self) -> bool {
        self.argv().iter().any(|a| a == RESTART_MARKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_fields() {
        let spec = ProcessSpec::new("primary", "/bin/server")
            .arg("--port")
            .arg("8080")
            .env("MODE", "standalone")
            .working_dir("/srv")
            .with_respawn(true)
            .privileged();

        assert_eq!(spec.program(), "/bin/server");
        assert_eq!(spec.argv(), ["--port", "8080"]);
        assert_eq!(spec.env, [("MODE".to_string(), "standalone".to_string())]);
        assert_eq!(spec.working_dir.as_deref(), Some(std::path::Path::new("/srv")));
        assert!(spec.respawn);
        assert!(spec.privileged);
    }

    #[test]
    fn defaults_are_unprivileged_no_respawn() {
        let spec = ProcessSpec::new("w", "/bin/true");
        assert!(!spec.respawn);
        assert!(!spec.privileged);
        assert!(spec.working_dir.is_none());
        assert!(spec.argv().is_empty());
    }

    #[test]
    fn restart_marker_detection() {
        let spec = ProcessSpec::new("w", "/bin/server").arg(RESTART_MARKER);
        assert!(spec.has_restart_marker());
        assert!(!ProcessSpec::new("w", "/bin/server").has_restart_marker());
    }
}
