//! Event filter backed by an external process.

use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{debug, warn};
use watcher::{Error, EventFilter, EventRecord, FilterAction};

struct Pipe {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    line: String,
}

/// Runs `sh -c <command>` once and exchanges one JSON line per event.
///
/// Requests are serialized so every answer pairs with its request, even when
/// a caller gave up waiting.
pub struct CommandFilter {
    command: String,
    child: Mutex<Child>,
    pipe: Mutex<Pipe>,
}

impl std::fmt::Debug for CommandFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandFilter")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl CommandFilter {
    pub fn spawn(command: &str) -> std::io::Result<Self> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(std::io::Error::other("filter process has no stdio pipes"));
        };
        debug!(command, pid = child.id(), "filter process started");
        Ok(Self {
            command: command.to_owned(),
            child: Mutex::new(child),
            pipe: Mutex::new(Pipe {
                stdin,
                stdout: BufReader::new(stdout),
                line: String::new(),
            }),
        })
    }
}

impl EventFilter for CommandFilter {
    fn apply(&self, event: &EventRecord) -> Result<FilterAction, Error> {
        let request = serde_json::to_string(event)
            .map_err(|err| Error::Callback(format!("cannot encode event: {err}")))?;

        let mut pipe = self.pipe.lock();
        let Pipe {
            stdin,
            stdout,
            line,
        } = &mut *pipe;
        writeln!(stdin, "{request}")
            .and_then(|()| stdin.flush())
            .map_err(|err| Error::Callback(format!("filter stdin: {err}")))?;

        line.clear();
        let read = stdout
            .read_line(line)
            .map_err(|err| Error::Callback(format!("filter stdout: {err}")))?;
        if read == 0 {
            return Err(Error::Callback("filter process closed its output".into()));
        }
        FilterAction::from_json(line.trim_end())
    }
}

impl Drop for CommandFilter {
    fn drop(&mut self) {
        let child = self.child.get_mut();
        if let Err(err) = child.kill() {
            warn!(%err, command = %self.command, "failed to stop filter process");
        }
        let _ = child.wait();
    }
}
