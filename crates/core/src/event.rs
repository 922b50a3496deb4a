//! The user-facing event stream
//!
//! Every testcase, command and board transition becomes an [`Event`]. Events
//! are appended as JSON lines to an optional log file and rendered as an
//! indented tree on stdout, filtered by the global [`Verbosity`].

use crate::channel::Sink;
use crate::error::{Result, TbotError};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::cell::{Cell, RefCell};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::rc::Rc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Process-wide event log
pub static EVENTS: Lazy<EventLog> = Lazy::new(EventLog::new);

static START: Lazy<Instant> = Lazy::new(Instant::now);

thread_local! {
    static NESTING: Cell<usize> = const { Cell::new(0) };
    static CAPTURE: RefCell<Option<Vec<Event>>> = const { RefCell::new(None) };
}

/// How much of the event stream is rendered to stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Nothing but the final result
    Quiet,
    /// Testcases, board transitions and messages
    Info,
    /// Plus every command line
    Command,
    /// Plus command output
    Stdout,
    /// Plus raw channel traffic
    Channel,
}

impl Verbosity {
    /// One step louder (`-v`)
    pub fn increase(self) -> Self {
        match self {
            Self::Quiet => Self::Info,
            Self::Info => Self::Command,
            Self::Command => Self::Stdout,
            Self::Stdout | Self::Channel => Self::Channel,
        }
    }

    /// One step quieter (`-q`)
    pub fn decrease(self) -> Self {
        match self {
            Self::Quiet | Self::Info => Self::Quiet,
            Self::Command => Self::Info,
            Self::Stdout => Self::Command,
            Self::Channel => Self::Stdout,
        }
    }
}

impl std::str::FromStr for Verbosity {
    type Err = TbotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "quiet" => Ok(Self::Quiet),
            "info" => Ok(Self::Info),
            "command" => Ok(Self::Command),
            "stdout" => Ok(Self::Stdout),
            "channel" => Ok(Self::Channel),
            _ => Err(TbotError::config(format!("Invalid verbosity: {}", s))),
        }
    }
}

/// Severity of a `msg/<level>` event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl MsgLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// One record of the event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: Vec<String>,
    /// Seconds since the process started
    pub time: f64,
    pub data: Value,
}

impl Event {
    /// `kind` joined with `/`, e.g. `cmd/lab`
    pub fn path(&self) -> String {
        self.kind.join("/")
    }
}

struct EventLogInner {
    file: Option<BufWriter<File>>,
    out: Box<dyn Write + Send>,
    verbosity: Verbosity,
}

/// Sink for events; see [`EVENTS`]
pub struct EventLog {
    inner: Mutex<EventLogInner>,
}

impl EventLog {
    fn new() -> Self {
        Lazy::force(&START);
        Self {
            inner: Mutex::new(EventLogInner {
                file: None,
                out: Box::new(std::io::stdout()),
                verbosity: Verbosity::Info,
            }),
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut EventLogInner) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn verbosity(&self) -> Verbosity {
        self.with_inner(|inner| inner.verbosity)
    }

    pub fn set_verbosity(&self, verbosity: Verbosity) {
        self.with_inner(|inner| inner.verbosity = verbosity);
    }

    /// Redirect rendered output, e.g. to silence it
    pub fn set_output(&self, out: Box<dyn Write + Send>) {
        self.with_inner(|inner| inner.out = out);
    }

    /// Append every following event to `path` as JSON lines
    pub fn open_file(&self, path: &Path) -> Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.with_inner(|inner| inner.file = Some(BufWriter::new(file)));
        debug!("event log opened at {}", path.display());
        Ok(())
    }

    /// Flush and detach the log file
    pub fn close_file(&self) -> Result<()> {
        let file = self.with_inner(|inner| inner.file.take());
        if let Some(mut file) = file {
            file.flush()?;
        }
        Ok(())
    }

    /// Record an event
    pub fn emit(&self, kind: &[&str], data: Value) -> Event {
        let event = Event {
            kind: kind.iter().map(|s| s.to_string()).collect(),
            time: START.elapsed().as_secs_f64(),
            data,
        };
        debug!(target: "tbot::event", kind = %event.path(), data = %event.data);

        self.with_inner(|inner| {
            if let Some(file) = inner.file.as_mut() {
                let written = serde_json::to_writer(&mut *file, &event)
                    .map_err(std::io::Error::from)
                    .and_then(|_| file.write_all(b"\n"))
                    .and_then(|_| file.flush());
                if let Err(e) = written {
                    warn!("failed to write event log: {}", e);
                }
            }
        });
        CAPTURE.with(|c| {
            if let Some(events) = c.borrow_mut().as_mut() {
                events.push(event.clone());
            }
        });
        event
    }

    /// Render `text` at the current nesting level if `level` is enabled
    fn render(&self, level: Verbosity, text: &str) {
        self.with_inner(|inner| {
            if inner.verbosity < level {
                return;
            }
            let indent = "│   ".repeat(nesting());
            let mut rendered = String::new();
            for line in text.lines() {
                rendered.push_str(&indent);
                rendered.push_str(line);
                rendered.push('\n');
            }
            if inner.out.write_all(rendered.as_bytes()).is_ok() {
                let _ = inner.out.flush();
            }
        });
    }

    fn render_raw(&self, level: Verbosity, bytes: &[u8]) {
        self.with_inner(|inner| {
            if inner.verbosity >= level && inner.out.write_all(bytes).is_ok() {
                let _ = inner.out.flush();
            }
        });
    }
}

/// Current testcase nesting depth
pub fn nesting() -> usize {
    NESTING.with(Cell::get)
}

/// Run `f` and return every event it emitted on this thread
pub fn capture<R>(f: impl FnOnce() -> R) -> (R, Vec<Event>) {
    let outer = CAPTURE.with(|c| c.borrow_mut().replace(Vec::new()));
    let result = f();
    let events = CAPTURE.with(|c| std::mem::replace(&mut *c.borrow_mut(), outer));
    let events = events.unwrap_or_default();
    // nested captures also see the inner events
    CAPTURE.with(|c| {
        if let Some(outer) = c.borrow_mut().as_mut() {
            outer.extend(events.iter().cloned());
        }
    });
    (result, events)
}

pub fn testcase_begin(name: &str) {
    EVENTS.render(Verbosity::Info, &format!("├─Calling {name} ..."));
    EVENTS.emit(&["tc", "begin"], json!({ "name": name }));
    NESTING.with(|n| n.set(n.get() + 1));
}

pub fn testcase_end(name: &str, duration: Duration, success: bool, error: Option<&str>) {
    NESTING.with(|n| n.set(n.get().saturating_sub(1)));
    let status = if success { "Done" } else { "Fail" };
    EVENTS.render(
        Verbosity::Info,
        &format!("│   └─{status}. ({:.3}s)", duration.as_secs_f64()),
    );
    let mut data = json!({
        "name": name,
        "duration": duration.as_secs_f64(),
        "success": success,
    });
    if let (Some(error), Some(obj)) = (error, data.as_object_mut()) {
        obj.insert("error".to_string(), Value::from(error));
    }
    EVENTS.emit(&["tc", "end"], data);
}

pub fn board_on(board: &str) {
    EVENTS.render(Verbosity::Info, &format!("├─POWERON ({board})"));
    EVENTS.emit(&["board", "on"], json!({ "name": board }));
}

pub fn board_off(board: &str) {
    EVENTS.render(Verbosity::Info, &format!("├─POWEROFF ({board})"));
    EVENTS.emit(&["board", "off"], json!({ "name": board }));
}

pub fn board_uboot(board: &str) {
    EVENTS.render(Verbosity::Info, &format!("├─UBOOT ({board})"));
    EVENTS.emit(&["board", "uboot"], json!({ "name": board }));
}

pub fn board_linux(board: &str) {
    EVENTS.render(Verbosity::Info, &format!("├─LINUX ({board})"));
    EVENTS.emit(&["board", "linux"], json!({ "name": board }));
}

pub fn message(level: MsgLevel, text: &str) {
    let needed = if level == MsgLevel::Debug {
        Verbosity::Command
    } else {
        Verbosity::Info
    };
    EVENTS.render(needed, &format!("├─{text}"));
    EVENTS.emit(&["msg", level.as_str()], json!({ "text": text }));
}

pub fn exception(name: &str, trace: &str) {
    EVENTS.render(Verbosity::Info, &format!("├─Exception: {name}"));
    EVENTS.emit(&["exception"], json!({ "name": name, "trace": trace }));
}

pub fn tbot_end(success: bool) {
    let text = if success { "SUCCESS" } else { "FAILURE" };
    EVENTS.render(Verbosity::Quiet, &format!("└─{text}"));
    EVENTS.emit(&["tbot", "end"], json!({ "success": success }));
}

/// Collects the output of one command and emits `cmd/<machine>` when finished.
///
/// Output lines are rendered live at [`Verbosity::Stdout`].
pub struct CommandLog {
    machine: String,
    command: String,
    output: Vec<u8>,
    rendered: usize,
    finished: bool,
}

impl CommandLog {
    pub fn new(machine: &str, command: &str) -> Self {
        EVENTS.render(Verbosity::Command, &format!("├─[{machine}] {command}"));
        Self {
            machine: machine.to_string(),
            command: command.to_string(),
            output: Vec::new(),
            rendered: 0,
            finished: false,
        }
    }

    /// As a channel sink
    pub fn sink(machine: &str, command: &str) -> (Rc<RefCell<CommandLog>>, Sink) {
        let log = Rc::new(RefCell::new(Self::new(machine, command)));
        let sink: Sink = log.clone();
        (log, sink)
    }

    fn render_lines(&mut self, all: bool) {
        let pending = &self.output[self.rendered..];
        let end = if all {
            pending.len()
        } else {
            match pending.iter().rposition(|&b| b == b'\n') {
                Some(pos) => pos + 1,
                None => return,
            }
        };
        if end == 0 {
            return;
        }
        let text = String::from_utf8_lossy(&pending[..end]);
        let text = crate::channel::normalize_newlines(&text);
        let mut rendered = String::new();
        for line in text.lines() {
            rendered.push_str("│    ");
            rendered.push_str(line);
            rendered.push('\n');
        }
        EVENTS.render(Verbosity::Stdout, &rendered);
        self.rendered += end;
    }

    /// Emit the `cmd/<machine>` event
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.render_lines(true);
        let stdout = String::from_utf8_lossy(&self.output).into_owned();
        EVENTS.emit(
            &["cmd", &self.machine],
            json!({ "cmd": self.command, "stdout": stdout }),
        );
    }
}

impl Write for CommandLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.output.extend_from_slice(buf);
        self.render_lines(false);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for CommandLog {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Channel sink that mirrors raw traffic at [`Verbosity::Channel`]
pub struct ChannelLog;

impl ChannelLog {
    pub fn sink() -> Sink {
        Rc::new(RefCell::new(ChannelLog))
    }
}

impl Write for ChannelLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        EVENTS.render_raw(Verbosity::Channel, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_steps() {
        assert_eq!(Verbosity::Info.increase(), Verbosity::Command);
        assert_eq!(Verbosity::Channel.increase(), Verbosity::Channel);
        assert_eq!(Verbosity::Info.decrease(), Verbosity::Quiet);
        assert!(Verbosity::Stdout > Verbosity::Command);
        assert_eq!("STDOUT".parse::<Verbosity>().unwrap(), Verbosity::Stdout);
    }

    #[test]
    fn test_event_json_shape() {
        let (event, _) = capture(|| EVENTS.emit(&["board", "on"], json!({ "name": "rpi" })));
        let line = serde_json::to_value(&event).unwrap();
        assert_eq!(line["type"], json!(["board", "on"]));
        assert_eq!(line["data"]["name"], "rpi");
        assert!(line["time"].as_f64().unwrap() >= 0.0);
    }

    #[test]
    fn test_command_log_emits_on_finish() {
        let ((), events) = capture(|| {
            let (log, sink) = CommandLog::sink("lab", "uname -a");
            sink.borrow_mut().write_all(b"Linux lab\r\n").unwrap();
            log.borrow_mut().finish();
            // a second finish is a no-op
            log.borrow_mut().finish();
        });
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path(), "cmd/lab");
        assert_eq!(events[0].data["cmd"], "uname -a");
        assert_eq!(events[0].data["stdout"], "Linux lab\r\n");
    }

    #[test]
    fn test_testcase_events_nest() {
        let ((), events) = capture(|| {
            testcase_begin("outer");
            assert_eq!(nesting(), 1);
            testcase_begin("inner");
            testcase_end("inner", Duration::from_millis(1), true, None);
            testcase_end("outer", Duration::from_millis(2), false, Some("boom"));
        });
        let kinds: Vec<_> = events.iter().map(Event::path).collect();
        assert_eq!(kinds, ["tc/begin", "tc/begin", "tc/end", "tc/end"]);
        assert_eq!(events[3].data["success"], false);
        assert_eq!(events[3].data["error"], "boom");
        assert_eq!(nesting(), 0);
    }

    #[test]
    fn test_event_file_is_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new();
        log.set_output(Box::new(std::io::sink()));
        log.open_file(&dir.path().join("events.json")).unwrap();
        log.emit(&["msg", "info"], json!({ "text": "a" }));
        log.emit(&["tbot", "end"], json!({ "success": true }));
        log.close_file().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("events.json")).unwrap();
        let lines: Vec<Event> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].path(), "tbot/end");
        assert!(lines[0].time <= lines[1].time);
    }
}
