//! Console UI collaborator
//!
//! Renders session notifications and keeps the running text of decoded card
//! reads. Everything here runs on the UI task; the session and reader threads
//! only reach it through `UiEvent`s.

use common::{DeviceDescriptor, UiHandler};
use std::io::Write;

/// Accumulated text of decoded reads
///
/// Only grows by appending; only an explicit user reset empties it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DisplayLog {
    text: String,
}

impl DisplayLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one decoded fragment, space separated from the previous one
    pub fn append(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(fragment);
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Commands typed into the console
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    /// Clear the display log (UI only)
    ClearDisplay,
    /// Look for the device again
    Rescan,
    /// Tear down the current session
    Reset,
    /// Answer a pending permission prompt
    Answer(bool),
    Quit,
    Help,
}

/// Parse one console input line
pub fn parse_command(line: &str) -> Option<UserCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "c" | "clear" => Some(UserCommand::ClearDisplay),
        "s" | "scan" | "rescan" => Some(UserCommand::Rescan),
        "x" | "reset" => Some(UserCommand::Reset),
        "y" | "yes" => Some(UserCommand::Answer(true)),
        "n" | "no" => Some(UserCommand::Answer(false)),
        "q" | "quit" | "exit" => Some(UserCommand::Quit),
        "h" | "help" | "?" => Some(UserCommand::Help),
        _ => None,
    }
}

pub const HELP_TEXT: &str =
    "Commands: c = clear display, s = rescan, x = reset session, y/n = answer prompt, q = quit";

/// Line-oriented console renderer
pub struct ConsoleUi<W: Write> {
    out: W,
    log: DisplayLog,
    status: &'static str,
    pending_permission: Option<DeviceDescriptor>,
}

impl<W: Write> ConsoleUi<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            log: DisplayLog::new(),
            status: "Device is disconnected",
            pending_permission: None,
        }
    }

    pub fn log(&self) -> &DisplayLog {
        &self.log
    }

    pub fn status(&self) -> &str {
        self.status
    }

    pub fn pending_permission(&self) -> Option<&DeviceDescriptor> {
        self.pending_permission.as_ref()
    }

    /// Take the device a prompt is waiting on, if any
    pub fn take_pending_permission(&mut self) -> Option<DeviceDescriptor> {
        self.pending_permission.take()
    }

    /// Clear the card text; the session is left alone
    pub fn reset_display(&mut self) {
        self.log.clear();
        self.line(format_args!("Display cleared"));
    }

    pub fn print(&mut self, message: &str) {
        self.line(format_args!("{}", message));
    }

    fn line(&mut self, args: std::fmt::Arguments<'_>) {
        // A closed stdout is not worth crashing over
        let _ = writeln!(self.out, "{}", args);
        let _ = self.out.flush();
    }
}

impl<W: Write> UiHandler for ConsoleUi<W> {
    fn on_connected(&mut self, device: &DeviceDescriptor) {
        self.status = "Device is connected";
        self.pending_permission = None;
        let status = self.status;
        self.line(format_args!("{} ({})", status, device));
    }

    fn on_disconnected(&mut self) {
        self.status = "Device is disconnected";
        self.pending_permission = None;
        let status = self.status;
        self.line(format_args!("{}", status));
    }

    fn on_permission_denied(&mut self, device: &DeviceDescriptor) {
        self.status = "Device is disconnected";
        self.pending_permission = None;
        self.line(format_args!("Permission denied for device {}", device));
    }

    fn on_data_appended(&mut self, text: &str) {
        self.log.append(text);
        let line = format!("Card: {}", self.log.as_str());
        self.line(format_args!("{}", line));
    }

    fn on_permission_requested(&mut self, device: &DeviceDescriptor) {
        self.line(format_args!("Allow access to {}? [y/n]", device));
        self.pending_permission = Some(device.clone());
    }
}
