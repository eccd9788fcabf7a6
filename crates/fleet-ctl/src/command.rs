//! Supported worker-control commands and their endpoints.

use std::fmt;
use std::str::FromStr;

/// A worker-control command. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    List,
    Status,
    Start,
    Shutdown,
    Create,
    Destroy,
    Bounce,
    Uptime,
    Info,
    Delete,
    Cleanup,
}

impl Command {
    pub const ALL: [Command; 11] = [
        Command::List,
        Command::Status,
        Command::Start,
        Command::Shutdown,
        Command::Create,
        Command::Destroy,
        Command::Bounce,
        Command::Uptime,
        Command::Info,
        Command::Delete,
        Command::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::List => "list",
            Command::Status => "status",
            Command::Start => "start",
            Command::Shutdown => "shutdown",
            Command::Create => "create",
            Command::Destroy => "destroy",
            Command::Bounce => "bounce",
            Command::Uptime => "uptime",
            Command::Info => "info",
            Command::Delete => "delete",
            Command::Cleanup => "cleanup",
        }
    }

    /// Path and query of the control endpoint for this command.
    pub fn path(&self) -> &'static str {
        match self {
            Command::List => "/wctrl?cmd=list",
            Command::Status => "/wctrl?cmd=status",
            Command::Start => "/wctrl?cmd=start",
            Command::Shutdown => "/wctrl?cmd=shutdown",
            Command::Create => "/wctrl?cmd=create",
            Command::Destroy => "/wctrl?cmd=destroy",
            Command::Bounce => "/wctrl?cmd=bounce",
            Command::Uptime => "/wctrl?cmd=uptime",
            Command::Info => "/wctrl?cmd=info",
            Command::Delete => "/wctrl?cmd=delete",
            Command::Cleanup => "/wctrl?cmd=cleanup",
        }
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("Invalid or unsupported workerctrl command: {s}"))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Fully resolved control endpoint of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub command: Command,
}

impl Endpoint {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn path(&self) -> &'static str {
        self.command.path()
    }

    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme.as_str(), self.authority(), self.path())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}
