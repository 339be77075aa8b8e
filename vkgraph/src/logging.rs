//! Colored diagnostics on stderr, switched per channel by environment variables.
//!
//! `VKGRAPH_TRACE` covers graph building and encoding, `VKGRAPH_VULKAN_TRACE`
//! covers device calls. Each accepts `basic` (or `1`) and `full`; anything else
//! is off. The value is read once per process.

use std::env;
use std::fmt::Arguments;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Off,
    Basic,
    Full,
}

impl Verbosity {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "basic" => Verbosity::Basic,
            "full" => Verbosity::Full,
            _ => Verbosity::Off,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Graph,
    Device,
}

impl Channel {
    pub fn env_var(self) -> &'static str {
        match self {
            Channel::Graph => "VKGRAPH_TRACE",
            Channel::Device => "VKGRAPH_VULKAN_TRACE",
        }
    }

    pub fn verbosity(self) -> Verbosity {
        static GRAPH: OnceLock<Verbosity> = OnceLock::new();
        static DEVICE: OnceLock<Verbosity> = OnceLock::new();
        let cache = match self {
            Channel::Graph => &GRAPH,
            Channel::Device => &DEVICE,
        };
        *cache.get_or_init(|| {
            env::var(self.env_var())
                .map(|value| Verbosity::parse(&value))
                .unwrap_or(Verbosity::Off)
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Recoverable oddities; graph channel at `full` only.
    Warning,
    Error,
    /// Printed whatever the environment says.
    Critical,
    Trace,
    VkTrace,
}

impl Severity {
    fn label(self) -> (&'static str, &'static str) {
        match self {
            Severity::Warning => ("WARNING", "33"),
            Severity::Error => ("ERROR", "91"),
            Severity::Critical => ("CRITICAL", "31"),
            Severity::Trace => ("TRACE", "34"),
            Severity::VkTrace => ("VK_TRACE", "32"),
        }
    }

    pub fn enabled(self) -> bool {
        match self {
            Severity::Critical => true,
            Severity::Warning => Channel::Graph.verbosity() >= Verbosity::Full,
            Severity::Error | Severity::Trace => Channel::Graph.verbosity() >= Verbosity::Basic,
            Severity::VkTrace => Channel::Device.verbosity() >= Verbosity::Basic,
        }
    }
}

fn time_of_day() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3_600, (secs % 3_600) / 60, secs % 60)
}

pub fn log(severity: Severity, args: Arguments) {
    if severity.enabled() {
        let (label, color) = severity.label();
        eprintln!("{} [\u{001b}[{color}m{label}\u{001b}[0m] {args}", time_of_day());
    }
}

#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::Severity::Warning, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::Severity::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! critical {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::Severity::Critical, format_args!($($arg)*))
    };
}

/// Graph channel trace.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::Severity::Trace, format_args!($($arg)*))
    };
}

/// Device channel trace.
#[macro_export]
macro_rules! vk_trace {
    ($($arg:tt)*) => {
        $crate::logging::log($crate::logging::Severity::VkTrace, format_args!($($arg)*))
    };
}
