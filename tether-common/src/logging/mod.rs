// Logging utilities for the Tether system
//
// This module provides a structured logging layer on top of the `log` facade:
// - Component-based categorization
// - Context-aware loggers for proxies and adaptors
// - Bus-name tracking through logger inheritance
// - Object-path tracing for per-object diagnostics

use log::{debug, error, info, warn};
use std::fmt::{self, Display, Formatter};

/// Predefined components for logging categorization
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Component {
    Proxy,
    Readiness,
    Queue,
    Connection,
    CallStream,
    Adaptor,
    Transport,
    System,
    Custom(&'static str),
}

impl Component {
    /// Get the string representation of the component
    pub fn as_str(&self) -> &str {
        match self {
            Component::Proxy => "Proxy",
            Component::Readiness => "Readiness",
            Component::Queue => "Queue",
            Component::Connection => "Connection",
            Component::CallStream => "CallStream",
            Component::Adaptor => "Adaptor",
            Component::Transport => "Transport",
            Component::System => "System",
            Component::Custom(name) => name,
        }
    }
}

// Lightweight Display helpers to avoid prefix String allocations
struct ComponentPrefixDisplay {
    parent: Option<Component>,
    component: Component,
}

impl Display for ComponentPrefixDisplay {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.parent {
            Some(parent) if parent != Component::System => {
                write!(f, "{}.{}", parent.as_str(), self.component.as_str())
            }
            _ => write!(f, "{}", self.component.as_str()),
        }
    }
}

struct MaybeObjectPathDisplay<'a>(Option<&'a str>);

impl Display for MaybeObjectPathDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(path) = self.0 {
            write!(f, "|object={path}")
        } else {
            Ok(())
        }
    }
}

/// A helper for creating component-specific loggers with bus-name tracking
#[derive(Clone)]
pub struct Logger {
    /// Component this logger is for
    component: Component,
    /// Bus name for tracing across proxies that share a connection
    bus_name: String,
    /// Parent component for hierarchical logging (if any)
    parent_component: Option<Component>,
    /// Object path for per-object tracing
    object_path: Option<String>,
}

impl Logger {
    /// Create a new root logger for a specific component and bus name
    pub fn new_root(component: Component, bus_name: &str) -> Self {
        Self {
            component,
            bus_name: bus_name.to_string(),
            parent_component: None,
            object_path: None,
        }
    }

    /// Create a child logger with the same bus name but a different component
    ///
    /// This is the preferred way to create loggers in proxies and adaptors.
    pub fn with_component(&self, component: Component) -> Self {
        Self {
            component,
            bus_name: self.bus_name.clone(),
            parent_component: Some(self.component),
            object_path: self.object_path.clone(),
        }
    }

    /// Create a logger carrying an object path
    ///
    /// Used to track a single remote object through introspection and
    /// change-notification handling.
    pub fn with_object_path(&self, path: impl Into<String>) -> Self {
        Self {
            component: self.component,
            bus_name: self.bus_name.clone(),
            parent_component: self.parent_component,
            object_path: Some(path.into()),
        }
    }

    /// Get the bus name this logger was created for
    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    fn prefix(&self) -> ComponentPrefixDisplay {
        ComponentPrefixDisplay {
            parent: self.parent_component,
            component: self.component,
        }
    }

    fn object(&self) -> MaybeObjectPathDisplay<'_> {
        MaybeObjectPathDisplay(self.object_path.as_deref())
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        debug!(
            "[{}] [{}{}] {}",
            self.bus_name,
            self.prefix(),
            self.object(),
            message.as_ref()
        );
    }

    pub fn info(&self, message: impl AsRef<str>) {
        info!(
            "[{}] [{}{}] {}",
            self.bus_name,
            self.prefix(),
            self.object(),
            message.as_ref()
        );
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        warn!(
            "[{}] [{}{}] {}",
            self.bus_name,
            self.prefix(),
            self.object(),
            message.as_ref()
        );
    }

    pub fn error(&self, message: impl AsRef<str>) {
        error!(
            "[{}] [{}{}] {}",
            self.bus_name,
            self.prefix(),
            self.object(),
            message.as_ref()
        );
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("component", &self.component)
            .field("bus_name", &self.bus_name)
            .field("object_path", &self.object_path)
            .finish()
    }
}

/// Initialize the process-wide logger from the environment (RUST_LOG)
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let _ = env_logger::Builder::from_default_env().try_init();
}
