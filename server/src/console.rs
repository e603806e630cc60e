//! Console command and variable registries.
//!
//! Both registries are plain values built at startup and shared through an
//! `Arc<Console>`; sessions dispatch client string commands through them.

use log::info;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("console: {0} is already registered")]
    AlreadyRegistered(String),
    #[error("unknown command \"{0}\"")]
    UnknownCommand(String),
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },
    #[error("{0}: not implemented")]
    NotImplemented(String),
    #[error("{name}: {message}")]
    Failed { name: String, message: String },
}

pub type CommandHandler = Arc<dyn Fn(&[&str]) -> Result<(), ConsoleError> + Send + Sync>;

/// Named console commands
#[derive(Default)]
pub struct CommandRegistry {
    commands: Mutex<HashMap<String, CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, name: &str, handler: F) -> Result<(), ConsoleError>
    where
        F: Fn(&[&str]) -> Result<(), ConsoleError> + Send + Sync + 'static,
    {
        let mut commands = self.commands.lock();
        if commands.contains_key(name) {
            return Err(ConsoleError::AlreadyRegistered(name.to_string()));
        }
        commands.insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.lock().contains_key(name)
    }

    /// Runs `name` with `args`. The lock is released before the handler runs,
    /// so handlers may use the registry themselves.
    pub fn run(&self, name: &str, args: &[&str]) -> Result<(), ConsoleError> {
        let handler = self
            .commands
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ConsoleError::UnknownCommand(name.to_string()))?;
        handler(args)
    }

    /// Tokenises `line` on whitespace and runs the named command.
    pub fn execute(&self, line: &str) -> Result<(), ConsoleError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.split_first() {
            Some((name, args)) => self.run(name, args),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.commands.lock().keys().cloned().collect();
        names.sort();
        f.debug_struct("CommandRegistry")
            .field("commands", &names)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CvarFlags(u8);

impl CvarFlags {
    pub const NONE: CvarFlags = CvarFlags(0);
    /// Persisted to the config file.
    pub const ARCHIVE: CvarFlags = CvarFlags(1);
    /// Announced to clients when changed.
    pub const SERVER_SIDE: CvarFlags = CvarFlags(2);

    pub fn contains(self, other: CvarFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CvarFlags {
    type Output = CvarFlags;

    fn bitor(self, rhs: CvarFlags) -> CvarFlags {
        CvarFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CvarValue {
    Float(f64),
    Text(String),
}

impl fmt::Display for CvarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CvarValue::Float(v) => write!(f, "{}", v),
            CvarValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone)]
struct Cvar {
    value: CvarValue,
    flags: CvarFlags,
}

/// Named configuration values
#[derive(Debug, Default)]
pub struct CvarRegistry {
    vars: Mutex<HashMap<String, Cvar>>,
}

impl CvarRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, name: &str, value: CvarValue, flags: CvarFlags) -> Result<(), ConsoleError> {
        let mut vars = self.vars.lock();
        if vars.contains_key(name) {
            return Err(ConsoleError::AlreadyRegistered(name.to_string()));
        }
        vars.insert(name.to_string(), Cvar { value, flags });
        Ok(())
    }

    pub fn register_float(
        &self,
        name: &str,
        default: f64,
        flags: CvarFlags,
    ) -> Result<(), ConsoleError> {
        self.register(name, CvarValue::Float(default), flags)
    }

    pub fn register_string(
        &self,
        name: &str,
        default: &str,
        flags: CvarFlags,
    ) -> Result<(), ConsoleError> {
        self.register(name, CvarValue::Text(default.to_string()), flags)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.lock().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<CvarValue> {
        self.vars.lock().get(name).map(|cvar| cvar.value.clone())
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            CvarValue::Float(v) => Some(v),
            CvarValue::Text(_) => None,
        }
    }

    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name).map(|value| value.to_string())
    }

    pub fn flags(&self, name: &str) -> Option<CvarFlags> {
        self.vars.lock().get(name).map(|cvar| cvar.flags)
    }

    /// Parses `text` according to the variable's registered type.
    pub fn set(&self, name: &str, text: &str) -> Result<(), ConsoleError> {
        let mut vars = self.vars.lock();
        let cvar = vars
            .get_mut(name)
            .ok_or_else(|| ConsoleError::UnknownCommand(name.to_string()))?;
        cvar.value = match cvar.value {
            CvarValue::Float(_) => {
                let parsed = text.parse::<f64>().map_err(|_| ConsoleError::InvalidValue {
                    name: name.to_string(),
                    value: text.to_string(),
                })?;
                CvarValue::Float(parsed)
            }
            CvarValue::Text(_) => CvarValue::Text(text.to_string()),
        };
        Ok(())
    }
}

/// Commands and variables as one console
#[derive(Debug, Default)]
pub struct Console {
    pub commands: CommandRegistry,
    pub cvars: CvarRegistry,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    /// A console carrying the stock server variables and commands.
    pub fn with_defaults() -> Self {
        let console = Self::new();
        let stock_floats = [
            ("net_messagetimeout", 300.0, CvarFlags::NONE),
            ("sys_ticrate", 0.05, CvarFlags::NONE),
            ("maxplayers", 1.0, CvarFlags::SERVER_SIDE),
            ("developer", 0.0, CvarFlags::NONE),
        ];
        for (name, default, flags) in stock_floats {
            // Names are unique and the registry is fresh.
            let _ = console.cvars.register_float(name, default, flags);
        }
        let _ = console
            .cvars
            .register_string("hostname", "UNNAMED", CvarFlags::ARCHIVE);

        for name in ["slist", "listen", "port"] {
            let _ = console.commands.add(name, move |_| {
                Err(ConsoleError::NotImplemented(name.to_string()))
            });
        }
        console
    }

    /// Runs a command, reads a variable (`name`) or sets one (`name value`).
    pub fn execute(&self, line: &str) -> Result<(), ConsoleError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, args)) = tokens.split_first() else {
            return Ok(());
        };
        if self.commands.contains(name) {
            return self.commands.run(name, args);
        }
        if self.cvars.contains(name) {
            return match args.first() {
                Some(value) => self.cvars.set(name, value),
                None => {
                    if let Some(value) = self.cvars.get(name) {
                        info!("\"{}\" is \"{}\"", name, value);
                    }
                    Ok(())
                }
            };
        }
        Err(ConsoleError::UnknownCommand(name.to_string()))
    }
}
