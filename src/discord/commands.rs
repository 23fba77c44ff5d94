use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Callback invoked with the `d` payload of the triggering MESSAGE_CREATE.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Clone)]
pub struct Command {
    name: Box<str>,
    handler: Handler,
}

impl Command {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke(&self, payload: &Value) {
        (self.handler)(payload)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command").field("name", &self.name).finish()
    }
}

/// Command names mapped to handlers, in registration order.
///
/// Duplicate names are kept; lookups return the earliest registration.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: Vec<Command>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<Box<str>>, handler: F) -> &mut Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.commands.push(Command {
            name: name.into(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Case-insensitive lookup.
    pub fn lookup(&self, name: &str) -> Option<&Command> {
        let name = name.to_lowercase();
        self.commands
            .iter()
            .find(|command| command.name.to_lowercase() == name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
