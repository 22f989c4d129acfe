//! Interface to the host's item registry.
//!
//! The engine never stores item values itself. It asks the host for the
//! current state, publishes updates, and sends commands through
//! [`ItemRegistry`].

use crate::codec::Hsb;
use std::collections::HashMap;
use std::sync::RwLock;

/// Value held by a host item.
#[derive(Debug, Clone, PartialEq)]
pub enum State {
    /// The item has never been set
    Undefined,
    On,
    Off,
    Open,
    Closed,
    Decimal(f64),
    Percent(u8),
    Hsb(Hsb),
}

impl State {
    pub fn on_off(on: bool) -> Self {
        if on { State::On } else { State::Off }
    }

    pub fn open_closed(open: bool) -> Self {
        if open { State::Open } else { State::Closed }
    }
}

/// Command sent to (or received from) a host item.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    On,
    Off,
    Percent(u8),
    Hsb(Hsb),
}

impl Command {
    pub fn on_off(on: bool) -> Self {
        if on { Command::On } else { Command::Off }
    }
}

/// Result of looking an item up in the host registry.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemLookup {
    Found(State),
    NotFound,
}

/// The host side of the engine.
///
/// Called from the receive loop and from command callers concurrently, so
/// implementations must be thread safe.
pub trait ItemRegistry: Send + Sync {
    /// Every `(item name, item type string)` pair bound to this engine.
    fn bindings(&self) -> Vec<(String, String)>;

    /// Current state of an item.
    fn state(&self, item: &str) -> ItemLookup;

    /// Publishes a new state for an item.
    fn post_update(&self, item: &str, state: State);

    /// Sends a command to an item.
    fn send_command(&self, item: &str, command: Command);

    /// Type string bound to one item.
    fn item_type(&self, item: &str) -> Option<String> {
        self.bindings()
            .into_iter()
            .find(|(name, _)| name == item)
            .map(|(_, item_type)| item_type)
    }
}

struct MemoryItem {
    item_type: String,
    state: State,
}

/// Item registry kept in memory.
///
/// Useful for embedding without a host framework and for tests: it records
/// every update and command it receives.
#[derive(Default)]
pub struct MemoryItemRegistry {
    items: RwLock<HashMap<String, MemoryItem>>,
    updates: RwLock<Vec<(String, State)>>,
    commands: RwLock<Vec<(String, Command)>>,
}

impl MemoryItemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an item bound to `item_type`, initially [`State::Undefined`].
    pub fn bind(&self, item: &str, item_type: &str) {
        if let Ok(mut items) = self.items.write() {
            items.insert(
                item.to_string(),
                MemoryItem {
                    item_type: item_type.to_string(),
                    state: State::Undefined,
                },
            );
        }
    }

    /// Overwrites the state of an existing item without recording an update.
    pub fn set_state(&self, item: &str, state: State) {
        if let Ok(mut items) = self.items.write()
            && let Some(entry) = items.get_mut(item)
        {
            entry.state = state;
        }
    }

    /// Every update published so far, oldest first.
    pub fn updates(&self) -> Vec<(String, State)> {
        self.updates.read().map(|u| u.clone()).unwrap_or_default()
    }

    /// Every command sent so far, oldest first.
    pub fn commands(&self) -> Vec<(String, Command)> {
        self.commands.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Forgets recorded updates and commands.
    pub fn clear_history(&self) {
        if let Ok(mut u) = self.updates.write() {
            u.clear();
        }
        if let Ok(mut c) = self.commands.write() {
            c.clear();
        }
    }
}

impl ItemRegistry for MemoryItemRegistry {
    fn bindings(&self) -> Vec<(String, String)> {
        self.items
            .read()
            .map(|items| {
                items
                    .iter()
                    .map(|(name, item)| (name.clone(), item.item_type.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn state(&self, item: &str) -> ItemLookup {
        self.items
            .read()
            .ok()
            .and_then(|items| items.get(item).map(|i| ItemLookup::Found(i.state.clone())))
            .unwrap_or(ItemLookup::NotFound)
    }

    fn post_update(&self, item: &str, state: State) {
        self.set_state(item, state.clone());
        if let Ok(mut updates) = self.updates.write() {
            updates.push((item.to_string(), state));
        }
    }

    fn send_command(&self, item: &str, command: Command) {
        if let Ok(mut commands) = self.commands.write() {
            commands.push((item.to_string(), command));
        }
    }
}
