//! Command processor: raw console lines into outgoing messages.
//!
//! Plain text is broadcast with SAY. Slash commands:
//!
//! ```text
//! /msg <name> <text>   private message (SAYTO) to one peer
//! /name <name>         change the local display name
//! /peers               list known peers
//! /help                usage
//! ```

use gossip_core::{Error, Message};

use crate::chat::{emit, OutputSink};
use crate::peer::{is_valid_name, PeerLookup, PeerRegistry};

const USAGE: &str = "commands: /msg <name> <text>, /name <name>, /peers, /help";

pub struct CommandProcessor {
    registry: PeerRegistry,
    output: OutputSink,
}

impl CommandProcessor {
    pub fn new(registry: PeerRegistry, output: OutputSink) -> Self {
        Self { registry, output }
    }

    /// Handle one line of user input.
    pub fn process(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let Some(command) = line.strip_prefix('/') else {
            self.say(line);
            return;
        };

        let (name, args) = match command.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (command, ""),
        };
        match name {
            "msg" => self.say_to(args),
            "name" => self.rename(args),
            "peers" => self.list_peers(),
            "help" => emit(&self.output, USAGE.to_string()),
            other => emit(&self.output, format!("Unknown command: {other}")),
        }
    }

    fn say(&self, text: &str) {
        emit(
            &self.output,
            format!("[{}] {}", self.registry.local_name(), text),
        );
        let sent = self.registry.send_to_all(Message::say(text));
        tracing::debug!(peers = sent, "broadcast queued");
    }

    fn say_to(&self, args: &str) {
        let Some((recipient, text)) = args.split_once(char::is_whitespace) else {
            emit(&self.output, "usage: /msg <name> <text>".to_string());
            return;
        };
        let text = text.trim();
        let Some(peer) = self.registry.find_by_name(recipient) else {
            emit(&self.output, format!("No peer named {recipient}"));
            return;
        };
        if peer.send(Message::say_to(text)) {
            emit(
                &self.output,
                format!("[{} -> {}] {}", self.registry.local_name(), peer, text),
            );
        } else {
            emit(&self.output, format!("{peer} is not connected"));
        }
    }

    fn rename(&self, name: &str) {
        if !is_valid_name(name) {
            emit(&self.output, "usage: /name <name-without-spaces>".to_string());
            return;
        }
        match self.registry.set_local_name(name) {
            Ok(()) => {
                emit(&self.output, format!("You are now known as {name}"));
                self.registry.send_to_all(Message::name(name));
            }
            Err(Error::IdentityConflict { .. }) => {
                emit(&self.output, format!("{name} is already taken"));
            }
            Err(e) => tracing::warn!(error = %e, "rename failed"),
        }
    }

    fn list_peers(&self) {
        let peers = self.registry.peers();
        if peers.is_empty() {
            emit(&self.output, "No peers".to_string());
            return;
        }
        for peer in peers {
            emit(&self.output, format!("{} ({})", peer, peer.address));
        }
    }
}
