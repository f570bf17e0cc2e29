//! Request parser (`spec.md` §4.3, §3): the service-specific command
//! grammars and the [`FrameSink`] implementations that feed them from the
//! pkt-line stream.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use regex::Regex;
use std::sync::OnceLock;

use crate::pktline::stream::FrameSink;
use crate::service::Service;

const ZERO_ID: &str = "0000000000000000000000000000000000000000";

/// `Command (receive-pack)`: one ref update requested by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveCommand {
    pub kind: ReceiveCommandKind,
    pub old_commit: String,
    pub new_commit: String,
    pub reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveCommandKind {
    Create,
    Update,
    Delete,
}

impl ReceiveCommand {
    fn classify(old_commit: &str, new_commit: &str) -> ReceiveCommandKind {
        if old_commit == ZERO_ID {
            ReceiveCommandKind::Create
        } else if new_commit == ZERO_ID {
            ReceiveCommandKind::Delete
        } else {
            ReceiveCommandKind::Update
        }
    }

    fn new(old_commit: String, new_commit: String, reference: String) -> Self {
        let kind = Self::classify(&old_commit, &new_commit);
        Self {
            kind,
            old_commit,
            new_commit,
            reference,
        }
    }
}

/// `Command (upload-pack)`: a single `want`/`have` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadCommandKind {
    Want,
    Have,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCommand {
    pub kind: UploadCommandKind,
    pub commit: String,
}

/// A parsed command of either service, as stored on [`crate::context::Context`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Receive(ReceiveCommand),
    Upload(UploadCommand),
}

/// Ordered `name -> Option<value>` capability map (`spec.md` §3
/// "Capabilities"). `foo` maps to `None`; `foo=bar` maps to `Some("bar")`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeMap<String, Option<String>>);

impl Capabilities {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Option<String>> {
        self.0.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Option<String>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn merge_from_str(&mut self, caps: &str) {
        for token in caps.split(' ') {
            if token.is_empty() {
                continue;
            }
            match token.split_once('=') {
                Some((k, v)) => {
                    self.0.insert(k.to_owned(), Some(v.to_owned()));
                }
                None => {
                    self.0.insert(token.to_owned(), None);
                }
            }
        }
    }
}

/// Shared state written by a [`FrameSink`] during the initialisation
/// window and read by [`crate::context::Context`] afterward (`spec.md` §5
/// "Shared-resource policy").
#[derive(Debug, Default)]
pub struct ParsedState {
    pub commands: Vec<Command>,
    pub capabilities: Capabilities,
}

pub type SharedParsedState = Arc<Mutex<ParsedState>>;

fn receive_pack_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^(?P<old>[0-9a-f]{40})\x20
             (?P<new>[0-9a-f]{40})\x20
             (?P<ref>refs/[^\x20\0\n]*)
             (?:\x20(?P<caps>[a-z0-9_\-]+(?:=[\w.\-/]+)?(?:\x20[a-z0-9_\-]+(?:=[\w.\-/]+)?)*))?
             \x20?\n?$
            ",
        )
        .expect("static receive-pack grammar is a valid regex")
    })
}

fn upload_pack_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^(?P<kind>want|have)\x20
             (?P<sha>[0-9a-f]{40})
             (?:\x20(?P<caps>[a-z0-9_\-]+(?:=[\w.\-/]+)?(?:\x20[a-z0-9_\-]+(?:=[\w.\-/]+)?)*))?
             \x20?\n?$
            ",
        )
        .expect("static upload-pack grammar is a valid regex")
    })
}

/// Frame sink for `receive-pack` request bodies. Binds frames that match
/// the ref-update grammar into [`ReceiveCommand`]s; everything else
/// (notably the zero-id handshake line with no preceding commands, and any
/// line the server doesn't recognise) is silently ignored per `spec.md`
/// §9's Open Question resolution.
pub struct ReceivePackSink {
    state: SharedParsedState,
    seen_first: bool,
}

impl ReceivePackSink {
    #[must_use]
    pub fn new(state: SharedParsedState) -> Self {
        Self {
            state,
            seen_first: false,
        }
    }
}

impl FrameSink for ReceivePackSink {
    fn on_frame(&mut self, frame: &[u8]) {
        // A client may send a NUL-separated capabilities suffix on the
        // *first* command line instead of (or in addition to) a trailing
        // space-separated one; normalise it to a space before matching.
        let mut owned;
        let text: &[u8] = if !self.seen_first {
            if let Some(nul) = frame.iter().position(|&b| b == 0) {
                owned = frame.to_vec();
                owned[nul] = b' ';
                &owned
            } else {
                frame
            }
        } else {
            frame
        };
        self.seen_first = true;

        let Ok(text) = std::str::from_utf8(text) else {
            return;
        };
        let Some(caps) = receive_pack_regex().captures(text) else {
            return;
        };

        let old_commit = caps["old"].to_owned();
        let new_commit = caps["new"].to_owned();
        let reference = caps["ref"].to_owned();
        let command = ReceiveCommand::new(old_commit, new_commit, reference);

        let mut state = self.state.lock().expect("parsed state mutex poisoned");
        if let Some(cap_str) = caps.name("caps") {
            state.capabilities.merge_from_str(cap_str.as_str());
        }
        state.commands.push(Command::Receive(command));
    }
}

/// Frame sink for `upload-pack` request bodies (`want`/`have` lines).
pub struct UploadPackSink {
    state: SharedParsedState,
}

impl UploadPackSink {
    #[must_use]
    pub fn new(state: SharedParsedState) -> Self {
        Self { state }
    }
}

impl FrameSink for UploadPackSink {
    fn on_frame(&mut self, frame: &[u8]) {
        let Ok(text) = std::str::from_utf8(frame) else {
            return;
        };
        let Some(caps) = upload_pack_regex().captures(text) else {
            return;
        };

        let kind = match &caps["kind"] {
            "want" => UploadCommandKind::Want,
            _ => UploadCommandKind::Have,
        };
        let commit = caps["sha"].to_owned();

        let mut state = self.state.lock().expect("parsed state mutex poisoned");
        if let Some(cap_str) = caps.name("caps") {
            state.capabilities.merge_from_str(cap_str.as_str());
        }
        state.commands.push(Command::Upload(UploadCommand {
            kind,
            commit,
        }));
    }
}

/// Builds the right sink for `service`, sharing `state` with the
/// `Context` that owns it.
#[must_use]
pub fn sink_for(service: Service, state: SharedParsedState) -> Box<dyn FrameSink> {
    match service {
        Service::UploadPack => Box::new(UploadPackSink::new(state)),
        Service::ReceivePack => Box::new(ReceivePackSink::new(state)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SharedParsedState {
        Arc::new(Mutex::new(ParsedState::default()))
    }

    #[test]
    fn classifies_create_update_delete() {
        let zero = ZERO_ID;
        let hex_a = "1".repeat(40);
        let hex_b = "2".repeat(40);

        assert_eq!(
            ReceiveCommand::classify(zero, &hex_a),
            ReceiveCommandKind::Create
        );
        assert_eq!(
            ReceiveCommand::classify(&hex_a, zero),
            ReceiveCommandKind::Delete
        );
        assert_eq!(
            ReceiveCommand::classify(&hex_a, &hex_b),
            ReceiveCommandKind::Update
        );
    }

    #[test]
    fn receive_pack_sink_parses_two_commands_and_caps() {
        let st = state();
        let mut sink = ReceivePackSink::new(st.clone());

        let zero = ZERO_ID;
        let new = "a".repeat(40);
        let old = "b".repeat(40);

        let first = format!("{zero} {new} refs/heads/main\0report-status side-band-64k\n");
        sink.on_frame(first.as_bytes());

        let second = format!("{old} {zero} refs/heads/old\n");
        sink.on_frame(second.as_bytes());

        let guard = st.lock().unwrap();
        assert_eq!(guard.commands.len(), 2);
        assert!(matches!(
            guard.commands[0],
            Command::Receive(ReceiveCommand {
                kind: ReceiveCommandKind::Create,
                ..
            })
        ));
        assert!(matches!(
            guard.commands[1],
            Command::Receive(ReceiveCommand {
                kind: ReceiveCommandKind::Delete,
                ..
            })
        ));
        assert!(guard.capabilities.contains("report-status"));
        assert!(guard.capabilities.contains("side-band-64k"));
    }

    #[test]
    fn upload_pack_sink_parses_want_and_have() {
        let st = state();
        let mut sink = UploadPackSink::new(st.clone());

        let sha_a = "c".repeat(40);
        let sha_b = "d".repeat(40);
        sink.on_frame(format!("want {sha_a} multi_ack side-band\n").as_bytes());
        sink.on_frame(format!("have {sha_b}\n").as_bytes());

        let guard = st.lock().unwrap();
        assert_eq!(guard.commands.len(), 2);
        assert!(matches!(
            &guard.commands[0],
            Command::Upload(UploadCommand { kind: UploadCommandKind::Want, commit }) if *commit == sha_a
        ));
        assert!(matches!(
            &guard.commands[1],
            Command::Upload(UploadCommand { kind: UploadCommandKind::Have, commit }) if *commit == sha_b
        ));
        assert!(guard.capabilities.contains("multi_ack"));
    }

    #[test]
    fn unmatched_frames_are_silently_ignored() {
        let st = state();
        let mut sink = UploadPackSink::new(st.clone());
        sink.on_frame(b"done\n");
        sink.on_frame(b"not-a-command at all");
        assert!(st.lock().unwrap().commands.is_empty());
    }
}
