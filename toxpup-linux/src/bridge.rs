//! Bridge side of the daemon: one session per configured puppet, notification
//! translation into operator status lines, and console command execution.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::mpsc;
use toxpup_core::{
    BootstrapNode, FileTransfer, Fetcher, Notification, PeerIdentity, Session, SessionConfig,
    UserStatus,
};
use tracing::{debug, info, warn};

use crate::commands::{Command, HELP};
use crate::config::{Config, PuppetConfig};
use crate::loopback::{LoopbackNetwork, LoopbackTransport};

type PuppetSession = Session<LoopbackTransport>;

/// One line of operator-facing status from a puppet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub puppet: String,
    pub text: String,
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.puppet, self.text)
    }
}

pub type StatusSender = mpsc::UnboundedSender<StatusLine>;

/// Presence label shown for a peer status.
pub fn presence_label(status: UserStatus) -> &'static str {
    match status {
        UserStatus::Online => "online",
        UserStatus::Offline => "offline",
        UserStatus::Away | UserStatus::Busy => "unavailable",
    }
}

pub fn friend_request_prompt(puppet: &str, key: &PeerIdentity, message: &str) -> String {
    format!(
        "New incoming friends request from key `{key}` with the following message:\n\n\
         {message}\n\n\
         Type `acceptfriend {puppet} {key}` to accept it."
    )
}

/// Status line for a notification that needs no further work.
fn describe(notification: &Notification, puppet: &str) -> Option<String> {
    match notification {
        Notification::Connected { address } => Some(format!("connected, address {address}")),
        Notification::Disconnected => Some("disconnected".to_string()),
        Notification::Message {
            peer,
            text,
            is_action: false,
        } => Some(format!("<{peer}> {text}")),
        Notification::Message {
            peer,
            text,
            is_action: true,
        } => Some(format!("* {peer} {text}")),
        Notification::PresenceChanged { peer, status } => {
            Some(format!("{peer} is {}", presence_label(*status)))
        }
        Notification::StatusMessageChanged { peer, text } => {
            Some(format!("{peer} set status message: {text}"))
        }
        Notification::FriendRequestReceived {
            public_key,
            message,
        } => Some(friend_request_prompt(puppet, public_key, message)),
        Notification::TypingChanged { .. }
        | Notification::NameChanged { .. }
        | Notification::FileReceived { .. }
        | Notification::AvatarReceived { .. } => None,
    }
}

/// Keep only the final path component of a peer-supplied name.
fn safe_file_name(name: &str) -> String {
    match Path::new(name).file_name().and_then(|n| n.to_str()) {
        Some(n) if !n.is_empty() => n.to_string(),
        _ => "file".to_string(),
    }
}

/// Write a received file below `dir`, prefixed with the sender's key.
pub async fn save_received(dir: &Path, peer: &PeerIdentity, file: &FileTransfer) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}-{}", &peer.to_hex()[..8], safe_file_name(&file.name)));
    tokio::fs::write(&path, file.data()).await?;
    Ok(path)
}

fn status(tx: &StatusSender, puppet: &str, text: impl Into<String>) {
    let line = StatusLine {
        puppet: puppet.to_string(),
        text: text.into(),
    };
    if tx.send(line).is_err() {
        debug!(puppet = %puppet, "status receiver gone");
    }
}

/// Translate one puppet's notifications until its session goes away.
async fn pump(
    puppet: String,
    session: PuppetSession,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    received_dir: PathBuf,
    tx: StatusSender,
) {
    while let Some(notification) = notifications.recv().await {
        if let Some(line) = describe(&notification, &puppet) {
            status(&tx, &puppet, line);
            continue;
        }
        match notification {
            Notification::FileReceived { peer, file } => {
                match save_received(&received_dir, &peer, &file).await {
                    Ok(path) => status(
                        &tx,
                        &puppet,
                        format!("received file `{}` from {peer}, saved to {}", file.name, path.display()),
                    ),
                    Err(err) => warn!(puppet = %puppet, %peer, %err, "failed to store received file"),
                }
            }
            Notification::AvatarReceived { peer, file } => {
                let dir = received_dir.join("avatars");
                match save_received(&dir, &peer, &file).await {
                    Ok(path) => debug!(puppet = %puppet, %peer, path = %path.display(), "stored peer avatar"),
                    Err(err) => warn!(puppet = %puppet, %peer, %err, "failed to store peer avatar"),
                }
            }
            Notification::NameChanged { peer } => match session.friend_name(&peer).await {
                Ok(name) => status(&tx, &puppet, format!("{peer} is now known as {name}")),
                Err(err) => debug!(puppet = %puppet, %peer, %err, "name lookup failed"),
            },
            Notification::TypingChanged { peer, typing } => {
                debug!(puppet = %puppet, %peer, typing, "typing");
            }
            _ => {}
        }
    }
    debug!(puppet = %puppet, "notification stream closed");
}

pub struct Bridge {
    puppets: BTreeMap<String, PuppetSession>,
}

impl Bridge {
    /// Open every configured puppet, apply its profile and connect it. A puppet
    /// that fails to connect stays registered so `connect` can retry it.
    pub async fn start(
        config: &Config,
        nodes: Vec<BootstrapNode>,
        fetcher: Arc<dyn Fetcher>,
        tx: StatusSender,
    ) -> anyhow::Result<Self> {
        let network = LoopbackNetwork::new();
        let mut puppets = BTreeMap::new();
        for puppet in &config.puppets {
            let save = config.save_path(puppet);
            let transport = network
                .open(&save)
                .with_context(|| format!("opening puppet {}", puppet.name))?;
            let key = transport.public_key();
            let (session, notifications) = Session::new(
                transport,
                Arc::clone(&fetcher),
                SessionConfig {
                    bootstrap_nodes: nodes.clone(),
                },
            );
            tokio::spawn(pump(
                puppet.name.clone(),
                session.clone(),
                notifications,
                config.received_dir(),
                tx.clone(),
            ));
            bring_up(puppet, &session, &tx).await;
            info!(puppet = %puppet.name, %key, save = %save.display(), "puppet started");
            puppets.insert(puppet.name.clone(), session);
        }
        Ok(Self { puppets })
    }

    pub async fn shutdown(&self) {
        for (name, session) in &self.puppets {
            if let Err(err) = session.disconnect().await {
                warn!(puppet = %name, %err, "disconnect failed");
            }
        }
    }

    /// Run one console command and return the reply for the operator.
    pub async fn execute(&self, command: Command) -> String {
        let puppet = match &command {
            Command::Help => return HELP.to_string(),
            Command::AcceptFriend { puppet, .. }
            | Command::AddFriend { puppet, .. }
            | Command::RemoveFriend { puppet, .. }
            | Command::Message { puppet, .. }
            | Command::File { puppet, .. }
            | Command::Name { puppet, .. }
            | Command::Avatar { puppet, .. }
            | Command::Friends { puppet }
            | Command::WhoAmI { puppet }
            | Command::Connect { puppet }
            | Command::Disconnect { puppet } => puppet.clone(),
        };
        let Some(session) = self.puppets.get(&puppet) else {
            return "Puppet not found!".to_string();
        };
        match run(session, command).await {
            Ok(reply) => reply,
            Err((reply, err)) => {
                warn!(puppet = %puppet, err = %format!("{err:#}"), "{reply}");
                format!("{reply} {err:#}")
            }
        }
    }
}

/// Apply the configured profile, then connect. A failed connect is reported as
/// a status line and left for the operator to retry.
async fn bring_up(puppet: &PuppetConfig, session: &PuppetSession, tx: &StatusSender) {
    if let Some(name) = &puppet.display_name {
        if let Err(err) = session.set_name(name).await {
            warn!(puppet = %puppet.name, %err, "failed to set display name");
        }
    }
    if let Some(url) = &puppet.avatar_url {
        if let Err(err) = session.set_avatar(url).await {
            warn!(puppet = %puppet.name, %err, "failed to set avatar");
        }
    }
    if let Err(err) = session.connect().await {
        warn!(puppet = %puppet.name, %err, "failed to connect client");
        status(tx, &puppet.name, format!("Failed to connect client: {err}"));
    }
}

type Failure = (&'static str, anyhow::Error);

fn fail<E: Into<anyhow::Error>>(reply: &'static str) -> impl FnOnce(E) -> Failure {
    move |err| (reply, err.into())
}

async fn run(session: &PuppetSession, command: Command) -> Result<String, Failure> {
    match command {
        Command::Help => Ok(HELP.to_string()),
        Command::AcceptFriend { key, .. } => {
            session
                .accept_friend_request(&key)
                .await
                .map_err(fail("Couldn't accept friends request!"))?;
            Ok("Accepted friends request!".to_string())
        }
        Command::AddFriend {
            address, message, ..
        } => {
            session
                .add_friend(&address, &message)
                .await
                .map_err(fail("Couldn't add new friend!"))?;
            Ok("Added new friend!".to_string())
        }
        Command::RemoveFriend { key, .. } => {
            session
                .remove_friend(&key)
                .await
                .map_err(fail("Couldn't remove friend!"))?;
            Ok("Removed friend!".to_string())
        }
        Command::Message {
            key,
            text,
            is_action,
            ..
        } => {
            session
                .send_message(&key, &text, is_action)
                .await
                .map_err(fail("Couldn't send message!"))?;
            Ok("Sent.".to_string())
        }
        Command::File { key, path, .. } => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))
                .map_err(fail("Couldn't read file!"))?;
            let name = safe_file_name(&path.to_string_lossy());
            session
                .send_file(&key, Bytes::from(data), &name)
                .await
                .map_err(fail("Couldn't send file!"))?;
            Ok(format!("Offered `{name}`."))
        }
        Command::Name { name, .. } => {
            session
                .set_name(&name)
                .await
                .map_err(fail("Couldn't set name!"))?;
            Ok("Name updated.".to_string())
        }
        Command::Avatar { url, .. } => {
            session
                .set_avatar(&url)
                .await
                .map_err(fail("Couldn't set avatar!"))?;
            Ok("Avatar updated.".to_string())
        }
        Command::Friends { .. } => {
            let friends = session
                .list_friends()
                .await
                .map_err(fail("Couldn't list friends!"))?;
            if friends.is_empty() {
                return Ok("No friends yet.".to_string());
            }
            let mut lines = Vec::with_capacity(friends.len());
            for key in friends {
                let name = session.friend_name(&key).await.unwrap_or_default();
                lines.push(format!("{key} {name}").trim_end().to_string());
            }
            Ok(lines.join("\n"))
        }
        Command::WhoAmI { .. } => {
            let address = session
                .own_address()
                .await
                .map_err(fail("Couldn't read own address!"))?;
            let name = session.own_name().await.unwrap_or_default();
            Ok(format!("{name} {address} ({:?})", session.state()).trim_start().to_string())
        }
        Command::Connect { .. } => {
            session
                .connect()
                .await
                .map_err(fail("Failed to connect client:"))?;
            Ok("Connecting.".to_string())
        }
        Command::Disconnect { .. } => {
            session
                .disconnect()
                .await
                .map_err(fail("Couldn't disconnect!"))?;
            Ok("Disconnected.".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use toxpup_core::{FetchError, FileKind, Transport};

    use super::*;

    struct NoFetch;

    #[async_trait]
    impl Fetcher for NoFetch {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            Err(FetchError {
                url: url.to_string(),
                reason: "offline".into(),
            })
        }
    }

    fn puppet(name: &str) -> PuppetConfig {
        PuppetConfig {
            name: name.into(),
            savefile: None,
            display_name: Some("Dana".into()),
            avatar_url: None,
        }
    }

    async fn next_line(rx: &mut mpsc::UnboundedReceiver<StatusLine>) -> StatusLine {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("closed")
    }

    #[tokio::test]
    async fn failed_connect_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let network = LoopbackNetwork::new();
        let transport = network.open(&dir.path().join("dana.tox")).unwrap();
        let (session, _notes) = Session::new(transport, Arc::new(NoFetch), SessionConfig::default());
        // Someone else already runs this account's transport loop.
        let (events, _events_rx) = mpsc::unbounded_channel();
        session.transport().start(events).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        bring_up(&puppet("dana"), &session, &tx).await;
        let line = next_line(&mut rx).await;
        assert_eq!(
            line.to_string(),
            "[dana] Failed to connect client: transport failure: transport already started"
        );
        assert_eq!(session.own_name().await.unwrap(), "Dana");
        assert_eq!(session.state(), toxpup_core::ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn started_puppet_reports_connected() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            saves_folder: dir.path().to_path_buf(),
            puppets: vec![puppet("dana")],
            ..Config::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = Bridge::start(&config, Vec::new(), Arc::new(NoFetch), tx)
            .await
            .unwrap();
        let line = next_line(&mut rx).await;
        assert_eq!(line.puppet, "dana");
        assert!(line.text.starts_with("connected, address "), "{line}");
        assert!(dir.path().join("dana.tox").exists());
        assert_eq!(
            bridge.execute(Command::Connect { puppet: "nobody".into() }).await,
            "Puppet not found!"
        );
        bridge.shutdown().await;
    }

    fn id(b: u8) -> PeerIdentity {
        PeerIdentity::from_bytes([b; 32])
    }

    #[test]
    fn presence_mapping() {
        assert_eq!(presence_label(UserStatus::Online), "online");
        assert_eq!(presence_label(UserStatus::Offline), "offline");
        assert_eq!(presence_label(UserStatus::Away), "unavailable");
        assert_eq!(presence_label(UserStatus::Busy), "unavailable");
    }

    #[test]
    fn friend_request_text() {
        let text = friend_request_prompt("alice", &id(0xab), "let me in");
        let key = "ab".repeat(32);
        assert_eq!(
            text,
            format!(
                "New incoming friends request from key `{key}` with the following message:\n\n\
                 let me in\n\nType `acceptfriend alice {key}` to accept it."
            )
        );
    }

    #[test]
    fn status_lines() {
        let msg = Notification::Message {
            peer: id(1),
            text: "hi".into(),
            is_action: false,
        };
        assert_eq!(describe(&msg, "p").unwrap(), format!("<{}> hi", id(1)));
        let away = Notification::PresenceChanged {
            peer: id(1),
            status: UserStatus::Away,
        };
        assert!(describe(&away, "p").unwrap().ends_with("is unavailable"));
        assert!(describe(&Notification::NameChanged { peer: id(1) }, "p").is_none());
    }

    #[test]
    fn peer_file_names_are_flattened() {
        assert_eq!(safe_file_name("../../etc/passwd"), "passwd");
        assert_eq!(safe_file_name("photo.jpg"), "photo.jpg");
        assert_eq!(safe_file_name(".."), "file");
        assert_eq!(safe_file_name(""), "file");
    }

    #[tokio::test]
    async fn received_files_land_in_folder() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = toxpup_core::transfer::TransferEngine::new();
        let (h, t) = (toxpup_core::SessionHandle(1), toxpup_core::TransferId(1));
        engine.register_inbound(h, t, FileKind::Data, "../x.txt", 2).unwrap();
        let toxpup_core::transfer::ChunkOutcome::Complete(file) = engine.write_chunk(h, t, 0, b"ok", true)
        else {
            panic!("transfer not complete");
        };
        let received = dir.path().join("received");
        let path = save_received(&received, &id(0xcd), &file).await.unwrap();
        assert_eq!(path, received.join("cdcdcdcd-x.txt"));
        assert_eq!(std::fs::read(path).unwrap(), b"ok");
    }
}
