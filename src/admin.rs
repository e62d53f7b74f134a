//! # Admin Plane
//!
//! A running peer is steered over a Unix domain socket at a well-known path.
//! Each connection carries exactly one [`AdminCommand`], bincode-encoded; the
//! peer answers with ASCII text terminated by a single zero byte. A bare zero
//! byte is an empty success. Errors come back as their display text, then the
//! terminator, then the connection closes.
//!
//! `add` and `probe` take base64 peer strings; `update` takes a hex
//! identifier, since freshness is about an identifier we already know, not an
//! address.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{bail, Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tracing::info;

use crate::identity::{NodeId, Peer, NODE_ID_LEN};
use crate::server::Server;

/// Where a serving peer listens for commands.
pub const SOCKET_PATH: &str = "/tmp/murmur.sock";

/// Closes every reply, including empty ones.
pub const REPLY_TERMINATOR: u8 = 0;

/// A command is a few strings at most.
const MAX_COMMAND_SIZE: u64 = 4096;

/// One instruction for a running peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminCommand {
    /// Shut the peer down.
    Stop,
    /// Report the local peer string.
    SelfInfo,
    /// Add a peer by its base64 string.
    AddPeer { peer: String },
    /// List one bucket's peers, oldest first.
    ListBucket { index: usize },
    /// Probe a peer by its base64 string and report the verdict.
    Probe { peer: String },
    /// Bump a known identifier's freshness; the identifier is hex.
    UpdateFreshness { id: String },
    /// Start serving, optionally from a saved routing table. Part of the
    /// command surface for completeness; a peer that can answer it is
    /// already running.
    StartServer { file: Option<String> },
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_COMMAND_SIZE)
        .with_fixint_encoding()
}

fn decode_command(raw: &[u8]) -> Result<AdminCommand> {
    bincode_options().deserialize(raw).context("decoding admin command")
}

/// Serve one admin connection to completion.
///
/// Reads the command (the client half-closes after writing), executes it,
/// writes the reply and terminator, and only then signals shutdown if the
/// command asked for it, so the client always sees its acknowledgement.
pub async fn handle(mut stream: UnixStream, server: Server, stop: watch::Sender<bool>) {
    let (read_half, mut write_half) = stream.split();

    let mut raw = Vec::new();
    let command = match read_half.take(MAX_COMMAND_SIZE).read_to_end(&mut raw).await {
        Ok(_) => decode_command(&raw),
        Err(err) => Err(err).context("reading admin command"),
    };
    let outcome = match command {
        Ok(command) => dispatch(command, &server).await,
        Err(err) => Err(err),
    };
    let (reply, stop_requested) = match outcome {
        Ok(pair) => pair,
        Err(err) => (format!("{err:#}"), false),
    };

    if !reply.is_empty() {
        let _ = write_half.write_all(reply.as_bytes()).await;
    }
    let _ = write_half.write_all(&[REPLY_TERMINATOR]).await;
    let _ = write_half.shutdown().await;

    if stop_requested {
        info!("stop requested over the admin socket");
        let _ = stop.send(true);
    }
}

async fn dispatch(command: AdminCommand, server: &Server) -> Result<(String, bool)> {
    match command {
        AdminCommand::Stop => Ok((String::new(), true)),
        AdminCommand::SelfInfo => {
            let text = server
                .self_peer()
                .to_base64()
                .context("local peer has no IPv4 address")?;
            Ok((text, false))
        }
        AdminCommand::AddPeer { peer } => {
            let peer = Peer::from_base64(&peer)?;
            server.routing().add(peer.id, peer.addr, server).await;
            Ok((format!("added {}", peer.id), false))
        }
        AdminCommand::ListBucket { index } => {
            let Some(peers) = server.routing().bucket_peers(index).await else {
                return Ok(("empty bucket".into(), false));
            };
            let mut out = String::new();
            for (slot, peer) in peers.iter().enumerate() {
                let text = peer.to_base64().unwrap_or_else(|_| "-".into());
                let _ = writeln!(out, "[{slot}] {} {} {}", peer.id, peer.addr, text);
            }
            Ok((out, false))
        }
        AdminCommand::Probe { peer } => {
            let peer = Peer::from_base64(&peer)?;
            let alive = server.probe(&peer).await;
            Ok((format!("probe result: {alive}"), false))
        }
        AdminCommand::UpdateFreshness { id } => {
            let raw = hex::decode(id.trim()).context("identifier is not valid hex")?;
            let bytes: [u8; NODE_ID_LEN] = match raw.as_slice().try_into() {
                Ok(bytes) => bytes,
                Err(_) => bail!("identifier must be {} hex characters", NODE_ID_LEN * 2),
            };
            server.routing().update(&NodeId::from_bytes(bytes)).await?;
            Ok(("peer refreshed".into(), false))
        }
        AdminCommand::StartServer { .. } => Ok(("already running".into(), false)),
    }
}

/// Send one command to a serving peer and collect its reply text.
pub async fn request(path: &Path, command: &AdminCommand) -> Result<String> {
    let mut stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("connecting to {} (is the peer running?)", path.display()))?;

    let raw = bincode::serialize(command).context("encoding admin command")?;
    stream.write_all(&raw).await.context("sending admin command")?;
    stream.shutdown().await.context("closing the send side")?;

    let mut reply = Vec::new();
    stream
        .read_to_end(&mut reply)
        .await
        .context("reading admin reply")?;
    if reply.last() == Some(&REPLY_TERMINATOR) {
        reply.pop();
    }
    Ok(String::from_utf8_lossy(&reply).into_owned())
}
