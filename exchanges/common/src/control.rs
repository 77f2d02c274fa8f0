//! Line-oriented control protocol spoken between a client and the relay.
//!
//! ```text
//! client -> relay: getlist
//! relay -> client: SIZE <n>
//!                  <displayName 0>
//!                  <hostName 0>
//!                  ...            (2n lines)
//! ```

use relaydrop_entities::{Peer, Roster};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines,
};

use crate::{TransferError, TransferResult};

pub const ROSTER_REQUEST: &str = "getlist";
pub const SIZE_MARKER: &str = "SIZE";

pub fn is_roster_request(line: &str) -> bool {
    line.trim_start().starts_with(ROSTER_REQUEST)
}

pub async fn write_roster_request<W>(writer: &mut W) -> TransferResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{ROSTER_REQUEST}\n").as_bytes())
        .await?;
    writer.flush().await?;
    Ok(())
}

pub fn encode_roster_reply(roster: &Roster) -> String {
    let mut reply = format!("{SIZE_MARKER} {}\n", roster.len());
    for peer in roster {
        reply.push_str(peer.display_name());
        reply.push('\n');
        reply.push_str(peer.host_name());
        reply.push('\n');
    }
    reply
}

pub async fn write_roster_reply<W>(
    writer: &mut W,
    roster: &Roster,
) -> TransferResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(encode_roster_reply(roster).as_bytes())
        .await?;
    writer.flush().await?;
    Ok(())
}

/// Returns the announced peer count if `line` is a size marker.
pub fn parse_size_line(line: &str) -> TransferResult<Option<usize>> {
    if !line.starts_with(SIZE_MARKER) {
        return Ok(None);
    }
    let mut tokens = line.split_whitespace();
    tokens.next();
    let size = tokens
        .next()
        .and_then(|t| t.parse::<usize>().ok())
        .ok_or_else(|| {
            TransferError::framing(format!("bad roster size line `{line}`"))
        })?;
    Ok(Some(size))
}

/// Reads roster replies off the client's side of a control connection.
pub struct RosterReplyReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R> RosterReplyReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Waits for the next complete roster. Lines that are not a size marker
    /// are skipped. `Ok(None)` means the relay closed the connection.
    pub async fn next_roster(&mut self) -> TransferResult<Option<Roster>> {
        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(None);
            };
            let Some(size) = parse_size_line(&line)? else {
                continue;
            };
            let mut peers = Vec::with_capacity(size.min(1024));
            for _ in 0..size {
                let display_name = self.required_line().await?;
                let host_name = self.required_line().await?;
                peers.push(Peer::new(display_name, host_name));
            }
            let roster = Roster::new(peers)
                .map_err(|e| TransferError::framing(e.to_string()))?;
            return Ok(Some(roster));
        }
    }

    async fn next_line(&mut self) -> TransferResult<Option<String>> {
        let line = self
            .lines
            .next_line()
            .await
            .map_err(TransferError::from_read)?;
        Ok(line.map(|l| l.trim_end_matches('\r').to_string()))
    }

    async fn required_line(&mut self) -> TransferResult<String> {
        self.next_line().await?.ok_or_else(|| {
            TransferError::framing("roster reply ended before all peers")
        })
    }
}
