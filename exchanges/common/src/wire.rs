//! Binary framing used on every data connection.
//!
//! A batch on the wire is, in order:
//! 1. `i32` receiver count (0 for a direct push),
//! 2. that many host names,
//! 3. `i32` file count,
//! 4. per file: name, `i64` size, then exactly `size` content bytes.
//!
//! Integers are big-endian. Strings are an `i32` count of UTF-16 code units
//! followed by the units themselves, big-endian, two bytes each. There is no
//! magic number, no version and no resynchronization: a bad field ends the
//! connection with [`TransferError::ProtocolFraming`].

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{TransferError, TransferResult};

/// Longest accepted string, in UTF-16 code units.
pub const MAX_NAME_UNITS: usize = 65_535;

/// Default size of one streamed content chunk (1 MiB). Not a protocol
/// constant: a receiver decodes any chunking.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Where an outbound batch is going.
///
/// Both variants share one encoding: `Direct` is a receiver count of zero,
/// `Relayed` lists the host names the relay must fan out to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchRoute {
    #[default]
    Direct,
    Relayed(Vec<String>),
}

impl BatchRoute {
    /// Builds a relayed route; an empty list collapses to `Direct`.
    pub fn relayed<I, S>(receivers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let receivers: Vec<String> =
            receivers.into_iter().map(Into::into).collect();
        if receivers.is_empty() {
            Self::Direct
        } else {
            Self::Relayed(receivers)
        }
    }

    pub fn receivers(&self) -> &[String] {
        match self {
            Self::Direct => &[],
            Self::Relayed(receivers) => receivers,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.receivers().is_empty()
    }
}

/// Manifest entry announcing one file; `size` content bytes follow it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub name: String,
    pub size: u64,
}

pub async fn write_count<W>(writer: &mut W, count: usize) -> TransferResult<()>
where
    W: AsyncWrite + Unpin,
{
    let count = i32::try_from(count).map_err(|_| {
        TransferError::framing(format!("count {count} too large"))
    })?;
    writer.write_i32(count).await?;
    Ok(())
}

pub async fn read_count<R>(reader: &mut R) -> TransferResult<usize>
where
    R: AsyncRead + Unpin,
{
    let count = reader
        .read_i32()
        .await
        .map_err(TransferError::from_read)?;
    checked_count(count)
}

fn checked_count(count: i32) -> TransferResult<usize> {
    usize::try_from(count)
        .map_err(|_| TransferError::framing(format!("negative count {count}")))
}

pub async fn write_string<W>(writer: &mut W, value: &str) -> TransferResult<()>
where
    W: AsyncWrite + Unpin,
{
    let units: Vec<u16> = value.encode_utf16().collect();
    if units.len() > MAX_NAME_UNITS {
        return Err(TransferError::framing(format!(
            "string of {} UTF-16 units exceeds {MAX_NAME_UNITS}",
            units.len()
        )));
    }
    let mut buffer = Vec::with_capacity(4 + units.len() * 2);
    buffer.extend_from_slice(&(units.len() as i32).to_be_bytes());
    for unit in units {
        buffer.extend_from_slice(&unit.to_be_bytes());
    }
    writer.write_all(&buffer).await?;
    Ok(())
}

pub async fn read_string<R>(reader: &mut R) -> TransferResult<String>
where
    R: AsyncRead + Unpin,
{
    let len = read_count(reader).await?;
    if len > MAX_NAME_UNITS {
        return Err(TransferError::framing(format!(
            "string length {len} exceeds {MAX_NAME_UNITS}"
        )));
    }
    let mut raw = vec![0u8; len * 2];
    reader
        .read_exact(&mut raw)
        .await
        .map_err(TransferError::from_read)?;
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|_| TransferError::framing("string is not valid UTF-16"))
}

pub async fn write_route<W>(
    writer: &mut W,
    route: &BatchRoute,
) -> TransferResult<()>
where
    W: AsyncWrite + Unpin,
{
    let receivers = route.receivers();
    write_count(writer, receivers.len()).await?;
    for receiver in receivers {
        write_string(writer, receiver).await?;
    }
    Ok(())
}

pub async fn read_route<R>(reader: &mut R) -> TransferResult<BatchRoute>
where
    R: AsyncRead + Unpin,
{
    let count = read_count(reader).await?;
    read_route_names(reader, count).await
}

/// Reads the route, telling apart a peer that closed the connection without
/// sending a single byte (`Ok(None)`) from one that stopped mid-field.
pub async fn read_route_or_idle<R>(
    reader: &mut R,
) -> TransferResult<Option<BatchRoute>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let first = reader
        .read(&mut header)
        .await
        .map_err(TransferError::from_read)?;
    if first == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut header[first..])
        .await
        .map_err(TransferError::from_read)?;
    let count = checked_count(i32::from_be_bytes(header))?;
    read_route_names(reader, count).await.map(Some)
}

async fn read_route_names<R>(
    reader: &mut R,
    count: usize,
) -> TransferResult<BatchRoute>
where
    R: AsyncRead + Unpin,
{
    let mut receivers = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        receivers.push(read_string(reader).await?);
    }
    Ok(BatchRoute::relayed(receivers))
}

pub async fn write_file_header<W>(
    writer: &mut W,
    header: &FileHeader,
) -> TransferResult<()>
where
    W: AsyncWrite + Unpin,
{
    let size = i64::try_from(header.size).map_err(|_| {
        TransferError::framing(format!("file size {} too large", header.size))
    })?;
    write_string(writer, &header.name).await?;
    writer.write_i64(size).await?;
    Ok(())
}

pub async fn read_file_header<R>(reader: &mut R) -> TransferResult<FileHeader>
where
    R: AsyncRead + Unpin,
{
    let name = read_string(reader).await?;
    let size = reader
        .read_i64()
        .await
        .map_err(TransferError::from_read)?;
    let size = u64::try_from(size).map_err(|_| {
        TransferError::framing(format!("negative size {size} for `{name}`"))
    })?;
    Ok(FileHeader { name, size })
}

/// Rejects names that would escape the destination directory. Names on the
/// wire never carry a path component.
pub fn validate_file_name(name: &str) -> TransferResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(TransferError::framing(format!(
            "`{name}` is not a plain file name"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn strings_are_utf16_big_endian() {
        let mut out = Vec::new();
        write_string(&mut out, "hé").await.unwrap();
        assert_eq!(out, vec![0, 0, 0, 2, 0x00, b'h', 0x00, 0xE9]);

        let mut input = out.as_slice();
        assert_eq!(read_string(&mut input).await.unwrap(), "hé");
    }

    #[tokio::test]
    async fn astral_characters_take_two_units() {
        let mut out = Vec::new();
        write_string(&mut out, "🦀").await.unwrap();
        assert_eq!(&out[..4], &[0, 0, 0, 2]);
        assert_eq!(out.len(), 8);

        let mut input = out.as_slice();
        assert_eq!(read_string(&mut input).await.unwrap(), "🦀");
    }

    #[tokio::test]
    async fn direct_route_is_a_zero_count() {
        let mut out = Vec::new();
        write_route(&mut out, &BatchRoute::Direct).await.unwrap();
        assert_eq!(out, vec![0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn relayed_route_keeps_receiver_order() {
        let route = BatchRoute::relayed(["cid-pc", "ann-pc", "bob-pc"]);
        let mut out = Vec::new();
        write_route(&mut out, &route).await.unwrap();

        let mut input = out.as_slice();
        let decoded = read_route(&mut input).await.unwrap();
        assert_eq!(decoded, route);
        assert_eq!(decoded.receivers()[0], "cid-pc");
    }

    #[tokio::test]
    async fn negative_count_is_framing_error() {
        let bytes = (-1i32).to_be_bytes();
        let mut input = &bytes[..];
        let err = read_route(&mut input).await.unwrap_err();
        assert!(err.is_framing(), "{err}");
    }

    #[tokio::test]
    async fn oversized_string_length_is_framing_error() {
        let bytes = (MAX_NAME_UNITS as i32 + 1).to_be_bytes();
        let mut input = &bytes[..];
        let err = read_string(&mut input).await.unwrap_err();
        assert!(err.is_framing(), "{err}");
    }

    #[tokio::test]
    async fn truncated_string_is_framing_error() {
        let mut bytes = 3i32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0, b'a']);
        let mut input = bytes.as_slice();
        let err = read_string(&mut input).await.unwrap_err();
        assert!(err.is_framing(), "{err}");
    }

    #[tokio::test]
    async fn unpaired_surrogate_is_framing_error() {
        let mut bytes = 1i32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&0xD800u16.to_be_bytes());
        let mut input = bytes.as_slice();
        let err = read_string(&mut input).await.unwrap_err();
        assert!(err.is_framing(), "{err}");
    }

    #[tokio::test]
    async fn file_header_round_trip() {
        let header = FileHeader {
            name: "report.txt".into(),
            size: 14,
        };
        let mut out = Vec::new();
        write_file_header(&mut out, &header).await.unwrap();
        assert_eq!(out.len(), 4 + 10 * 2 + 8);

        let mut input = out.as_slice();
        assert_eq!(read_file_header(&mut input).await.unwrap(), header);
    }

    #[tokio::test]
    async fn negative_size_is_framing_error() {
        let mut out = Vec::new();
        write_string(&mut out, "a.bin").await.unwrap();
        out.extend_from_slice(&(-5i64).to_be_bytes());
        let mut input = out.as_slice();
        let err = read_file_header(&mut input).await.unwrap_err();
        assert!(err.is_framing(), "{err}");
    }

    #[tokio::test]
    async fn empty_stream_is_idle() {
        let mut input: &[u8] = &[];
        assert_eq!(read_route_or_idle(&mut input).await.unwrap(), None);
    }

    #[tokio::test]
    async fn partial_count_is_not_idle() {
        let mut input: &[u8] = &[0, 0];
        let err = read_route_or_idle(&mut input).await.unwrap_err();
        assert!(err.is_framing(), "{err}");
    }

    #[tokio::test]
    async fn idle_aware_read_decodes_routes() {
        let route = BatchRoute::relayed(["bob-pc"]);
        let mut out = Vec::new();
        write_route(&mut out, &route).await.unwrap();
        let mut input = out.as_slice();
        assert_eq!(read_route_or_idle(&mut input).await.unwrap(), Some(route));
    }

    #[test]
    fn empty_relayed_route_is_direct() {
        assert!(BatchRoute::relayed(Vec::<String>::new()).is_direct());
        assert_eq!(BatchRoute::Direct.receivers().len(), 0);
    }

    #[test]
    fn file_names_with_path_components_are_rejected() {
        assert!(validate_file_name("report.txt").is_ok());
        assert!(validate_file_name(".hidden").is_ok());
        for bad in ["", ".", "..", "a/b", "..\\x", "nul\0"] {
            assert!(validate_file_name(bad).is_err(), "{bad:?}");
        }
    }
}
