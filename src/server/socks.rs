use serde::Deserialize;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use self::Error::{
    AddressTypeUnsupported, CommandUnsupported, MetadataInvalid, NoAcceptableAuth, ProtocolError,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("SOCKS I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed SOCKS message: {0}")]
    ProtocolError(String),
    #[error("SOCKS command {0} is not supported, only CONNECT is")]
    CommandUnsupported(u8),
    #[error("SOCKS address type {0} is not supported")]
    AddressTypeUnsupported(u8),
    #[error("no acceptable SOCKS authentication method")]
    NoAcceptableAuth,
    #[error("invalid SOCKS metadata: {0}")]
    MetadataInvalid(String),
}

/// Authentication methods the server may advertise for SOCKS5, in server
/// preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksAuthMethod {
    /// 0x00 — no authentication.
    NoAuth,
    /// 0x02 — RFC 1929 username/password, where the password field carries a
    /// JSON metadata blob.
    UserPasswordMetadata,
    /// 0xDA — custom method: a one-byte length-prefixed JSON metadata blob.
    CustomMetadata,
}

impl SocksAuthMethod {
    fn code(&self) -> u8 {
        match self {
            SocksAuthMethod::NoAuth => 0x00,
            SocksAuthMethod::UserPasswordMetadata => 0x02,
            SocksAuthMethod::CustomMetadata => 0xDA,
        }
    }
}

/// Resolved CONNECT target of a SOCKS handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum SocksHost {
    Hostname(String),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
}

impl SocksHost {
    pub fn to_hostname(&self) -> String {
        match self {
            SocksHost::Hostname(name) => name.clone(),
            SocksHost::Ipv4(ip) => ip.to_string(),
            SocksHost::Ipv6(ip) => ip.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SocksTarget {
    pub host: SocksHost,
    pub port: u16,
    /// Tags parsed from connection metadata, later attached to every request
    /// on this connection.
    pub tags: Vec<String>,
}

#[derive(Deserialize)]
struct ConnectionMetadata {
    #[serde(default)]
    tags: Vec<String>,
}

const SOCKS5_REP_SUCCESS: u8 = 0x00;
const SOCKS5_REP_COMMAND_UNSUPPORTED: u8 = 0x07;
const SOCKS5_REP_ADDRESS_UNSUPPORTED: u8 = 0x08;
const SOCKS4_REP_GRANTED: u8 = 0x5A;
const SOCKS4_REP_REJECTED: u8 = 0x5B;

/// Runs the SOCKS handshake on a fresh connection whose first byte was
/// detected as 0x04 or 0x05. On success the stream is positioned at the
/// first byte of the tunneled protocol and the caller re-enters protocol
/// detection with the returned target attached.
pub async fn handshake<S>(stream: &mut S, auth_methods: &[SocksAuthMethod]) -> Result<SocksTarget, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    match version {
        0x04 => handshake_v4(stream).await,
        0x05 => handshake_v5(stream, auth_methods).await,
        other => Err(ProtocolError(format!("unknown SOCKS version {}", other))),
    }
}

async fn handshake_v4<S>(stream: &mut S) -> Result<SocksTarget, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let command = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut ip = [0u8; 4];
    stream.read_exact(&mut ip).await?;

    // USERID, null-terminated. SOCKS4 has no metadata channel.
    read_null_terminated(stream).await?;

    if command != 0x01 {
        stream
            .write_all(&[0x00, SOCKS4_REP_REJECTED, 0, 0, 0, 0, 0, 0])
            .await?;
        return Err(CommandUnsupported(command));
    }

    // SOCKS4a marks a deferred hostname with 0.0.0.x (x != 0).
    let host = if ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0 {
        let name = read_null_terminated(stream).await?;
        let name = String::from_utf8(name)
            .map_err(|_| ProtocolError("SOCKS4a hostname is not UTF-8".to_string()))?;
        SocksHost::Hostname(name)
    } else {
        SocksHost::Ipv4(Ipv4Addr::from(ip))
    };

    stream
        .write_all(&[0x00, SOCKS4_REP_GRANTED, 0, 0, 0, 0, 0, 0])
        .await?;

    Ok(SocksTarget {
        host,
        port,
        tags: Vec::new(),
    })
}

async fn handshake_v5<S>(
    stream: &mut S,
    auth_methods: &[SocksAuthMethod],
) -> Result<SocksTarget, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method_count = stream.read_u8().await? as usize;
    let mut offered = vec![0u8; method_count];
    stream.read_exact(&mut offered).await?;

    // First configured method the client offered wins, so the server
    // preference order is the configuration order.
    let selected = auth_methods
        .iter()
        .find(|method| offered.contains(&method.code()))
        .copied();

    let Some(selected) = selected else {
        stream.write_all(&[0x05, 0xFF]).await?;
        return Err(NoAcceptableAuth);
    };

    stream.write_all(&[0x05, selected.code()]).await?;

    let tags = match selected {
        SocksAuthMethod::NoAuth => Vec::new(),
        SocksAuthMethod::UserPasswordMetadata => read_userpass_metadata(stream).await?,
        SocksAuthMethod::CustomMetadata => read_custom_metadata(stream).await?,
    };

    let version = stream.read_u8().await?;
    if version != 0x05 {
        return Err(ProtocolError(format!(
            "unexpected version {} in SOCKS5 request",
            version
        )));
    }
    let command = stream.read_u8().await?;
    let _reserved = stream.read_u8().await?;
    let address_type = stream.read_u8().await?;

    let host = match address_type {
        0x01 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            SocksHost::Ipv4(Ipv4Addr::from(ip))
        }
        0x03 => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            SocksHost::Hostname(String::from_utf8(name).map_err(|_| {
                ProtocolError("SOCKS5 hostname is not UTF-8".to_string())
            })?)
        }
        0x04 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            SocksHost::Ipv6(Ipv6Addr::from(ip))
        }
        other => {
            reply_v5(stream, SOCKS5_REP_ADDRESS_UNSUPPORTED).await?;
            return Err(AddressTypeUnsupported(other));
        }
    };
    let port = stream.read_u16().await?;

    if command != 0x01 {
        reply_v5(stream, SOCKS5_REP_COMMAND_UNSUPPORTED).await?;
        return Err(CommandUnsupported(command));
    }

    reply_v5(stream, SOCKS5_REP_SUCCESS).await?;

    Ok(SocksTarget { host, port, tags })
}

async fn reply_v5<S>(stream: &mut S, reply: u8) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    // Bind address is reported as 0.0.0.0:0; clients only care about REP.
    stream
        .write_all(&[0x05, reply, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

/// RFC 1929 sub-negotiation where the password field carries the metadata
/// blob. The username is ignored.
async fn read_userpass_metadata<S>(stream: &mut S) -> Result<Vec<String>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != 0x01 {
        return Err(ProtocolError(format!(
            "unexpected username/password sub-negotiation version {}",
            version
        )));
    }
    let user_len = stream.read_u8().await? as usize;
    let mut user = vec![0u8; user_len];
    stream.read_exact(&mut user).await?;
    let pass_len = stream.read_u8().await? as usize;
    let mut pass = vec![0u8; pass_len];
    stream.read_exact(&mut pass).await?;

    match parse_metadata(&pass) {
        Ok(tags) => {
            stream.write_all(&[0x01, 0x00]).await?;
            Ok(tags)
        }
        Err(err) => {
            stream.write_all(&[0x01, 0x01]).await?;
            Err(err)
        }
    }
}

/// Custom 0xDA sub-negotiation: a one-byte length followed by up to 255
/// bytes of JSON.
async fn read_custom_metadata<S>(stream: &mut S) -> Result<Vec<String>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = stream.read_u8().await? as usize;
    let mut blob = vec![0u8; len];
    stream.read_exact(&mut blob).await?;

    match parse_metadata(&blob) {
        Ok(tags) => {
            stream.write_all(&[0x01, 0x00]).await?;
            Ok(tags)
        }
        Err(err) => {
            stream.write_all(&[0x01, 0x01]).await?;
            Err(err)
        }
    }
}

fn parse_metadata(blob: &[u8]) -> Result<Vec<String>, Error> {
    if blob.is_empty() {
        return Ok(Vec::new());
    }
    let metadata: ConnectionMetadata = serde_json::from_slice(blob)
        .map_err(|err| MetadataInvalid(format!("metadata is not valid JSON: {}", err)))?;
    Ok(metadata.tags)
}

async fn read_null_terminated<S>(stream: &mut S) -> Result<Vec<u8>, Error>
where
    S: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            return Ok(out);
        }
        if out.len() >= 512 {
            return Err(ProtocolError("SOCKS4 user id too long".to_string()));
        }
        out.push(byte);
    }
}
