use bytes::Bytes;
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot decode body with encoding {encoding}: {source}")]
    DecodeError {
        encoding: String,
        source: std::io::Error,
    },
    #[error("cannot encode body with encoding {encoding}: {source}")]
    EncodeError {
        encoding: String,
        source: std::io::Error,
    },
    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("decoded body exceeds the configured maximum of {0} bytes")]
    BodyTooLarge(usize),
}

/// Case-insensitive lookup over an ordered raw header list. The list itself
/// preserves wire order and case; only lookups normalize.
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn find_header_values<'a, 'b>(
    headers: &'a [(String, String)],
    name: &'b str,
) -> impl Iterator<Item = &'a str> + use<'a, 'b> {
    headers
        .iter()
        .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn remove_header(headers: &mut Vec<(String, String)>, name: &str) {
    headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
}

/// Replaces all values of `name` with a single value, keeping the position of
/// the first occurrence. Appends if the header was absent.
pub fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    let mut replaced = false;
    headers.retain_mut(|(n, v)| {
        if n.eq_ignore_ascii_case(name) {
            if replaced {
                return false;
            }
            replaced = true;
            *v = value.to_string();
        }
        true
    });
    if !replaced {
        headers.push((name.to_string(), value.to_string()));
    }
}

/// Splits an authority into hostname and optional port. IPv6 literals keep
/// their brackets stripped.
pub fn split_host_port(authority: &str) -> (String, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6, optionally with a port.
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_string(), port);
        }
    }
    if authority.matches(':').count() == 1 {
        if let Some((host, port)) = authority.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return (host.to_string(), Some(port));
            }
        }
    }
    (authority.to_string(), None)
}

pub fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" | "wss" => 443,
        _ => 80,
    }
}

/// Formats `host:port`, dropping the port if it is the scheme default and
/// bracketing IPv6 literals.
pub fn format_host_header(hostname: &str, port: u16, scheme: &str) -> String {
    let host = if hostname.contains(':') {
        format!("[{}]", hostname)
    } else {
        hostname.to_string()
    };
    if port == default_port(scheme) {
        host
    } else {
        format!("{}:{}", host, port)
    }
}

/// Parses a `content-encoding` header value into the list of codings that
/// were applied, in application order.
pub fn parse_content_encodings(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Decodes a body according to a `content-encoding` header value. Codings are
/// undone in reverse application order. `max_size` bounds the decoded output.
pub fn decode_body(encoding: Option<&str>, raw: &Bytes, max_size: usize) -> Result<Bytes, Error> {
    let codings = encoding.map(parse_content_encodings).unwrap_or_default();
    if codings.is_empty() || codings.iter().all(|c| c == "identity") {
        if raw.len() > max_size {
            return Err(Error::BodyTooLarge(max_size));
        }
        return Ok(raw.clone());
    }

    let mut current = raw.to_vec();
    for coding in codings.iter().rev() {
        current = decode_once(coding, &current, max_size)?;
    }
    Ok(Bytes::from(current))
}

fn decode_once(coding: &str, input: &[u8], max_size: usize) -> Result<Vec<u8>, Error> {
    let map_err = |source| Error::DecodeError {
        encoding: coding.to_string(),
        source,
    };

    let mut out = Vec::new();
    match coding {
        "identity" => out.extend_from_slice(input),
        "gzip" | "x-gzip" => {
            let mut decoder = flate2::read::GzDecoder::new(input).take((max_size as u64).saturating_add(1));
            decoder.read_to_end(&mut out).map_err(map_err)?;
        }
        "deflate" => {
            // Servers disagree on whether "deflate" means zlib-wrapped or raw;
            // try zlib first and fall back to raw.
            let mut decoder = flate2::read::ZlibDecoder::new(input).take((max_size as u64).saturating_add(1));
            if decoder.read_to_end(&mut out).is_err() {
                out.clear();
                let mut decoder =
                    flate2::read::DeflateDecoder::new(input).take((max_size as u64).saturating_add(1));
                decoder.read_to_end(&mut out).map_err(map_err)?;
            }
        }
        "br" => {
            let mut decoder = brotli::Decompressor::new(input, 4096).take((max_size as u64).saturating_add(1));
            decoder.read_to_end(&mut out).map_err(map_err)?;
        }
        other => return Err(Error::UnsupportedEncoding(other.to_string())),
    }

    if out.len() > max_size {
        return Err(Error::BodyTooLarge(max_size));
    }
    Ok(out)
}

/// Encodes a body to match a `content-encoding` header value, applying
/// codings in declaration order.
pub fn encode_body(encoding: Option<&str>, plain: &[u8]) -> Result<Bytes, Error> {
    let codings = encoding.map(parse_content_encodings).unwrap_or_default();
    let mut current = plain.to_vec();
    for coding in &codings {
        current = encode_once(coding, &current)?;
    }
    Ok(Bytes::from(current))
}

fn encode_once(coding: &str, input: &[u8]) -> Result<Vec<u8>, Error> {
    let map_err = |source| Error::EncodeError {
        encoding: coding.to_string(),
        source,
    };

    match coding {
        "identity" => Ok(input.to_vec()),
        "gzip" | "x-gzip" => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(input).map_err(map_err)?;
            encoder.finish().map_err(map_err)
        }
        "deflate" => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(input).map_err(map_err)?;
            encoder.finish().map_err(map_err)
        }
        "br" => {
            let mut out = Vec::new();
            let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            writer.write_all(input).map_err(map_err)?;
            writer.flush().map_err(map_err)?;
            drop(writer);
            Ok(out)
        }
        other => Err(Error::UnsupportedEncoding(other.to_string())),
    }
}

/// True for loopback addresses and the `localhost` name.
pub fn is_localhost(hostname: &str) -> bool {
    if hostname.eq_ignore_ascii_case("localhost") {
        return true;
    }
    if let Ok(ip) = hostname.parse::<std::net::IpAddr>() {
        return ip.is_loopback();
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let headers = vec![
            ("X-First".to_string(), "1".to_string()),
            ("x-first".to_string(), "2".to_string()),
        ];
        assert_eq!(find_header(&headers, "X-FIRST"), Some("1"));
        assert_eq!(find_header_values(&headers, "x-First").count(), 2);
    }

    #[test]
    fn set_header_keeps_position_of_first_occurrence() {
        let mut headers = vec![
            ("a".to_string(), "1".to_string()),
            ("host".to_string(), "old".to_string()),
            ("b".to_string(), "2".to_string()),
            ("Host".to_string(), "older".to_string()),
        ];
        set_header(&mut headers, "Host", "new");
        assert_eq!(
            headers,
            vec![
                ("a".to_string(), "1".to_string()),
                ("host".to_string(), "new".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn split_host_port_handles_ipv6() {
        assert_eq!(split_host_port("[::1]:8080"), ("::1".to_string(), Some(8080)));
        assert_eq!(split_host_port("[::1]"), ("::1".to_string(), None));
        assert_eq!(
            split_host_port("example.com:443"),
            ("example.com".to_string(), Some(443))
        );
        assert_eq!(split_host_port("example.com"), ("example.com".to_string(), None));
    }

    #[test]
    fn gzip_round_trip() {
        let plain = b"hello hello hello hello";
        let encoded = encode_body(Some("gzip"), plain).unwrap();
        assert_ne!(&encoded[..], &plain[..]);
        let decoded = decode_body(Some("gzip"), &encoded, 1024).unwrap();
        assert_eq!(&decoded[..], &plain[..]);
    }

    #[test]
    fn brotli_round_trip() {
        let plain = b"compressible compressible compressible";
        let encoded = encode_body(Some("br"), plain).unwrap();
        let decoded = decode_body(Some("br"), &encoded, 1024).unwrap();
        assert_eq!(&decoded[..], &plain[..]);
    }

    #[test]
    fn decode_respects_size_cap() {
        let plain = vec![b'a'; 2048];
        let encoded = encode_body(Some("gzip"), &plain).unwrap();
        let result = decode_body(Some("gzip"), &encoded, 1024);
        assert!(matches!(result, Err(Error::BodyTooLarge(1024))));
    }

    #[test]
    fn chained_encodings_are_undone_in_reverse() {
        let plain = b"chained body";
        let once = encode_body(Some("gzip"), plain).unwrap();
        let twice = encode_body(Some("br"), &once).unwrap();
        let decoded = decode_body(Some("gzip, br"), &twice, 4096).unwrap();
        assert_eq!(&decoded[..], &plain[..]);
    }

    #[test]
    fn localhost_detection() {
        assert!(is_localhost("localhost"));
        assert!(is_localhost("127.0.0.1"));
        assert!(is_localhost("::1"));
        assert!(!is_localhost("example.com"));
        assert!(!is_localhost("192.168.1.10"));
    }
}
