//! Raw-git fallback for commit lookups.
//!
//! When the REST API is down or rate-limited, branch heads can still be
//! read over Git's "smart" HTTP protocol: a single `ls-refs` request
//! against `git-upload-pack`, speaking just enough of protocol v2 to list
//! refs without cloning. This transport is read-only and is consulted
//! only under the conditions [`FallbackPolicy`] encodes.
//!
//! See: https://git-scm.com/docs/protocol-v2

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Token;

use super::ProviderError;

/// Explicit preconditions for using the fallback transport.
///
/// The fallback exists for one operation only (commit lookup), and only
/// when the API path failed in a way the transport can route around.
#[derive(Clone, Copy, Debug)]
pub struct FallbackPolicy {
    pub enabled: bool,
}

impl FallbackPolicy {
    pub fn permits(&self, error: &ProviderError) -> bool {
        self.enabled && error.fallback_eligible()
    }
}

const FLUSH: &[u8] = b"0000";
const DELIM: &[u8] = b"0001";
const LENGTH_PREFIX_LEN: usize = 4;

/// Encodes one data pkt-line: a four-hex-digit length prefix (including
/// the prefix itself) followed by the payload.
fn encode_data(dest: &mut Vec<u8>, data: &[u8]) {
    dest.extend_from_slice(format!("{:04x}", data.len() + LENGTH_PREFIX_LEN).as_bytes());
    dest.extend_from_slice(data);
}

/// One decoded pkt-line.
#[derive(Debug, PartialEq, Eq)]
enum Packet<'a> {
    Data(&'a [u8]),
    Flush,
    Delim,
}

/// Decodes a pkt-line stream, stopping at the final flush.
fn decode_packets(mut input: &[u8]) -> Result<Vec<Packet<'_>>, ProviderError> {
    let mut packets = Vec::new();

    while !input.is_empty() {
        if input.len() < LENGTH_PREFIX_LEN {
            return Err(malformed("truncated pkt-line length prefix"));
        }
        let (prefix, rest) = input.split_at(LENGTH_PREFIX_LEN);
        let length = std::str::from_utf8(prefix)
            .ok()
            .and_then(|s| usize::from_str_radix(s, 16).ok())
            .ok_or_else(|| malformed("invalid pkt-line length prefix"))?;

        match length {
            0 => {
                packets.push(Packet::Flush);
                input = rest;
            }
            1 => {
                packets.push(Packet::Delim);
                input = rest;
            }
            2 | 3 => return Err(malformed("reserved pkt-line control code")),
            _ => {
                let data_len = length - LENGTH_PREFIX_LEN;
                if rest.len() < data_len {
                    return Err(malformed("pkt-line shorter than its length prefix"));
                }
                let (data, rest) = rest.split_at(data_len);
                if data.starts_with(b"ERR ") {
                    let message = String::from_utf8_lossy(&data[4..]).trim().to_string();
                    return Err(ProviderError::Transient {
                        context: format!("in-band git error: {message}"),
                        status: None,
                    });
                }
                packets.push(Packet::Data(data));
                input = rest;
            }
        }
    }

    Ok(packets)
}

fn malformed(context: &str) -> ProviderError {
    ProviderError::Malformed {
        context: context.into(),
    }
}

/// A parsed `ls-refs` response line: `<oid> <refname>[ attr...]`.
#[derive(Debug, PartialEq, Eq)]
struct RefLine {
    oid: String,
    name: String,
    peeled: Option<String>,
}

fn parse_ref_line(line: &[u8]) -> Result<RefLine, ProviderError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| malformed("ref line is not UTF-8"))?
        .trim_end_matches('\n');

    let mut parts = line.split(' ');
    let oid = parts.next().filter(|s| !s.is_empty());
    let name = parts.next().filter(|s| !s.is_empty());
    let (Some(oid), Some(name)) = (oid, name) else {
        return Err(malformed("ref line missing oid or name"));
    };

    let peeled = parts
        .find_map(|attr| attr.strip_prefix("peeled:"))
        .map(String::from);

    Ok(RefLine {
        oid: oid.to_string(),
        name: name.to_string(),
        peeled,
    })
}

/// Lists branch heads over `git-upload-pack`.
pub struct GitRefLister {
    http: reqwest::Client,
    upload_pack_url: String,
    token: Token,
}

impl GitRefLister {
    pub fn new(clone_url: String, token: Token, timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(ProviderError::from)?;

        Ok(Self {
            http,
            upload_pack_url: format!("{clone_url}/git-upload-pack"),
            token,
        })
    }

    /// Resolves one branch's head commit, or `None` if the branch
    /// doesn't exist on the remote.
    pub async fn head_for_branch(
        &self,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ProviderError> {
        let wanted = format!("refs/heads/{branch}");

        let mut body = Vec::new();
        encode_data(&mut body, b"command=ls-refs\n");
        encode_data(&mut body, format!("agent={}\n", crate::USER_AGENT).as_bytes());
        body.extend_from_slice(DELIM);
        encode_data(&mut body, b"peel\n");
        encode_data(&mut body, format!("ref-prefix {wanted}\n").as_bytes());
        body.extend_from_slice(FLUSH);

        let request = self
            .http
            .post(&self.upload_pack_url)
            .header("Git-Protocol", "version=2")
            .header("Content-Type", "application/x-git-upload-pack-request")
            .basic_auth("oauth2", Some(self.token.expose()))
            .body(body)
            .send();

        let resp = tokio::select! {
            resp = request => resp?,
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::from_status(status, None));
        }

        let content = resp.bytes().await?;
        for packet in decode_packets(&content)? {
            let Packet::Data(line) = packet else {
                continue;
            };
            let parsed = parse_ref_line(line)?;
            if parsed.name == wanted {
                // Prefer the peeled object id; for annotated refs it's the
                // commit rather than the annotation.
                return Ok(Some(parsed.peeled.unwrap_or(parsed.oid)));
            }
        }

        Ok(None)
    }
}
