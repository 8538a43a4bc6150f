//! Server side of the remote-repository protocol.
//!
//! A helper process runs `serve` over a bidirectional byte stream
//! (stdin/stdout of an SSH child, a socketpair in tests) and answers
//! framed requests with repository operations. Keys never reach this
//! side: objects pass through opaque, and `load_key` hands back the
//! wrapped blob for the client to unlock.

use std::io::{Read, Write};

use tracing::debug;

use cairn_protocol::{
    check_protocol_version, decode_frame, encode_frame, Decoded, RemoteError, Request, Response,
};
use cairn_types::error::{CairnError, Result};

use crate::config::RuntimeConfig;
use crate::platform;
use crate::repo::check::RepoCheckOptions;
use crate::repo::{Access, Repository};

const READ_CHUNK: usize = 64 * 1024;

fn remote_error(e: CairnError) -> RemoteError {
    match e {
        CairnError::ObjectMissing(id) => RemoteError::ObjectMissing(id),
        CairnError::RepoNotFound(p) => RemoteError::RepoNotFound(p),
        CairnError::RepoAlreadyExists(p) => RemoteError::RepoAlreadyExists(p),
        CairnError::Locked(holder) => RemoteError::Locked(holder),
        e @ (CairnError::CrcMismatch { .. }
        | CairnError::UnknownSegmentMagic { .. }
        | CairnError::IdMismatch(_)) => RemoteError::IntegrityError(e.to_string()),
        CairnError::Io(e) => RemoteError::Io(e.to_string()),
        e => RemoteError::InvalidRequest(e.to_string()),
    }
}

/// Serve one connection until the peer closes the stream.
pub fn serve(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    runtime: &RuntimeConfig,
) -> Result<()> {
    let mut repo: Option<Repository> = None;
    let mut buf: Vec<u8> = Vec::new();
    let mut scratch = [0u8; READ_CHUNK];

    loop {
        let request: Request = loop {
            match decode_frame(&buf) {
                Ok(Decoded::Frame(req, consumed)) => {
                    buf.drain(..consumed);
                    break req;
                }
                Ok(Decoded::Incomplete) => {
                    let n = reader.read(&mut scratch)?;
                    if n == 0 {
                        return Ok(()); // peer hung up between frames
                    }
                    buf.extend_from_slice(&scratch[..n]);
                }
                Ok(Decoded::Oversized(len)) => {
                    return Err(CairnError::InvalidFormat(format!(
                        "oversized protocol frame: {len} bytes"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        };

        let response = handle(&mut repo, request, runtime);
        let frame = encode_frame(&response)
            .map_err(|e| CairnError::Other(format!("response encoding failed: {e}")))?;
        writer.write_all(&frame)?;
        writer.flush()?;
    }
}

fn handle(repo: &mut Option<Repository>, request: Request, runtime: &RuntimeConfig) -> Response {
    match try_handle(repo, request, runtime) {
        Ok(response) => response,
        Err(e) => Response::Error(remote_error(e)),
    }
}

fn try_handle(
    repo_slot: &mut Option<Repository>,
    request: Request,
    runtime: &RuntimeConfig,
) -> Result<Response> {
    if let Request::Open {
        protocol_version,
        path,
        create,
        read_only,
    } = &request
    {
        check_protocol_version(*protocol_version)
            .map_err(|m| CairnError::Other(format!("protocol mismatch: {m}")))?;
        if *create {
            // Creation decides key material and must happen client-side.
            return Ok(Response::Error(RemoteError::InvalidRequest(
                "remote create is not supported".into(),
            )));
        }
        let access = if *read_only {
            Access::ReadOnly
        } else {
            Access::ReadWrite
        };
        let host_id = platform::host_id(runtime.host_id.as_deref());
        let repo = Repository::open(std::path::Path::new(path), access, &host_id)?;
        debug!(path = %path, "remote repository opened");
        *repo_slot = Some(repo);
        return Ok(Response::Ok);
    }

    let repo = repo_slot
        .as_mut()
        .ok_or_else(|| CairnError::Other("request before open".into()))?;

    match request {
        Request::Open { .. } => unreachable!("handled above"),
        Request::Put { id, payload } => {
            repo.put(&id, &payload)?;
            Ok(Response::Ok)
        }
        Request::Get { id } => Ok(Response::Data(repo.get(&id)?)),
        Request::Delete { id } => {
            repo.delete(&id)?;
            Ok(Response::Ok)
        }
        Request::Commit => {
            repo.commit(None)?;
            Ok(Response::Ok)
        }
        Request::List { after, limit } => {
            Ok(Response::Ids(repo.list(after.as_ref(), limit as usize)))
        }
        Request::Check { verify_data: _ } => {
            // Data verification needs the key and happens client-side;
            // the helper checks structure only.
            let report = repo.check(&RepoCheckOptions::default())?;
            Ok(Response::CheckReport {
                errors: report
                    .issues
                    .iter()
                    .map(|i| format!("segment {}: {}", i.segment, i.message))
                    .collect(),
            })
        }
        Request::LoadKey => match &repo.config.key {
            Some(key) => Ok(Response::Data(rmp_serde::to_vec(key)?)),
            None => Ok(Response::Error(RemoteError::InvalidRequest(
                "repository has no stored key".into(),
            ))),
        },
    }
}
