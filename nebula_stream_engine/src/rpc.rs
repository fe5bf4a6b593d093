// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The inter-worker RPC wire contract.
//!
//! Four operations travel between coordinator and workers: register a query, unregister a
//! query, list the queries a worker runs, and push a tuple buffer. Messages are
//! length-prefixed frames, `[u32 kind][u32 bodyLen][body]`, little-endian. Control bodies
//! are JSON; buffer bodies are the fixed header followed by the raw payload. The transport
//! that carries the frames is a collaborator; this module only encodes and decodes.

use serde::{Deserialize, Serialize};

use crate::runtime::buffer::BUFFER_HEADER_SIZE;
use crate::ErrorKind;

const KIND_REGISTER_QUERY: u32 = 1;
const KIND_UNREGISTER_QUERY: u32 = 2;
const KIND_LIST_QUERIES: u32 = 3;
const KIND_SEND_BUFFER: u32 = 4;

/// A decoded request frame.
#[derive(Debug, PartialEq)]
pub enum RpcRequest {
    /// Registers a serialized logical plan; answered with the assigned query id.
    RegisterQuery { plan: serde_json::Value },
    /// Unregisters a query; answered with a success flag.
    UnregisterQuery { query_id: u64 },
    /// Lists the query ids known to the peer.
    ListQueries,
    /// Pushes one tuple buffer for the given origin.
    SendBuffer {
        origin_id: u64,
        watermark: u64,
        sequence_number: u64,
        num_tuples: u64,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Deserialize, Serialize)]
struct RegisterQueryBody {
    plan: serde_json::Value,
}

#[derive(Debug, Deserialize, Serialize)]
struct UnregisterQueryBody {
    #[serde(rename = "queryId")]
    query_id: u64,
}

impl RpcRequest {
    pub fn kind(&self) -> u32 {
        match self {
            RpcRequest::RegisterQuery { .. } => KIND_REGISTER_QUERY,
            RpcRequest::UnregisterQuery { .. } => KIND_UNREGISTER_QUERY,
            RpcRequest::ListQueries => KIND_LIST_QUERIES,
            RpcRequest::SendBuffer { .. } => KIND_SEND_BUFFER,
        }
    }

    /// Encodes this request as one frame.
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        let body = match self {
            RpcRequest::RegisterQuery { plan } => {
                serde_json::to_vec(&RegisterQueryBody { plan: plan.clone() })
                    .map_err(|e| ErrorKind::InternalError.with_source(e))?
            }
            RpcRequest::UnregisterQuery { query_id } => {
                serde_json::to_vec(&UnregisterQueryBody { query_id: *query_id })
                    .map_err(|e| ErrorKind::InternalError.with_source(e))?
            }
            RpcRequest::ListQueries => Vec::new(),
            RpcRequest::SendBuffer {
                origin_id,
                watermark,
                sequence_number,
                num_tuples,
                payload,
            } => {
                let mut body = Vec::with_capacity(BUFFER_HEADER_SIZE + payload.len());
                body.extend_from_slice(&num_tuples.to_le_bytes());
                body.extend_from_slice(&origin_id.to_le_bytes());
                body.extend_from_slice(&watermark.to_le_bytes());
                body.extend_from_slice(&sequence_number.to_le_bytes());
                body.extend_from_slice(payload);
                body
            }
        };
        let mut frame = Vec::with_capacity(8 + body.len());
        frame.extend_from_slice(&self.kind().to_le_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decodes one frame from the front of `bytes`.
    ///
    /// Returns the request and the bytes consumed, or `None` when the frame is still
    /// incomplete (the caller reads more and retries).
    pub fn decode(bytes: &[u8]) -> crate::Result<Option<(RpcRequest, usize)>> {
        if bytes.len() < 8 {
            return Ok(None);
        }
        let kind = u32::from_le_bytes(bytes[..4].try_into().expect("frame header"));
        let body_len =
            u32::from_le_bytes(bytes[4..8].try_into().expect("frame header")) as usize;
        if bytes.len() < 8 + body_len {
            return Ok(None);
        }
        let body = &bytes[8..8 + body_len];
        let request = match kind {
            KIND_REGISTER_QUERY => {
                let body: RegisterQueryBody = serde_json::from_slice(body)
                    .map_err(|e| ErrorKind::InvalidQueryPlan.with_source(e))?;
                RpcRequest::RegisterQuery { plan: body.plan }
            }
            KIND_UNREGISTER_QUERY => {
                let body: UnregisterQueryBody = serde_json::from_slice(body)
                    .map_err(|e| ErrorKind::InvalidQueryPlan.with_source(e))?;
                RpcRequest::UnregisterQuery {
                    query_id: body.query_id,
                }
            }
            KIND_LIST_QUERIES => RpcRequest::ListQueries,
            KIND_SEND_BUFFER => {
                if body.len() < BUFFER_HEADER_SIZE {
                    return Err(ErrorKind::InternalError
                        .with_message("buffer frame shorter than its header"));
                }
                let word =
                    |i: usize| u64::from_le_bytes(body[i * 8..(i + 1) * 8].try_into().expect("header"));
                RpcRequest::SendBuffer {
                    num_tuples: word(0),
                    origin_id: word(1),
                    watermark: word(2),
                    sequence_number: word(3),
                    payload: body[BUFFER_HEADER_SIZE..].to_vec(),
                }
            }
            other => {
                return Err(ErrorKind::InternalError
                    .with_message(format!("unknown rpc frame kind {other}")))
            }
        };
        Ok(Some((request, 8 + body_len)))
    }
}

/// A decoded response frame; kinds mirror the request kinds plus 100.
#[derive(Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RpcResponse {
    QueryRegistered { query_id: u64 },
    QueryUnregistered { success: bool },
    QueryList { query_ids: Vec<u64> },
    BufferAccepted,
}

impl RpcResponse {
    fn kind(&self) -> u32 {
        match self {
            RpcResponse::QueryRegistered { .. } => 100 + KIND_REGISTER_QUERY,
            RpcResponse::QueryUnregistered { .. } => 100 + KIND_UNREGISTER_QUERY,
            RpcResponse::QueryList { .. } => 100 + KIND_LIST_QUERIES,
            RpcResponse::BufferAccepted => 100 + KIND_SEND_BUFFER,
        }
    }

    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        let body = serde_json::to_vec(self)
            .map_err(|e| ErrorKind::InternalError.with_source(e))?;
        let mut frame = Vec::with_capacity(8 + body.len());
        frame.extend_from_slice(&self.kind().to_le_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Option<(RpcResponse, usize)>> {
        if bytes.len() < 8 {
            return Ok(None);
        }
        let body_len =
            u32::from_le_bytes(bytes[4..8].try_into().expect("frame header")) as usize;
        if bytes.len() < 8 + body_len {
            return Ok(None);
        }
        let response: RpcResponse = serde_json::from_slice(&bytes[8..8 + body_len])
            .map_err(|e| ErrorKind::InternalError.with_source(e))?;
        Ok(Some((response, 8 + body_len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn control_frames_roundtrip() -> crate::Result<()> {
        let request = RpcRequest::RegisterQuery {
            plan: json!({"nodes": [{"opKind": "source", "opId": 1, "inputs": []}]}),
        };
        let frame = request.encode()?;
        let (decoded, consumed) = RpcRequest::decode(&frame)?.expect("complete frame");
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded, request);
        Ok(())
    }

    #[test]
    fn buffer_frames_carry_header_and_payload() -> crate::Result<()> {
        let request = RpcRequest::SendBuffer {
            origin_id: 7,
            watermark: 1500,
            sequence_number: 3,
            num_tuples: 2,
            payload: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        let frame = request.encode()?;
        assert_eq!(frame.len(), 8 + 32 + 4);
        let (decoded, _) = RpcRequest::decode(&frame)?.expect("complete frame");
        assert_eq!(decoded, request);
        Ok(())
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() -> crate::Result<()> {
        let frame = RpcRequest::ListQueries.encode()?;
        assert!(RpcRequest::decode(&frame[..4])?.is_none());
        assert!(RpcRequest::decode(&frame[..7])?.is_none());
        assert!(RpcRequest::decode(&frame)?.is_some());
        Ok(())
    }

    #[test]
    fn frames_decode_back_to_back() -> crate::Result<()> {
        let mut stream = RpcRequest::ListQueries.encode()?;
        stream.extend(RpcRequest::UnregisterQuery { query_id: 9 }.encode()?);
        let (first, consumed) = RpcRequest::decode(&stream)?.expect("first frame");
        assert_eq!(first, RpcRequest::ListQueries);
        let (second, _) = RpcRequest::decode(&stream[consumed..])?.expect("second frame");
        assert_eq!(second, RpcRequest::UnregisterQuery { query_id: 9 });
        Ok(())
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let mut frame = vec![0u8; 8];
        frame[..4].copy_from_slice(&99u32.to_le_bytes());
        let err = RpcRequest::decode(&frame).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalError);
    }

    #[test]
    fn responses_roundtrip() -> crate::Result<()> {
        let response = RpcResponse::QueryList {
            query_ids: vec![1, 2, 3],
        };
        let frame = response.encode()?;
        let (decoded, _) = RpcResponse::decode(&frame)?.expect("complete frame");
        assert_eq!(decoded, response);
        Ok(())
    }
}
