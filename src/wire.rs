//! Wire Module
//!
//! JSON message types for the two HTTP surfaces: the client gateway
//! (`POST /v1/fs`) and the file server RPC (`POST /v1/rpc`).

use crate::cache_types::{FileHandle, LeaseGrant, LeaseMode, OpenMode, RemoteFile, SeekOrigin, Version};
use crate::file_server::Invalidation;
use crate::ProxyError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const FS_PATH: &str = "/v1/fs";
pub const RPC_PATH: &str = "/v1/rpc";
pub const HEALTH_PATH: &str = "/health";
pub const STATS_PATH: &str = "/stats";

/// One client file operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FsOp {
    Open {
        path: String,
        mode: OpenMode,
        #[serde(default)]
        allow_stale: bool,
    },
    /// Positional read when `offset` is set, cursor read otherwise
    Read {
        handle: FileHandle,
        len: u64,
        #[serde(default)]
        offset: Option<u64>,
    },
    Write {
        handle: FileHandle,
        data: Bytes,
    },
    Seek {
        handle: FileHandle,
        origin: SeekOrigin,
    },
    Close {
        handle: FileHandle,
    },
    Discard {
        handle: FileHandle,
    },
    Unlink {
        path: String,
    },
    /// The client is finished; close all of its handles
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsRequest {
    pub client_id: String,
    pub op: FsOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FsResult {
    Handle { handle: FileHandle },
    Data { data: Bytes },
    Written { count: u64 },
    Offset { offset: u64 },
    Closed { handles: u64 },
    Ok,
}

/// Gateway reply: a result, or an error with its errno
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsReply {
    Ok(FsResult),
    Err { errno: i32, error: ProxyError },
}

impl From<crate::Result<FsResult>> for FsReply {
    fn from(result: crate::Result<FsResult>) -> Self {
        match result {
            Ok(value) => FsReply::Ok(value),
            Err(error) => FsReply::Err {
                errno: error.errno(),
                error,
            },
        }
    }
}

impl From<FsReply> for crate::Result<FsResult> {
    fn from(reply: FsReply) -> Self {
        match reply {
            FsReply::Ok(value) => Ok(value),
            FsReply::Err { error, .. } => Err(error),
        }
    }
}

/// One remote store call, made on behalf of `proxy_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub proxy_id: String,
    pub call: RpcCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcCall {
    Fetch { name: String },
    Stat { name: String },
    Commit { name: String, content: Bytes, expected: Version },
    RequestLease { name: String, mode: LeaseMode },
    ReleaseLease { name: String },
    Remove { name: String },
    /// Start queueing invalidations for this proxy
    Register,
    /// Acknowledge `acks`, then wait up to `wait_ms` for invalidations
    PollInvalidations { acks: Vec<u64>, wait_ms: u64 },
    Disconnect,
}

impl RpcCall {
    /// Calls that may be repeated without changing the outcome
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, RpcCall::Commit { .. } | RpcCall::Remove { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcValue {
    File(RemoteFile),
    Version(Option<Version>),
    Committed(Version),
    Lease(LeaseGrant),
    Invalidations(Vec<Invalidation>),
    Done,
}

pub type RpcReply = std::result::Result<RpcValue, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_request_json_shape() {
        let json = r#"{"client_id":"c1","op":{"type":"open","path":"A","mode":"create_new"}}"#;
        let request: FsRequest = serde_json::from_str(json).unwrap();
        assert_eq!(
            request.op,
            FsOp::Open {
                path: "A".to_string(),
                mode: OpenMode::CreateNew,
                allow_stale: false
            }
        );

        let seek: FsOp = serde_json::from_str(r#"{"type":"seek","handle":3,"origin":{"end":-2}}"#).unwrap();
        assert_eq!(
            seek,
            FsOp::Seek {
                handle: 3,
                origin: SeekOrigin::End(-2)
            }
        );
    }

    #[test]
    fn test_error_reply_carries_errno() {
        let reply = FsReply::from(Err(ProxyError::NotFound("A".to_string())));
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"errno\":-2"));

        let back: FsReply = serde_json::from_str(&json).unwrap();
        let result: crate::Result<FsResult> = back.into();
        assert_eq!(result, Err(ProxyError::NotFound("A".to_string())));
    }

    #[test]
    fn test_commit_is_not_idempotent() {
        assert!(!RpcCall::Commit {
            name: "A".to_string(),
            content: Bytes::new(),
            expected: 0
        }
        .is_idempotent());
        assert!(RpcCall::Fetch { name: "A".to_string() }.is_idempotent());
    }
}
