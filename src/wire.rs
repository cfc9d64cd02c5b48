//! Wire schema: operation header, request/response unions, result packages
//!
//! The transport itself (sockets, framing, retries) is outside this crate;
//! what is specified here is the byte layout of every message the match
//! engine consumes or emits:
//!
//! - every sender operation starts with a [`SenderOperationHeader`] carrying
//!   the serialization version and the operation type, followed by the
//!   type's body — a malformed header, an unknown type, or a version
//!   mismatch fails the load before any body parsing;
//! - responses mirror the same envelope;
//! - query results stream as standalone [`ResultPackage`]s after the
//!   [`QueryResponse`] header.
//!
//! Ciphertexts and parameter blobs travel as the opaque byte containers
//! their producers emit ([`crate::he::Ciphertext`], [`PsiParams::save`]);
//! this module never interprets them.

#![forbid(unsafe_code)]

use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::he::Ciphertext;
use crate::oprf::OPRF_QUERY_SIZE;
use crate::params::SERIALIZATION_VERSION;

/// No compression of serialized HE objects.
pub const COMPR_MODE_NONE: u8 = 0;
/// Zlib compression (accepted on the wire, applied by the HE backend).
pub const COMPR_MODE_ZLIB: u8 = 1;
/// Zstandard compression (accepted on the wire, applied by the HE backend).
pub const COMPR_MODE_ZSTD: u8 = 2;

/// Errors surfaced while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed wire data: {0}")]
    Serialization(String),
    #[error("wire version {got} is incompatible with {expected}")]
    VersionMismatch { got: u32, expected: u32 },
    #[error("unknown sender operation type {0}")]
    UnknownOperationType(u32),
    #[error("header declares operation type {header} but the body is {body}")]
    TypeMismatch { header: u32, body: u32 },
    #[error("OPRF request size {0} is not a positive multiple of {OPRF_QUERY_SIZE}")]
    BadOprfRequestSize(usize),
    #[error("unsupported compression mode {0}")]
    UnsupportedCompression(u8),
}

/// Operation discriminants as they appear on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SenderOperationType {
    /// Reserved; never valid in a well-formed message.
    Unknown = 0,
    /// Parameter request.
    Parms = 1,
    /// OPRF evaluation request.
    Oprf = 2,
    /// Encrypted query.
    Query = 3,
}

impl SenderOperationType {
    fn from_u32(value: u32) -> Result<Self, WireError> {
        match value {
            1 => Ok(Self::Parms),
            2 => Ok(Self::Oprf),
            3 => Ok(Self::Query),
            other => Err(WireError::UnknownOperationType(other)),
        }
    }
}

/// The fixed header preceding every sender operation and response.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SenderOperationHeader {
    /// Serialization version; must match [`SERIALIZATION_VERSION`].
    pub version: u32,
    /// Raw operation type (see [`SenderOperationType`]).
    pub op_type: u32,
}

fn check_compression(mode: u8) -> Result<(), WireError> {
    match mode {
        COMPR_MODE_NONE | COMPR_MODE_ZLIB | COMPR_MODE_ZSTD => Ok(()),
        other => Err(WireError::UnsupportedCompression(other)),
    }
}

// ---------------------------- Requests ----------------------------

/// Parameter request; carries no data.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParmsRequest {}

/// A batch of OPRF query elements.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OprfRequest {
    /// Concatenated [`OPRF_QUERY_SIZE`]-byte elements.
    pub data: Vec<u8>,
}

impl OprfRequest {
    fn validate(&self) -> Result<(), WireError> {
        if self.data.is_empty() || self.data.len() % OPRF_QUERY_SIZE != 0 {
            return Err(WireError::BadOprfRequestSize(self.data.len()));
        }
        Ok(())
    }
}

/// The ciphertexts for one transmitted power, one per bundle index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryPart {
    /// The power these ciphertexts carry.
    pub exponent: u32,
    /// One ciphertext per bundle index (`bundle_idx_count` entries).
    pub cts: Vec<Ciphertext>,
}

/// An encrypted query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Compression mode for the response ciphertexts.
    pub compression: u8,
    /// Serialized relinearization keys (empty when the scheme does not
    /// key-switch).
    pub relin_keys: Vec<u8>,
    /// The transmitted source powers.
    pub query: Vec<QueryPart>,
}

/// A sender operation: the typed union the wire carries after the header.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SenderOperation {
    /// Parameter request.
    Parms(ParmsRequest),
    /// OPRF request.
    Oprf(OprfRequest),
    /// Encrypted query request.
    Query(QueryRequest),
}

impl SenderOperation {
    /// The operation's wire type.
    pub fn op_type(&self) -> SenderOperationType {
        match self {
            SenderOperation::Parms(_) => SenderOperationType::Parms,
            SenderOperation::Oprf(_) => SenderOperationType::Oprf,
            SenderOperation::Query(_) => SenderOperationType::Query,
        }
    }

    /// Serialize as header followed by the body.
    pub fn save(&self) -> Result<Vec<u8>, WireError> {
        let header = SenderOperationHeader {
            version: SERIALIZATION_VERSION,
            op_type: self.op_type() as u32,
        };
        let mut out =
            bincode::serialize(&header).map_err(|e| WireError::Serialization(e.to_string()))?;
        let body = match self {
            SenderOperation::Parms(req) => bincode::serialize(req),
            SenderOperation::Oprf(req) => bincode::serialize(req),
            SenderOperation::Query(req) => bincode::serialize(req),
        }
        .map_err(|e| WireError::Serialization(e.to_string()))?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse and validate a sender operation.
    pub fn load(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cursor = Cursor::new(bytes);
        let header: SenderOperationHeader = bincode::deserialize_from(&mut cursor)
            .map_err(|e| WireError::Serialization(e.to_string()))?;
        if header.version != SERIALIZATION_VERSION {
            return Err(WireError::VersionMismatch {
                got: header.version,
                expected: SERIALIZATION_VERSION,
            });
        }
        let body = &bytes[cursor.position() as usize..];

        let op = match SenderOperationType::from_u32(header.op_type)? {
            SenderOperationType::Parms => SenderOperation::Parms(
                bincode::deserialize(body).map_err(|e| WireError::Serialization(e.to_string()))?,
            ),
            SenderOperationType::Oprf => {
                let req: OprfRequest = bincode::deserialize(body)
                    .map_err(|e| WireError::Serialization(e.to_string()))?;
                req.validate()?;
                SenderOperation::Oprf(req)
            }
            SenderOperationType::Query => {
                let req: QueryRequest = bincode::deserialize(body)
                    .map_err(|e| WireError::Serialization(e.to_string()))?;
                check_compression(req.compression)?;
                SenderOperation::Query(req)
            }
            SenderOperationType::Unknown => unreachable!("rejected by from_u32"),
        };
        Ok(op)
    }
}

// ---------------------------- Responses ----------------------------

/// Response to a parameter request: the serialized parameter bundle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParmsResponse {
    /// [`crate::params::PsiParams::save`] output.
    pub params: Vec<u8>,
}

/// Response to an OPRF request; same shape as the request data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OprfResponse {
    /// Concatenated processed elements.
    pub data: Vec<u8>,
}

/// Response header for a query: how many result packages will follow.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Total BinBundle count at query time.
    pub package_count: u32,
}

/// A sender response: the typed union mirroring [`SenderOperation`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SenderResponse {
    /// Parameter response.
    Parms(ParmsResponse),
    /// OPRF response.
    Oprf(OprfResponse),
    /// Query response header.
    Query(QueryResponse),
}

impl SenderResponse {
    /// The response's wire type.
    pub fn op_type(&self) -> SenderOperationType {
        match self {
            SenderResponse::Parms(_) => SenderOperationType::Parms,
            SenderResponse::Oprf(_) => SenderOperationType::Oprf,
            SenderResponse::Query(_) => SenderOperationType::Query,
        }
    }

    /// Serialize as header followed by the body.
    pub fn save(&self) -> Result<Vec<u8>, WireError> {
        let header = SenderOperationHeader {
            version: SERIALIZATION_VERSION,
            op_type: self.op_type() as u32,
        };
        let mut out =
            bincode::serialize(&header).map_err(|e| WireError::Serialization(e.to_string()))?;
        let body = match self {
            SenderResponse::Parms(r) => bincode::serialize(r),
            SenderResponse::Oprf(r) => bincode::serialize(r),
            SenderResponse::Query(r) => bincode::serialize(r),
        }
        .map_err(|e| WireError::Serialization(e.to_string()))?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse and validate a sender response.
    pub fn load(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cursor = Cursor::new(bytes);
        let header: SenderOperationHeader = bincode::deserialize_from(&mut cursor)
            .map_err(|e| WireError::Serialization(e.to_string()))?;
        if header.version != SERIALIZATION_VERSION {
            return Err(WireError::VersionMismatch {
                got: header.version,
                expected: SERIALIZATION_VERSION,
            });
        }
        let body = &bytes[cursor.position() as usize..];
        let map_err = |e: bincode::Error| WireError::Serialization(e.to_string());

        Ok(match SenderOperationType::from_u32(header.op_type)? {
            SenderOperationType::Parms => {
                SenderResponse::Parms(bincode::deserialize(body).map_err(map_err)?)
            }
            SenderOperationType::Oprf => {
                SenderResponse::Oprf(bincode::deserialize(body).map_err(map_err)?)
            }
            SenderOperationType::Query => {
                SenderResponse::Query(bincode::deserialize(body).map_err(map_err)?)
            }
            SenderOperationType::Unknown => unreachable!("rejected by from_u32"),
        })
    }
}

// ---------------------------- Result packages ----------------------------

/// One streamed query result: everything the receiver needs to decode the
/// matches (and labels) of one BinBundle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultPackage {
    /// Which bundle index this package answers.
    pub bundle_idx: u32,
    /// Compression mode of the contained ciphertexts.
    pub compression: u8,
    /// Label length in bytes (0 when unlabeled).
    pub label_byte_count: u32,
    /// Nonce length in bytes.
    pub nonce_byte_count: u32,
    /// The encrypted matching-polynomial evaluation.
    pub psi_result: Ciphertext,
    /// Encrypted interpolation-polynomial evaluations, one per label chunk.
    pub label_result: Vec<Ciphertext>,
}

impl ResultPackage {
    /// Serialize with a version word.
    pub fn save(&self) -> Result<Vec<u8>, WireError> {
        let mut out = bincode::serialize(&SERIALIZATION_VERSION)
            .map_err(|e| WireError::Serialization(e.to_string()))?;
        out.extend_from_slice(
            &bincode::serialize(self).map_err(|e| WireError::Serialization(e.to_string()))?,
        );
        Ok(out)
    }

    /// Parse and validate a result package.
    pub fn load(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cursor = Cursor::new(bytes);
        let version: u32 = bincode::deserialize_from(&mut cursor)
            .map_err(|e| WireError::Serialization(e.to_string()))?;
        if version != SERIALIZATION_VERSION {
            return Err(WireError::VersionMismatch {
                got: version,
                expected: SERIALIZATION_VERSION,
            });
        }
        let package: ResultPackage =
            bincode::deserialize(&bytes[cursor.position() as usize..])
                .map_err(|e| WireError::Serialization(e.to_string()))?;
        check_compression(package.compression)?;
        Ok(package)
    }
}

// ============================================================================
// Tests
// ============================================================================
