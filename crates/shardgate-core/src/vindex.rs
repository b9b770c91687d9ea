//! Vindex resolution: deterministic mapping from column values to
//! shard-identifying keyspace ids.
//!
//! Variants:
//! - `Binary`: identity bytes, reversible
//! - `Hash`: zero-key 3DES hash of a 64-bit integer, reversible
//! - `BinaryHash`: zero-key 3DES over fixed 8-byte binary keys, reversible
//! - `Murmur`: murmur-finalizer hash used for table-level partitioning,
//!   not reversible
//!
//! All variants are stateless and safe for unsynchronized concurrent use.
//! `map` is pure and total: every input value yields exactly one
//! `Destination`, and the output length always equals the input length.

use std::sync::OnceLock;

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::TdesEde3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::expr::Value;

#[derive(Debug, Error)]
pub enum VindexError {
    #[error("keyspace id is required, got an empty value")]
    MissingKeyspaceId,
    #[error("keyspace id must be {expected} bytes, got {got}")]
    BadKeyspaceIdLength { expected: usize, got: usize },
    #[error("cannot coerce value to {expected}: {got}")]
    InvalidInput { expected: &'static str, got: String },
    #[error("vindex {0} is not reversible")]
    NotReversible(&'static str),
    #[error("verify called with {values} values against {keyspace_ids} keyspace ids")]
    LengthMismatch { values: usize, keyspace_ids: usize },
}

/// Routing target produced by vindex evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    /// A single keyspace id; resolves to exactly one shard.
    KeyspaceId(Vec<u8>),
    /// Every shard of the keyspace.
    AllShards,
    /// No shard at all. Resolves to nothing and never errors.
    None,
}

impl Destination {
    pub fn is_unique(&self) -> bool {
        !matches!(self, Destination::AllShards)
    }
}

/// The vindex family. Closed set; stateless; `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vindex {
    Binary,
    Hash,
    BinaryHash,
    Murmur,
}

impl Vindex {
    /// Registry lookup by the name used in schema definitions.
    pub fn by_name(name: &str) -> Option<Vindex> {
        match name {
            "binary" => Some(Vindex::Binary),
            "hash" => Some(Vindex::Hash),
            "binary_hash" => Some(Vindex::BinaryHash),
            "murmur" => Some(Vindex::Murmur),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Vindex::Binary => "binary",
            Vindex::Hash => "hash",
            Vindex::BinaryHash => "binary_hash",
            Vindex::Murmur => "murmur",
        }
    }

    /// Relative cost for vindex selection; identity is free.
    pub fn cost(&self) -> u32 {
        match self {
            Vindex::Binary => 0,
            Vindex::Hash | Vindex::BinaryHash | Vindex::Murmur => 1,
        }
    }

    /// Whether one input value maps to at most one keyspace id.
    pub fn is_unique(&self) -> bool {
        true
    }

    /// Whether evaluation needs an execution context (lookup-style vindexes
    /// would; none of the functional variants here do).
    pub fn needs_context(&self) -> bool {
        false
    }

    /// Maps each input value to its routing destination. NULL maps to
    /// `Destination::None`; a value that cannot be coerced to the vindex's
    /// input type is an error, never a silent default.
    pub fn map(&self, values: &[Value]) -> Result<Vec<Destination>, VindexError> {
        values
            .iter()
            .map(|value| {
                if value.is_null() {
                    return Ok(Destination::None);
                }
                let ksid = self.keyspace_id(value)?;
                Ok(Destination::KeyspaceId(ksid))
            })
            .collect()
    }

    /// Element-wise check that each value maps to the paired keyspace id.
    pub fn verify(&self, values: &[Value], keyspace_ids: &[Vec<u8>]) -> Result<Vec<bool>, VindexError> {
        if values.len() != keyspace_ids.len() {
            return Err(VindexError::LengthMismatch {
                values: values.len(),
                keyspace_ids: keyspace_ids.len(),
            });
        }
        values
            .iter()
            .zip(keyspace_ids)
            .map(|(value, ksid)| {
                if value.is_null() {
                    return Ok(false);
                }
                Ok(self.keyspace_id(value)? == *ksid)
            })
            .collect()
    }

    /// Inverts keyspace ids back to column values. Fails on any empty
    /// keyspace id (a keyspace id is required input, never optional) and on
    /// the non-reversible `Murmur` variant.
    pub fn reverse_map(&self, keyspace_ids: &[Vec<u8>]) -> Result<Vec<Value>, VindexError> {
        keyspace_ids
            .iter()
            .map(|ksid| {
                if ksid.is_empty() {
                    return Err(VindexError::MissingKeyspaceId);
                }
                match self {
                    Vindex::Binary => Ok(Value::Bytes(ksid.clone())),
                    Vindex::Hash => Ok(Value::UInt(vunhash(ksid)?)),
                    Vindex::BinaryHash => Ok(Value::Bytes(vunhash_bytes(ksid)?.to_vec())),
                    Vindex::Murmur => Err(VindexError::NotReversible(self.name())),
                }
            })
            .collect()
    }

    /// Table-level partition ordinal for the `Murmur` vindex (and, by
    /// extension, any variant: partitioning only needs a stable hash).
    pub fn partition(&self, value: &Value, partition_count: u32) -> Result<u32, VindexError> {
        if partition_count == 0 {
            return Err(VindexError::InvalidInput {
                expected: "non-zero partition count",
                got: "0".to_string(),
            });
        }
        let bytes = value_bytes(value)?;
        Ok((murmur64(&bytes) % u64::from(partition_count)) as u32)
    }

    fn keyspace_id(&self, value: &Value) -> Result<Vec<u8>, VindexError> {
        match self {
            Vindex::Binary => value_bytes(value),
            Vindex::Hash => Ok(vhash(to_u64(value)?).to_vec()),
            Vindex::BinaryHash => {
                let bytes = value_bytes(value)?;
                if bytes.len() != 8 {
                    return Err(VindexError::InvalidInput {
                        expected: "8-byte binary key",
                        got: format!("{} bytes", bytes.len()),
                    });
                }
                let mut block = [0u8; 8];
                block.copy_from_slice(&bytes);
                Ok(vhash_block(block).to_vec())
            }
            Vindex::Murmur => Ok(murmur64(&value_bytes(value)?).to_be_bytes().to_vec()),
        }
    }
}

// ============================================================================
// Value coercion
// ============================================================================

fn to_u64(value: &Value) -> Result<u64, VindexError> {
    match value {
        Value::Int(i) => Ok(*i as u64),
        Value::UInt(u) => Ok(*u),
        Value::Str(s) => s
            .parse::<u64>()
            .or_else(|_| s.parse::<i64>().map(|i| i as u64))
            .map_err(|_| VindexError::InvalidInput {
                expected: "64-bit integer",
                got: s.clone(),
            }),
        Value::Bytes(b) if b.len() == 8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            Ok(u64::from_be_bytes(raw))
        }
        other => Err(VindexError::InvalidInput {
            expected: "64-bit integer",
            got: format!("{other:?}"),
        }),
    }
}

fn value_bytes(value: &Value) -> Result<Vec<u8>, VindexError> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        Value::Str(s) => Ok(s.as_bytes().to_vec()),
        Value::Int(i) => Ok(i.to_be_bytes().to_vec()),
        Value::UInt(u) => Ok(u.to_be_bytes().to_vec()),
        Value::Null => Err(VindexError::InvalidInput {
            expected: "non-null value",
            got: "NULL".to_string(),
        }),
    }
}

// ============================================================================
// Reversible block hash (zero-key 3DES)
// ============================================================================

static VHASH_CIPHER: OnceLock<TdesEde3> = OnceLock::new();

fn vhash_cipher() -> &'static TdesEde3 {
    VHASH_CIPHER.get_or_init(|| TdesEde3::new(GenericArray::from_slice(&[0u8; 24])))
}

/// Hashes a 64-bit shard key into its 8-byte keyspace id.
pub fn vhash(shard_key: u64) -> [u8; 8] {
    vhash_block(shard_key.to_be_bytes())
}

fn vhash_block(block: [u8; 8]) -> [u8; 8] {
    let mut buf = GenericArray::from(block);
    vhash_cipher().encrypt_block(&mut buf);
    buf.into()
}

/// Exact inverse of `vhash`.
pub fn vunhash(keyspace_id: &[u8]) -> Result<u64, VindexError> {
    Ok(u64::from_be_bytes(vunhash_bytes(keyspace_id)?))
}

fn vunhash_bytes(keyspace_id: &[u8]) -> Result<[u8; 8], VindexError> {
    if keyspace_id.len() != 8 {
        return Err(VindexError::BadKeyspaceIdLength {
            expected: 8,
            got: keyspace_id.len(),
        });
    }
    let mut buf = GenericArray::clone_from_slice(keyspace_id);
    vhash_cipher().decrypt_block(&mut buf);
    Ok(buf.into())
}

// ============================================================================
// Non-reversible partition hash
// ============================================================================

fn murmur64(data: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325 ^ (data.len() as u64);
    for &byte in data {
        h = h.wrapping_add(u64::from(byte)).wrapping_mul(0x517c_c1b7_2722_0a95);
        h ^= h >> 47;
    }
    // 64-bit finalizer for avalanche on short keys
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^ (h >> 33)
}

// ============================================================================
// Tests
// ============================================================================
