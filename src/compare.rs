//! Key comparators and the custom-comparator registry
//!
//! Comparators derive from the key type: memcmp for binary keys, natural
//! order for the numeric types, and a user-registered function for custom
//! keys. The registry is the only process-wide state in the crate; it is a
//! lazily initialized, lock-protected map keyed by comparator name.
//!
//! User comparators are called under the Environment lock and must be
//! deterministic and side-effect-free.

use std::cmp::Ordering;
use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Error, ErrorKind, Result};
use crate::types::KeyType;

/// A user-supplied key comparator.
pub type CompareFn = fn(&[u8], &[u8]) -> Ordering;

lazy_static::lazy_static! {
    static ref COMPARE_REGISTRY: RwLock<HashMap<String, CompareFn>> =
        RwLock::new(HashMap::new());
}

/// Register a comparator under `name`, replacing any previous registration.
///
/// Databases created with `KeyType::Custom` reference the comparator by this
/// name; the function must be registered before such a database is opened.
pub fn register_compare(name: &str, func: CompareFn) {
    COMPARE_REGISTRY.write().insert(name.to_string(), func);
}

/// Look up a registered comparator by name.
pub fn lookup_compare(name: &str) -> Option<CompareFn> {
    COMPARE_REGISTRY.read().get(name).copied()
}

/// The comparison strategy a database runs with.
#[derive(Debug, Clone, Copy)]
pub enum KeyCompare {
    Memcmp,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Real32,
    Real64,
    Custom(CompareFn),
    /// Placeholder for a custom database opened with the
    /// ignore-missing-callback flag; any comparison fails.
    Unresolved,
}

impl KeyCompare {
    /// Resolve the comparator for a key type at database open time.
    pub fn resolve(
        key_type: KeyType,
        compare_name: Option<&str>,
        ignore_missing: bool,
    ) -> Result<KeyCompare> {
        Ok(match key_type {
            KeyType::Binary => KeyCompare::Memcmp,
            KeyType::UInt8 => KeyCompare::UInt8,
            KeyType::UInt16 => KeyCompare::UInt16,
            KeyType::UInt32 => KeyCompare::UInt32,
            KeyType::UInt64 => KeyCompare::UInt64,
            KeyType::Real32 => KeyCompare::Real32,
            KeyType::Real64 => KeyCompare::Real64,
            KeyType::Custom => {
                let name = compare_name.ok_or_else(|| {
                    Error::with_detail(ErrorKind::InvalidParameter, "missing comparator name")
                })?;
                match lookup_compare(name) {
                    Some(func) => KeyCompare::Custom(func),
                    None if ignore_missing => KeyCompare::Unresolved,
                    None => {
                        return Err(Error::with_detail(
                            ErrorKind::NotReady,
                            format!("comparator {name:?} is not registered"),
                        ))
                    }
                }
            }
        })
    }

    /// Compare two encoded keys.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        Ok(match self {
            KeyCompare::Memcmp => a.cmp(b),
            KeyCompare::UInt8 => a[0].cmp(&b[0]),
            KeyCompare::UInt16 => le_u16(a).cmp(&le_u16(b)),
            KeyCompare::UInt32 => le_u32(a).cmp(&le_u32(b)),
            KeyCompare::UInt64 => le_u64(a).cmp(&le_u64(b)),
            KeyCompare::Real32 => f32::from_le_bytes([a[0], a[1], a[2], a[3]])
                .total_cmp(&f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            KeyCompare::Real64 => {
                let mut fa = [0u8; 8];
                let mut fb = [0u8; 8];
                fa.copy_from_slice(&a[..8]);
                fb.copy_from_slice(&b[..8]);
                f64::from_le_bytes(fa).total_cmp(&f64::from_le_bytes(fb))
            }
            KeyCompare::Custom(func) => func(a, b),
            KeyCompare::Unresolved => {
                return Err(Error::with_detail(
                    ErrorKind::NotReady,
                    "database was opened without its comparator",
                ))
            }
        })
    }
}

fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[..8]);
    u64::from_le_bytes(buf)
}
