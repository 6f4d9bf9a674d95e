//! burrowdb - embedded ordered key/value storage engine
//!
//! An [`Environment`] binds one backing file (or in-memory arena) and hosts
//! multiple named [`Database`]s, each an ordered key/value map backed by a
//! disk-resident B+tree. ACID transactions layer over the tree with a
//! write-ahead journal for crash recovery; pages can optionally be
//! CRC32-verified and AES-128-CBC encrypted, and record/journal payloads can
//! be compressed.
//!
//! ```no_run
//! use burrowdb::{Environment, EnvConfig, DbConfig, InsertFlags};
//!
//! let env = Environment::create("data.db".as_ref(), EnvConfig::default())?;
//! let db = env.create_db(1, DbConfig::default())?;
//! db.insert(None, b"hello", b"world", InsertFlags::empty())?;
//! assert_eq!(db.find(None, b"hello")?, b"world");
//! # Ok::<(), burrowdb::Error>(())
//! ```

pub mod blob;
pub mod btree;
pub mod compare;
pub mod compress;
pub mod config;
pub mod db;
pub mod env;
pub mod error;
pub mod journal;
pub mod os;
pub mod storage;
pub mod txn;
pub mod types;

// The public surface.
pub use btree::{extended_key_threshold, set_extended_key_threshold};
pub use compare::{lookup_compare, register_compare, CompareFn};
pub use compress::Codec;
pub use config::{DbConfig, EnvConfig};
pub use db::{Cursor, Database, Transaction};
pub use env::{DbParameters, EnvParameters, Environment};
pub use error::{Error, ErrorKind, Result};
pub use types::{
    CursorMove, DbFlags, DbName, EnvFlags, EraseFlags, Fadvise, FindFlags, InsertFlags, KeyType,
    MoveFlags, RecordType, TxnFlags, KEY_SIZE_UNLIMITED, RECORD_SIZE_UNLIMITED,
};
