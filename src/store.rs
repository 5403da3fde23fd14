//! Durable command storage using RocksDB
//!
//! # Column Families
//!
//! - `commands` - Payment command records (key: command_id)
//! - `responses` - Verbatim response bytes for idempotent replay (key: request_id)
//! - `refs` - reference_id -> command_id index for settlement idempotency
//!
//! The store is the single source of truth and the only shared mutable
//! resource. Concurrency control is per-command: writes go through a
//! compare-and-set on a version counter, and a stale writer gets
//! `Conflict` and must re-fetch and reapply its merge.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::types::PaymentCommand;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const CF_COMMANDS: &str = "commands";
const CF_RESPONSES: &str = "responses";
const CF_REFS: &str = "refs";

/// Store-level bookkeeping for a command, distinct from the derived
/// protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Negotiation or settlement still in progress
    InFlight,

    /// Retry budget exhausted; requires external intervention, not terminal
    Stalled,

    /// READY and submitted (or awaiting the counterparty's submission),
    /// confirmation not yet observed
    PendingConfirmation,

    /// Terminal, settled or aborted; read-only from here on
    Archived,

    /// Terminal, funding transaction executed with an error
    Failed,
}

impl Disposition {
    /// Archived and Failed never revert
    pub fn is_final(&self) -> bool {
        matches!(self, Disposition::Archived | Disposition::Failed)
    }
}

/// Versioned command record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    /// The negotiated view
    pub command: PaymentCommand,

    /// Version counter for compare-and-set
    pub version: u64,

    /// Store bookkeeping
    pub disposition: Disposition,

    /// Last write time
    pub updated_at: DateTime<Utc>,
}

/// RocksDB-backed command store
pub struct CommandStore {
    db: Arc<DB>,
    // Serializes read-modify-write cycles per command id
    write_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl CommandStore {
    /// Open or create the database
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_COMMANDS, Options::default()),
            ColumnFamilyDescriptor::new(CF_RESPONSES, Options::default()),
            ColumnFamilyDescriptor::new(CF_REFS, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = %path.display(), "Opened command store");

        Ok(Self {
            db: Arc::new(db),
            write_locks: DashMap::new(),
        })
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {name} not found")))
    }

    fn command_lock(&self, command_id: Uuid) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(command_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Get a command record by id
    pub fn get_command(&self, command_id: Uuid) -> Result<Option<CommandRecord>> {
        let cf = self.cf_handle(CF_COMMANDS)?;
        let value = self.db.get_cf(cf, command_id.as_bytes())?;
        match value {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get a command record or fail with `CommandNotFound`
    pub fn must_get_command(&self, command_id: Uuid) -> Result<CommandRecord> {
        self.get_command(command_id)?
            .ok_or(Error::CommandNotFound(command_id))
    }

    /// Compare-and-set write of a command view.
    ///
    /// `expected_version` is `None` for the initial insert. A stale writer
    /// gets `Conflict` and must re-fetch and reapply its merge. Returns
    /// the new version.
    pub fn compare_and_put(
        &self,
        command: &PaymentCommand,
        expected_version: Option<u64>,
        disposition: Disposition,
    ) -> Result<u64> {
        self.commit(command, expected_version, disposition, None)
    }

    /// Compare-and-set write of a command view together with the response
    /// recorded under `request_id`, in one atomic batch.
    pub fn commit(
        &self,
        command: &PaymentCommand,
        expected_version: Option<u64>,
        disposition: Disposition,
        response: Option<(Uuid, &[u8])>,
    ) -> Result<u64> {
        let lock = self.command_lock(command.command_id);
        let _guard = lock.lock();

        let current = self.get_command(command.command_id)?;
        let new_version = match (&current, expected_version) {
            (None, None) => 1,
            (Some(record), Some(expected)) if record.version == expected => {
                if record.disposition.is_final() && record.disposition != disposition {
                    return Err(Error::InvalidTransition(format!(
                        "command {} disposition {:?} is final",
                        command.command_id, record.disposition
                    )));
                }
                expected + 1
            }
            _ => return Err(Error::Conflict(command.command_id)),
        };

        let record = CommandRecord {
            command: command.clone(),
            version: new_version,
            disposition,
            updated_at: Utc::now(),
        };

        let mut batch = WriteBatch::default();

        let cf_commands = self.cf_handle(CF_COMMANDS)?;
        batch.put_cf(
            cf_commands,
            command.command_id.as_bytes(),
            serde_json::to_vec(&record)?,
        );

        // First insert also writes the settlement idempotency index. A
        // reference id can only ever belong to one command.
        if current.is_none() {
            let cf_refs = self.cf_handle(CF_REFS)?;
            match self.db.get_cf(cf_refs, command.reference_id.as_bytes())? {
                Some(bound) if bound != command.command_id.as_bytes() => {
                    return Err(Error::InvalidTransition(format!(
                        "reference_id {} is already bound to another command",
                        command.reference_id
                    )));
                }
                Some(_) => {}
                None => {
                    batch.put_cf(
                        cf_refs,
                        command.reference_id.as_bytes(),
                        command.command_id.as_bytes(),
                    );
                }
            }
        }

        if let Some((request_id, bytes)) = response {
            let cf_responses = self.cf_handle(CF_RESPONSES)?;
            batch.put_cf(cf_responses, request_id.as_bytes(), bytes);
        }

        self.db.write(batch)?;

        tracing::debug!(
            command_id = %command.command_id,
            version = new_version,
            disposition = ?disposition,
            "Command record written"
        );

        Ok(new_version)
    }

    /// Update only the disposition, preserving the stored view.
    /// Final dispositions never revert.
    pub fn set_disposition(&self, command_id: Uuid, disposition: Disposition) -> Result<u64> {
        let lock = self.command_lock(command_id);
        let _guard = lock.lock();

        let record = self.must_get_command(command_id)?;
        if record.disposition == disposition {
            return Ok(record.version);
        }
        if record.disposition.is_final() {
            return Err(Error::InvalidTransition(format!(
                "command {command_id} disposition {:?} is final",
                record.disposition
            )));
        }

        let updated = CommandRecord {
            version: record.version + 1,
            disposition,
            updated_at: Utc::now(),
            ..record
        };

        let cf = self.cf_handle(CF_COMMANDS)?;
        self.db
            .put_cf(cf, command_id.as_bytes(), serde_json::to_vec(&updated)?)?;

        tracing::info!(
            command_id = %command_id,
            disposition = ?disposition,
            "Command disposition updated"
        );

        Ok(updated.version)
    }

    /// Record the response for a request id. First write wins: the mapping
    /// is permanent and replays return the original bytes verbatim.
    pub fn record_response(&self, request_id: Uuid, bytes: &[u8]) -> Result<()> {
        let cf = self.cf_handle(CF_RESPONSES)?;
        if self.db.get_cf(cf, request_id.as_bytes())?.is_some() {
            return Ok(());
        }
        self.db.put_cf(cf, request_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Fetch the recorded response for a request id, if any
    pub fn get_response(&self, request_id: Uuid) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(CF_RESPONSES)?;
        Ok(self.db.get_cf(cf, request_id.as_bytes())?)
    }

    /// Look up a command by its settlement reference id
    pub fn get_command_by_reference(&self, reference_id: &str) -> Result<Option<CommandRecord>> {
        let cf = self.cf_handle(CF_REFS)?;
        let value = self.db.get_cf(cf, reference_id.as_bytes())?;
        match value {
            Some(bytes) => {
                let id_bytes: [u8; 16] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("corrupt reference index entry".to_string()))?;
                self.get_command(Uuid::from_bytes(id_bytes))
            }
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for CommandStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStore").finish_non_exhaustive()
    }
}
