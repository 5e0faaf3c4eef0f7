//! Transfer history stored in SQLite

use rusqlite::{params, Connection, Result};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use torshare_core::FileMetadata;

/// Which side of the transfer we were on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Direction::Sent),
            "received" => Some(Direction::Received),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    /// Unix timestamp in seconds
    pub timestamp: i64,
    pub direction: Direction,
    pub filename: String,
    pub filesize: u64,
    pub checksum: String,
    pub encrypted: bool,
    /// Remote address for sends, local path for receipts
    pub peer: String,
}

impl TransferRecord {
    /// Record for `metadata`, stamped with the current time
    pub fn now(direction: Direction, metadata: &FileMetadata, peer: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self {
            timestamp,
            direction,
            filename: metadata.filename().to_string(),
            filesize: metadata.filesize(),
            checksum: metadata.checksum().to_string(),
            encrypted: metadata.encrypted(),
            peer: peer.into(),
        }
    }
}

/// Log of completed transfers
pub struct TransferHistory {
    conn: Connection,
}

impl TransferHistory {
    /// Open or create the history database
    pub fn open(path: &std::path::Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                direction TEXT NOT NULL,
                filename TEXT NOT NULL,
                filesize INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                encrypted INTEGER NOT NULL,
                peer TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS transfers_timestamp ON transfers(timestamp);
            "#,
        )?;

        Ok(Self { conn })
    }

    /// Append a transfer
    pub fn record(&self, record: &TransferRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO transfers
            (timestamp, direction, filename, filesize, checksum, encrypted, peer)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.timestamp,
                record.direction.as_str(),
                record.filename,
                record.filesize as i64,
                record.checksum,
                record.encrypted,
                record.peer,
            ],
        )?;
        Ok(())
    }

    /// Most recent transfers first
    pub fn list(&self, limit: u32) -> Result<Vec<TransferRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, direction, filename, filesize, checksum, encrypted, peer
            FROM transfers
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )?;

        let records = stmt
            .query_map(params![limit], |row| {
                let direction: String = row.get(1)?;
                let direction = Direction::parse(&direction).ok_or_else(|| {
                    rusqlite::Error::InvalidColumnType(
                        1,
                        "direction".to_string(),
                        rusqlite::types::Type::Text,
                    )
                })?;

                Ok(TransferRecord {
                    timestamp: row.get(0)?,
                    direction,
                    filename: row.get(2)?,
                    filesize: row.get::<_, i64>(3)? as u64,
                    checksum: row.get(4)?,
                    encrypted: row.get(5)?,
                    peer: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;

        Ok(records)
    }

    /// Number of recorded transfers
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM transfers", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
