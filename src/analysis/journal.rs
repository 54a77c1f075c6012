//! SQLite-backed flow journal
//!
//! One row per observed five-tuple, annotated over time with the hostname
//! and the most specific protocol chain seen. The schema is versioned via
//! `pragma user_version` and migrations are forward-only; an unknown version
//! is fatal at startup.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection};

use crate::common::Five;
use crate::error::{Error, Result};

pub struct Journal {
    connection: Connection,
    rows: HashMap<Five, i64>,
    chains: HashMap<Five, String>,
}

impl Journal {
    /// Open (or create) the journal database, applying pragmas and schema
    /// migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let connection = Connection::open(path)?;

        let application_id: i32 =
            connection.query_row("pragma application_id", [], |row| row.get(0))?;
        if application_id != 0 {
            return Err(Error::Config(format!(
                "journal has foreign application_id {}",
                application_id
            )));
        }

        // journal_mode and secure_delete report their new value as a row.
        connection.query_row("pragma journal_mode = wal", [], |_| Ok(()))?;
        connection.query_row("pragma secure_delete = on", [], |_| Ok(()))?;
        connection.execute_batch("pragma synchronous = full")?;

        connection.execute_batch("begin")?;
        let version: i32 = connection.query_row("pragma user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                connection.execute_batch(
                    r#"
                    create table "flow" (
                        "id" integer primary key autoincrement,
                        "start" real,
                        "layer4" integer,
                        "src_addr" integer,
                        "src_port" integer,
                        "dst_addr" integer,
                        "dst_port" integer,
                        "protocol" string,
                        "hostname" text
                    )
                    "#,
                )?;
            }
            1 => {}
            unknown => {
                connection.execute_batch("rollback")?;
                return Err(Error::Config(format!(
                    "journal schema version {} is newer than this build",
                    unknown
                )));
            }
        }
        connection.execute_batch("pragma user_version = 1")?;
        connection.execute_batch("commit")?;

        Ok(Self {
            connection,
            rows: HashMap::new(),
            chains: HashMap::new(),
        })
    }

    /// Journal a newly observed flow. Idempotent: a five-tuple already seen
    /// in this session is left untouched. Returns whether a row was
    /// inserted.
    pub fn add_flow(&mut self, five: Five) -> Result<bool> {
        if self.rows.contains_key(&five) {
            return Ok(false);
        }
        self.connection.execute(
            r#"
            insert into "flow" (
                "start", "layer4", "src_addr", "src_port", "dst_addr", "dst_port"
            ) values (
                julianday('now'), ?1, ?2, ?3, ?4, ?5
            )
            "#,
            params![
                five.protocol.number(),
                five.source().host_u32(),
                five.source().port,
                five.target().host_u32(),
                five.target().port,
            ],
        )?;
        self.rows.insert(five, self.connection.last_insert_rowid());
        Ok(true)
    }

    /// Record the hostname behind a journaled flow.
    ///
    /// A hostname for a flow that was never journaled means the analyzer's
    /// bookkeeping broke; that is a fatal invariant violation, not an I/O
    /// error.
    pub fn got_hostname(&mut self, five: Five, hostname: &str) -> Result<()> {
        let row = match self.rows.get(&five) {
            Some(row) => *row,
            None => panic!("hostname {} for unjournaled flow {}", hostname, five),
        };
        self.connection.execute(
            r#"update "flow" set "hostname" = ?1 where "id" = ?2"#,
            params![hostname, row],
        )?;
        Ok(())
    }

    /// Record the protocol classification of a journaled flow. A chain less
    /// specific than one already recorded (fewer `:` separators) is ignored,
    /// so the stored protocol only ever gets more precise.
    pub fn got_protocol(&mut self, five: Five, protocol: &str, chain: &str) -> Result<()> {
        let row = match self.rows.get(&five) {
            Some(row) => *row,
            None => panic!("protocol {} for unjournaled flow {}", protocol, five),
        };
        if let Some(recorded) = self.chains.get(&five) {
            let specificity = chain.matches(':').count();
            let current = recorded.matches(':').count();
            if specificity < current {
                return Ok(());
            }
        }
        self.chains.insert(five, chain.to_string());
        self.connection.execute(
            r#"update "flow" set "protocol" = ?1 where "id" = ?2"#,
            params![protocol, row],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn row(&self, five: &Five) -> Option<(Option<String>, Option<String>)> {
        let id = self.rows.get(five)?;
        self.connection
            .query_row(
                r#"select "protocol", "hostname" from "flow" where "id" = ?1"#,
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Layer4, Socket};
    use std::net::Ipv4Addr;

    fn five(port: u16) -> Five {
        Five::new(
            Layer4::Tcp,
            Socket::new(Ipv4Addr::new(10, 0, 0, 1), port),
            Socket::new(Ipv4Addr::new(93, 184, 216, 34), 443),
        )
    }

    fn open_temporary() -> (tempfile::TempDir, Journal) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path().join("analysis.db")).unwrap();
        (dir, journal)
    }

    #[test]
    fn test_migration_and_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analysis.db");
        drop(Journal::open(&path).unwrap());

        let connection = Connection::open(&path).unwrap();
        let version: i32 = connection
            .query_row("pragma user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
        let mode: String = connection
            .query_row("pragma journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        // Reopening an already-migrated database succeeds.
        drop(connection);
        Journal::open(&path).unwrap();
    }

    #[test]
    fn test_unknown_schema_version_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analysis.db");
        {
            let connection = Connection::open(&path).unwrap();
            connection.execute_batch("pragma user_version = 7").unwrap();
        }
        assert!(Journal::open(&path).is_err());
    }

    #[test]
    fn test_add_flow_idempotent() {
        let (_dir, mut journal) = open_temporary();
        assert!(journal.add_flow(five(1000)).unwrap());
        assert!(!journal.add_flow(five(1000)).unwrap());
        assert!(journal.add_flow(five(1001)).unwrap());

        let count: i64 = journal
            .connection
            .query_row(r#"select count(*) from "flow""#, [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_hostname_update() {
        let (_dir, mut journal) = open_temporary();
        journal.add_flow(five(1000)).unwrap();
        journal.got_hostname(five(1000), "example.com").unwrap();
        let (_, hostname) = journal.row(&five(1000)).unwrap();
        assert_eq!(hostname.as_deref(), Some("example.com"));
    }

    #[test]
    #[should_panic(expected = "unjournaled flow")]
    fn test_hostname_for_unknown_flow_is_fatal() {
        let (_dir, mut journal) = open_temporary();
        let _ = journal.got_hostname(five(1000), "example.com");
    }

    #[test]
    #[should_panic(expected = "unjournaled flow")]
    fn test_protocol_for_unknown_flow_is_fatal() {
        let (_dir, mut journal) = open_temporary();
        let _ = journal.got_protocol(five(1000), "http", "tcp:http");
    }

    #[test]
    fn test_protocol_specificity_monotone() {
        let (_dir, mut journal) = open_temporary();
        journal.add_flow(five(1000)).unwrap();

        journal.got_protocol(five(1000), "http", "tcp:http").unwrap();
        let (protocol, _) = journal.row(&five(1000)).unwrap();
        assert_eq!(protocol.as_deref(), Some("http"));

        // A less specific chain does not downgrade the row.
        journal.got_protocol(five(1000), "tls", "tcp").unwrap();
        let (protocol, _) = journal.row(&five(1000)).unwrap();
        assert_eq!(protocol.as_deref(), Some("http"));

        // An equally or more specific chain replaces it.
        journal
            .got_protocol(five(1000), "http2", "tcp:tls:http2")
            .unwrap();
        let (protocol, _) = journal.row(&five(1000)).unwrap();
        assert_eq!(protocol.as_deref(), Some("http2"));
    }
}
