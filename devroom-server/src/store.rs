//! SQLite backing store for project file trees.
//!
//! One row per project: the last saved tree (last write wins) and the
//! commands from the project's most recent directive. Uses WAL mode.

use std::path::Path;

use devroom_sdk::{CommandSpec, FileTree};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};

/// A saved tree and who saved it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTree {
    pub tree: FileTree,
    pub updated_by: String,
    /// Unix milliseconds.
    pub updated_at: i64,
}

/// Build/start commands remembered from the last directive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredCommands {
    pub build: Option<CommandSpec>,
    pub start: Option<CommandSpec>,
}

pub struct TreeStore {
    conn: Connection,
}

impl TreeStore {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let store = Self {
            conn: Connection::open(path)?,
        };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> SqlResult<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS project_trees (
                project_id  TEXT PRIMARY KEY,
                tree_json   TEXT NOT NULL,
                updated_by  TEXT NOT NULL,
                updated_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS project_commands (
                project_id  TEXT PRIMARY KEY,
                build_json  TEXT,
                start_json  TEXT
            );
            ",
        )
    }

    pub fn save_tree(&self, project_id: &str, tree: &FileTree, updated_by: &str) -> SqlResult<()> {
        let json = to_json(tree)?;
        self.conn.execute(
            "INSERT INTO project_trees (project_id, tree_json, updated_by, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(project_id) DO UPDATE SET
                tree_json = excluded.tree_json,
                updated_by = excluded.updated_by,
                updated_at = excluded.updated_at",
            params![project_id, json, updated_by, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn load_tree(&self, project_id: &str) -> SqlResult<Option<StoredTree>> {
        let row = self
            .conn
            .query_row(
                "SELECT tree_json, updated_by, updated_at FROM project_trees WHERE project_id = ?1",
                params![project_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((json, updated_by, updated_at)) => Ok(Some(StoredTree {
                tree: from_json(&json)?,
                updated_by,
                updated_at,
            })),
            None => Ok(None),
        }
    }

    pub fn save_commands(&self, project_id: &str, commands: &StoredCommands) -> SqlResult<()> {
        let build = commands.build.as_ref().map(to_json).transpose()?;
        let start = commands.start.as_ref().map(to_json).transpose()?;
        self.conn.execute(
            "INSERT INTO project_commands (project_id, build_json, start_json)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(project_id) DO UPDATE SET
                build_json = excluded.build_json,
                start_json = excluded.start_json",
            params![project_id, build, start],
        )?;
        Ok(())
    }

    pub fn load_commands(&self, project_id: &str) -> SqlResult<StoredCommands> {
        let row = self
            .conn
            .query_row(
                "SELECT build_json, start_json FROM project_commands WHERE project_id = ?1",
                params![project_id],
                |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;
        let Some((build, start)) = row else {
            return Ok(StoredCommands::default());
        };
        Ok(StoredCommands {
            build: build.as_deref().map(from_json).transpose()?,
            start: start.as_deref().map(from_json).transpose()?,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> SqlResult<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json<T: serde::de::DeserializeOwned>(json: &str) -> SqlResult<T> {
    serde_json::from_str(json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(body: &str) -> FileTree {
        FileTree::new().with_file("index.js", body)
    }

    #[test]
    fn last_write_wins() {
        let store = TreeStore::open_memory().unwrap();
        assert!(store.load_tree("p1").unwrap().is_none());

        store.save_tree("p1", &tree("v1"), "alice").unwrap();
        store.save_tree("p1", &tree("v2"), "bob").unwrap();
        let stored = store.load_tree("p1").unwrap().unwrap();
        assert_eq!(stored.tree, tree("v2"));
        assert_eq!(stored.updated_by, "bob");
    }

    #[test]
    fn commands_round_trip() {
        let store = TreeStore::open_memory().unwrap();
        assert_eq!(store.load_commands("p1").unwrap(), StoredCommands::default());

        let commands = StoredCommands {
            build: Some(CommandSpec::new("npm", ["install"])),
            start: None,
        };
        store.save_commands("p1", &commands).unwrap();
        assert_eq!(store.load_commands("p1").unwrap(), commands);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trees.db");
        {
            let store = TreeStore::open(&path).unwrap();
            store.save_tree("p1", &tree("persisted"), "alice").unwrap();
        }
        let store = TreeStore::open(&path).unwrap();
        assert_eq!(store.load_tree("p1").unwrap().unwrap().tree, tree("persisted"));
    }
}
