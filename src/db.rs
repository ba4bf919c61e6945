// Copyright 2025 Fernando Borretti
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! SQLite-backed run store. Run records are stored as JSON next to the
//! columns the conditional update and the listing need.

use std::path::Path;
use std::sync::Mutex;
use std::sync::MutexGuard;

use cardsmith_core::error::PipelineError;
use cardsmith_core::store::RunStore;
use cardsmith_core::types::run::PipelineRun;
use cardsmith_core::types::run::RunId;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use crate::error::ErrorReport;
use crate::error::Fallible;

const SCHEMA: &str = "
create table if not exists runs (
    run_id text primary key,
    version integer not null,
    created_at text not null,
    record text not null
);

create table if not exists outputs (
    run_id text not null,
    key text not null,
    blob text not null,
    primary key (run_id, key)
);
";

pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

fn store_error(e: rusqlite::Error) -> PipelineError {
    PipelineError::Store(format!("SQLite error: {e}"))
}

impl SqliteRunStore {
    pub fn open(path: &Path) -> Fallible<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ErrorReport::new(format!("failed to open {}: {e}", path.display())))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| ErrorReport::new(format!("failed to create schema: {e}")))?;
        log::debug!("Opened run store at {}.", path.display());
        Ok(SqliteRunStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PipelineError> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Store("database lock poisoned".to_string()))
    }
}

fn decode(record: String) -> Result<PipelineRun, PipelineError> {
    Ok(serde_json::from_str(&record)?)
}

/// The conditional update: the row changes only if its version is still
/// `expected_version`.
fn replace_run(conn: &Connection, run: &PipelineRun, expected_version: u64) -> Result<u64, PipelineError> {
    let version = expected_version + 1;
    let record = serde_json::to_string(&PipelineRun {
        version,
        ..run.clone()
    })?;
    let changed = conn
        .execute(
            "update runs set version = ?1, record = ?2 where run_id = ?3 and version = ?4",
            params![
                version as i64,
                record,
                run.run_id.as_str(),
                expected_version as i64
            ],
        )
        .map_err(store_error)?;
    if changed == 1 {
        return Ok(version);
    }
    let found: Option<i64> = conn
        .query_row(
            "select version from runs where run_id = ?1",
            params![run.run_id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(store_error)?;
    match found {
        Some(found) => Err(PipelineError::VersionConflict {
            run_id: run.run_id.clone(),
            expected: expected_version,
            found: found as u64,
        }),
        None => Err(PipelineError::RunNotFound(run.run_id.clone())),
    }
}

fn upsert_output(conn: &Connection, run_id: &RunId, key: &str, blob: &str) -> Result<(), PipelineError> {
    conn.execute(
        "insert into outputs (run_id, key, blob) values (?1, ?2, ?3)
         on conflict (run_id, key) do update set blob = excluded.blob",
        params![run_id.as_str(), key, blob],
    )
    .map_err(store_error)?;
    Ok(())
}

impl RunStore for SqliteRunStore {
    fn create_run(&self, run: &PipelineRun) -> Result<(), PipelineError> {
        let record = serde_json::to_string(run)?;
        let conn = self.conn()?;
        let exists: Option<i64> = conn
            .query_row(
                "select 1 from runs where run_id = ?1",
                params![run.run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_error)?;
        if exists.is_some() {
            return Err(PipelineError::Store(format!("run {} already exists", run.run_id)));
        }
        conn.execute(
            "insert into runs (run_id, version, created_at, record) values (?1, ?2, ?3, ?4)",
            params![
                run.run_id.as_str(),
                run.version as i64,
                run.created_at.to_string(),
                record
            ],
        )
        .map_err(store_error)?;
        Ok(())
    }

    fn load_run(&self, run_id: &RunId) -> Result<PipelineRun, PipelineError> {
        let record: Option<String> = self
            .conn()?
            .query_row(
                "select record from runs where run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_error)?;
        match record {
            Some(record) => decode(record),
            None => Err(PipelineError::RunNotFound(run_id.clone())),
        }
    }

    fn update_run(&self, run: &PipelineRun, expected_version: u64) -> Result<u64, PipelineError> {
        replace_run(&*self.conn()?, run, expected_version)
    }

    fn commit_output(
        &self,
        run: &PipelineRun,
        expected_version: u64,
        key: &str,
        blob: &str,
    ) -> Result<u64, PipelineError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(store_error)?;
        let version = replace_run(&tx, run, expected_version)?;
        upsert_output(&tx, &run.run_id, key, blob)?;
        tx.commit().map_err(store_error)?;
        Ok(version)
    }

    fn delete_run(&self, run_id: &RunId) -> Result<(), PipelineError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(store_error)?;
        tx.execute("delete from outputs where run_id = ?1", params![run_id.as_str()])
            .map_err(store_error)?;
        let deleted = tx
            .execute("delete from runs where run_id = ?1", params![run_id.as_str()])
            .map_err(store_error)?;
        if deleted == 0 {
            return Err(PipelineError::RunNotFound(run_id.clone()));
        }
        tx.commit().map_err(store_error)?;
        log::debug!("Deleted run {run_id} from the store.");
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<PipelineRun>, PipelineError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("select record from runs order by created_at, run_id")
            .map_err(store_error)?;
        let records = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(store_error)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(store_error)?;
        records.into_iter().map(decode).collect()
    }

    fn put_output(&self, run_id: &RunId, key: &str, blob: &str) -> Result<(), PipelineError> {
        upsert_output(&*self.conn()?, run_id, key, blob)
    }

    fn get_output(&self, run_id: &RunId, key: &str) -> Result<Option<String>, PipelineError> {
        self.conn()?
            .query_row(
                "select blob from outputs where run_id = ?1 and key = ?2",
                params![run_id.as_str(), key],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_error)
    }
}
