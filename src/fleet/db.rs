use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use super::models::*;
use crate::errors::TemplateExists;

/// Async-safe handle to the fleet database.
///
/// Wraps `FleetDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so SQLite I/O never ties up the
/// async workers that drive sockets and plugins.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FleetDb>>,
}

impl DbHandle {
    pub fn new(db: FleetDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FleetDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct FleetDb {
    conn: Connection,
}

const PLAN_COLUMNS: &str =
    "id, template_id, device_id, is_done, last_error, created_at, completed_at";

const TEMPLATE_COLUMNS: &str =
    "id, name, target_device_ids, instruction, created_at, updated_at";

impl FleetDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS update_templates (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    target_device_ids TEXT NOT NULL DEFAULT '[]',
                    instruction TEXT NOT NULL DEFAULT 'null',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS execution_plans (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    template_id TEXT NOT NULL,
                    device_id TEXT NOT NULL,
                    is_done INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS devices (
                    device_id TEXT PRIMARY KEY,
                    last_seen TEXT NOT NULL,
                    data TEXT NOT NULL DEFAULT 'null'
                );

                CREATE INDEX IF NOT EXISTS idx_plans_template ON execution_plans(template_id);
                CREATE INDEX IF NOT EXISTS idx_plans_template_device
                    ON execution_plans(template_id, device_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Update templates ──────────────────────────────────────────────

    pub fn create_template(&self, new: &NewTemplate) -> Result<UpdateTemplate> {
        let id = new
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let targets = serde_json::to_string(&new.target_device_ids)
            .context("Failed to serialize target device ids")?;
        let instruction =
            serde_json::to_string(&new.instruction).context("Failed to serialize instruction")?;
        let inserted = self.conn.execute(
            "INSERT INTO update_templates (id, name, target_device_ids, instruction) VALUES (?1, ?2, ?3, ?4)",
            params![id, new.name, targets, instruction],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                return Err(TemplateExists { id }.into());
            }
            Err(err) => return Err(err).context("Failed to insert update template"),
        }
        self.get_template(&id)?
            .context("Update template not found after insert")
    }

    pub fn get_template(&self, id: &str) -> Result<Option<UpdateTemplate>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM update_templates WHERE id = ?1", TEMPLATE_COLUMNS),
                params![id],
                |row| {
                    Ok(TemplateRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        target_device_ids: row.get(2)?,
                        instruction: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("Failed to query update template")?;
        row.map(TemplateRow::into_template).transpose()
    }

    /// Replace the stored target list of a template.
    pub fn set_template_targets(&self, id: &str, targets: &[String]) -> Result<UpdateTemplate> {
        let encoded =
            serde_json::to_string(targets).context("Failed to serialize target device ids")?;
        self.conn
            .execute(
                "UPDATE update_templates SET target_device_ids = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![encoded, id],
            )
            .context("Failed to update template targets")?;
        self.get_template(id)?
            .with_context(|| format!("Update template {} not found", id))
    }

    // ── Execution plans ───────────────────────────────────────────────

    pub fn create_plan(&self, template_id: &str, device_id: &str) -> Result<ExecutionPlan> {
        self.conn
            .execute(
                "INSERT INTO execution_plans (template_id, device_id) VALUES (?1, ?2)",
                params![template_id, device_id],
            )
            .context("Failed to insert execution plan")?;
        let id = self.conn.last_insert_rowid();
        self.get_plan(id)?
            .context("Execution plan not found after insert")
    }

    pub fn get_plan(&self, id: i64) -> Result<Option<ExecutionPlan>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM execution_plans WHERE id = ?1", PLAN_COLUMNS),
                params![id],
                plan_from_row,
            )
            .optional()
            .context("Failed to query execution plan")
    }

    /// The most recently created plan for a template/device pair.
    pub fn latest_plan(&self, template_id: &str, device_id: &str) -> Result<Option<ExecutionPlan>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM execution_plans WHERE template_id = ?1 AND device_id = ?2 ORDER BY id DESC LIMIT 1",
                    PLAN_COLUMNS
                ),
                params![template_id, device_id],
                plan_from_row,
            )
            .optional()
            .context("Failed to query latest execution plan")
    }

    /// Flip a plan to done. Returns `false` when it was already done (or does
    /// not exist); the flag never goes back to false.
    pub fn mark_plan_done(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE execution_plans SET is_done = 1, completed_at = datetime('now') WHERE id = ?1 AND is_done = 0",
                params![id],
            )
            .context("Failed to mark execution plan done")?;
        Ok(changed == 1)
    }

    pub fn record_plan_error(&self, id: i64, error: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE execution_plans SET last_error = ?1 WHERE id = ?2 AND is_done = 0",
                params![error, id],
            )
            .context("Failed to record execution plan error")?;
        Ok(())
    }

    pub fn list_plans(&self, template_id: &str) -> Result<Vec<ExecutionPlan>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM execution_plans WHERE template_id = ?1 ORDER BY id",
                PLAN_COLUMNS
            ))
            .context("Failed to prepare list_plans")?;
        let rows = stmt
            .query_map(params![template_id], plan_from_row)
            .context("Failed to query execution plans")?;
        let mut plans = Vec::new();
        for row in rows {
            plans.push(row.context("Failed to read execution plan row")?);
        }
        Ok(plans)
    }

    // ── Devices ───────────────────────────────────────────────────────

    pub fn upsert_device(&self, record: &DeviceRecord) -> Result<()> {
        let data = serde_json::to_string(&record.data).context("Failed to serialize device data")?;
        self.conn
            .execute(
                "INSERT INTO devices (device_id, last_seen, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT(device_id) DO UPDATE SET last_seen = excluded.last_seen, data = excluded.data",
                params![record.device_id, record.last_seen, data],
            )
            .context("Failed to upsert device")?;
        Ok(())
    }

    /// All stored devices ordered by device id.
    pub fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT device_id, last_seen, data FROM devices ORDER BY device_id")
            .context("Failed to prepare list_devices")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("Failed to query devices")?;
        let mut devices = Vec::new();
        for row in rows {
            let (device_id, last_seen, data) = row.context("Failed to read device row")?;
            devices.push(DeviceRecord {
                device_id,
                last_seen,
                data: serde_json::from_str(&data).context("Corrupt device data")?,
            });
        }
        Ok(devices)
    }
}

// ── Row helpers ───────────────────────────────────────────────────────

struct TemplateRow {
    id: String,
    name: String,
    target_device_ids: String,
    instruction: String,
    created_at: String,
    updated_at: String,
}

impl TemplateRow {
    fn into_template(self) -> Result<UpdateTemplate> {
        Ok(UpdateTemplate {
            target_device_ids: serde_json::from_str(&self.target_device_ids)
                .with_context(|| format!("Corrupt target list on template {}", self.id))?,
            instruction: serde_json::from_str(&self.instruction)
                .with_context(|| format!("Corrupt instruction on template {}", self.id))?,
            id: self.id,
            name: self.name,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn plan_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionPlan> {
    Ok(ExecutionPlan {
        id: row.get(0)?,
        template_id: row.get(1)?,
        device_id: row.get(2)?,
        is_done: row.get::<_, i64>(3)? != 0,
        last_error: row.get(4)?,
        created_at: row.get(5)?,
        completed_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(db: &FleetDb, id: &str, targets: &[&str]) -> UpdateTemplate {
        db.create_template(&NewTemplate {
            id: Some(id.to_string()),
            name: format!("template {}", id),
            target_device_ids: targets.iter().map(|t| t.to_string()).collect(),
            instruction: serde_json::json!({"imageStacks": [{"image": "nginx", "tag": "1.25"}]}),
        })
        .unwrap()
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let count: i64 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('update_templates', 'execution_plans', 'devices')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 3);
        Ok(())
    }

    #[test]
    fn test_create_and_get_template() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let created = template(&db, "t1", &["d1", "d2"]);
        assert_eq!(created.id, "t1");
        assert_eq!(created.target_device_ids, vec!["d1", "d2"]);
        assert_eq!(created.instruction["imageStacks"][0]["image"], "nginx");

        let fetched = db.get_template("t1")?.unwrap();
        assert_eq!(fetched, created);
        assert!(db.get_template("missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_template_without_id_gets_generated_one() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let created = db.create_template(&NewTemplate {
            name: "anon".to_string(),
            ..Default::default()
        })?;
        assert!(!created.id.is_empty());
        assert!(created.target_device_ids.is_empty());
        Ok(())
    }

    #[test]
    fn test_duplicate_template_id_is_typed_conflict() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        template(&db, "t1", &["d1"]);
        let err = db
            .create_template(&NewTemplate {
                id: Some("t1".to_string()),
                name: "again".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.downcast_ref::<TemplateExists>().unwrap().id, "t1");
        assert_eq!(db.get_template("t1")?.unwrap().name, "template t1");
        Ok(())
    }

    #[test]
    fn test_set_template_targets_replaces_list() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        template(&db, "t1", &["d1", "d2"]);
        let updated = db.set_template_targets("t1", &["dX".to_string(), "dY".to_string()])?;
        assert_eq!(updated.target_device_ids, vec!["dX", "dY"]);
        assert!(db.set_template_targets("missing", &[]).is_err());
        Ok(())
    }

    #[test]
    fn test_create_plan_starts_pending() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let plan = db.create_plan("t1", "d1")?;
        assert_eq!(plan.template_id, "t1");
        assert_eq!(plan.device_id, "d1");
        assert!(!plan.is_done);
        assert!(plan.completed_at.is_none());
        Ok(())
    }

    #[test]
    fn test_mark_plan_done_is_idempotent() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let plan = db.create_plan("t1", "d1")?;
        assert!(db.mark_plan_done(plan.id)?);
        assert!(!db.mark_plan_done(plan.id)?);

        let plans = db.list_plans("t1")?;
        assert_eq!(plans.len(), 1);
        assert!(plans[0].is_done);
        assert!(plans[0].completed_at.is_some());
        Ok(())
    }

    #[test]
    fn test_record_error_leaves_plan_pending() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let plan = db.create_plan("t1", "d1")?;
        db.record_plan_error(plan.id, "pull failed")?;
        let stored = db.get_plan(plan.id)?.unwrap();
        assert!(!stored.is_done);
        assert_eq!(stored.last_error.as_deref(), Some("pull failed"));
        Ok(())
    }

    #[test]
    fn test_latest_plan_picks_newest_for_pair() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        let first = db.create_plan("t1", "d1")?;
        db.create_plan("t1", "d2")?;
        let second = db.create_plan("t1", "d1")?;
        let latest = db.latest_plan("t1", "d1")?.unwrap();
        assert_eq!(latest.id, second.id);
        assert_ne!(latest.id, first.id);
        assert!(db.latest_plan("t2", "d1")?.is_none());
        Ok(())
    }

    #[test]
    fn test_list_plans_ordered_and_scoped() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        db.create_plan("t1", "d2")?;
        db.create_plan("t2", "d1")?;
        db.create_plan("t1", "d1")?;
        let plans = db.list_plans("t1")?;
        let devices: Vec<&str> = plans.iter().map(|p| p.device_id.as_str()).collect();
        assert_eq!(devices, vec!["d2", "d1"]);
        Ok(())
    }

    #[test]
    fn test_upsert_device_replaces_data() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        db.upsert_device(&DeviceRecord {
            device_id: "b".to_string(),
            last_seen: "2024-01-01T00:00:00Z".to_string(),
            data: serde_json::json!({"cpu": 10}),
        })?;
        db.upsert_device(&DeviceRecord {
            device_id: "a".to_string(),
            last_seen: "2024-01-01T00:00:00Z".to_string(),
            data: serde_json::json!({"cpu": 20}),
        })?;
        db.upsert_device(&DeviceRecord {
            device_id: "b".to_string(),
            last_seen: "2024-01-02T00:00:00Z".to_string(),
            data: serde_json::json!({"cpu": 99}),
        })?;

        let devices = db.list_devices()?;
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_id, "a");
        assert_eq!(devices[1].device_id, "b");
        assert_eq!(devices[1].data["cpu"], 99);
        assert_eq!(devices[1].last_seen, "2024-01-02T00:00:00Z");
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call_runs_on_blocking_pool() -> Result<()> {
        let handle = DbHandle::new(FleetDb::new_in_memory()?);
        let plan = handle.call(|db| db.create_plan("t1", "d1")).await?;
        let plans = handle.call(|db| db.list_plans("t1")).await?;
        assert_eq!(plans, vec![plan]);
        Ok(())
    }
}
