use crate::error::{StoreError, StoreResult};
use crate::models::{
    Effect, Identity, MqttAction, NewIdentity, NewReading, NewThresholdRule, PermissionRule,
    QosSet, Reading, ThresholdKey, ThresholdRule, ThresholdUpdate,
};
use crate::store::Store;
use async_trait::async_trait;
use log::{debug, error, info};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde_json::Value;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_SIZE: u32 = 8;

/// SQLite-backed store. Every call checks a connection out of the pool on the
/// blocking thread pool.
pub struct DatabaseService {
    pool: Pool<SqliteConnectionManager>,
}

impl DatabaseService {
    /// Opens (or creates) the database at `db_path`. `:memory:` gives a
    /// single-connection in-memory database.
    pub fn new(db_path: &str) -> StoreResult<Self> {
        let (manager, max_size) = if db_path == ":memory:" {
            (SqliteConnectionManager::memory(), 1)
        } else {
            (SqliteConnectionManager::file(db_path), POOL_SIZE)
        };
        let manager = manager.with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")
        });
        let pool = Pool::builder().max_size(max_size).build(manager)?;
        Ok(Self { pool })
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> StoreResult<()> {
        let conn = self.pool.get()?;

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS identities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mqtt_id TEXT NOT NULL UNIQUE,
            secret_hash TEXT NOT NULL,
            client_id TEXT NOT NULL UNIQUE,
            device_name TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS permission_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            identity_id INTEGER NOT NULL,
            topic_pattern TEXT NOT NULL,
            action TEXT NOT NULL,
            effect TEXT NOT NULL,
            allowed_qos TEXT NOT NULL DEFAULT '0,1,2',
            priority INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (identity_id) REFERENCES identities(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_permission_rules_identity
            ON permission_rules(identity_id);

        CREATE TABLE IF NOT EXISTS threshold_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_client_id TEXT NOT NULL,
            sensor_key TEXT NOT NULL,
            min_value REAL,
            max_value REAL,
            warning_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (owner_client_id, sensor_key)
        );

        CREATE TABLE IF NOT EXISTS readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            identity_id INTEGER NOT NULL,
            recorded_at TEXT NOT NULL,
            received_at TEXT NOT NULL,
            data TEXT NOT NULL,
            FOREIGN KEY (identity_id) REFERENCES identities(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_readings_identity_recorded
            ON readings(identity_id, recorded_at);
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

fn now_rfc3339() -> StoreResult<String> {
    format_time(OffsetDateTime::now_utc())
}

fn format_time(at: OffsetDateTime) -> StoreResult<String> {
    at.format(&Rfc3339)
        .map_err(|e| StoreError::Corrupt(format!("unformattable timestamp: {e}")))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

struct IdentityRow {
    id: i64,
    mqtt_id: String,
    secret_hash: String,
    client_id: String,
    device_name: Option<String>,
}

fn identity_row(row: &Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok(IdentityRow {
        id: row.get(0)?,
        mqtt_id: row.get(1)?,
        secret_hash: row.get(2)?,
        client_id: row.get(3)?,
        device_name: row.get(4)?,
    })
}

fn load_permissions(conn: &Connection, identity_id: i64) -> StoreResult<Vec<PermissionRule>> {
    let mut stmt = conn.prepare(
        "SELECT topic_pattern, action, effect, allowed_qos, priority
         FROM permission_rules WHERE identity_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![identity_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, i32>(4)?,
        ))
    })?;

    let mut rules = Vec::new();
    for row in rows {
        let (topic_pattern, action, effect, qos, priority) = row?;
        rules.push(PermissionRule {
            action: MqttAction::parse(&action)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown action '{action}'")))?,
            effect: Effect::parse(&effect)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown effect '{effect}'")))?,
            allowed_qos: QosSet::from_csv(&qos)
                .ok_or_else(|| StoreError::Corrupt(format!("bad qos set '{qos}'")))?,
            topic_pattern,
            priority,
        });
    }
    Ok(rules)
}

fn find_identity(conn: &Connection, column: &str, value: &str) -> StoreResult<Option<Identity>> {
    let sql = format!(
        "SELECT id, mqtt_id, secret_hash, client_id, device_name FROM identities WHERE {column} = ?1"
    );
    let row = conn
        .query_row(&sql, params![value], identity_row)
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };
    let permissions = load_permissions(conn, row.id)?;
    Ok(Some(Identity {
        id: row.id,
        mqtt_id: row.mqtt_id,
        secret_hash: row.secret_hash,
        client_id: row.client_id,
        device_name: row.device_name,
        permissions,
    }))
}

fn exists(conn: &Connection, column: &str, value: &str) -> StoreResult<bool> {
    let sql = format!("SELECT EXISTS(SELECT 1 FROM identities WHERE {column} = ?1)");
    Ok(conn.query_row(&sql, params![value], |row| row.get(0))?)
}

fn threshold_row(row: &Row<'_>) -> rusqlite::Result<ThresholdRule> {
    Ok(ThresholdRule {
        id: row.get(0)?,
        owner: row.get(1)?,
        sensor_key: row.get(2)?,
        min_value: row.get(3)?,
        max_value: row.get(4)?,
        warning_message: row.get(5)?,
    })
}

const THRESHOLD_COLUMNS: &str =
    "id, owner_client_id, sensor_key, min_value, max_value, warning_message";

fn find_threshold(conn: &Connection, key: &ThresholdKey) -> StoreResult<Option<ThresholdRule>> {
    let sql = format!(
        "SELECT {THRESHOLD_COLUMNS} FROM threshold_rules
         WHERE owner_client_id = ?1 AND sensor_key = ?2"
    );
    Ok(conn
        .query_row(&sql, params![key.owner, key.sensor_key], threshold_row)
        .optional()?)
}

#[async_trait]
impl Store for DatabaseService {
    async fn find_identity_by_external_id(&self, mqtt_id: &str) -> StoreResult<Option<Identity>> {
        let mqtt_id = mqtt_id.to_string();
        self.with_conn(move |conn| find_identity(conn, "mqtt_id", &mqtt_id))
            .await
    }

    async fn find_identity_by_client_id(&self, client_id: &str) -> StoreResult<Option<Identity>> {
        let client_id = client_id.to_string();
        self.with_conn(move |conn| find_identity(conn, "client_id", &client_id))
            .await
    }

    async fn exists_by_external_id(&self, mqtt_id: &str) -> StoreResult<bool> {
        let mqtt_id = mqtt_id.to_string();
        self.with_conn(move |conn| exists(conn, "mqtt_id", &mqtt_id))
            .await
    }

    async fn exists_by_client_id(&self, client_id: &str) -> StoreResult<bool> {
        let client_id = client_id.to_string();
        self.with_conn(move |conn| exists(conn, "client_id", &client_id))
            .await
    }

    async fn create_identity(&self, identity: NewIdentity) -> StoreResult<Identity> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT INTO identities (mqtt_id, secret_hash, client_id, device_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    identity.mqtt_id,
                    identity.secret_hash,
                    identity.client_id,
                    identity.device_name,
                    now_rfc3339()?
                ],
            );
            if let Err(e) = inserted {
                if is_constraint_violation(&e) {
                    return Err(StoreError::Conflict(format!(
                        "identity '{}' or client id '{}' already exists",
                        identity.mqtt_id, identity.client_id
                    )));
                }
                return Err(e.into());
            }
            let id = tx.last_insert_rowid();

            for rule in &identity.permissions {
                tx.execute(
                    "INSERT INTO permission_rules
                        (identity_id, topic_pattern, action, effect, allowed_qos, priority)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id,
                        rule.topic_pattern,
                        rule.action.as_str(),
                        rule.effect.as_str(),
                        rule.allowed_qos.to_csv(),
                        rule.priority
                    ],
                )?;
            }
            tx.commit()?;
            info!("Created identity '{}' (client id {}).", identity.mqtt_id, identity.client_id);

            Ok(Identity {
                id,
                mqtt_id: identity.mqtt_id,
                secret_hash: identity.secret_hash,
                client_id: identity.client_id,
                device_name: identity.device_name,
                permissions: identity.permissions,
            })
        })
        .await
    }

    async fn find_threshold_rule(&self, key: &ThresholdKey) -> StoreResult<Option<ThresholdRule>> {
        let key = key.clone();
        self.with_conn(move |conn| find_threshold(conn, &key)).await
    }

    async fn create_threshold_rule(&self, rule: NewThresholdRule) -> StoreResult<ThresholdRule> {
        self.with_conn(move |conn| {
            let now = now_rfc3339()?;
            let created = conn.execute(
                "INSERT INTO threshold_rules
                    (owner_client_id, sensor_key, min_value, max_value, warning_message,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT (owner_client_id, sensor_key) DO NOTHING",
                params![
                    rule.owner,
                    rule.sensor_key,
                    rule.min_value,
                    rule.max_value,
                    rule.warning_message,
                    now
                ],
            )?;
            let key = ThresholdKey::new(rule.owner, rule.sensor_key);
            if created == 0 {
                debug!("Threshold rule {} already present, reusing it.", key);
            }
            find_threshold(conn, &key)?
                .ok_or_else(|| StoreError::NotFound(format!("threshold rule {key}")))
        })
        .await
    }

    async fn update_threshold_rule(
        &self,
        key: &ThresholdKey,
        update: ThresholdUpdate,
    ) -> StoreResult<ThresholdRule> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE threshold_rules
                 SET min_value = ?3,
                     max_value = ?4,
                     warning_message = COALESCE(?5, warning_message),
                     updated_at = ?6
                 WHERE owner_client_id = ?1 AND sensor_key = ?2",
                params![
                    key.owner,
                    key.sensor_key,
                    update.min_value,
                    update.max_value,
                    update.warning_message,
                    now_rfc3339()?
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("threshold rule {key}")));
            }
            find_threshold(conn, &key)?
                .ok_or_else(|| StoreError::NotFound(format!("threshold rule {key}")))
        })
        .await
    }

    async fn list_threshold_rules(&self, owner: &str) -> StoreResult<Vec<ThresholdRule>> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {THRESHOLD_COLUMNS} FROM threshold_rules
                 WHERE owner_client_id = ?1 ORDER BY sensor_key"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![owner], threshold_row)?;

            let mut results = Vec::new();
            for row in rows {
                results.push(row?);
            }
            Ok(results)
        })
        .await
    }

    async fn persist_reading(&self, reading: NewReading) -> StoreResult<Reading> {
        self.with_conn(move |conn| {
            let received_at = OffsetDateTime::now_utc();
            let data = serde_json::to_string(&Value::Object(reading.data.clone()))?;
            conn.execute(
                "INSERT INTO readings (identity_id, recorded_at, received_at, data)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    reading.identity_id,
                    format_time(reading.recorded_at)?,
                    format_time(received_at)?,
                    data
                ],
            )?;
            Ok(Reading {
                id: conn.last_insert_rowid(),
                identity_id: reading.identity_id,
                recorded_at: reading.recorded_at,
                received_at,
                data: reading.data,
            })
        })
        .await
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
