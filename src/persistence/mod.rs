use crate::model::{HistoryRecord, SettingsSnapshot};
use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::{path::PathBuf, sync::Arc};

/// Namespace the server writes its own history into.
pub const DEFAULT_HISTORY_NAMESPACE: &str = "downloads";

#[derive(Clone)]
pub struct Db {
  // A single connection behind a mutex; history and settings writes are rare.
  conn: Arc<Mutex<Connection>>,
}

impl Db {
  pub fn open(path: PathBuf) -> anyhow::Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).context("failed to create db parent dir")?;
    }
    let conn = Connection::open(&path).context("failed to open sqlite db")?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  pub fn open_in_memory() -> anyhow::Result<Self> {
    let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  pub fn init_schema(&self) -> anyhow::Result<()> {
    let sql = r#"
      CREATE TABLE IF NOT EXISTS history (
        id TEXT PRIMARY KEY,
        namespace TEXT NOT NULL,
        item_id TEXT,
        title TEXT NOT NULL,
        artists TEXT NOT NULL,
        album TEXT NOT NULL,
        format TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        path TEXT NOT NULL,
        source_id TEXT NOT NULL
      );

      CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
      );

      CREATE INDEX IF NOT EXISTS idx_history_by_namespace ON history(namespace, timestamp);
    "#;

    let conn = self.conn.lock();
    conn.execute_batch(sql).context("failed to initialize schema")?;
    Ok(())
  }

  fn get_setting_raw(&self, key: &str) -> anyhow::Result<Option<String>> {
    let conn = self.conn.lock();
    let v: Option<String> = conn
      .query_row(r#"SELECT value FROM settings WHERE key=?1"#, params![key], |r| r.get(0))
      .optional()?;
    Ok(v)
  }

  fn set_setting_raw(&self, key: &str, value: &str) -> anyhow::Result<()> {
    let conn = self.conn.lock();
    conn.execute(
      r#"INSERT INTO settings(key, value) VALUES(?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value"#,
      params![key, value],
    )?;
    Ok(())
  }

  pub fn get_settings_snapshot(&self) -> anyhow::Result<SettingsSnapshot> {
    let defaults = SettingsSnapshot::default();
    Ok(SettingsSnapshot {
      filename_format: self
        .get_setting_raw("filename_format")?
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(defaults.filename_format),
      audio_format: self
        .get_setting_raw("audio_format")?
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(defaults.audio_format),
      default_service: self
        .get_setting_raw("default_service")?
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(defaults.default_service),
      fallback_services: self
        .get_setting_raw("fallback_services")?
        .and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .unwrap_or(defaults.fallback_services),
    })
  }

  pub fn set_settings_snapshot(&self, s: &SettingsSnapshot) -> anyhow::Result<()> {
    self.set_setting_raw("filename_format", &s.filename_format)?;
    self.set_setting_raw("audio_format", &s.audio_format)?;
    self.set_setting_raw("default_service", &s.default_service)?;
    self.set_setting_raw(
      "fallback_services",
      &serde_json::to_string(&s.fallback_services).context("failed to encode fallback services")?,
    )?;
    Ok(())
  }

  pub fn insert_history(&self, rec: &HistoryRecord, namespace: &str) -> anyhow::Result<()> {
    let conn = self.conn.lock();
    conn.execute(
      r#"INSERT INTO history(id, namespace, item_id, title, artists, album, format, timestamp, path, source_id)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
      params![
        rec.id,
        namespace,
        rec.item_id,
        rec.title,
        rec.artists,
        rec.album,
        rec.format,
        rec.timestamp,
        rec.path,
        rec.source_id
      ],
    )
    .context("failed to insert history record")?;
    Ok(())
  }

  /// Newest first.
  pub fn list_history(&self, namespace: &str) -> anyhow::Result<Vec<HistoryRecord>> {
    let conn = self.conn.lock();
    let mut stmt = conn.prepare(
      r#"
        SELECT id, item_id, title, artists, album, format, timestamp, path, source_id
        FROM history
        WHERE namespace=?1
        ORDER BY timestamp DESC, rowid DESC
      "#,
    )?;
    let rows = stmt.query_map(params![namespace], |r| {
      Ok(HistoryRecord {
        id: r.get(0)?,
        item_id: r.get(1)?,
        title: r.get(2)?,
        artists: r.get(3)?,
        album: r.get(4)?,
        format: r.get(5)?,
        timestamp: r.get(6)?,
        path: r.get(7)?,
        source_id: r.get(8)?,
      })
    })?;
    let mut out = Vec::new();
    for row in rows {
      out.push(row?);
    }
    Ok(out)
  }

  pub fn delete_history(&self, id: &str, namespace: &str) -> anyhow::Result<bool> {
    let conn = self.conn.lock();
    let n = conn.execute(
      r#"DELETE FROM history WHERE id=?1 AND namespace=?2"#,
      params![id, namespace],
    )?;
    Ok(n > 0)
  }

  pub fn clear_history(&self, namespace: &str) -> anyhow::Result<usize> {
    let conn = self.conn.lock();
    let n = conn.execute(r#"DELETE FROM history WHERE namespace=?1"#, params![namespace])?;
    Ok(n)
  }
}

/// Durable record of completed downloads, partitioned by namespace.
pub trait HistoryStore: Send + Sync {
  fn add(&self, record: &HistoryRecord, namespace: &str) -> anyhow::Result<()>;
  fn list(&self, namespace: &str) -> anyhow::Result<Vec<HistoryRecord>>;
  /// Returns whether a record was removed.
  fn delete(&self, id: &str, namespace: &str) -> anyhow::Result<bool>;
  fn clear(&self, namespace: &str) -> anyhow::Result<usize>;
}

#[derive(Clone)]
pub struct SqliteHistoryStore {
  db: Db,
}

impl SqliteHistoryStore {
  pub fn new(db: Db) -> Self {
    Self { db }
  }
}

impl HistoryStore for SqliteHistoryStore {
  fn add(&self, record: &HistoryRecord, namespace: &str) -> anyhow::Result<()> {
    self.db.insert_history(record, namespace)
  }

  fn list(&self, namespace: &str) -> anyhow::Result<Vec<HistoryRecord>> {
    self.db.list_history(namespace)
  }

  fn delete(&self, id: &str, namespace: &str) -> anyhow::Result<bool> {
    self.db.delete_history(id, namespace)
  }

  fn clear(&self, namespace: &str) -> anyhow::Result<usize> {
    self.db.clear_history(namespace)
  }
}

#[derive(Clone)]
pub struct SettingsStore {
  db: Db,
}

impl SettingsStore {
  pub fn new(db: Db) -> Self {
    Self { db }
  }

  pub fn get_snapshot(&self) -> anyhow::Result<SettingsSnapshot> {
    self.db.get_settings_snapshot()
  }

  pub fn set_snapshot(&self, s: &SettingsSnapshot) -> anyhow::Result<()> {
    self.db.set_settings_snapshot(s)
  }

  /// Writes defaults for any setting that was never stored.
  pub fn ensure_bootstrap_defaults(&self) -> anyhow::Result<()> {
    let snap = self.db.get_settings_snapshot()?;
    self.db.set_settings_snapshot(&snap)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn db() -> Db {
    let db = Db::open_in_memory().unwrap();
    db.init_schema().unwrap();
    db
  }

  fn record(id: &str, ts: i64) -> HistoryRecord {
    HistoryRecord {
      id: id.to_string(),
      item_id: Some(format!("item-{id}")),
      title: "Song A".to_string(),
      artists: "Artist X".to_string(),
      album: "Album Z".to_string(),
      format: "flac".to_string(),
      timestamp: ts,
      path: format!("/downloads/{id}.flac"),
      source_id: "sp1".to_string(),
    }
  }

  #[test]
  fn history_is_partitioned_by_namespace() {
    let store = SqliteHistoryStore::new(db());
    store.add(&record("a", 1), "downloads").unwrap();
    store.add(&record("b", 2), "downloads").unwrap();
    store.add(&record("c", 3), "other").unwrap();

    let list = store.list("downloads").unwrap();
    let ids: Vec<_> = list.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "a"]);
    assert_eq!(list[1], record("a", 1));

    assert!(!store.delete("c", "downloads").unwrap());
    assert!(store.delete("a", "downloads").unwrap());
    assert_eq!(store.list("downloads").unwrap().len(), 1);

    assert_eq!(store.clear("downloads").unwrap(), 1);
    assert!(store.list("downloads").unwrap().is_empty());
    assert_eq!(store.list("other").unwrap().len(), 1);
  }

  #[test]
  fn schema_init_is_idempotent() {
    let db = db();
    db.init_schema().unwrap();
  }

  #[test]
  fn settings_default_then_round_trip() {
    let settings = SettingsStore::new(db());
    let snap = settings.get_snapshot().unwrap();
    assert_eq!(snap.filename_format, "{track_number}. {track_name}");
    assert_eq!(snap.audio_format, "flac");
    assert_eq!(snap.default_service, "direct");
    assert!(snap.fallback_services.is_empty());

    settings.ensure_bootstrap_defaults().unwrap();
    let updated = SettingsSnapshot {
      filename_format: "{artist} - {title}".to_string(),
      audio_format: "mp3".to_string(),
      default_service: "tidal".to_string(),
      fallback_services: vec!["qobuz".to_string(), "amazon".to_string()],
    };
    settings.set_snapshot(&updated).unwrap();
    let back = settings.get_snapshot().unwrap();
    assert_eq!(back.default_service, "tidal");
    assert_eq!(back.fallback_services, vec!["qobuz", "amazon"]);
  }

  #[test]
  fn blank_setting_falls_back_to_default() {
    let db = db();
    db.set_setting_raw("audio_format", "  ").unwrap();
    db.set_setting_raw("fallback_services", "not json").unwrap();
    let snap = db.get_settings_snapshot().unwrap();
    assert_eq!(snap.audio_format, "flac");
    assert!(snap.fallback_services.is_empty());
  }
}
