//! SQLite-backed video repository.
//!
//! The store is a cheap, cloneable handle holding only the database path.
//! Each call opens a short-lived connection, so handlers can move a clone into
//! `spawn_blocking` without sharing a connection across threads. Owner
//! expansion ("populate") is a LEFT JOIN against `users` done here, never in
//! the HTTP layer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{
    Connection, OptionalExtension, Row, functions::FunctionFlags, params, params_from_iter,
    types::Value,
};
use uuid::Uuid;

use crate::models::{NewUser, NewVideo, Owner, OwnerProfile, Video, VideoChanges};
use crate::query::VideoQuery;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Every video read selects the same columns, joined with the owner profile.
const VIDEO_SELECT: &str = r#"
    SELECT v.id, v.video_file, v.thumbnail, v.title, v.description,
           v.duration, v.views, v.is_published, v.owner_id,
           v.created_at, v.updated_at,
           u.username AS owner_username,
           u.full_name AS owner_full_name,
           u.avatar AS owner_avatar
    FROM videos v
    LEFT JOIN users u ON u.id = v.owner_id
"#;

#[derive(Debug, Clone)]
pub struct VideoStore {
    db_path: PathBuf,
}

impl VideoStore {
    /// Opens (and if necessary creates) the database and ensures the schema
    /// exists. WAL mode lets list queries proceed while a write is running.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("opening video DB {}", path.display()))?;
        let _mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("enabling WAL mode for video DB")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting video DB synchronous mode")?;
        ensure_tables(&mut conn)?;

        Ok(Self {
            db_path: path.to_path_buf(),
        })
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = Connection::open(&self.db_path)
            .with_context(|| format!("opening video DB {}", self.db_path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        register_casefold(&conn)?;
        f(&mut conn)
    }

    /// Registers an owner profile. Accounts belong to the identity service;
    /// this exists for seeding and local setups.
    pub fn insert_user(&self, user: &NewUser) -> Result<OwnerProfile> {
        let profile = OwnerProfile {
            id: Uuid::new_v4(),
            username: user.username.clone(),
            full_name: user.full_name.clone(),
            avatar: user.avatar.clone(),
        };
        self.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO users (id, username, full_name, avatar, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    profile.id.to_string(),
                    profile.username,
                    profile.full_name,
                    profile.avatar,
                    Utc::now(),
                ],
            )
            .with_context(|| format!("inserting user {}", profile.username))?;
            Ok(())
        })?;
        Ok(profile)
    }

    /// Runs a list query: AND-ed filters, optional sort, then skip/limit.
    /// Rows without an explicit sort, and ties within one, come back in
    /// insertion order. Owners are always expanded.
    pub fn find_videos(&self, query: &VideoQuery) -> Result<Vec<Video>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        if let Some(term) = &query.filter.title_contains {
            clauses.push("instr(casefold(v.title), casefold(?)) > 0");
            values.push(Value::Text(term.clone()));
        }
        if let Some(owner) = query.filter.owner {
            clauses.push("v.owner_id = ?");
            values.push(Value::Text(owner.to_string()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let order_sql = match query.sort {
            Some(sort) => format!(
                "ORDER BY v.{} {}, v.rowid ASC",
                sort.field.column(),
                sort.direction.sql()
            ),
            None => "ORDER BY v.rowid ASC".to_string(),
        };
        values.push(Value::Integer(clamp_i64(query.limit)));
        values.push(Value::Integer(clamp_i64(query.skip)));

        let sql = format!("{VIDEO_SELECT} {where_sql} {order_sql} LIMIT ? OFFSET ?");
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(values))?;
            let mut videos = Vec::new();
            while let Some(row) = rows.next()? {
                videos.push(row_to_video(row, true)?);
            }
            Ok(videos)
        })
    }

    pub fn find_video_by_id(&self, id: Uuid, populate: bool) -> Result<Option<Video>> {
        self.with_connection(|conn| fetch_single(conn, id, populate))
    }

    pub fn create_video(&self, new: &NewVideo) -> Result<Video> {
        let now = Utc::now();
        let video = Video {
            id: Uuid::new_v4(),
            video_file: new.video_file.clone(),
            thumbnail: new.thumbnail.clone(),
            title: new.title.clone(),
            description: new.description.clone(),
            duration: new.duration,
            views: 0,
            is_published: true,
            owner: new.owner.map(Owner::Ref),
            created_at: now,
            updated_at: now,
        };

        self.with_connection(|conn| {
            conn.execute(
                r#"
                INSERT INTO videos (
                    id, video_file, thumbnail, title, description, duration,
                    views, is_published, owner_id, created_at, updated_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11
                )
                "#,
                params![
                    video.id.to_string(),
                    video.video_file,
                    video.thumbnail,
                    video.title,
                    video.description,
                    video.duration,
                    video.views,
                    video.is_published,
                    new.owner.map(|owner| owner.to_string()),
                    video.created_at,
                    video.updated_at,
                ],
            )
            .context("inserting video")?;
            Ok(())
        })?;

        Ok(video)
    }

    /// Applies the provided fields and returns the updated row, or `None`
    /// when no video has this id.
    pub fn update_video(&self, id: Uuid, changes: &VideoChanges) -> Result<Option<Video>> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    r#"
                    UPDATE videos SET
                        title = COALESCE(?1, title),
                        description = COALESCE(?2, description),
                        thumbnail = COALESCE(?3, thumbnail),
                        updated_at = ?4
                    WHERE id = ?5
                    "#,
                    params![
                        changes.title,
                        changes.description,
                        changes.thumbnail,
                        Utc::now(),
                        id.to_string(),
                    ],
                )
                .with_context(|| format!("updating video {id}"))?;
            if changed == 0 {
                return Ok(None);
            }
            fetch_single(conn, id, false)
        })
    }

    /// Removes the video and returns what was removed. `None` means nothing
    /// was deleted, either because the id is unknown or because the row
    /// vanished between the read and the delete.
    pub fn delete_video(&self, id: Uuid) -> Result<Option<Video>> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let Some(video) = fetch_single(&tx, id, false)? else {
                return Ok(None);
            };
            let removed = tx
                .execute("DELETE FROM videos WHERE id = ?1", params![id.to_string()])
                .with_context(|| format!("deleting video {id}"))?;
            if removed != 1 {
                return Ok(None);
            }
            tx.commit()?;
            Ok(Some(video))
        })
    }

    /// Flips `is_published` in a single statement so two concurrent toggles
    /// cannot both read the same old value.
    pub fn toggle_publish(&self, id: Uuid) -> Result<Option<Video>> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    r#"
                    UPDATE videos
                    SET is_published = NOT is_published, updated_at = ?1
                    WHERE id = ?2
                    "#,
                    params![Utc::now(), id.to_string()],
                )
                .with_context(|| format!("toggling publish state of video {id}"))?;
            if changed == 0 {
                return Ok(None);
            }
            fetch_single(conn, id, false)
        })
    }
}

/// SQLite's `lower()` folds ASCII only; title search needs full Unicode case
/// folding.
fn register_casefold(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "casefold",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| Ok(ctx.get::<Option<String>>(0)?.map(|text| text.to_lowercase())),
    )
    .context("registering casefold for video DB")
}

fn ensure_tables(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            full_name TEXT NOT NULL,
            avatar TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY,
            video_file TEXT NOT NULL,
            thumbnail TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            duration REAL,
            views INTEGER NOT NULL DEFAULT 0,
            is_published INTEGER NOT NULL DEFAULT 1,
            owner_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_videos_owner ON videos(owner_id);
        "#,
    )
    .context("creating video DB schema")?;

    tx.commit()?;
    Ok(())
}

fn fetch_single(conn: &Connection, id: Uuid, populate: bool) -> Result<Option<Video>> {
    let mut stmt = conn.prepare(&format!("{VIDEO_SELECT} WHERE v.id = ?1"))?;
    let row = stmt
        .query_row([id.to_string()], |row| Ok(row_to_video(row, populate)))
        .optional()?;
    row.transpose()
}

/// Converts a joined row into a `Video`. With `populate` the owner becomes the
/// expanded profile (or `None` when the referenced user is gone); otherwise
/// it stays a bare id.
fn row_to_video(row: &Row<'_>, populate: bool) -> Result<Video> {
    let id: String = row.get("id")?;
    let owner_id: Option<String> = row.get("owner_id")?;
    let owner_id = owner_id
        .map(|raw| Uuid::parse_str(&raw).with_context(|| format!("parsing stored owner id {raw}")))
        .transpose()?;

    let owner = match (owner_id, populate) {
        (None, _) => None,
        (Some(owner_id), false) => Some(Owner::Ref(owner_id)),
        (Some(owner_id), true) => {
            let username: Option<String> = row.get("owner_username")?;
            match username {
                Some(username) => Some(Owner::Profile(OwnerProfile {
                    id: owner_id,
                    username,
                    full_name: row.get("owner_full_name")?,
                    avatar: row.get("owner_avatar")?,
                })),
                None => None,
            }
        }
    };

    Ok(Video {
        id: Uuid::parse_str(&id).with_context(|| format!("parsing stored video id {id}"))?,
        video_file: row.get("video_file")?,
        thumbnail: row.get("thumbnail")?,
        title: row.get("title")?,
        description: row.get("description")?,
        duration: row.get("duration")?,
        views: row.get("views")?,
        is_published: row.get("is_published")?,
        owner,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ListQuery;
    use tempfile::{TempDir, tempdir};

    fn temp_store() -> (TempDir, VideoStore) {
        let dir = tempdir().unwrap();
        let store = VideoStore::open(dir.path().join("db").join("videos.db")).unwrap();
        (dir, store)
    }

    fn new_video(title: &str, owner: Option<Uuid>) -> NewVideo {
        NewVideo {
            video_file: format!("https://cdn.test/{title}.mp4"),
            thumbnail: format!("https://cdn.test/{title}.jpg"),
            title: title.to_string(),
            description: format!("about {title}"),
            duration: Some(12.5),
            owner,
        }
    }

    fn query(pairs: &[(&str, &str)]) -> VideoQuery {
        let mut raw = ListQuery::default();
        for (key, value) in pairs {
            let value = Some(value.to_string());
            match *key {
                "page" => raw.page = value,
                "limit" => raw.limit = value,
                "query" => raw.query = value,
                "sortBy" => raw.sort_by = value,
                "sortType" => raw.sort_type = value,
                "userId" => raw.user_id = value,
                other => panic!("unexpected key {other}"),
            }
        }
        raw.build().unwrap()
    }

    fn titles(videos: &[Video]) -> Vec<&str> {
        videos.iter().map(|video| video.title.as_str()).collect()
    }

    #[test]
    fn pagination_returns_requested_window_in_insertion_order() -> Result<()> {
        let (_dir, store) = temp_store();
        for idx in 1..=12 {
            store.create_video(&new_video(&format!("video-{idx:02}"), None))?;
        }

        let page = store.find_videos(&query(&[("page", "2"), ("limit", "5")]))?;
        assert_eq!(
            titles(&page),
            ["video-06", "video-07", "video-08", "video-09", "video-10"]
        );

        let last = store.find_videos(&query(&[("page", "3"), ("limit", "5")]))?;
        assert_eq!(titles(&last), ["video-11", "video-12"]);
        Ok(())
    }

    #[test]
    fn title_search_is_case_insensitive_substring() -> Result<()> {
        let (_dir, store) = temp_store();
        store.create_video(&new_video("Concatenate", None))?;
        store.create_video(&new_video("CATS compilation", None))?;
        store.create_video(&new_video("Dogs", None))?;

        let found = store.find_videos(&query(&[("query", "cat")]))?;
        assert_eq!(titles(&found), ["Concatenate", "CATS compilation"]);
        Ok(())
    }

    #[test]
    fn title_search_folds_non_ascii_letters() -> Result<()> {
        let (_dir, store) = temp_store();
        store.create_video(&new_video("ÉCOLE d'été", None))?;
        store.create_video(&new_video("Straße", None))?;

        let found = store.find_videos(&query(&[("query", "école")]))?;
        assert_eq!(titles(&found), ["ÉCOLE d'été"]);
        let found = store.find_videos(&query(&[("query", "D'ÉTÉ")]))?;
        assert_eq!(titles(&found), ["ÉCOLE d'été"]);
        Ok(())
    }

    #[test]
    fn search_term_is_not_a_pattern() -> Result<()> {
        let (_dir, store) = temp_store();
        store.create_video(&new_video("100% real", None))?;
        store.create_video(&new_video("1000 ways", None))?;

        let found = store.find_videos(&query(&[("query", "0%")]))?;
        assert_eq!(titles(&found), ["100% real"]);
        Ok(())
    }

    #[test]
    fn owner_filter_and_title_filter_combine() -> Result<()> {
        let (_dir, store) = temp_store();
        let ana = store.insert_user(&NewUser {
            username: "ana".into(),
            full_name: "Ana Lee".into(),
            avatar: Some("https://cdn.test/ana.png".into()),
        })?;
        let other = Uuid::new_v4();
        store.create_video(&new_video("cat one", Some(ana.id)))?;
        store.create_video(&new_video("dog one", Some(ana.id)))?;
        store.create_video(&new_video("cat two", Some(other)))?;

        let found = store.find_videos(&query(&[
            ("query", "cat"),
            ("userId", &ana.id.to_string()),
        ]))?;
        assert_eq!(titles(&found), ["cat one"]);
        assert_eq!(found[0].owner, Some(Owner::Profile(ana)));
        Ok(())
    }

    #[test]
    fn sorts_descending_by_title() -> Result<()> {
        let (_dir, store) = temp_store();
        for title in ["beta", "alpha", "gamma", "delta"] {
            store.create_video(&new_video(title, None))?;
        }
        let sorted = store.find_videos(&query(&[("sortBy", "title"), ("sortType", "desc")]))?;
        assert_eq!(titles(&sorted), ["gamma", "delta", "beta", "alpha"]);

        let unsorted = store.find_videos(&query(&[("sortBy", "title")]))?;
        assert_eq!(titles(&unsorted), ["beta", "alpha", "gamma", "delta"]);
        Ok(())
    }

    #[test]
    fn dangling_owner_populates_as_none() -> Result<()> {
        let (_dir, store) = temp_store();
        let ghost = Uuid::new_v4();
        let created = store.create_video(&new_video("orphan", Some(ghost)))?;
        assert_eq!(created.owner, Some(Owner::Ref(ghost)));

        let populated = store.find_video_by_id(created.id, true)?.unwrap();
        assert!(populated.owner.is_none());
        let raw = store.find_video_by_id(created.id, false)?.unwrap();
        assert_eq!(raw.owner, Some(Owner::Ref(ghost)));
        Ok(())
    }

    #[test]
    fn update_keeps_fields_that_were_not_provided() -> Result<()> {
        let (_dir, store) = temp_store();
        let created = store.create_video(&new_video("first", None))?;

        let updated = store
            .update_video(
                created.id,
                &VideoChanges {
                    title: Some("second".into()),
                    description: None,
                    thumbnail: Some("https://cdn.test/new.jpg".into()),
                },
            )?
            .unwrap();
        assert_eq!(updated.title, "second");
        assert_eq!(updated.description, created.description);
        assert_eq!(updated.thumbnail, "https://cdn.test/new.jpg");
        assert!(updated.updated_at >= created.updated_at);

        assert!(
            store
                .update_video(Uuid::new_v4(), &VideoChanges::default())?
                .is_none()
        );
        Ok(())
    }

    #[test]
    fn delete_reports_only_real_removals() -> Result<()> {
        let (_dir, store) = temp_store();
        let created = store.create_video(&new_video("gone", None))?;

        let deleted = store.delete_video(created.id)?.unwrap();
        assert_eq!(deleted.id, created.id);
        assert!(store.find_video_by_id(created.id, false)?.is_none());
        assert!(store.delete_video(created.id)?.is_none());
        Ok(())
    }

    #[test]
    fn toggle_publish_twice_restores_flag() -> Result<()> {
        let (_dir, store) = temp_store();
        let created = store.create_video(&new_video("flip", None))?;
        assert!(created.is_published);

        let once = store.toggle_publish(created.id)?.unwrap();
        assert!(!once.is_published);
        let twice = store.toggle_publish(created.id)?.unwrap();
        assert!(twice.is_published);

        assert!(store.toggle_publish(Uuid::new_v4())?.is_none());
        Ok(())
    }
}
