//! Durable cache: an SQLite index of every generated (or failed) thumbnail plus the
//! content addressed artifact files it points to.
//!
//! Thumbnails directory have the following structure:
//! thumbnails/
//! └── <hash>[0..3]/ # sharding
//!    └── <hash>.<webp|jpg>

use sd_utils::error::FileIOError;

use std::{
	collections::{HashMap, HashSet},
	io::Write,
	path::{Path, PathBuf},
	str::FromStr,
	time::{Duration, SystemTime},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{
	sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
	FromRow, QueryBuilder, Sqlite, SqlitePool,
};
use tempfile::NamedTempFile;
use tokio::{fs, io, task::spawn_blocking};
use tracing::{debug, error, info, instrument, trace, warn};

use super::{
	codec::Artifact,
	config::OutputFormat,
	error::{ErrorKind, ThumbnailerError},
	key::{ContentKey, Fingerprint},
	resolver::ContainerInfo,
};

mod shard;

pub use shard::{artifact_path, get_shard_hex};

pub const THUMBNAIL_CACHE_DIR_NAME: &str = "thumbnails";
pub const DATABASE_FILE_NAME: &str = "thumbnails.db";

/// `artifact_ref` stored for negative entries
const NEGATIVE_ARTIFACT_REF: &str = "";

/// SQLite caps the number of bound parameters, batch lookups go in chunks of this size
const BATCH_CHUNK: usize = 500;

/// Artifact files younger than this are never reclaimed: their index row may not be written yet
const ORPHAN_GRACE: Duration = Duration::from_secs(5 * 60);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS thumbnails (
	key            TEXT PRIMARY KEY NOT NULL,
	root_path      TEXT NOT NULL,
	inner_path     TEXT NOT NULL DEFAULT '',
	selector       TEXT NOT NULL DEFAULT '',
	modified_ms    INTEGER NOT NULL,
	byte_size      INTEGER NOT NULL,
	artifact_ref   TEXT NOT NULL,
	error_kind     TEXT,
	width          INTEGER NOT NULL DEFAULT 0,
	height         INTEGER NOT NULL DEFAULT 0,
	artifact_bytes INTEGER NOT NULL DEFAULT 0,
	is_container   INTEGER NOT NULL DEFAULT 0,
	created_at     INTEGER NOT NULL,
	accessed_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_thumbnails_root_path ON thumbnails(root_path);
CREATE INDEX IF NOT EXISTS idx_thumbnails_created_at ON thumbnails(created_at);
CREATE INDEX IF NOT EXISTS idx_thumbnails_artifact_ref ON thumbnails(artifact_ref);

CREATE TABLE IF NOT EXISTS containers (
	path                 TEXT PRIMARY KEY NOT NULL,
	modified_ms          INTEGER NOT NULL,
	byte_size            INTEGER NOT NULL,
	representative_root  TEXT NOT NULL,
	representative_inner TEXT NOT NULL DEFAULT '',
	child_count          INTEGER NOT NULL,
	scanned_at           INTEGER NOT NULL
);
";

const THUMBNAIL_COLUMNS: &str = "root_path, inner_path, selector, modified_ms, byte_size, \
	artifact_ref, error_kind, width, height, artifact_bytes, is_container, created_at";

/// What an index row points to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArtifactRef {
	/// Artifact file name, `<hash>.<ext>`
	File(String),
	/// Negative entry: generation failed permanently for this fingerprint
	Unavailable(ErrorKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableCacheEntry {
	pub key: ContentKey,
	pub fingerprint: Fingerprint,
	pub artifact: ArtifactRef,
	pub width: u32,
	pub height: u32,
	pub byte_size: u64,
	/// When the fingerprint this entry was generated from was observed
	pub created_at: DateTime<Utc>,
	pub is_container: bool,
}

impl DurableCacheEntry {
	#[must_use]
	pub const fn is_negative(&self) -> bool {
		matches!(self.artifact, ArtifactRef::Unavailable(_))
	}

	/// A cache hit is only valid for the fingerprint it was generated from
	#[must_use]
	pub fn is_valid_for(&self, fingerprint: &Fingerprint) -> bool {
		self.fingerprint == *fingerprint
	}

	#[must_use]
	pub fn negative(
		key: ContentKey,
		fingerprint: Fingerprint,
		kind: ErrorKind,
		created_at: DateTime<Utc>,
	) -> Self {
		Self {
			key,
			fingerprint,
			artifact: ArtifactRef::Unavailable(kind),
			width: 0,
			height: 0,
			byte_size: 0,
			created_at,
			is_container: false,
		}
	}
}

/// Container index row: the representative found by the last scan of a folder or archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
	pub path: PathBuf,
	pub fingerprint: Fingerprint,
	pub info: ContainerInfo,
	pub scanned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VacuumReport {
	pub orphan_files_removed: u64,
	pub dangling_rows_removed: u64,
	pub bytes_reclaimed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
	pub rows: u64,
	pub negative_rows: u64,
	pub artifact_bytes: u64,
	pub containers: u64,
}

#[derive(FromRow)]
struct ThumbnailRow {
	root_path: String,
	inner_path: String,
	selector: String,
	modified_ms: i64,
	byte_size: i64,
	artifact_ref: String,
	error_kind: Option<String>,
	width: i64,
	height: i64,
	artifact_bytes: i64,
	is_container: bool,
	created_at: i64,
}

impl ThumbnailRow {
	fn into_entry(self) -> DurableCacheEntry {
		let artifact = match self.error_kind {
			Some(kind) => ArtifactRef::Unavailable(ErrorKind::from_str(&kind).unwrap_or_else(|e| {
				warn!(%e, "Unknown error kind in thumbnail index, treating as corrupt");
				ErrorKind::Corrupt
			})),
			None => ArtifactRef::File(self.artifact_ref),
		};

		DurableCacheEntry {
			key: ContentKey::from_stored(self.root_path, self.inner_path, self.selector),
			fingerprint: Fingerprint {
				modified_ms: self.modified_ms,
				byte_size: to_u64(self.byte_size),
			},
			artifact,
			width: u32::try_from(self.width).unwrap_or_default(),
			height: u32::try_from(self.height).unwrap_or_default(),
			byte_size: to_u64(self.artifact_bytes),
			created_at: from_ms(self.created_at),
			is_container: self.is_container,
		}
	}
}

#[derive(FromRow)]
struct ContainerRow {
	path: String,
	modified_ms: i64,
	byte_size: i64,
	representative_root: String,
	representative_inner: String,
	child_count: i64,
	scanned_at: i64,
}

/// The durable index. Cheap to clone, all clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct DurableStore {
	pool: SqlitePool,
	thumbnails_dir: PathBuf,
}

impl DurableStore {
	/// Opens (or creates) the index and the artifacts directory under `data_dir`
	#[instrument(skip_all, fields(data_dir = %data_dir.as_ref().display()))]
	pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, ThumbnailerError> {
		let data_dir = data_dir.as_ref();
		let thumbnails_dir = data_dir.join(THUMBNAIL_CACHE_DIR_NAME);

		fs::create_dir_all(&thumbnails_dir).await.map_err(|e| {
			FileIOError::from((&thumbnails_dir, e, "Failed to create thumbnails directory"))
		})?;

		let options = SqliteConnectOptions::new()
			.filename(data_dir.join(DATABASE_FILE_NAME))
			.create_if_missing(true)
			.journal_mode(SqliteJournalMode::Wal)
			.synchronous(SqliteSynchronous::Normal)
			.busy_timeout(Duration::from_secs(5));

		let pool = SqlitePoolOptions::new()
			.max_connections(8)
			.connect_with(options)
			.await?;

		sqlx::raw_sql(SCHEMA).execute(&pool).await?;

		info!("Opened thumbnail index");

		Ok(Self {
			pool,
			thumbnails_dir,
		})
	}

	#[must_use]
	pub fn thumbnails_dir(&self) -> &Path {
		&self.thumbnails_dir
	}

	pub async fn get(&self, key: &ContentKey) -> Result<Option<DurableCacheEntry>, ThumbnailerError> {
		let storage_key = key.storage_key()?;

		Ok(sqlx::query_as::<_, ThumbnailRow>(&format!(
			"SELECT {THUMBNAIL_COLUMNS} FROM thumbnails WHERE key = ?1"
		))
		.bind(storage_key)
		.fetch_optional(&self.pool)
		.await?
		.map(ThumbnailRow::into_entry))
	}

	/// Looks up many keys at once. Keys without a row (or that can't be stored at all)
	/// are simply absent from the result.
	pub async fn get_batch(
		&self,
		keys: &[ContentKey],
	) -> Result<HashMap<ContentKey, DurableCacheEntry>, ThumbnailerError> {
		let storage_keys = keys
			.iter()
			.filter_map(|key| key.storage_key().ok())
			.collect::<Vec<_>>();

		let mut entries = HashMap::with_capacity(storage_keys.len());

		for chunk in storage_keys.chunks(BATCH_CHUNK) {
			let mut query = QueryBuilder::<Sqlite>::new(format!(
				"SELECT {THUMBNAIL_COLUMNS} FROM thumbnails WHERE key IN ("
			));
			let mut separated = query.separated(", ");
			for storage_key in chunk {
				separated.push_bind(storage_key.as_str());
			}
			separated.push_unseparated(")");

			for row in query
				.build_query_as::<ThumbnailRow>()
				.fetch_all(&self.pool)
				.await?
			{
				let entry = row.into_entry();
				entries.insert(entry.key.clone(), entry);
			}
		}

		Ok(entries)
	}

	/// Writes `entry`, replacing whatever the key had.
	///
	/// The write is a no-op when the stored entry was generated from a fingerprint observed at
	/// the same time or later, so a slower duplicate never clobbers a fresher result.
	/// Returns whether the row was written.
	pub async fn put(&self, entry: &DurableCacheEntry) -> Result<bool, ThumbnailerError> {
		let storage_key = entry.key.storage_key()?;
		let (artifact_ref, error_kind) = match &entry.artifact {
			ArtifactRef::File(name) => (name.as_str(), None),
			ArtifactRef::Unavailable(kind) => (NEGATIVE_ARTIFACT_REF, Some(kind.as_str())),
		};
		let created_at = entry.created_at.timestamp_millis();

		let res = sqlx::query(
			"INSERT INTO thumbnails (
				key, root_path, inner_path, selector, modified_ms, byte_size, artifact_ref,
				error_kind, width, height, artifact_bytes, is_container, created_at, accessed_at
			) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
			ON CONFLICT(key) DO UPDATE SET
				modified_ms = excluded.modified_ms,
				byte_size = excluded.byte_size,
				artifact_ref = excluded.artifact_ref,
				error_kind = excluded.error_kind,
				width = excluded.width,
				height = excluded.height,
				artifact_bytes = excluded.artifact_bytes,
				is_container = excluded.is_container,
				created_at = excluded.created_at,
				accessed_at = excluded.accessed_at
			WHERE excluded.created_at > thumbnails.created_at",
		)
		.bind(storage_key)
		.bind(entry.key.root_path_str()?)
		.bind(entry.key.inner_path().unwrap_or_default())
		.bind(entry.key.selector().unwrap_or_default())
		.bind(entry.fingerprint.modified_ms)
		.bind(to_i64(entry.fingerprint.byte_size))
		.bind(artifact_ref)
		.bind(error_kind)
		.bind(i64::from(entry.width))
		.bind(i64::from(entry.height))
		.bind(to_i64(entry.byte_size))
		.bind(entry.is_container)
		.bind(created_at)
		.bind(now_ms())
		.execute(&self.pool)
		.await?;

		let written = res.rows_affected() > 0;
		if !written {
			debug!(key = %entry.key, "Skipped index write, a fresher entry exists");
		}

		Ok(written)
	}

	pub async fn remove(&self, key: &ContentKey) -> Result<bool, ThumbnailerError> {
		Ok(sqlx::query("DELETE FROM thumbnails WHERE key = ?1")
			.bind(key.storage_key()?)
			.execute(&self.pool)
			.await?
			.rows_affected() > 0)
	}

	/// Removes entries generated more than `max_age` ago, their files are left for [`Self::vacuum`]
	pub async fn invalidate_older_than(&self, max_age: Duration) -> Result<u64, ThumbnailerError> {
		let cutoff = now_ms().saturating_sub(to_i64(
			u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX),
		));

		let removed = sqlx::query("DELETE FROM thumbnails WHERE created_at < ?1")
			.bind(cutoff)
			.execute(&self.pool)
			.await?
			.rows_affected();

		debug!(removed, ?max_age, "Expired thumbnail index entries");

		Ok(removed)
	}

	/// Removes every entry (and container record) whose root path starts with `prefix`
	pub async fn invalidate_by_prefix(&self, prefix: &Path) -> Result<u64, ThumbnailerError> {
		let prefix = path_str(prefix)?;

		// substr instead of LIKE, paths are full of `_` and `%`
		let removed = sqlx::query(
			"DELETE FROM thumbnails WHERE substr(root_path, 1, length(?1)) = ?1",
		)
		.bind(prefix)
		.execute(&self.pool)
		.await?
		.rows_affected();

		sqlx::query("DELETE FROM containers WHERE substr(path, 1, length(?1)) = ?1")
			.bind(prefix)
			.execute(&self.pool)
			.await?;

		debug!(removed, %prefix, "Invalidated thumbnail index entries by prefix");

		Ok(removed)
	}

	/// Every entry whose root path starts with `prefix`
	pub async fn entries_under(
		&self,
		prefix: &Path,
	) -> Result<Vec<DurableCacheEntry>, ThumbnailerError> {
		Ok(sqlx::query_as::<_, ThumbnailRow>(&format!(
			"SELECT {THUMBNAIL_COLUMNS} FROM thumbnails WHERE substr(root_path, 1, length(?1)) = ?1"
		))
		.bind(path_str(prefix)?)
		.fetch_all(&self.pool)
		.await?
		.into_iter()
		.map(ThumbnailRow::into_entry)
		.collect())
	}

	/// Drops negative entries so failed sources are tried again
	pub async fn clear_negative(&self) -> Result<u64, ThumbnailerError> {
		Ok(sqlx::query("DELETE FROM thumbnails WHERE error_kind IS NOT NULL")
			.execute(&self.pool)
			.await?
			.rows_affected())
	}

	/// Drops entries (and container records) whose source is gone from disk
	pub async fn prune_missing_sources(&self) -> Result<u64, ThumbnailerError> {
		let roots = sqlx::query_scalar::<_, String>("SELECT DISTINCT root_path FROM thumbnails")
			.fetch_all(&self.pool)
			.await?;

		let mut removed = 0;
		for root in roots {
			if fs::try_exists(&root).await.unwrap_or(true) {
				continue;
			}

			removed += sqlx::query("DELETE FROM thumbnails WHERE root_path = ?1")
				.bind(&root)
				.execute(&self.pool)
				.await?
				.rows_affected();
			sqlx::query("DELETE FROM containers WHERE path = ?1")
				.bind(&root)
				.execute(&self.pool)
				.await?;
		}

		debug!(removed, "Pruned entries of missing sources");

		Ok(removed)
	}

	/// Records an access to these keys
	pub async fn touch(&self, keys: &[ContentKey]) -> Result<(), ThumbnailerError> {
		let storage_keys = keys
			.iter()
			.filter_map(|key| key.storage_key().ok())
			.collect::<Vec<_>>();
		let now = now_ms();

		for chunk in storage_keys.chunks(BATCH_CHUNK) {
			let mut query = QueryBuilder::<Sqlite>::new("UPDATE thumbnails SET accessed_at = ");
			query.push_bind(now);
			query.push(" WHERE key IN (");
			let mut separated = query.separated(", ");
			for storage_key in chunk {
				separated.push_bind(storage_key.as_str());
			}
			separated.push_unseparated(")");

			query.build().execute(&self.pool).await?;
		}

		Ok(())
	}

	pub async fn stats(&self) -> Result<StoreStats, ThumbnailerError> {
		let (rows, negative_rows, artifact_bytes) = sqlx::query_as::<_, (i64, i64, i64)>(
			"SELECT
				COUNT(*),
				COALESCE(SUM(error_kind IS NOT NULL), 0),
				COALESCE(SUM(artifact_bytes), 0)
			FROM thumbnails",
		)
		.fetch_one(&self.pool)
		.await?;

		let containers = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM containers")
			.fetch_one(&self.pool)
			.await?;

		Ok(StoreStats {
			rows: to_u64(rows),
			negative_rows: to_u64(negative_rows),
			artifact_bytes: to_u64(artifact_bytes),
			containers: to_u64(containers),
		})
	}

	pub async fn get_container(
		&self,
		path: &Path,
	) -> Result<Option<ContainerEntry>, ThumbnailerError> {
		Ok(sqlx::query_as::<_, ContainerRow>(
			"SELECT path, modified_ms, byte_size, representative_root, representative_inner,
				child_count, scanned_at
			FROM containers WHERE path = ?1",
		)
		.bind(path_str(path)?)
		.fetch_optional(&self.pool)
		.await?
		.map(|row| ContainerEntry {
			path: PathBuf::from(row.path),
			fingerprint: Fingerprint {
				modified_ms: row.modified_ms,
				byte_size: to_u64(row.byte_size),
			},
			info: ContainerInfo {
				representative: ContentKey::new(row.representative_root)
					.with_inner_path(row.representative_inner),
				child_count: to_u64(row.child_count),
			},
			scanned_at: from_ms(row.scanned_at),
		}))
	}

	pub async fn put_container(
		&self,
		path: &Path,
		fingerprint: Fingerprint,
		info: &ContainerInfo,
	) -> Result<(), ThumbnailerError> {
		sqlx::query(
			"INSERT OR REPLACE INTO containers (
				path, modified_ms, byte_size, representative_root, representative_inner,
				child_count, scanned_at
			) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
		)
		.bind(path_str(path)?)
		.bind(fingerprint.modified_ms)
		.bind(to_i64(fingerprint.byte_size))
		.bind(info.representative.root_path_str()?)
		.bind(info.representative.inner_path().unwrap_or_default())
		.bind(to_i64(info.child_count))
		.bind(now_ms())
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	/// Writes the artifact file, named after the hash of its bytes, and returns its reference.
	/// Identical artifacts share a single file.
	pub async fn write_artifact(&self, artifact: &Artifact) -> Result<ArtifactRef, ThumbnailerError> {
		let hash = blake3::hash(&artifact.bytes).to_hex();
		let file_name = format!("{hash}.{}", artifact.format.extension());
		let path = artifact_path(&self.thumbnails_dir, &file_name);

		if fs::try_exists(&path).await.unwrap_or(false) {
			trace!(%file_name, "Artifact already on disk");
			return Ok(ArtifactRef::File(file_name));
		}

		let Some(shard_dir) = path.parent().map(Path::to_path_buf) else {
			error!("Failed to get parent directory for sharding parent directory");
			return Err(FileIOError::from((
				&path,
				io::Error::from(io::ErrorKind::InvalidInput),
				"Artifact path has no shard directory",
			))
			.into());
		};

		fs::create_dir_all(&shard_dir)
			.await
			.map_err(|e| FileIOError::from((&shard_dir, e, "Failed to create shard directory")))?;

		// Every writer gets its own temporary file then renames it in place, so readers never
		// see a half written file and concurrent writers of the same bytes don't collide
		let bytes = artifact.bytes.clone();
		let target = path.clone();
		spawn_blocking(move || -> Result<(), FileIOError> {
			let mut tmp = NamedTempFile::new_in(&shard_dir).map_err(|e| {
				FileIOError::from((&shard_dir, e, "Failed to create temporary artifact"))
			})?;
			tmp.write_all(&bytes)
				.map_err(|e| FileIOError::from((tmp.path(), e, "Failed to write artifact")))?;

			match tmp.persist(&target) {
				Ok(_) => Ok(()),
				// Content addressed, whoever got there first wrote the same bytes
				Err(_) if target.is_file() => Ok(()),
				Err(e) => Err(FileIOError::from((
					&target,
					e.error,
					"Failed to move artifact in place",
				))),
			}
		})
		.await
		.map_err(|e| ThumbnailerError::Panic(e.to_string()))??;

		trace!(%file_name, "Wrote artifact to disk");

		Ok(ArtifactRef::File(file_name))
	}

	/// Loads the artifact of a positive entry, `None` if the file is gone
	pub async fn read_artifact(
		&self,
		entry: &DurableCacheEntry,
	) -> Result<Option<Artifact>, ThumbnailerError> {
		let ArtifactRef::File(file_name) = &entry.artifact else {
			return Ok(None);
		};

		let path = artifact_path(&self.thumbnails_dir, file_name);
		let format = Path::new(file_name)
			.extension()
			.and_then(|ext| ext.to_str())
			.and_then(OutputFormat::from_extension)
			.unwrap_or(OutputFormat::Webp);

		match fs::read(&path).await {
			Ok(bytes) => Ok(Some(Artifact {
				bytes: Bytes::from(bytes),
				width: entry.width,
				height: entry.height,
				format,
			})),
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				warn!(path = %path.display(), "Artifact file missing for index entry");
				Ok(None)
			}
			Err(e) => Err(FileIOError::from((&path, e, "Failed to read artifact")).into()),
		}
	}

	/// Reclaims artifact files no row points to, drops rows whose file is gone
	/// and compacts the database.
	#[instrument(skip(self))]
	pub async fn vacuum(&self) -> Result<VacuumReport, ThumbnailerError> {
		let mut report = VacuumReport::default();

		// References first and files second: a file written after the query is young
		// enough to be spared by the grace period
		let referenced = sqlx::query_scalar::<_, String>(
			"SELECT DISTINCT artifact_ref FROM thumbnails WHERE error_kind IS NULL",
		)
		.fetch_all(&self.pool)
		.await?
		.into_iter()
		.collect::<HashSet<_>>();

		let on_disk = self.list_artifact_files().await?;
		let now = SystemTime::now();

		for (file_name, (path, size, modified)) in &on_disk {
			if referenced.contains(file_name) {
				continue;
			}

			let age = now.duration_since(*modified).unwrap_or_default();
			if age < ORPHAN_GRACE {
				continue;
			}

			match fs::remove_file(path).await {
				Ok(()) => {
					report.orphan_files_removed += 1;
					report.bytes_reclaimed += size;
				}
				Err(e) if e.kind() == io::ErrorKind::NotFound => {}
				Err(e) => error!(
					e = %FileIOError::from((path, e, "Failed to remove orphan artifact")),
					"Vacuum couldn't remove file;"
				),
			}
		}

		for file_name in referenced.iter().filter(|name| !on_disk.contains_key(*name)) {
			// Check again right before deleting, a worker may have just written it
			let path = artifact_path(&self.thumbnails_dir, file_name);
			if fs::try_exists(&path).await.unwrap_or(true) {
				continue;
			}

			report.dangling_rows_removed += sqlx::query(
				"DELETE FROM thumbnails WHERE artifact_ref = ?1 AND error_kind IS NULL",
			)
			.bind(file_name)
			.execute(&self.pool)
			.await?
			.rows_affected();
		}

		sqlx::query("VACUUM").execute(&self.pool).await?;

		info!(?report, "Vacuumed thumbnail cache");

		Ok(report)
	}

	/// Every file under the shard directories, keyed by file name
	async fn list_artifact_files(
		&self,
	) -> Result<HashMap<String, (PathBuf, u64, SystemTime)>, ThumbnailerError> {
		let mut files = HashMap::new();

		let mut shards = fs::read_dir(&self.thumbnails_dir).await.map_err(|e| {
			FileIOError::from((&self.thumbnails_dir, e, "Failed to read thumbnails directory"))
		})?;

		while let Some(shard) = shards.next_entry().await.map_err(|e| {
			FileIOError::from((&self.thumbnails_dir, e, "Failed to read thumbnails directory"))
		})? {
			let shard_path = shard.path();
			if !shard.file_type().await.is_ok_and(|kind| kind.is_dir()) {
				continue;
			}

			let mut entries = fs::read_dir(&shard_path).await.map_err(|e| {
				FileIOError::from((&shard_path, e, "Failed to read shard directory"))
			})?;

			while let Some(entry) = entries.next_entry().await.map_err(|e| {
				FileIOError::from((&shard_path, e, "Failed to read shard directory"))
			})? {
				let Ok(metadata) = entry.metadata().await else {
					continue;
				};
				if !metadata.is_file() {
					continue;
				}

				if let Some(name) = entry.file_name().to_str() {
					files.insert(
						name.to_string(),
						(
							entry.path(),
							metadata.len(),
							metadata.modified().unwrap_or_else(|_| SystemTime::now()),
						),
					);
				}
			}
		}

		Ok(files)
	}
}

pub(crate) fn now_ms() -> i64 {
	Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
	DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn to_i64(value: u64) -> i64 {
	i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
	u64::try_from(value).unwrap_or_default()
}

fn path_str(path: &Path) -> Result<&str, ThumbnailerError> {
	path.to_str()
		.ok_or_else(|| sd_utils::error::NonUtf8PathError(path.into()).into())
}
