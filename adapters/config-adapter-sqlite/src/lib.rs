//! SQLite-backed property storage adapter
//!
//! Stores the property table in a single `properties` table. Encrypted
//! rows carry their ciphertext in `prop_value` and a base64 IV in `iv`;
//! decryption happens in the caller, this adapter only moves rows.

use async_trait::async_trait;
use sqlx::{
	Row,
	sqlite::{self, SqlitePool, SqliteRow},
};
use std::path::Path;

use banter::config_adapter::{ConfigAdapter, PropRow};
use banter::prelude::*;

fn inspect(err: &sqlx::Error) {
	warn!("DB: {:#?}", err);
}

fn collect_res<T>(iter: impl Iterator<Item = Result<T, sqlx::Error>>) -> BtResult<Vec<T>> {
	let mut items = Vec::new();
	for item in iter {
		items.push(item.inspect_err(inspect).map_err(|_| Error::DbError)?);
	}
	Ok(items)
}

fn row_to_prop(row: &SqliteRow) -> Result<PropRow, sqlx::Error> {
	Ok(PropRow {
		name: row.try_get::<String, _>("name")?.into(),
		value: row.try_get::<String, _>("prop_value")?.into(),
		encrypted: row.try_get::<i64, _>("encrypted")? != 0,
		iv: row.try_get::<Option<String>, _>("iv")?.map(Into::into),
	})
}

#[derive(Debug)]
pub struct ConfigAdapterSqlite {
	db: SqlitePool,
}

impl ConfigAdapterSqlite {
	pub async fn new(path: impl AsRef<Path>) -> BtResult<Self> {
		let opts = sqlite::SqliteConnectOptions::new()
			.filename(path.as_ref())
			.create_if_missing(true)
			.journal_mode(sqlite::SqliteJournalMode::Wal);
		let db = sqlite::SqlitePoolOptions::new()
			.max_connections(5)
			.connect_with(opts)
			.await
			.inspect_err(inspect)
			.or(Err(Error::DbError))?;

		init_db(&db).await.inspect_err(inspect).or(Err(Error::DbError))?;

		Ok(Self { db })
	}
}

#[async_trait]
impl ConfigAdapter for ConfigAdapterSqlite {
	async fn load_all(&self) -> BtResult<Vec<PropRow>> {
		let rows = sqlx::query("SELECT name, prop_value, encrypted, iv FROM properties")
			.fetch_all(&self.db)
			.await
			.inspect_err(inspect)
			.map_err(|_| Error::DbError)?;
		collect_res(rows.iter().map(row_to_prop))
	}

	async fn insert(&self, row: &PropRow) -> BtResult<()> {
		sqlx::query(
			"INSERT INTO properties (name, prop_value, encrypted, iv) VALUES (?1, ?2, ?3, ?4)",
		)
		.bind(row.name.as_ref())
		.bind(row.value.as_ref())
		.bind(i64::from(row.encrypted))
		.bind(row.iv.as_deref())
		.execute(&self.db)
		.await
		.inspect_err(inspect)
		.map_err(|_| Error::DbError)?;
		Ok(())
	}

	async fn update(&self, row: &PropRow) -> BtResult<()> {
		let res = sqlx::query(
			"UPDATE properties SET prop_value = ?2, encrypted = ?3, iv = ?4 WHERE name = ?1",
		)
		.bind(row.name.as_ref())
		.bind(row.value.as_ref())
		.bind(i64::from(row.encrypted))
		.bind(row.iv.as_deref())
		.execute(&self.db)
		.await
		.inspect_err(inspect)
		.map_err(|_| Error::DbError)?;
		if res.rows_affected() == 0 {
			return Err(Error::NotFound);
		}
		Ok(())
	}

	async fn delete_tree(&self, name: &str) -> BtResult<()> {
		sqlx::query("DELETE FROM properties WHERE name = ?1 OR name LIKE ?1 || '.%'")
			.bind(name)
			.execute(&self.db)
			.await
			.inspect_err(inspect)
			.map_err(|_| Error::DbError)?;
		Ok(())
	}
}

async fn init_db(db: &SqlitePool) -> Result<(), sqlx::Error> {
	sqlx::query(
		"CREATE TABLE IF NOT EXISTS properties (
			name text NOT NULL,
			prop_value text NOT NULL,
			encrypted integer NOT NULL DEFAULT 0,
			iv text,
			PRIMARY KEY(name)
	)",
	)
	.execute(db)
	.await?;
	Ok(())
}

// vim: ts=4
