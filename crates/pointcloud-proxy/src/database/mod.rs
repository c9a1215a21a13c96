//! SeaORM connection management for the shared state store
//!
//! Supports SQLite (default, single host) and PostgreSQL (shared between
//! several service instances).

use anyhow::{Context, Result};
use sea_orm::{ConnectOptions, Database as SeaOrmDatabase, DatabaseBackend, DatabaseConnection};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::DatabaseConfig;

pub mod migrations;

/// Database connection manager
#[derive(Clone, Debug)]
pub struct Database {
    connection: Arc<DatabaseConnection>,
    backend: DatabaseBackend,
    database_type: DatabaseType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    SQLite,
    PostgreSQL,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::SQLite => "SQLite",
            DatabaseType::PostgreSQL => "PostgreSQL",
        }
    }
}

impl Database {
    /// Open a connection pool for the configured URL.
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let database_type = Self::detect_database_type(&config.url)?;
        let backend = match database_type {
            DatabaseType::SQLite => DatabaseBackend::Sqlite,
            DatabaseType::PostgreSQL => DatabaseBackend::Postgres,
        };

        info!("Connecting to {} state store", database_type.as_str());

        let connection_url = match database_type {
            DatabaseType::SQLite => Self::ensure_sqlite_auto_creation(&config.url)?,
            DatabaseType::PostgreSQL => config.url.clone(),
        };

        let mut connect_options = ConnectOptions::new(&connection_url);
        connect_options
            .connect_timeout(Duration::from_secs(5))
            .acquire_timeout(Duration::from_secs(3))
            .sqlx_logging_level(tracing::log::LevelFilter::Debug);

        if connection_url.contains(":memory:") {
            // Every connection to an in-memory SQLite database sees a different database
            connect_options.max_connections(1).min_connections(1);
        } else {
            connect_options
                .max_connections(config.max_connections.max(1))
                .min_connections(1)
                .idle_timeout(Duration::from_secs(600))
                .max_lifetime(Duration::from_secs(1800));
        }

        let connection = match SeaOrmDatabase::connect(connect_options).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!("State store connection failed: {:?}", e);
                let mut source = e.source();
                let mut level = 0;
                while let Some(err) = source {
                    tracing::error!("  Level {}: {}", level, err);
                    source = err.source();
                    level += 1;
                }
                return Err(anyhow::anyhow!(
                    "Failed to connect to state store at '{}': {}",
                    &config.url,
                    e
                ));
            }
        };

        debug!("State store connection established");

        Ok(Self {
            connection: Arc::new(connection),
            backend,
            database_type,
        })
    }

    fn detect_database_type(url: &str) -> Result<DatabaseType> {
        if url.starts_with("sqlite:") {
            Ok(DatabaseType::SQLite)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Ok(DatabaseType::PostgreSQL)
        } else {
            anyhow::bail!("Unsupported state store URL format: {}", url);
        }
    }

    /// Add `mode=rwc` so SQLite creates a missing database file.
    fn ensure_sqlite_auto_creation(url: &str) -> Result<String> {
        if url.contains("mode=") || url.contains(":memory:") {
            return Ok(url.to_string());
        }

        let file_path = if let Some(path) = url.strip_prefix("sqlite://") {
            path
        } else if let Some(path) = url.strip_prefix("sqlite:") {
            path
        } else {
            anyhow::bail!("Invalid SQLite URL format: {}", url);
        };
        let file_path = file_path.split('?').next().unwrap_or(file_path);

        let path = std::path::Path::new(file_path);
        if path.exists() {
            return Ok(url.to_string());
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "Failed to create directory for SQLite database: {}",
                        parent.display()
                    )
                })?;
                info!("Created directory for SQLite database: {}", parent.display());
            }
        }

        let auto_create_url = if url.contains('?') {
            format!("{url}&mode=rwc")
        } else {
            format!("{url}?mode=rwc")
        };
        debug!("SQLite URL with auto-creation: {}", auto_create_url);
        Ok(auto_create_url)
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        use migrations::Migrator;
        use sea_orm_migration::MigratorTrait;

        info!(
            "Running state store migrations for {}",
            self.database_type.as_str()
        );
        Migrator::up(&*self.connection, None)
            .await
            .context("Failed to run migrations")?;
        Ok(())
    }

    pub fn connection(&self) -> Arc<DatabaseConnection> {
        self.connection.clone()
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    pub fn database_type(&self) -> DatabaseType {
        self.database_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_database_type() {
        assert_eq!(
            Database::detect_database_type("sqlite://./x.db").unwrap(),
            DatabaseType::SQLite
        );
        assert_eq!(
            Database::detect_database_type("postgres://localhost/pc").unwrap(),
            DatabaseType::PostgreSQL
        );
        assert!(Database::detect_database_type("mysql://localhost/pc").is_err());
    }

    #[test]
    fn test_sqlite_auto_creation_creates_parent() {
        let temp = tempfile::tempdir().unwrap();
        let db_path = temp.path().join("nested/state.db");
        let url = format!("sqlite://{}", db_path.display());

        let rewritten = Database::ensure_sqlite_auto_creation(&url).unwrap();
        assert!(rewritten.ends_with("?mode=rwc"));
        assert!(db_path.parent().unwrap().exists());

        assert_eq!(
            Database::ensure_sqlite_auto_creation("sqlite::memory:").unwrap(),
            "sqlite::memory:"
        );
    }

    #[tokio::test]
    async fn test_migrations_apply_to_file_database() {
        let temp = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", temp.path().join("state.db").display());
        let database = Database::new(&DatabaseConfig {
            url,
            max_connections: 2,
        })
        .await
        .unwrap();
        database.migrate().await.unwrap();
        // Running twice is a no-op
        database.migrate().await.unwrap();
        assert_eq!(database.database_type(), DatabaseType::SQLite);
    }
}
