//! Shared PostgreSQL fixture for integration tests.
//!
//! Provisions the layout a deployment script would create:
//! - `app`: the application (control) database
//! - `datastore`: the datastore, writable by `writer`, readable by `reader`
//! - `public.writetest`: the probe table

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use datastore_gate_core::{DatastoreConfig, DatastoreError, Result};
use sqlx::PgPool;
use std::time::Duration;
use testcontainers_modules::{
    postgres::Postgres,
    testcontainers::{ContainerAsync, runners::AsyncRunner},
};

pub struct Fixture {
    pub container: ContainerAsync<Postgres>,
    pub port: u16,
}

impl Fixture {
    pub async fn start() -> Self {
        let container = Postgres::default().start().await.unwrap();
        let port = container.get_host_port_ipv4(5432).await.unwrap();
        let fixture = Self { container, port };

        wait_for_postgres_ready(&fixture.url("postgres", "postgres", "postgres"), 30)
            .await
            .expect("PostgreSQL did not become ready");
        fixture.provision().await;
        fixture
    }

    pub fn url(&self, user: &str, password: &str, database: &str) -> String {
        format!(
            "postgres://{}:{}@localhost:{}/{}",
            user, password, self.port, database
        )
    }

    pub fn control_url(&self) -> String {
        self.url("postgres", "postgres", "app")
    }

    pub fn write_url(&self) -> String {
        self.url("writer", "writer", "datastore")
    }

    pub fn read_url(&self) -> String {
        self.url("reader", "reader", "datastore")
    }

    /// Control=app, Write=datastore/writer, Read=datastore/reader.
    pub fn config(&self) -> DatastoreConfig {
        DatastoreConfig::new(self.write_url())
            .with_control_url(self.control_url())
            .with_read_url(self.read_url())
    }

    /// Superuser pool on the datastore database.
    pub async fn admin_pool(&self) -> PgPool {
        PgPool::connect(&self.url("postgres", "postgres", "datastore"))
            .await
            .unwrap()
    }

    pub async fn pool_as(&self, user: &str, password: &str) -> PgPool {
        PgPool::connect(&self.url(user, password, "datastore"))
            .await
            .unwrap()
    }

    /// Runs statements as superuser on the datastore database.
    pub async fn admin_exec(&self, statements: &[&str]) {
        let pool = self.admin_pool().await;
        for statement in statements {
            sqlx::query(statement).execute(&pool).await.unwrap();
        }
        pool.close().await;
    }

    async fn provision(&self) {
        let server = PgPool::connect(&self.url("postgres", "postgres", "postgres"))
            .await
            .unwrap();
        for statement in [
            "CREATE DATABASE app",
            "CREATE DATABASE datastore",
            "CREATE ROLE writer LOGIN PASSWORD 'writer'",
            "CREATE ROLE reader LOGIN PASSWORD 'reader'",
        ] {
            sqlx::query(statement).execute(&server).await.unwrap();
        }
        server.close().await;

        self.admin_exec(&[
            "REVOKE CREATE ON SCHEMA public FROM PUBLIC",
            "GRANT USAGE, CREATE ON SCHEMA public TO writer",
            "GRANT USAGE ON SCHEMA public TO reader",
            "CREATE TABLE public.writetest (id INTEGER NOT NULL, name VARCHAR)",
            "ALTER TABLE public.writetest OWNER TO writer",
            "GRANT SELECT ON public.writetest TO reader",
            "ALTER DEFAULT PRIVILEGES FOR ROLE writer IN SCHEMA public GRANT SELECT ON TABLES TO reader",
        ])
        .await;
    }
}

/// Waits until PostgreSQL accepts connections.
pub async fn wait_for_postgres_ready(database_url: &str, max_attempts: u32) -> Result<()> {
    let mut attempts = 0;
    while attempts < max_attempts {
        if let Ok(pool) = PgPool::connect(database_url).await {
            if sqlx::query("SELECT 1").fetch_one(&pool).await.is_ok() {
                pool.close().await;
                return Ok(());
            }
            pool.close().await;
        }
        attempts += 1;
        if attempts < max_attempts {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
    Err(DatastoreError::configuration(format!(
        "PostgreSQL failed to become ready after {} attempts",
        max_attempts
    )))
}

pub async fn table_exists(pool: &PgPool, table: &str) -> bool {
    sqlx::query_scalar::<_, i32>("SELECT 1 FROM pg_tables WHERE tablename = $1")
        .bind(table)
        .fetch_optional(pool)
        .await
        .unwrap()
        .is_some()
}

pub async fn row_count(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM public.{}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}
