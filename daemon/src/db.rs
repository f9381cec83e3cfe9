use diesel::connection::SimpleConnection;
use diesel::r2d2::{self, ConnectionManager, PooledConnection};
use diesel::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use pkgbuilderd_common::errors::*;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type Pool = r2d2::Pool<ConnectionManager<SqliteConnection>>;
pub type Connection = PooledConnection<ConnectionManager<SqliteConnection>>;

#[derive(Debug)]
struct ConnectionOptions;

impl r2d2::CustomizeConnection<SqliteConnection, r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        conn.batch_execute("PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;")
            .map_err(r2d2::Error::QueryError)
    }
}

pub fn setup_pool(url: &str) -> Result<Pool> {
    let mut builder = r2d2::Pool::builder()
        .connection_customizer(Box::new(ConnectionOptions));

    // every connection to :memory: is its own database
    if url == ":memory:" {
        builder = builder
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let manager = ConnectionManager::<SqliteConnection>::new(url);
    let pool = builder.build(manager)
        .context("Failed to create pool")?;

    let mut connection = pool.get()?;
    let connection: &mut SqliteConnection = &mut connection;
    let applied = connection.run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow!("Failed to run migrations: {}", err))?;
    for migration in applied {
        debug!("Applied migration: {}", migration);
    }

    Ok(pool)
}
