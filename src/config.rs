use std::env::{self, VarError};

use rearch::{CData, CapsuleHandle, Container};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DbConn, DbErr, Schema};
use tracing::{info, instrument, warn};
use url::Url;

use crate::orm::short_url;

/// # Errors
/// Will return [`Err`] if the connection to the database fails
/// or the `urls` table cannot be created.
#[instrument]
pub async fn init_container() -> anyhow::Result<Container> {
    info!("Initializing container");
    let container = Container::new();

    let (db_connection_options, set_db_conn) =
        container.read((db_connection_options_capsule, db_conn_init_action));

    info!(?db_connection_options, "Connecting to database");
    set_db_conn(connect_database(db_connection_options).await?);

    info!("Container initialized");
    Ok(container)
}

/// Connects to the database and makes sure the `urls` table exists.
///
/// # Errors
/// Will return [`Err`] if the connection or the table creation fails.
pub async fn connect_database(options: ConnectOptions) -> Result<DbConn, DbErr> {
    let db = Database::connect(options).await?;

    let mut create_table =
        Schema::new(db.get_database_backend()).create_table_from_entity(short_url::Entity);
    create_table.if_not_exists();
    db.execute(&create_table).await?;

    Ok(db)
}

#[must_use]
pub fn db_connection_options_capsule(_: CapsuleHandle) -> ConnectOptions {
    const ENV_VAR_NAME: &str = "DB_URL";
    const DEFAULT_DB_URL: &str = "sqlite://urls.db?mode=rwc";

    env_var_or_default(ENV_VAR_NAME, DEFAULT_DB_URL).into()
}

fn db_conn_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (Option<DbConn>, impl use<> + CData + Fn(Option<DbConn>)) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn db_conn_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(DbConn) {
    let set_db_conn = get.as_ref(db_conn_manager).1.clone();
    move |db| set_db_conn(Some(db))
}

/// # Panics
/// Panics when the [`DbConn`] was not set via [`db_conn_init_action`].
pub fn db_conn_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> DbConn {
    let db_conn = get.as_ref(db_conn_manager).0.clone();
    db_conn.expect("DbConn should've been set via db_conn_init_action!")
}

/// # Panics
/// Panics when environment variable is invalid.
pub fn addr_capsule(_: CapsuleHandle) -> String {
    const ENV_VAR_NAME: &str = "ADDR";
    const DEFAULT_ADDR: &str = "127.0.0.1:0";

    env_var_or_default(ENV_VAR_NAME, DEFAULT_ADDR)
}

/// The public address that short codes are appended to when handing
/// short URLs back to clients.
///
/// # Panics
/// Panics when environment variable is invalid or is not an absolute URL.
pub fn base_url_capsule(_: CapsuleHandle) -> Url {
    const ENV_VAR_NAME: &str = "BASE_URL";
    const DEFAULT_BASE_URL: &str = "http://localhost/";

    let base_url = env_var_or_default(ENV_VAR_NAME, DEFAULT_BASE_URL);
    Url::parse(&base_url).unwrap_or_else(|err| {
        panic!("{ENV_VAR_NAME} environment variable is not a valid URL ({base_url}): {err}")
    })
}

fn env_var_or_default(env_var_name: &str, default: &str) -> String {
    match env::var(env_var_name) {
        Ok(value) => {
            info!(value, "{env_var_name} environment variable set");
            value
        }
        Err(VarError::NotPresent) => {
            warn!(
                value = default,
                "{env_var_name} environment variable not set; defaulting to {default}"
            );
            default.to_owned()
        }
        Err(VarError::NotUnicode(actual)) => {
            panic!(
                "{env_var_name} environment variable is invalid: {}",
                actual.display()
            );
        }
    }
}

/// A fresh, private SQLite database with the `urls` table in place.
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) async fn in_memory_db() -> DbConn {
    let mut options = ConnectOptions::new("sqlite::memory:");
    // NOTE: every pooled connection would otherwise get its own empty database
    options.max_connections(1).min_connections(1);
    connect_database(options).await.unwrap()
}

/// A SQLite database file in a fresh temporary directory, opened with the
/// default multi-connection pool; the directory lives as long as the guard.
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) async fn file_backed_db() -> (tempfile::TempDir, DbConn) {
    let dir = tempfile::tempdir().unwrap();
    let db_url = format!("sqlite://{}?mode=rwc", dir.path().join("urls.db").display());
    let db = connect_database(ConnectOptions::new(db_url)).await.unwrap();
    (dir, db)
}
