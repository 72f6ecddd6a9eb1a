//! Shared PostgreSQL container for integration tests.
//!
//! One container is started per test binary; each test gets its own database in it.

use std::sync::OnceLock;

use postgres::{Client, NoTls};
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

/// Default credentials for testcontainers-modules postgres
const PG_USER: &str = "postgres";
const PG_PASSWORD: &str = "postgres";
const PG_DB: &str = "postgres";

/// Keeps the runtime alive for the whole test run; the container is leaked.
struct SharedContainer {
    _runtime: tokio::runtime::Runtime,
    port: u16,
}

static CONTAINER: OnceLock<SharedContainer> = OnceLock::new();

fn shared_container() -> &'static SharedContainer {
    CONTAINER.get_or_init(|| {
        let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
        let port = runtime.block_on(async {
            let container = Postgres::default()
                .start()
                .await
                .expect("failed to start postgres container");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("failed to get postgres port");
            std::mem::forget(container);
            port
        });
        SharedContainer {
            _runtime: runtime,
            port,
        }
    })
}

/// Connection URL for database `db` in the shared container.
pub(crate) fn url_with_db(db: &str) -> String {
    format!(
        "postgres://{}:{}@127.0.0.1:{}/{}",
        PG_USER,
        PG_PASSWORD,
        shared_container().port,
        db
    )
}

/// Create a database with a unique name and connect to it.
///
/// Returns the client and the database name, so a test can open more sessions on the
/// same database with [url_with_db].
pub(crate) fn fresh_postgres_db() -> (Client, String) {
    let mut admin =
        Client::connect(&url_with_db(PG_DB), NoTls).expect("failed to connect as admin");

    let db_name = format!("test_{}", Uuid::new_v4().simple());
    admin
        .batch_execute(&format!("CREATE DATABASE \"{}\"", db_name))
        .expect("failed to create test database");
    drop(admin);

    let client =
        Client::connect(&url_with_db(&db_name), NoTls).expect("failed to connect to test database");
    (client, db_name)
}

/// A client connected to a fresh, isolated database.
pub(crate) fn get_test_client() -> Client {
    let (client, _db_name) = fresh_postgres_db();
    client
}
