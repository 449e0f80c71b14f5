use rand::Rng;

use chronicle::env::Environment;
use chronicle_postgres::{Datastore, Settings};

/// Connects to the database configured through the `POSTGRES_*`
/// environment variables, or returns `None` so the test can skip when
/// no database is available.
pub async fn connect() -> Option<Datastore> {
    let environment = Environment::from_os();

    let Ok(settings) = Settings::from_env(&environment) else {
        eprintln!("skipping: POSTGRES_DBNAME, POSTGRES_USER and POSTGRES_PASSWORD are not set");
        return None;
    };

    Some(
        Datastore::connect(settings)
            .await
            .expect("connection to the database should work"),
    )
}

/// Returns a fresh table name so concurrent test runs do not interfere.
pub fn random_table(prefix: &str) -> String {
    format!("{prefix}_{}", rand::thread_rng().gen_range(0..u32::MAX))
}
