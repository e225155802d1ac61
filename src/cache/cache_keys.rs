//! Cache key composition
//!
//! Keys are pure functions of their inputs, so two writers describing the
//! same table or row build textually identical keys and invalidate each
//! other's cached objects.

/// Key covering everything cached from one database
#[must_use]
pub fn database_key(database: &str) -> String {
    format!("DB-{database}")
}

/// Key covering everything cached from one table
#[must_use]
pub fn table_key(database: &str, table: &str) -> String {
    format!("{}-TBL-{table}", database_key(database))
}

/// Key covering one row (or row group) of a table
#[must_use]
pub fn row_key(database: &str, table: &str, key: &str) -> String {
    format!("{}-{key}", table_key(database, table))
}

#[must_use]
pub fn jobs_key() -> String {
    "JOBS".to_string()
}

#[must_use]
pub fn job_id_key(job_id: &str) -> String {
    format!("JOB_{job_id}")
}

#[must_use]
pub fn job_status_key() -> String {
    "JOBSTATUSES".to_string()
}

#[must_use]
pub fn repository_connections_key() -> String {
    "REPOSITORYCONNECTIONS".to_string()
}

#[must_use]
pub fn repository_connection_key(connection_name: &str) -> String {
    format!("REPOSITORYCONNECTION_{connection_name}")
}
