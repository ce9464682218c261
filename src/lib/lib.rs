pub mod admission;
pub mod capture;
pub mod checker;
pub mod config;
pub mod db;
pub mod flag;
pub mod inserter;
pub mod instance;
pub mod proxy;
pub mod runtime;
pub mod server;
pub mod submission;
pub mod sweeper;
pub mod types;
pub mod wh;

use color_eyre::Report;
use db::Db;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

// every request does a handful of short queries, waiting longer than this
// means the database is in trouble
const GET_TIMEOUT: Duration = Duration::from_millis(10_000);

const MAX_CONS: u32 = 50;

pub async fn db_connect(url: &str) -> Result<Db, Report> {
    Ok(Db::wrap(
        PgPoolOptions::new()
            .max_connections(MAX_CONS)
            .acquire_timeout(GET_TIMEOUT)
            .connect(url)
            .await?,
    ))
}
