use color_eyre::{eyre::eyre, Report};
use skansen::{
    checker::{self, FlagChecker},
    db::{MemoryStore, Store},
    db_connect,
    runtime::Runtimes,
    server::{self, AppState},
    sweeper,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::spawn;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Report> {
    color_eyre::install()?;

    // get config
    let args = argh::from_env::<skansen::config::Args>();
    let config = args.get_config()?;

    // setup logging
    args.setup_logging(&config.common)?;

    let store: Arc<dyn Store> = match &config.database {
        Some(database) => {
            let db = db_connect(&database.url()).await?;
            db.migrate().await?;
            info!("connected to {}", database.host);
            Arc::new(db)
        }
        None => {
            warn!("no database configured, everything is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let runtime = Runtimes::from_conf(&config.runtime)?;
    info!("using runtime {:?}", runtime);
    let runtime = runtime.into_dyn();

    let (state, queue) = AppState::new(&config, Arc::clone(&store), runtime);
    let addr: SocketAddr = config.server.listen.parse()?;

    let sweeper = spawn(sweeper::run(
        Arc::clone(&state.instances),
        Arc::clone(&state.admission),
        config.instances.sweep_interval(),
    ));

    let checker = spawn(checker::run(
        Arc::new(FlagChecker::new(Arc::clone(&store))),
        store,
        queue,
        config.submissions.checker_workers,
    ));

    let server = spawn(server::run(addr, state));

    tokio::select! {
        res = server => res??,
        res = sweeper => res?,
        res = checker => res?,
    }

    Err(eyre!("a background task exited"))
}
