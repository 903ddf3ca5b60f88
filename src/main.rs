use punishment_warden::clock::SystemClock;
use punishment_warden::logging;
use punishment_warden::punishment::{Notification, store};
use punishment_warden::{Config, Error, Warden};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Run a single node until interrupted
async fn async_main() -> Result<(), Error> {
    let config = Config::load().await?;
    logging::init(&config.logging)?;

    let store = store::connect(&config.database).await?;
    // Cross-node sync needs a deployment-specific transport; a lone node runs without one
    let warden = Warden::start(&config, store, None, Arc::new(SystemClock));

    let mut notifications = warden.manager().subscribe();
    let kicks = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(Notification::Kick(kick)) => logging::log_console(format!(
                    "Kick {} for {}: {}",
                    kick.id, kick.target, kick.reason
                )),
                Ok(Notification::Lifecycle(_)) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Notification listener lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("Punishment warden running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    warden.shutdown().await;
    kicks.abort();
    Ok(())
}

fn main() {
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::from)
        .and_then(|runtime| runtime.block_on(async_main()));

    if let Err(err) = result {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
