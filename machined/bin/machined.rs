use clap::Parser;
use machined::{cli::MachinedArgs, management::Daemon};
use tracing_subscriber::EnvFilter;

//--------------------------------------------------------------------------------------------------
// Main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let args = MachinedArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_level)),
        )
        .init();

    let daemon = match Daemon::new().await {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize daemon");
            std::process::exit(1);
        }
    };

    if let Err(e) = daemon.run().await {
        tracing::error!(error = %e, "daemon exited with error");
        std::process::exit(1);
    }
}
