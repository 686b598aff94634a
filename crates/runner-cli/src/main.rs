mod shutdown;

use runner_config::{EnvConfig, IdentityStore};
use runner_core::Runner;

use crate::shutdown::wait_for_shutdown_signal;

fn init_tracing(debug_logging: bool) {
    let default_filter = if debug_logging { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = EnvConfig::from_env()?;
    init_tracing(env.debug_logging);

    let identity_store = IdentityStore::next_to_binary()?;
    let runner = Runner::bootstrap(env, identity_store).await?;

    let cancel = runner.cancellation_token();
    tokio::spawn(wait_for_shutdown_signal(cancel));

    runner.run().await;
    Ok(())
}
