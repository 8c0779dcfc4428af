mod aggregate;
mod cache_set;
mod cli;
mod ledger;
mod logging;
mod metrics;
mod oracle;
mod run;
mod storage;
mod sync;
#[cfg(test)]
mod test_utils;
mod window;

use cli::{Command, ServiceConfig};
use eyre::Result;
use run::ServiceContext;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::from_args();
    let guards = logging::init_tracing(&config);

    let result = run_command(&config).await;
    guards.finish();
    result
}

async fn run_command(config: &ServiceConfig) -> Result<()> {
    let ctx = ServiceContext::open(config)?;
    match config.command.clone().unwrap_or(Command::Run) {
        Command::Run => {
            info!(
                data_dir = %config.data_dir.display(),
                oracle = %config.oracle_url,
                "starting cache-set aggregation service"
            );
            run::run_service(&ctx).await
        }
        Command::CreateSet(args) => run::handle_create_set(&ctx, &args).await.map(|_| ()),
        Command::UpdateSet(args) => run::handle_update_set(&ctx, &args).await,
        Command::DeactivateSet(args) => run::handle_deactivate_set(&ctx, &args),
        Command::ListSets(args) => run::handle_list_sets(&ctx, &args),
        Command::Backfill(args) => run::handle_backfill(&ctx, &args).await.map(|_| ()),
        Command::Ledger(args) => run::handle_ledger(&ctx, &args),
    }
}
