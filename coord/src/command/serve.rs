use std::net::SocketAddr;

use axum_server::Server;
use clap::Parser;
use tracing::info;

use crate::command::common::{StoreArgs, open_state};
use crate::core::routes::router;

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
}

pub async fn serve(serve_args: ServeArgs) -> anyhow::Result<()> {
    let state = open_state(&serve_args.store)?;

    let app = router(state.clone());
    let server = Server::bind(serve_args.listen).serve(app.into_make_service());

    info!("listening on {}", serve_args.listen);

    tokio::select! {
        res = server => { res?; }
        _ = tokio::signal::ctrl_c() => {}
    }

    // last word on disk
    tokio::task::spawn_blocking(move || state.persist()).await??;
    Ok(())
}
