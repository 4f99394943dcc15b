//! `frontline`: the acceptor. Listens for a `backline` link and dials the
//! upstream targets it requests — the only party that needs outbound
//! reachability to those destinations.

use argh::FromArgs;
use tracing::{Instrument, Level};
use tracing_subscriber::FmtSubscriber;
use tunnel::Timings;

/// frontline — accepts a backline link and dials its requested targets
#[derive(FromArgs)]
struct Args {
    /// address to listen on for the backline link (default :8443)
    #[argh(positional, default = "String::from(\":8443\")")]
    listen: String,
}

#[tokio::main]
async fn main() {
    let args: Args = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let pid = std::process::id();
    // Every event logged beneath this span carries `pid`/`role` fields, the
    // `tracing` analogue of the source's literal `[pid <role>] ` log prefix.
    let span = tracing::info_span!("frontline", pid, role = "frontline");
    if let Err(e) = tunnel::run_acceptor(args.listen, Timings::default())
        .instrument(span)
        .await
    {
        tracing::error!(pid, role = "frontline", error = %e, "exiting");
        std::process::exit(1);
    }
}
