//! `backline`: the initiator. Accepts local HTTP CONNECT clients and relays
//! their streams over a single reconnecting link to a `frontline` process.

use argh::FromArgs;
use tracing::{Instrument, Level};
use tracing_subscriber::FmtSubscriber;
use tunnel::Timings;

/// backline — accepts local CONNECT clients, tunnels them to a frontline
#[derive(FromArgs)]
struct Args {
    /// frontline host:port to dial
    #[argh(positional)]
    frontline: String,

    /// local address to listen on for CONNECT clients (default :8443)
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
    let span = tracing::info_span!("backline", pid, role = "backline");
    if let Err(e) = tunnel::run_initiator(args.frontline, args.listen, Timings::default())
        .instrument(span)
        .await
    {
        tracing::error!(pid, role = "backline", error = %e, "exiting");
        std::process::exit(1);
    }
}
