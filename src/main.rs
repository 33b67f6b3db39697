//! `hostagentd`: bind the listener, wire up logging, and serve controllers
//! until a term signal asks us to stop.

mod call;
mod consts;
mod dynlink;
mod logging;
mod memory;
mod protocol;
mod server;
mod session;
mod signals;
mod spawn;
mod tty;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::consts::DEFAULT_PORT;
use crate::logging::Sink;

/// hostagentd: a trusted in-process remote agent. Accepts connections from
/// a controller and lets it spawn processes, load libraries, invoke
/// function pointers, and read/write this process's own memory. No
/// authentication: only run this behind a transport you already trust.
#[derive(Parser, Debug)]
#[clap(version, author, about)]
struct Args {
    /// TCP port to listen on.
    #[clap(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// log sink, may be given more than once: stdout, syslog, or file:<path>
    #[clap(short = 'o', long = "output", action = clap::ArgAction::Append)]
    output: Vec<Sink>,

    /// show more in logs; may be provided multiple times
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logging::init(&args.output, args.verbose).context("initializing logging")?;

    signals::Handler::new().context("installing signal handlers")?.spawn()?;

    let listener = server::bind(args.port).context("binding listener")?;
    info!(port = args.port, "hostagentd starting");

    server::serve(listener)
}
