use anyhow::Context;
use clap::{App, Arg};
use std::path::Path;
use usbexecd::Daemon;

fn serve(path: &Path) -> anyhow::Result<()> {
    let mut daemon = Daemon::connect(path)
        .with_context(|| format!("failed to connect to control socket {}", path.display()))?;
    daemon.run().context("event loop failed")?;
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let matches = App::new("usbexecd")
        .about("multiplexes child process stdio over a local control socket")
        .arg(
            Arg::with_name("socket")
                .help("path of the control socket to connect to")
                .required(true)
                .index(1),
        )
        .get_matches();
    let path = matches.value_of_os("socket").expect("socket arg is required");

    // a clean RESET from the peer is the only zero exit
    if let Err(err) = serve(Path::new(path)) {
        tracing::error!("fatal: {:#}", err);
        std::process::exit(1);
    }
}
