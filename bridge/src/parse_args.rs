use std::net::SocketAddr;
use std::path::PathBuf;

use ssilink::{Duplex, LengthWidth, LinkConfig, OverflowPolicy};

use crate::server::ServerTarget;

/// Wildcard vsock CID.
const VMADDR_CID_ANY: u32 = u32::MAX;

const HELP: &str = "\
ssilink bridge - exposes a streaming serial link over a socket

The link is backed by a simulated MCU that echoes what it receives.

USAGE:
  bridge [OPTIONS]

OPTIONS:
  -h, --help              Prints help information
  --unix <path>           Listen on a Unix socket (default: /tmp/ssilink.sock)
  --tcp <addr:port>       Listen on TCP instead
  --vsock <port>          Listen on vsock (any CID) instead
  --one-byte-length       Use 1-byte length fields (254-byte frames)
  --half-duplex           No inbound payload during transmit frames
  --reject-overflow       Fail writes that do not fit instead of truncating
  --no-echo               The simulated MCU swallows written bytes
  -v, --verbose           Debug logging
  -vv, --trace            Trace logging, including frame dumps
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    #[default]
    Quiet,
    Verbose,
    Trace,
}

impl Verbosity {
    pub fn filter(self) -> &'static str {
        match self {
            Verbosity::Quiet => "info",
            Verbosity::Verbose => "debug",
            Verbosity::Trace => "trace",
        }
    }
}

#[derive(Debug)]
pub struct AppArgs {
    pub target: ServerTarget,
    pub config: LinkConfig,
    pub echo: bool,
    pub verbosity: Verbosity,
}

pub fn parse_args() -> Result<AppArgs, pico_args::Error> {
    let mut pargs = pico_args::Arguments::from_env();

    if pargs.contains(["-h", "--help"]) {
        print!("{}", HELP);
        std::process::exit(0);
    }

    let verbosity = if pargs.contains("--trace") || pargs.contains("-vv") {
        Verbosity::Trace
    } else if pargs.contains(["-v", "--verbose"]) {
        Verbosity::Verbose
    } else {
        Verbosity::Quiet
    };

    let unix: Option<PathBuf> = pargs.opt_value_from_str("--unix")?;
    let tcp: Option<SocketAddr> = pargs.opt_value_from_str("--tcp")?;
    let vsock: Option<u32> = pargs.opt_value_from_str("--vsock")?;

    let target = match (tcp, vsock) {
        (Some(addr), _) => ServerTarget::Tcp(addr),
        (None, Some(port)) => ServerTarget::Vsock {
            cid: VMADDR_CID_ANY,
            port,
        },
        (None, None) => {
            ServerTarget::Unix(unix.unwrap_or_else(|| PathBuf::from("/tmp/ssilink.sock")))
        }
    };

    let mut config = LinkConfig::new();
    if pargs.contains("--one-byte-length") {
        config = config.with_length_width(LengthWidth::One);
    }
    if pargs.contains("--half-duplex") {
        config = config.with_duplex(Duplex::Half);
    }
    if pargs.contains("--reject-overflow") {
        config = config.with_write_overflow(OverflowPolicy::Reject);
    }

    let args = AppArgs {
        target,
        config,
        echo: !pargs.contains("--no-echo"),
        verbosity,
    };

    let remaining = pargs.finish();
    if !remaining.is_empty() {
        eprintln!("Warning: unused arguments left: {:?}.", remaining);
    }

    Ok(args)
}
