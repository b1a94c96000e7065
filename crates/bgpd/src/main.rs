use std::path::PathBuf;

use bgp_core::config::SpeakerConfig;
use bgp_core::logging::{setup_tracing, LoggingOutput};
use bgp_core::Instance;
use clap::{Parser, ValueEnum};
use ipnet::{Ipv4Net, Ipv6Net};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Family {
    Ipv4,
    Ipv6,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Arg {
    #[arg(short, long, help = "Path to the speaker's YAML config", default_value = "/etc/bgpd/bgpd.yaml")]
    config: PathBuf,

    // One TCP listener per process, so one Instance per address family: a
    // single session carrying both AFIs via MP-BGP would need a shared
    // listener below two independently-monomorphized pipelines, which this
    // core does not attempt.
    #[arg(short, long, value_enum, default_value_t = Family::Ipv4, help = "Address family this process serves")]
    family: Family,

    #[arg(short, long, help = "Log to a rolling file under this directory instead of stdout")]
    log_dir: Option<String>,

    #[arg(short, long, help = "Log to syslog instead of stdout")]
    syslog: bool,
}

fn logging_output(arg: &Arg) -> LoggingOutput {
    if arg.syslog {
        LoggingOutput::Syslog { ident: "bgpd".to_string() }
    } else if let Some(directory) = &arg.log_dir {
        LoggingOutput::File { directory: directory.clone(), file_name_prefix: "bgpd".to_string() }
    } else {
        LoggingOutput::Stdout
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let arg = Arg::parse();
    let _guard = setup_tracing(logging_output(&arg));

    let text = std::fs::read_to_string(&arg.config)
        .map_err(|e| anyhow::anyhow!("reading {}: {}", arg.config.display(), e))?;
    let config = SpeakerConfig::from_yaml(&text)?;

    tracing::info!(asn = config.asn, router_id = %config.router_id, peers = config.peers.len(), family = ?arg.family, "bgpd starting");

    match arg.family {
        Family::Ipv4 => Instance::<Ipv4Net>::new(&config).event_loop().await,
        Family::Ipv6 => Instance::<Ipv6Net>::new(&config).event_loop().await,
    }

    Ok(())
}
