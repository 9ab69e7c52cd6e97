pub mod commands;

use crate::capture::Destination;
use crate::config::{
    SniffConfig, DEFAULT_INTERFACE, DEFAULT_LOCAL_TCPDUMP_PATH, DEFAULT_NAMESPACE,
    DEFAULT_REMOTE_TCPDUMP_PATH,
};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "kubectl-sniff")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Perform network sniffing on a container running in a kubernetes cluster.",
    long_about = None
)]
#[command(after_help = "Example:\n  kubectl sniff hello-minikube-7c77b68cff-qbvsd -c hello-minikube")]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(help = "Pod to sniff on")]
    pub pod: String,

    #[arg(short, long, default_value = DEFAULT_NAMESPACE, help = "Kubernetes namespace")]
    pub namespace: String,

    #[arg(
        short,
        long,
        help = "Container to sniff on (defaults to the pod's first container)"
    )]
    pub container: Option<String>,

    #[arg(short, long, default_value = "", help = "tcpdump filter expression")]
    pub filter: String,

    #[arg(
        short = 'o',
        long = "output-file",
        visible_alias = "output_file",
        help = "Write the capture to this file instead of starting a viewer"
    )]
    pub output_file: Option<PathBuf>,

    #[arg(
        short = 'l',
        long = "local-tcpdump-path",
        visible_alias = "local_tcpdump_path",
        default_value = DEFAULT_LOCAL_TCPDUMP_PATH,
        help = "Local static tcpdump binary path"
    )]
    pub local_tcpdump_path: PathBuf,

    #[arg(
        short = 'r',
        long = "remote-tcpdump-path",
        visible_alias = "remote_tcpdump_path",
        default_value = DEFAULT_REMOTE_TCPDUMP_PATH,
        help = "Remote static tcpdump binary path"
    )]
    pub remote_tcpdump_path: String,

    #[arg(short, long, default_value = DEFAULT_INTERFACE, help = "Interface to capture on")]
    pub interface: String,

    #[arg(long, help = "Kubeconfig context to use")]
    pub context: Option<String>,

    #[arg(
        long,
        default_value_t = 30,
        help = "Seconds to wait while connecting to the container"
    )]
    pub connect_timeout: u64,

    #[arg(
        long,
        default_value = "wireshark -k -i -",
        help = "Viewer command fed the capture on stdin"
    )]
    pub viewer: String,
}

impl Cli {
    pub fn sniff_config(&self) -> SniffConfig {
        SniffConfig {
            local_binary_path: self.local_tcpdump_path.clone(),
            remote_binary_path: self.remote_tcpdump_path.clone(),
            filter: self.filter.clone(),
            interface: self.interface.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            viewer: self.viewer.split_whitespace().map(str::to_string).collect(),
        }
    }

    pub fn destination(&self, config: &SniffConfig) -> Destination {
        match &self.output_file {
            Some(path) => Destination::File(path.clone()),
            None => Destination::Viewer(config.viewer.clone()),
        }
    }
}
