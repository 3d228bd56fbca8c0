use clap::Parser;
use std::path::PathBuf;

/// Tags images from ECR used by Pods in the cluster.
///
/// Adds a given tag, or a tag that starts with a given prefix followed by the current unix
/// timestamp, to all ECR images used by Pods in the Kubernetes cluster.
#[derive(Debug, Default, Parser)]
#[command(name = "kube-ecr-tagger")]
#[command(version)]
pub struct Cli {
    /// Image tag to apply. Same as --tag
    #[arg(value_name = "TAG")]
    pub positional_tag: Option<String>,

    /// Image tag to apply. Takes precedence over --tag-prefix
    #[arg(long)]
    pub tag: Option<String>,

    /// Prefix of a tag formed as <prefix><unix timestamp>
    #[arg(long)]
    pub tag_prefix: Option<String>,

    /// Namespace from which pods are watched. Defaults to all namespaces
    #[arg(long)]
    pub namespace: Option<String>,

    /// Path to a kubeconfig file. Defaults to $HOME/.kube/config, falling back to the
    /// in-cluster service account
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Path to a YAML configuration file
    #[arg(long, env = "KUBE_ECR_TAGGER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Seconds between re-deliveries of all cached pods
    #[arg(long, value_name = "SECONDS")]
    pub resync_interval: Option<u64>,

    /// Seconds to wait for the initial pod cache sync
    #[arg(long, value_name = "SECONDS")]
    pub sync_timeout: Option<u64>,

    /// Also check images whose pod spec tag already matches the target tag
    #[arg(long)]
    pub no_skip_current_tag: bool,

    /// Port of the health probe webserver
    #[arg(long)]
    pub port: Option<u16>,
}

impl Cli {
    /// The fixed tag from either the positional argument or --tag. Empty values are ignored.
    pub fn fixed_tag(&self) -> Option<&str> {
        non_empty(&self.positional_tag).or(non_empty(&self.tag))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
