//! Command line surface for the stager driver binary. Only compiled with
//! the `cli` feature so library consumers don't drag in the flag parser.

use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "csi-image-stager",
    about = "CSI driver performing stage-in/stage-out of container images"
)]
pub struct Opts {
    #[structopt(
        long = "logpretty",
        global = true,
        help = "Sets pretty (human-readable) logging instead of JSON"
    )]
    pub logpretty: bool,

    #[structopt(
        long = "loglevel",
        default_value = "info",
        global = true,
        help = "Sets the log level"
    )]
    pub loglevel: String,

    #[structopt(
        long = "endpoint",
        default_value = "unix:///tmp/csi.sock",
        global = true,
        help = "CSI endpoint to listen on"
    )]
    pub endpoint: String,

    #[structopt(
        long = "nodeid",
        default_value = "",
        global = true,
        help = "Node id reported over the CSI identity service"
    )]
    pub nodeid: String,

    #[structopt(
        long = "masterURL",
        default_value = "",
        global = true,
        help = "Kubernetes API server URL, overriding the kubeconfig"
    )]
    pub master_url: String,

    #[structopt(
        long = "kubeconfig",
        default_value = "",
        global = true,
        help = "Path to a kubeconfig; inferred (in-cluster or $KUBECONFIG) when empty"
    )]
    pub kubeconfig: String,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Start the container image CSI driver
    #[structopt(name = "image")]
    Image(ImageOpts),

    /// Print version information
    #[structopt(name = "version")]
    Version,
}

#[derive(Debug, StructOpt)]
pub struct ImageOpts {
    #[structopt(
        long = "defaultStageInImage",
        default_value = "busybox:latest",
        help = "Image staged in when the volume context does not name one"
    )]
    pub default_stage_in_image: String,

    #[structopt(
        long = "buildahPath",
        default_value = "/bin/buildah",
        help = "buildah binary path"
    )]
    pub buildah_path: PathBuf,

    #[structopt(
        long = "buildahTimeout",
        default_value = "10m",
        parse(try_from_str = humantime::parse_duration),
        help = "Timeout to execute buildah commands; 0s disables the deadline"
    )]
    pub buildah_timeout: Duration,

    #[structopt(
        long = "buildahGcTimeout",
        default_value = "60m",
        parse(try_from_str = humantime::parse_duration),
        help = "Timeout to execute the buildah gc command"
    )]
    pub buildah_gc_timeout: Duration,

    #[structopt(
        long = "buildahGcPeriod",
        default_value = "24h",
        parse(try_from_str = humantime::parse_duration),
        help = "Period between buildah gc runs; 0s disables collection"
    )]
    pub buildah_gc_period: Duration,
}
