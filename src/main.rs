use std::sync::Arc;

use structopt::StructOpt;
use tracing::info;

use stager::buildah;
use stager::config::{Command, ImageOpts, Opts};
use stager::driver::{Driver, StagerService, DRIVER_NAME};
use stager::image::clock::SystemClock;
use stager::image::events::EventRecorder;
use stager::image::Stager;
use stager::mount::SystemMounter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
// Stamped by the release build via `STAGER_REVISION=$(git rev-parse HEAD)`.
const REVISION: &str = match option_env!("STAGER_REVISION") {
    Some(revision) => revision,
    None => "unknown",
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::from_args();

    match opts.command {
        Command::Version => {
            println!("version={} revision={}", VERSION, REVISION);
            Ok(())
        }
        Command::Image(ref image) => run_image_driver(&opts, image).await,
    }
}

async fn run_image_driver(opts: &Opts, image: &ImageOpts) -> anyhow::Result<()> {
    init_tracing(&opts.loglevel, opts.logpretty);
    info!(
        driver = DRIVER_NAME,
        version = VERSION,
        revision = REVISION,
        node_id = %opts.nodeid,
        "starting"
    );

    // A cluster connection is required for event publication; failing to
    // construct one at init is fatal.
    let client = kube_client(&opts.master_url, &opts.kubeconfig)
        .await
        .expect("can't construct Kubernetes client");
    let recorder = EventRecorder::new(client, DRIVER_NAME);

    let stager = Stager {
        buildah: buildah::Client {
            driver_name: DRIVER_NAME.to_owned(),
            exec_path: image.buildah_path.clone(),
            args: Vec::new(),
            timeout: image.buildah_timeout,
            gc_timeout: image.buildah_gc_timeout,
        },
        mounter: Arc::new(SystemMounter),
        gc_period: image.buildah_gc_period,
        recorder: Some(recorder),
    };

    let service = StagerService::new(
        opts.nodeid.as_str(),
        VERSION,
        image.default_stage_in_image.as_str(),
        Arc::new(SystemClock),
        stager,
    );
    Driver::new(opts.endpoint.as_str(), service)
        .serve(shutdown_signal())
        .await
}

/// Resolves on SIGINT or SIGTERM, starting the graceful server drain.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("can't install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("can't install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received. stopping driver gracefully"),
        _ = sigterm.recv() => info!("SIGTERM received. stopping driver gracefully"),
    }
}

fn init_tracing(loglevel: &str, pretty: bool) {
    let filter = match tracing_subscriber::EnvFilter::try_new(loglevel) {
        Ok(filter) => filter,
        Err(error) => {
            eprintln!("can't parse loglevel {:?}: {}", loglevel, error);
            std::process::exit(1);
        }
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if pretty {
        builder.init();
    } else {
        builder.json().init();
    }
}

async fn kube_client(master_url: &str, kubeconfig: &str) -> anyhow::Result<kube::Client> {
    let mut config = if kubeconfig.is_empty() {
        kube::Config::infer().await?
    } else {
        let kubeconfig = kube::config::Kubeconfig::read_from(kubeconfig)?;
        kube::Config::from_custom_kubeconfig(
            kubeconfig,
            &kube::config::KubeConfigOptions::default(),
        )
        .await?
    };
    if !master_url.is_empty() {
        config.cluster_url = master_url.parse()?;
    }
    Ok(kube::Client::try_from(config)?)
}
