use anyhow::Context;
use cgwarden::{
    hierarchy, mount::OsFs, CgroupVersion, CompositeRunnable, DeviceRule, PollingService, Settings,
    SharesBalancer, Starter, SysinfoMemoryProvider,
};
use clap::Parser;
use std::{fs::File, path::PathBuf, sync::Arc, time::Duration};

#[derive(Parser, Debug)]
#[clap(name = "cgwarden", about = "CPU resource-control plane for a container backend")]
struct Opts {
    /// Root of the cgroup filesystem (defaults to /sys/fs/cgroup or
    /// $CGWARDEN_CGROUPFS)
    #[clap(long)]
    cgroup_root: Option<PathBuf>,

    /// Name of the working cgroup directory
    #[clap(long, default_value = "warden")]
    warden_cgroup: String,

    /// enabled, disabled or delegated
    #[clap(long, default_value = "enabled")]
    throttling: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Mount and initialize the cgroup hierarchy
    Setup {
        /// Chown created cgroups to this uid (rootless operation)
        #[clap(long)]
        uid: Option<u32>,

        /// Chown created cgroups to this gid
        #[clap(long)]
        gid: Option<u32>,
    },
    /// Periodically rebalance the good/bad CPU share budget
    Balance {
        /// Seconds between balancing cycles
        #[clap(long, default_value = "10")]
        interval_secs: u64,

        /// Scale factor applied to the bad cgroup's share budget
        #[clap(long, default_value = "1.0")]
        multiplier: f64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();

    let mut settings = Settings::default();
    if let Some(root) = opts.cgroup_root {
        settings.cgroup_root = root;
    }
    settings.warden_cgroup = opts.warden_cgroup.clone();
    settings.throttling = opts.throttling.parse().map_err(anyhow::Error::msg)?;

    let version = CgroupVersion::detect(&settings.cgroup_root);
    tracing::info!(?version, root = %settings.cgroup_root.display(), "detected cgroup hierarchy");

    match opts.command {
        Command::Setup { uid, gid } => setup(settings, version, uid, gid),
        Command::Balance {
            interval_secs,
            multiplier,
        } => balance(settings, version, interval_secs, multiplier),
    }
}

fn setup(
    mut settings: Settings,
    version: CgroupVersion,
    uid: Option<u32>,
    gid: Option<u32>,
) -> anyhow::Result<()> {
    if let (Some(uid), Some(gid)) = (uid, gid) {
        settings.owner = Some((uid, gid));
    }

    let proc_cgroups = File::open("/proc/cgroups").context("opening /proc/cgroups")?;
    let proc_self_cgroup =
        File::open("/proc/self/cgroup").context("opening /proc/self/cgroup")?;

    Starter::new(
        &settings,
        version,
        Box::new(proc_cgroups),
        Box::new(proc_self_cgroup),
        default_device_rules(),
        Box::new(OsFs),
    )
    .start()
    .context("bootstrapping the cgroup hierarchy")?;

    tracing::info!("cgroup hierarchy ready");
    Ok(())
}

fn balance(
    settings: Settings,
    version: CgroupVersion,
    interval_secs: u64,
    multiplier: f64,
) -> anyhow::Result<()> {
    let cpu_cgroup_path = hierarchy::cpu_cgroup_path(&settings, version)
        .context("resolving the warden CPU cgroup path")?;
    tracing::info!(path = %cpu_cgroup_path.display(), "balancing shares under warden CPU cgroup");

    let balancer = SharesBalancer::new(
        &cpu_cgroup_path,
        SysinfoMemoryProvider,
        multiplier,
        version,
    );
    let composite = CompositeRunnable::new(vec![Box::new(balancer)]);
    let ticker = crossbeam_channel::tick(Duration::from_secs(interval_secs));

    let mut service = PollingService::new(Arc::new(composite), ticker);
    service.start();

    loop {
        std::thread::park();
    }
}

/// The standard container device whitelist: basic character devices
/// every container needs, everything else denied.
fn default_device_rules() -> Vec<DeviceRule> {
    vec![
        DeviceRule::char_device(Some(1), Some(3), "rwm"),   // /dev/null
        DeviceRule::char_device(Some(1), Some(5), "rwm"),   // /dev/zero
        DeviceRule::char_device(Some(1), Some(7), "rwm"),   // /dev/full
        DeviceRule::char_device(Some(1), Some(8), "rwm"),   // /dev/random
        DeviceRule::char_device(Some(1), Some(9), "rwm"),   // /dev/urandom
        DeviceRule::char_device(Some(5), Some(0), "rwm"),   // /dev/tty
        DeviceRule::char_device(Some(5), Some(1), "rwm"),   // /dev/console
        DeviceRule::char_device(Some(5), Some(2), "rwm"),   // /dev/ptmx
        DeviceRule::char_device(Some(136), None, "rwm"),    // /dev/pts/*
    ]
}
