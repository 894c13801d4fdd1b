use std::path::Path;
use std::process::Command;

use anyhow::Context as _;
use clap::Parser;

const EBPF_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../flowacct-ebpf");

#[derive(Parser)]
enum Cli {
    /// Build the cgroup_skb programs for bpfel-unknown-none.
    BuildEbpf {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build the programs first, then the userspace agent.
    Build {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything and run the agent with sudo.
    Run {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
        /// Extra arguments passed to the agent (e.g. --cgroup /sys/fs/cgroup/app).
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the report for maps pinned by a running agent.
    Report {
        /// Directory the agent pinned its maps in.
        #[arg(default_value = "/sys/fs/bpf/flowacct")]
        pin_dir: String,
        #[arg(long)]
        release: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli {
        Cli::BuildEbpf { release } => build_ebpf(release),
        Cli::Build { release } => {
            build_ebpf(release)?;
            build_userspace(release)
        }
        Cli::Run { release, args } => {
            build_ebpf(release)?;
            build_userspace(release)?;
            run(release, &args)
        }
        Cli::Report { pin_dir, release } => {
            anyhow::ensure!(
                Path::new(&pin_dir).is_dir(),
                "{pin_dir} does not exist; start the agent with --pin-dir first"
            );
            run(release, &["--report-pinned".to_string(), pin_dir])
        }
    }
}

fn build_ebpf(release: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(EBPF_DIR);
    cmd.args([
        "+nightly",
        "build",
        "--target",
        "bpfel-unknown-none",
        "-Z",
        "build-std=core",
    ]);
    if release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .context("failed to run cargo build for the cgroup_skb programs")?;
    anyhow::ensure!(status.success(), "eBPF build failed");
    Ok(())
}

fn build_userspace(release: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.args(["build", "--package", "flowacct"]);
    if release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .context("failed to run cargo build for flowacct")?;
    anyhow::ensure!(status.success(), "flowacct build failed");
    Ok(())
}

fn run(release: bool, extra_args: &[String]) -> anyhow::Result<()> {
    let profile = if release { "release" } else { "debug" };
    let bin = format!("target/{profile}/flowacct");
    anyhow::ensure!(
        Path::new(&bin).exists(),
        "{bin} not found; run `cargo xtask build` first"
    );

    let mut cmd = Command::new("sudo");
    cmd.arg(&bin);
    cmd.args(extra_args);
    let status = cmd.status().context("failed to run flowacct")?;
    anyhow::ensure!(status.success(), "flowacct exited with error");
    Ok(())
}
