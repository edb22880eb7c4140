use std::path::{Path, PathBuf};
use std::process::Command;
use std::{env, fs};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const BINARY: &str = "lockwatch";
const EBPF_CRATE: &str = "lockwatch-ebpf";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build and package lockwatch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build only the eBPF object (nightly + bpf-linker)
    BuildEbpf {
        /// BPF target, derived from the host endianness by default
        #[arg(long)]
        bpf_target: Option<String>,
    },

    /// Build the complete binary (eBPF + userspace)
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Target triple for cross-compilation (e.g. aarch64-unknown-linux-gnu)
        #[arg(long)]
        target: Option<String>,
    },

    /// Package binary for distribution
    Package {
        /// Target triple
        #[arg(long)]
        target: Option<String>,

        /// Output directory
        #[arg(long, default_value = "dist")]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::BuildEbpf { bpf_target } => {
            let object = build_ebpf(bpf_target.as_deref())?;
            println!("✅ eBPF object: {}", object.display());
            println!("   Reuse with: LOCKWATCH_EBPF_OBJECT={}", object.display());
        }
        Commands::Build { release, target } => {
            build(release, target.as_deref())?;
        }
        Commands::Package { target, output } => {
            package(target.as_deref(), &output)?;
        }
    }

    Ok(())
}

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn default_bpf_target() -> &'static str {
    if cfg!(target_endian = "big") {
        "bpfeb-unknown-none"
    } else {
        "bpfel-unknown-none"
    }
}

fn build_ebpf(bpf_target: Option<&str>) -> Result<PathBuf> {
    let root = project_root();
    let bpf_target = bpf_target.unwrap_or(default_bpf_target());

    if which::which("bpf-linker").is_err() {
        bail!(
            "bpf-linker not found.\n\
             Install with: cargo install bpf-linker"
        );
    }

    println!("🔨 Building {} for {}...", EBPF_CRATE, bpf_target);

    let status = Command::new("cargo")
        .current_dir(root.join(EBPF_CRATE))
        .env("RUSTUP_TOOLCHAIN", "nightly")
        .args([
            "build",
            "--release",
            &format!("--target={}", bpf_target),
            "-Z",
            "build-std=core",
        ])
        .status()
        .context("Failed to run cargo build for eBPF")?;

    if !status.success() {
        bail!("eBPF build failed");
    }

    let object = root
        .join("target")
        .join(bpf_target)
        .join("release")
        .join(BINARY);
    if !object.exists() {
        bail!("eBPF object not found at: {}", object.display());
    }
    Ok(object)
}

fn binary_path(release: bool, target: Option<&str>) -> PathBuf {
    let profile = if release { "release" } else { "debug" };
    let mut path = project_root().join("target");
    if let Some(t) = target {
        path.push(t);
    }
    path.join(profile).join(BINARY)
}

fn build(release: bool, target: Option<&str>) -> Result<()> {
    let root = project_root();

    // Build the object here so a failure is reported instead of the
    // build script silently embedding an empty placeholder.
    let object = build_ebpf(None)?;

    println!("🔨 Building {}...", BINARY);

    // Cross-compiling to Linux from another OS needs `cross`.
    let is_cross_compile = target
        .map(|t| t.contains("linux"))
        .unwrap_or(false) && !cfg!(target_os = "linux");

    let build_cmd = if is_cross_compile {
        if which::which("cross").is_ok() {
            println!("   Using 'cross' for cross-compilation");
            "cross"
        } else {
            bail!(
                "Cross-compilation to Linux requires 'cross' tool.\n\
                 Install with: cargo install cross\n\
                 Also requires Docker to be running."
            );
        }
    } else {
        "cargo"
    };

    let mut cmd = Command::new(build_cmd);
    cmd.current_dir(&root);
    cmd.env("LOCKWATCH_EBPF_OBJECT", &object);
    cmd.arg("build");

    if release {
        cmd.arg("--release");
    }

    if let Some(t) = target {
        cmd.arg("--target").arg(t);
        println!("   Target: {}", t);
    }

    cmd.arg("-p").arg(BINARY);

    let status = cmd.status().context("Failed to run cargo build")?;

    if !status.success() {
        bail!("Build failed");
    }

    println!("✅ Build complete: {}", binary_path(release, target).display());

    Ok(())
}

fn package(target: Option<&str>, output_dir: &str) -> Result<()> {
    build(true, target)?;

    let root = project_root();
    let output_path = root.join(output_dir);

    fs::create_dir_all(&output_path).context("Failed to create output directory")?;

    let binary = binary_path(true, target);
    if !binary.exists() {
        bail!("Binary not found at: {}", binary.display());
    }

    let arch = target.unwrap_or(std::env::consts::ARCH);
    let version = env!("CARGO_PKG_VERSION");
    let package_name = format!("{}-{}-{}", BINARY, version, arch);

    let package_dir = output_path.join(&package_name);
    fs::create_dir_all(&package_dir)?;

    fs::copy(&binary, package_dir.join(BINARY))?;

    let env_example = root.join("example.env");
    if env_example.exists() {
        fs::copy(&env_example, package_dir.join("lockwatch.env.example"))?;
    }

    let install_script = r#"#!/bin/bash
set -e

INSTALL_DIR="${INSTALL_DIR:-/usr/local/bin}"
CONFIG_DIR="${CONFIG_DIR:-/etc/lockwatch}"

echo "Installing lockwatch..."

sudo install -m 755 lockwatch "$INSTALL_DIR/lockwatch"

sudo mkdir -p "$CONFIG_DIR"
if [ -f lockwatch.env.example ]; then
    sudo cp lockwatch.env.example "$CONFIG_DIR/lockwatch.env.example"
    if [ ! -f "$CONFIG_DIR/lockwatch.env" ]; then
        sudo cp lockwatch.env.example "$CONFIG_DIR/lockwatch.env"
    fi
fi

echo "✅ Installed to $INSTALL_DIR/lockwatch"
echo "Run with: sudo $INSTALL_DIR/lockwatch run"
"#;

    fs::write(package_dir.join("install.sh"), install_script)?;

    let tarball = output_path.join(format!("{}.tar.gz", package_name));

    let status = Command::new("tar")
        .current_dir(&output_path)
        .args(["-czf", &tarball.to_string_lossy(), &package_name])
        .status()
        .context("Failed to create tarball")?;

    if !status.success() {
        bail!("Failed to create tarball");
    }

    fs::remove_dir_all(&package_dir)?;

    println!("✅ Package created: {}", tarball.display());

    Ok(())
}
