use std::{
    env,
    path::{Path, PathBuf},
    process::Command,
};

const EBPF_CRATE_DIR: &str = "../lockwatch-ebpf";
const OBJECT_NAME: &str = "lockwatch";

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let out_file = out_dir.join(OBJECT_NAME);

    println!("cargo:rerun-if-changed={}/src", EBPF_CRATE_DIR);
    println!("cargo:rerun-if-changed=../lockwatch-common/src");
    println!("cargo:rerun-if-env-changed=LOCKWATCH_EBPF_OBJECT");
    println!("cargo:rerun-if-env-changed=LOCKWATCH_SKIP_EBPF_BUILD");

    // A prebuilt object (e.g. from `cargo xtask build-ebpf`) wins over building here.
    if let Ok(prebuilt) = env::var("LOCKWATCH_EBPF_OBJECT") {
        println!("cargo:rerun-if-changed={}", prebuilt);
        std::fs::copy(&prebuilt, &out_file).expect("Failed to copy prebuilt eBPF object");
        return;
    }

    if env::var_os("LOCKWATCH_SKIP_EBPF_BUILD").is_some() {
        write_placeholder(&out_file);
        return;
    }

    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();

    let bpf_target = match arch.as_str() {
        "x86_64" | "x86" | "aarch64" | "arm" | "riscv64" => "bpfel-unknown-none",
        "mips" | "mips64" | "powerpc" | "powerpc64" | "s390x" => "bpfeb-unknown-none",
        _ => {
            eprintln!(
                "Warning: Unknown architecture '{}', defaulting to bpfel-unknown-none",
                arch
            );
            "bpfel-unknown-none"
        }
    };

    println!(
        "cargo:warning=Building eBPF for target: {} (host arch: {})",
        bpf_target, arch
    );

    // Separate target directory so the nested cargo does not wait on our lock.
    let ebpf_target_dir = match env::var("HOME") {
        Ok(home) => PathBuf::from(home).join("cargo-target-ebpf"),
        Err(_) => out_dir.join("ebpf-target"),
    };

    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());

    let status = Command::new(cargo)
        .current_dir(EBPF_CRATE_DIR)
        .env("RUSTUP_TOOLCHAIN", "nightly")
        .env("CARGO_TARGET_DIR", &ebpf_target_dir)
        .env_remove("RUSTC_WORKSPACE_WRAPPER")
        .args([
            "build",
            "--release",
            &format!("--target={}", bpf_target),
            "-Z",
            "build-std=core",
        ])
        .stdout(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit())
        .status();

    match status {
        Ok(status) if status.success() => {
            let ebpf_binary = ebpf_target_dir.join(format!("{}/release/{}", bpf_target, OBJECT_NAME));
            std::fs::copy(&ebpf_binary, &out_file).expect("Failed to copy eBPF object file");
        }
        // Host-only builds (unit tests, metadata) still work; loading fails at runtime.
        Ok(status) => {
            println!("cargo:warning=eBPF build failed ({}); embedding empty object", status);
            write_placeholder(&out_file);
        }
        Err(err) => {
            println!("cargo:warning=Could not run cargo for eBPF ({}); embedding empty object", err);
            write_placeholder(&out_file);
        }
    }
}

fn write_placeholder(out_file: &Path) {
    std::fs::write(out_file, b"").expect("Failed to write placeholder eBPF object");
}
