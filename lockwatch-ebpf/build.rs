use which::which;

/// Rebuild the probe object whenever `bpf-linker` changes, since the linker
/// is what turns the bitcode into a loadable object.
fn main() {
    let bpf_linker = match which("bpf-linker") {
        Ok(path) => path,
        Err(err) => panic!("bpf-linker not found in PATH: {err}"),
    };
    println!("cargo:rerun-if-changed={}", bpf_linker.display());
}
