//! CRD YAML Generator
//!
//! Prints the Kubernetes CRD manifests for the custom resources defined by
//! the storage-version-migrator.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use storage_version_migrator::crd::generate_crds;

fn main() -> anyhow::Result<()> {
    for crd in generate_crds()? {
        println!("---");
        print!("{}", crd);
    }
    Ok(())
}
