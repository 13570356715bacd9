//! Prints the NodeNetworkConfig CRD manifest as YAML.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/nodenetworkconfigs.yaml`

use crds::NodeNetworkConfig;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&NodeNetworkConfig::crd())?);
    Ok(())
}
