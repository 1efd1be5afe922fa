use controller::apis::{
    beadstore_types::BeadStore, convoy_types::Convoy, polecat_types::Polecat,
    refinery_types::Refinery, rig_types::Rig, witness_types::Witness,
};
use kube::CustomResourceExt;

fn main() {
    let crds = [
        Rig::crd(),
        Polecat::crd(),
        Convoy::crd(),
        Witness::crd(),
        Refinery::crd(),
        BeadStore::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd).unwrap());
    }
}
