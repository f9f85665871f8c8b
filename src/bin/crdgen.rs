use kube::CustomResourceExt;

use kube_workqueue_controller::types::AIOps;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&AIOps::crd())?);
    Ok(())
}
