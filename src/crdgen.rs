use kube::CustomResourceExt;
use wireguard_operator::ops;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    println!("{}", serde_yaml::to_string(&ops::WireguardConfig::crd())?);
    println!("---");
    println!("{}", serde_yaml::to_string(&ops::WireguardClient::crd())?);
    Ok(())
}
