use clap::Parser;
use cluster_registrar::crds::owned_crds;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
enum Args {
    /// Run the registration controller
    Run,
    /// Print the CustomResourceDefinitions this operator owns
    Crds,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args {
        Args::Crds => {
            for crd in owned_crds() {
                println!("---\n{}", serde_yaml::to_string(&crd)?);
            }
        }
        Args::Run => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();
            cluster_registrar::run().await?;
        }
    };

    Ok(())
}
