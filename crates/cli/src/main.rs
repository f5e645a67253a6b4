use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fhirmat_observability::init();

    let cli = fhirmat_cli::Cli::parse();
    fhirmat_cli::run(cli).await
}
