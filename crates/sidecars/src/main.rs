use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let parsed = cli::Cli::parse();

    match parsed.dispatch().await {
        Ok(()) => Ok(()),
        Err(err) => {
            // Hash drift exits with code 3
            if let Some(error) = err.downcast_ref::<sidecars_core::errors::SidecarsError>() {
                if error.is_verification() {
                    eprintln!("Error: {}", error);
                    std::process::exit(3);
                }
            }
            Err(err)
        }
    }
}
