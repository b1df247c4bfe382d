use anyhow::Result;

use rfid_vault::cli::commands::run_cli;

fn main() -> Result<()> {
    run_cli()
}
