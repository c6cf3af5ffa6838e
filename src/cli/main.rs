pub mod cmd;
pub mod ui;

use anyhow::Result;
use provisioner::utils::tracing::init_tracing;

use crate::ui::message::message_error;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    if let Err(e) = cmd::run_cli().await {
        message_error(format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
