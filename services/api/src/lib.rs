mod cli;
mod infra;
mod routes;
mod server;
mod simulate;

use lead_router::error::AppError;

pub async fn run() -> Result<(), AppError> {
    cli::run().await
}
