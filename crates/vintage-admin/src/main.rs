use anyhow::Result;

use vintage_admin::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("vintage-admin")?;
    vintage_admin::server::run().await
}
