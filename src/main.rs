use spotlog::spotify::SpotifyClient;
use spotlog::{db, service, Config};

#[async_std::main]
async fn main() -> spotlog::Result<()> {
    // try sourcing a .env and env/.env if either exist
    dotenv::dotenv().ok();
    dotenv::from_filename("env/.env").ok();

    let config = Config::load();
    config.initialize()?;

    let pool = db::connect(&config.db_url).await?;
    db::create_schema_if_absent(&pool).await?;

    let api = SpotifyClient::new(&config);
    service::run_sync(&config, &pool, &api).await?;
    Ok(())
}
